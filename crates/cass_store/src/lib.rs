//! Client contract and embedded in-memory node for a wide-column store.
//!
//! `cass_fusion` only talks to the store through the [`Driver`], [`Cluster`]
//! and [`Session`] traits defined here. [`MemoryNode`] implements them over
//! plain in-process tables and serves the CQL `SELECT` subset that the scan
//! path emits.

mod cql;
pub mod driver;
pub mod memory;
pub mod value;

pub use driver::{
    Cluster, ColumnSpec, ConnectConfig, Credentials, Driver, DriverError, ResultSet, Row, Session,
    Statement,
};
pub use memory::{ColumnDef, MemoryNode, MemoryNodeStats};
pub use value::{RemoteType, RemoteValue};
