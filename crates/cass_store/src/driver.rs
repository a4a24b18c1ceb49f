//! Client-side contract for talking to a wide-column store.
//!
//! A [`Driver`] hands out cluster configurations; a [`Cluster`] opens
//! [`Session`]s against a set of contact points; a session executes CQL
//! [`Statement`]s and returns fully materialized [`ResultSet`]s. All calls
//! block until the store answers.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::value::{RemoteType, RemoteValue};

/// Errors surfaced by a driver. `Display` carries the store's message text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// No contact point accepted the connection.
    #[error("{0}")]
    Connect(String),

    /// Credentials were rejected.
    #[error("{0}")]
    Authentication(String),

    /// The statement text could not be parsed.
    #[error("{0}")]
    Syntax(String),

    /// The statement parsed but references unknown objects or bad values.
    #[error("{0}")]
    Invalid(String),

    /// The store could not serve the request.
    #[error("{0}")]
    Unavailable(String),

    /// The session or cluster was closed.
    #[error("{0}")]
    Closed(String),
}

/// Username and password presented at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Connection parameters applied to a cluster before opening a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectConfig {
    /// Comma-separated contact points.
    pub contact_points: String,
    pub port: Option<u16>,
    pub credentials: Option<Credentials>,
    pub request_timeout: Option<Duration>,
}

/// A CQL statement without bound parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    query: String,
}

impl Statement {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

/// Name and type of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    /// `None` for a bare `NULL` select item.
    pub ty: Option<RemoteType>,
}

/// One result row, indexable by select-list position.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<RemoteValue>,
}

impl Row {
    pub fn new(values: Vec<RemoteValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&RemoteValue> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[RemoteValue] {
        &self.values
    }
}

/// A fully materialized query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    columns: Vec<ColumnSpec>,
    rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(columns: Vec<ColumnSpec>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

/// An open session. Implementations must allow concurrent `execute` calls.
pub trait Session: Send + Sync {
    fn execute(&self, statement: &Statement) -> Result<ResultSet, DriverError>;

    /// Closes the session; later `execute` calls fail with [`DriverError::Closed`].
    fn close(&self);
}

/// Shared cluster configuration that sessions are opened against.
pub trait Cluster: Send + Sync {
    fn connect(&self, config: &ConnectConfig) -> Result<Arc<dyn Session>, DriverError>;

    /// Releases the cluster configuration and everything it owns.
    fn close(&self);
}

/// Entry point of a driver implementation.
pub trait Driver: Send + Sync {
    fn new_cluster(&self) -> Arc<dyn Cluster>;
}
