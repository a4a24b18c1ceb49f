//! Embedded in-memory node implementing the [`Driver`] contract.
//!
//! The node keeps tables as plain row vectors and answers the CQL subset in
//! [`crate::cql`]. It is used to run the scan path end-to-end without a real
//! cluster, and it counts every cluster, connect and execute call so callers
//! can assert on how often the network would have been touched.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::debug;

use crate::cql::{parse_select, Literal, SelectItems, SelectQuery};
use crate::driver::{
    Cluster, ColumnSpec, ConnectConfig, Driver, DriverError, ResultSet, Row, Session, Statement,
};
use crate::value::{RemoteType, RemoteValue};

/// Column definition of an in-memory table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: RemoteType,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<ColumnDef>,
    rows: Vec<Vec<RemoteValue>>,
}

impl MemoryTable {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

/// Point-in-time copy of node call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryNodeStats {
    pub clusters_created: u64,
    pub clusters_closed: u64,
    pub connects: u64,
    pub failed_connects: u64,
    pub sessions_closed: u64,
    pub executes: u64,
}

#[derive(Debug, Default)]
struct NodeCounters {
    clusters_created: AtomicU64,
    clusters_closed: AtomicU64,
    connects: AtomicU64,
    failed_connects: AtomicU64,
    sessions_closed: AtomicU64,
    executes: AtomicU64,
}

struct NodeState {
    contact_point: String,
    users: RwLock<HashMap<String, String>>,
    tables: RwLock<BTreeMap<String, MemoryTable>>,
    unavailable: AtomicBool,
    counters: NodeCounters,
}

/// Handle to one embedded node. Clones share the same data.
#[derive(Clone)]
pub struct MemoryNode {
    state: Arc<NodeState>,
}

impl MemoryNode {
    /// Creates an empty node reachable through `contact_point`.
    pub fn new(contact_point: impl Into<String>) -> Self {
        Self {
            state: Arc::new(NodeState {
                contact_point: contact_point.into(),
                users: RwLock::new(HashMap::new()),
                tables: RwLock::new(BTreeMap::new()),
                unavailable: AtomicBool::new(false),
                counters: NodeCounters::default(),
            }),
        }
    }

    /// Enables password authentication and registers one role.
    pub fn with_user(self, username: &str, password: &str) -> Self {
        if let Ok(mut users) = self.state.users.write() {
            users.insert(username.to_string(), password.to_string());
        }
        self
    }

    pub fn contact_point(&self) -> &str {
        &self.state.contact_point
    }

    /// Creates (or replaces) a table.
    pub fn create_table(&self, name: &str, columns: &[(&str, RemoteType)]) {
        let table = MemoryTable {
            columns: columns
                .iter()
                .map(|(name, ty)| ColumnDef {
                    name: (*name).to_string(),
                    ty: *ty,
                })
                .collect(),
            rows: Vec::new(),
        };
        let mut tables = self
            .state
            .tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tables.insert(name.to_string(), table);
    }

    /// Appends one row; values are matched to columns by position.
    pub fn insert(&self, table: &str, values: Vec<RemoteValue>) -> Result<(), DriverError> {
        let mut tables = self
            .state
            .tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let target = tables
            .get_mut(table)
            .ok_or_else(|| DriverError::Invalid(format!("unconfigured table {table}")))?;
        if values.len() != target.columns.len() {
            return Err(DriverError::Invalid(format!(
                "expected {} values for table {table}, got {}",
                target.columns.len(),
                values.len()
            )));
        }
        for (value, column) in values.iter().zip(target.columns.iter()) {
            if !value.fits(column.ty) {
                return Err(DriverError::Invalid(format!(
                    "value {value:?} does not fit column {} of type {}",
                    column.name, column.ty
                )));
            }
        }
        target.rows.push(values);
        Ok(())
    }

    /// Makes every subsequent execute fail as if all replicas were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MemoryNodeStats {
        let counters = &self.state.counters;
        MemoryNodeStats {
            clusters_created: counters.clusters_created.load(Ordering::Relaxed),
            clusters_closed: counters.clusters_closed.load(Ordering::Relaxed),
            connects: counters.connects.load(Ordering::Relaxed),
            failed_connects: counters.failed_connects.load(Ordering::Relaxed),
            sessions_closed: counters.sessions_closed.load(Ordering::Relaxed),
            executes: counters.executes.load(Ordering::Relaxed),
        }
    }
}

impl Driver for MemoryNode {
    fn new_cluster(&self) -> Arc<dyn Cluster> {
        self.state
            .counters
            .clusters_created
            .fetch_add(1, Ordering::Relaxed);
        Arc::new(MemoryCluster {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        })
    }
}

struct MemoryCluster {
    state: Arc<NodeState>,
    closed: AtomicBool,
}

impl Cluster for MemoryCluster {
    fn connect(&self, config: &ConnectConfig) -> Result<Arc<dyn Session>, DriverError> {
        let counters = &self.state.counters;
        if self.closed.load(Ordering::SeqCst) {
            counters.failed_connects.fetch_add(1, Ordering::Relaxed);
            return Err(DriverError::Closed("cluster has been closed".to_string()));
        }

        let reachable = config
            .contact_points
            .split(',')
            .map(str::trim)
            .any(|point| point == self.state.contact_point);
        if !reachable {
            counters.failed_connects.fetch_add(1, Ordering::Relaxed);
            return Err(DriverError::Connect(format!(
                "No hosts available for the control connection (tried: {})",
                config.contact_points
            )));
        }

        let users = self
            .state
            .users
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !users.is_empty() {
            let accepted = config.credentials.as_ref().is_some_and(|credentials| {
                users
                    .get(&credentials.username)
                    .is_some_and(|password| *password == credentials.password)
            });
            if !accepted {
                counters.failed_connects.fetch_add(1, Ordering::Relaxed);
                let username = config
                    .credentials
                    .as_ref()
                    .map(|credentials| credentials.username.as_str())
                    .unwrap_or("");
                return Err(DriverError::Authentication(format!(
                    "Provided username {username} and/or password are incorrect"
                )));
            }
        }

        counters.connects.fetch_add(1, Ordering::Relaxed);
        debug!(contact_point = %self.state.contact_point, "memory node accepted session");
        Ok(Arc::new(MemorySession {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state
                .counters
                .clusters_closed
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct MemorySession {
    state: Arc<NodeState>,
    closed: AtomicBool,
}

impl Session for MemorySession {
    fn execute(&self, statement: &Statement) -> Result<ResultSet, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed("session has been closed".to_string()));
        }
        self.state.counters.executes.fetch_add(1, Ordering::Relaxed);
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(DriverError::Unavailable(
                "Cannot achieve consistency level ONE".to_string(),
            ));
        }

        let query = parse_select(statement.query())?;
        let tables = self
            .state
            .tables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let table = tables
            .get(&query.table)
            .ok_or_else(|| DriverError::Invalid(format!("unconfigured table {}", query.table)))?;
        execute_select(table, &query)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state
                .counters
                .sessions_closed
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Output column of a select: a table column index or a bare `NULL`.
enum Projection {
    Column(usize),
    Null,
}

fn execute_select(table: &MemoryTable, query: &SelectQuery) -> Result<ResultSet, DriverError> {
    let (projections, columns): (Vec<Projection>, Vec<ColumnSpec>) = match &query.items {
        SelectItems::All => (
            (0..table.columns.len()).map(Projection::Column).collect(),
            table
                .columns
                .iter()
                .map(|column| ColumnSpec {
                    name: column.name.clone(),
                    ty: Some(column.ty),
                })
                .collect(),
        ),
        SelectItems::Null => (
            vec![Projection::Null],
            vec![ColumnSpec {
                name: "null".to_string(),
                ty: None,
            }],
        ),
        SelectItems::Columns(names) => {
            let mut projections = Vec::with_capacity(names.len());
            let mut columns = Vec::with_capacity(names.len());
            for name in names {
                let index = table
                    .column_index(name)
                    .ok_or_else(|| DriverError::Invalid(format!("Undefined column name {name}")))?;
                projections.push(Projection::Column(index));
                columns.push(ColumnSpec {
                    name: name.clone(),
                    ty: Some(table.columns[index].ty),
                });
            }
            (projections, columns)
        }
    };

    let mut filters = Vec::with_capacity(query.conditions.len());
    for condition in &query.conditions {
        let index = table.column_index(&condition.column).ok_or_else(|| {
            DriverError::Invalid(format!("Undefined column name {}", condition.column))
        })?;
        let column = &table.columns[index];
        filters.push((index, coerce_literal(&condition.value, column)?));
    }

    let rows = table
        .rows
        .iter()
        .filter(|row| filters.iter().all(|(index, value)| row[*index] == *value))
        .map(|row| {
            Row::new(
                projections
                    .iter()
                    .map(|projection| match projection {
                        Projection::Column(index) => row[*index].clone(),
                        Projection::Null => RemoteValue::Null,
                    })
                    .collect(),
            )
        })
        .collect();
    Ok(ResultSet::new(columns, rows))
}

fn coerce_literal(literal: &Literal, column: &ColumnDef) -> Result<RemoteValue, DriverError> {
    let mismatch = || {
        DriverError::Invalid(format!(
            "Invalid constant {literal:?} for \"{}\" of type {}",
            column.name, column.ty
        ))
    };
    match (literal, column.ty) {
        (Literal::Null, _) => Err(DriverError::Invalid(format!(
            "Invalid null value in condition for column {}",
            column.name
        ))),
        (Literal::Integer(value), RemoteType::Int) => i32::try_from(*value)
            .map(RemoteValue::Int32)
            .map_err(|_| mismatch()),
        (Literal::Integer(value), RemoteType::BigInt) => Ok(RemoteValue::Int64(*value)),
        (Literal::Integer(value), RemoteType::Double) => Ok(RemoteValue::Double(*value as f64)),
        (Literal::Float(value), RemoteType::Double) => Ok(RemoteValue::Double(*value)),
        (Literal::Boolean(value), RemoteType::Boolean) => Ok(RemoteValue::Boolean(*value)),
        (Literal::Text(value), ty) if ty.is_textual() => Ok(RemoteValue::Text(value.clone())),
        (Literal::Uuid(value), RemoteType::Uuid) => Ok(RemoteValue::Uuid(*value)),
        (Literal::Integer(value), RemoteType::Timestamp) => Ok(RemoteValue::Timestamp(*value)),
        (Literal::Text(value), RemoteType::Timestamp) => parse_timestamp_millis(value)
            .map(RemoteValue::Timestamp)
            .ok_or_else(|| {
                DriverError::Invalid(format!(
                    "Unable to coerce '{value}' to a formatted date (long)"
                ))
            }),
        _ => Err(mismatch()),
    }
}

/// Parses the timestamp literal forms the store accepts, read as UTC.
fn parse_timestamp_millis(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.timestamp_millis());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|parsed| parsed.and_utc().timestamp_millis())
}
