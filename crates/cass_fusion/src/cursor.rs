//! Remote statement execution and row decoding.
//!
//! A cursor owns one statement against a borrowed session. Execution is
//! lazy: nothing is sent until the first [`CursorExecutor::fetch_batch`],
//! and that single execute materializes the whole result.

use std::fmt;
use std::sync::Arc;

use cass_store::{ResultSet, Row, Session, Statement};
use tracing::{debug, warn};

use crate::codec::remote_to_text;
use crate::error::{FdwError, FdwResult};
use crate::relation::{AttrNumber, LocalRelation, LocalRow, RowBuilder};

/// Lifecycle of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Statement built, not yet executed.
    Opened,
    /// The result (or an error) has been consumed; no more network calls.
    Exhausted,
    Closed,
}

/// Rows materialized by one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub rows: Vec<LocalRow>,
    pub end_of_data: bool,
}

/// Decodes remote rows into local rows using the retrieved-attribute list.
pub struct RowDecoder<'a> {
    relation: &'a LocalRelation,
    retrieved_attrs: &'a [AttrNumber],
}

impl<'a> RowDecoder<'a> {
    pub fn new(relation: &'a LocalRelation, retrieved_attrs: &'a [AttrNumber]) -> Self {
        Self {
            relation,
            retrieved_attrs,
        }
    }

    /// Checks that the result has exactly one column per retrieved
    /// attribute. An empty attribute list accepts any shape, since the
    /// remote query then selects a bare `NULL`.
    pub fn check_result(&self, result: &ResultSet) -> FdwResult<()> {
        let expected = self.retrieved_attrs.len();
        if expected > 0 && expected != result.column_count() {
            return Err(FdwError::Consistency(format!(
                "expected {expected} columns for \"{}\", remote returned {}",
                self.relation.name(),
                result.column_count()
            )));
        }
        Ok(())
    }

    /// Builds one local row. Remote column `i` feeds `retrieved_attrs[i]`.
    pub fn decode(&self, row: &Row) -> FdwResult<LocalRow> {
        let mut builder = RowBuilder::with_capacity(self.retrieved_attrs.len());
        for (position, &attno) in self.retrieved_attrs.iter().enumerate() {
            // The row locator has no slot in the local row.
            if attno < 1 {
                continue;
            }
            let column = self.relation.column(attno).ok_or_else(|| {
                FdwError::Consistency(format!(
                    "retrieved column {attno} does not exist in \"{}\"",
                    self.relation.name()
                ))
            })?;
            let value = row.get(position).ok_or_else(|| {
                FdwError::Consistency(format!(
                    "remote row has {} values, column {position} requested",
                    row.len()
                ))
            })?;
            let local = match remote_to_text(value) {
                Some(text) => Some(column.ty.input(&text)?),
                None => None,
            };
            builder.push(attno, local);
        }
        builder.finish(self.relation)
    }
}

/// Executes one remote statement and pages its result.
pub struct CursorExecutor {
    session: Arc<dyn Session>,
    statement: Statement,
    state: CursorState,
    fetch_count: u64,
}

impl CursorExecutor {
    /// Prepares `query` against `session` without executing it.
    pub fn open(session: Arc<dyn Session>, query: &str) -> Self {
        Self {
            session,
            statement: Statement::new(query),
            state: CursorState::Opened,
            fetch_count: 0,
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn query(&self) -> &str {
        self.statement.query()
    }

    /// Number of remote executes issued by this cursor.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count
    }

    /// Executes the statement and decodes the full result as one batch.
    ///
    /// Once exhausted, further calls return an empty end-of-data batch
    /// without touching the network. Remote failures exhaust the cursor
    /// and surface the driver's message.
    pub fn fetch_batch(&mut self, decoder: &RowDecoder<'_>) -> FdwResult<Batch> {
        match self.state {
            CursorState::Closed => {
                return Err(FdwError::ScanState("cursor is closed".to_string()));
            }
            CursorState::Exhausted => {
                return Ok(Batch {
                    rows: Vec::new(),
                    end_of_data: true,
                });
            }
            CursorState::Opened => {}
        }

        self.fetch_count += 1;
        debug!(query = %self.statement.query(), "executing remote query");
        let result = self.session.execute(&self.statement);
        self.state = CursorState::Exhausted;
        let result = result.map_err(|err| {
            warn!(query = %self.statement.query(), error = %err, "remote query failed");
            FdwError::RemoteExecution {
                query: self.statement.query().to_string(),
                message: err.to_string(),
            }
        })?;

        decoder.check_result(&result)?;
        let rows = result
            .rows()
            .iter()
            .map(|row| decoder.decode(row))
            .collect::<FdwResult<Vec<_>>>()?;
        Ok(Batch {
            rows,
            end_of_data: true,
        })
    }

    /// Drops the statement. Idempotent.
    pub fn close(&mut self) {
        self.state = CursorState::Closed;
    }
}

impl fmt::Debug for CursorExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorExecutor")
            .field("query", &self.statement.query())
            .field("state", &self.state)
            .field("fetch_count", &self.fetch_count)
            .finish_non_exhaustive()
    }
}
