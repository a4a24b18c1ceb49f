//! Foreign scan state machine: begin, iterate, rewind, end.
//!
//! ```text
//! Closed --begin--> Scanning --rewind--> Rewound
//!    ^                 |                    |
//!    +------end--------+--------end---------+
//! ```
//!
//! In explain-only mode `begin` moves to `ExplainOnly` without touching the
//! connection cache.

use std::sync::Arc;

use tracing::{debug, info};

use crate::catalog::{ForeignCatalog, UserId};
use crate::connection::{ConnectionCache, SessionHandle};
use crate::cursor::{CursorExecutor, RowDecoder};
use crate::error::{FdwError, FdwResult};
use crate::estimate::ForeignScanPlan;
use crate::metrics::ScanMetrics;
use crate::relation::{AttrNumber, LocalRelation, LocalRow};

/// Who a scan runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanIdentity {
    /// Explicit user to check permissions as (e.g. a view owner).
    pub check_as_user: Option<UserId>,
    /// The invoking user.
    pub current_user: UserId,
}

impl ScanIdentity {
    pub fn new(current_user: UserId) -> Self {
        Self {
            check_as_user: None,
            current_user,
        }
    }

    pub fn with_check_as_user(mut self, user: UserId) -> Self {
        self.check_as_user = Some(user);
        self
    }

    pub fn acting_user(&self) -> UserId {
        self.check_as_user.unwrap_or(self.current_user)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanFlags {
    /// Planning or EXPLAIN without execution.
    pub explain_only: bool,
}

/// Inputs of [`ScanController::begin`].
#[derive(Debug, Clone, Copy)]
pub struct ScanRequest<'a> {
    pub catalog: &'a ForeignCatalog,
    pub table: &'a str,
    pub identity: ScanIdentity,
    pub plan: &'a ForeignScanPlan,
    pub flags: ScanFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Closed,
    Scanning,
    Rewound,
    ExplainOnly,
}

struct ScanState {
    relation: LocalRelation,
    query: String,
    retrieved_attrs: Vec<AttrNumber>,
    session: Option<SessionHandle>,
    cursor: Option<CursorExecutor>,
    batch: Vec<LocalRow>,
    next_row: usize,
    end_of_data: bool,
}

/// Drives one foreign scan at a time.
pub struct ScanController {
    cache: Arc<ConnectionCache>,
    metrics: Arc<ScanMetrics>,
    phase: ScanPhase,
    state: Option<ScanState>,
}

impl ScanController {
    pub fn new(cache: Arc<ConnectionCache>, metrics: Arc<ScanMetrics>) -> Self {
        Self {
            cache,
            metrics,
            phase: ScanPhase::Closed,
            state: None,
        }
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    pub fn query(&self) -> Option<&str> {
        self.state.as_ref().map(|state| state.query.as_str())
    }

    pub fn retrieved_attrs(&self) -> &[AttrNumber] {
        self.state
            .as_ref()
            .map_or(&[], |state| state.retrieved_attrs.as_slice())
    }

    /// Remote executes issued by the current scan.
    pub fn fetch_count(&self) -> u64 {
        self.state
            .as_ref()
            .and_then(|state| state.cursor.as_ref())
            .map_or(0, CursorExecutor::fetch_count)
    }

    /// Resolves the acting user, acquires a session and stores the plan.
    pub fn begin(&mut self, request: ScanRequest<'_>) -> FdwResult<()> {
        if self.phase != ScanPhase::Closed {
            return Err(FdwError::ScanState(format!(
                "begin called while scan is {:?}",
                self.phase
            )));
        }
        let table = request.catalog.table_or_err(request.table)?;
        let mut state = ScanState {
            relation: table.relation.clone(),
            query: request.plan.query.clone(),
            retrieved_attrs: request.plan.retrieved_attrs.clone(),
            session: None,
            cursor: None,
            batch: Vec::new(),
            next_row: 0,
            end_of_data: false,
        };

        if request.flags.explain_only {
            debug!(table = %request.table, "foreign scan opened for explain only");
            self.state = Some(state);
            self.phase = ScanPhase::ExplainOnly;
            return Ok(());
        }

        let user = request.identity.acting_user();
        let server = request.catalog.server_or_err(table.server_id)?;
        let mapping = request.catalog.user_mapping(server.id, user)?;
        state.session = Some(self.cache.acquire(server, &mapping, false)?);

        info!(
            table = %request.table,
            user = %user,
            query = %state.query,
            "pushdown query"
        );
        self.metrics.record_scan_begin();
        self.state = Some(state);
        self.phase = ScanPhase::Scanning;
        Ok(())
    }

    /// Returns the next row, or `None` once the result is exhausted.
    ///
    /// The first call executes the remote query. End of data is sticky:
    /// later calls keep returning `None` without re-querying, including
    /// after a remote error.
    pub fn next(&mut self) -> FdwResult<Option<LocalRow>> {
        if !matches!(self.phase, ScanPhase::Scanning | ScanPhase::Rewound) {
            return Err(FdwError::ScanState(format!(
                "next called while scan is {:?}",
                self.phase
            )));
        }
        let Some(state) = self.state.as_mut() else {
            return Err(FdwError::ScanState("scan has no state".to_string()));
        };

        loop {
            if let Some(row) = state.batch.get(state.next_row) {
                state.next_row += 1;
                self.metrics.record_row_returned();
                return Ok(Some(row.clone()));
            }
            if state.end_of_data {
                return Ok(None);
            }
            Self::fetch_more(state, &self.metrics)?;
        }
    }

    fn fetch_more(state: &mut ScanState, metrics: &ScanMetrics) -> FdwResult<()> {
        if state.cursor.is_none() {
            let session = state
                .session
                .as_ref()
                .ok_or_else(|| FdwError::ScanState("scan has no session".to_string()))?;
            state.cursor = Some(CursorExecutor::open(
                Arc::clone(session.session()),
                &state.query,
            ));
        }
        let Some(cursor) = state.cursor.as_mut() else {
            return Err(FdwError::ScanState("scan has no cursor".to_string()));
        };

        let decoder = RowDecoder::new(&state.relation, &state.retrieved_attrs);
        state.batch.clear();
        state.next_row = 0;
        match cursor.fetch_batch(&decoder) {
            Ok(batch) => {
                metrics.record_execute(Some(batch.rows.len() as u64));
                debug!(rows = batch.rows.len(), "fetched remote batch");
                state.batch = batch.rows;
                state.end_of_data = batch.end_of_data;
                Ok(())
            }
            Err(err) => {
                if matches!(err, FdwError::RemoteExecution { .. }) {
                    metrics.record_execute(None);
                }
                state.end_of_data = true;
                Err(err)
            }
        }
    }

    /// Restarts iteration from the first materialized row without
    /// re-executing. A no-op before the first fetch.
    pub fn rewind(&mut self) -> FdwResult<()> {
        if !matches!(self.phase, ScanPhase::Scanning | ScanPhase::Rewound) {
            return Err(FdwError::ScanState(format!(
                "rewind called while scan is {:?}",
                self.phase
            )));
        }
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        if state.cursor.is_none() {
            return Ok(());
        }
        state.next_row = 0;
        self.phase = ScanPhase::Rewound;
        self.metrics.record_rewind();
        debug!(rows = state.batch.len(), "rewound foreign scan");
        Ok(())
    }

    /// Closes the cursor and hands the session back. Idempotent.
    pub fn end(&mut self) {
        if let Some(mut state) = self.state.take() {
            if let Some(cursor) = state.cursor.as_mut() {
                cursor.close();
            }
            if let Some(session) = state.session.take() {
                self.cache.release(session);
            }
        }
        self.phase = ScanPhase::Closed;
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        self.end();
    }
}
