//! Planner-facing size and cost placeholders, and the foreign scan plan.
//!
//! The remote store is never consulted while planning, so the numbers
//! here are fixed guesses rather than calibrated estimates.

use crate::deparse::build_query;
use crate::options::TableBinding;
use crate::relation::{AttrNumber, AttrsUsed, LocalRelation};
use crate::restriction::Restriction;

pub const DEFAULT_FDW_STARTUP_COST: f64 = 100.0;
pub const DEFAULT_FDW_TUPLE_COST: f64 = 0.01;

/// Pages assumed for a relation without statistics.
const DEFAULT_PAGES: u64 = 10;
const BLOCK_SIZE: u64 = 8192;
/// Per-tuple header overhead in bytes.
const TUPLE_HEADER_SIZE: u64 = 23;

/// Local statistics of a foreign table; zeroes mean "never analyzed".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RelationStats {
    pub pages: u64,
    pub tuples: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanEstimate {
    pub pages: u64,
    pub rows: f64,
    /// Average width in bytes of the retrieved columns.
    pub width: i32,
    pub startup_cost: f64,
    pub total_cost: f64,
}

/// Estimates relation size, falling back to a minimum of ten pages when
/// the table has no statistics.
pub fn estimate_scan(stats: RelationStats, width: i32) -> ScanEstimate {
    let (pages, rows) = if stats.pages == 0 && stats.tuples == 0.0 {
        let width = u64::try_from(width.max(0)).unwrap_or(0);
        let tuples = (DEFAULT_PAGES * BLOCK_SIZE) / (width + TUPLE_HEADER_SIZE);
        (DEFAULT_PAGES, tuples as f64)
    } else {
        (stats.pages, stats.tuples)
    };
    ScanEstimate {
        pages,
        rows,
        width,
        startup_cost: DEFAULT_FDW_STARTUP_COST,
        total_cost: DEFAULT_FDW_TUPLE_COST * 100.0,
    }
}

/// Everything the executor needs to run one foreign scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignScanPlan {
    pub query: String,
    pub retrieved_attrs: Vec<AttrNumber>,
    /// The full restriction list. Pushed clauses are kept too, so the
    /// caller re-checks every clause on the returned rows.
    pub local_filters: Vec<Restriction>,
    /// Indexes into `local_filters` that were also rendered remotely.
    pub pushed_clauses: Vec<usize>,
    pub estimate: ScanEstimate,
}

impl ForeignScanPlan {
    /// EXPLAIN properties; the remote query is shown only in verbose mode.
    pub fn explain(&self, verbose: bool) -> Vec<(&'static str, String)> {
        if verbose {
            vec![("Remote SQL", self.query.clone())]
        } else {
            Vec::new()
        }
    }
}

/// Plans a scan of `relation`: estimate, remote query and local filters.
pub fn plan_foreign_scan(
    relation: &LocalRelation,
    binding: &TableBinding,
    attrs_used: &AttrsUsed,
    restrictions: &[Restriction],
    stats: RelationStats,
) -> ForeignScanPlan {
    let estimate = estimate_scan(stats, attrs_used.width(relation));
    let pushdown = build_query(attrs_used, restrictions, relation, binding);
    ForeignScanPlan {
        query: pushdown.query,
        retrieved_attrs: pushdown.retrieved_attrs,
        local_filters: restrictions.to_vec(),
        pushed_clauses: pushdown.pushed_clauses,
        estimate,
    }
}
