//! DataFusion table provider backed by a foreign Cassandra table.
//!
//! Filters are reported as `Inexact` when they can be pushed, so DataFusion
//! always re-applies them on the returned rows. The scan itself runs the
//! blocking scan controller on a blocking thread and serves the rows
//! through a `MemTable`.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use datafusion::arrow::array::ArrayRef;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use datafusion::catalog::memory::MemTable;
use datafusion::catalog::{Session, TableProvider};
use datafusion::common::{DataFusionError, Result as DFResult, ScalarValue};
use datafusion::logical_expr::utils::split_conjunction;
use datafusion::logical_expr::{
    BinaryExpr, Expr, Operator, TableProviderFilterPushDown, TableType,
};
use datafusion::physical_plan::ExecutionPlan;
use tracing::debug;

use crate::catalog::ForeignCatalog;
use crate::connection::ConnectionCache;
use crate::deparse::is_pushable;
use crate::error::{FdwError, FdwResult};
use crate::estimate::{plan_foreign_scan, ForeignScanPlan, RelationStats};
use crate::metrics::ScanMetrics;
use crate::options::TableBinding;
use crate::relation::{AttrsUsed, LocalRelation, LocalRow, LocalType};
use crate::restriction::{Operand, Restriction};
use crate::scan::{ScanController, ScanFlags, ScanIdentity, ScanRequest};

/// Table provider for one foreign table of a [`ForeignCatalog`].
pub struct CassandraTableProvider {
    catalog: Arc<ForeignCatalog>,
    table_name: String,
    relation: LocalRelation,
    binding: TableBinding,
    schema: SchemaRef,
    cache: Arc<ConnectionCache>,
    metrics: Arc<ScanMetrics>,
    identity: ScanIdentity,
    last_plan: Mutex<Option<ForeignScanPlan>>,
}

impl CassandraTableProvider {
    pub fn new(
        catalog: Arc<ForeignCatalog>,
        table_name: &str,
        cache: Arc<ConnectionCache>,
        metrics: Arc<ScanMetrics>,
        identity: ScanIdentity,
    ) -> FdwResult<Self> {
        let relation = catalog.table_or_err(table_name)?.relation.clone();
        let binding = catalog.binding(table_name, identity.acting_user())?;
        let schema = relation.arrow_schema();
        Ok(Self {
            catalog,
            table_name: table_name.to_string(),
            relation,
            binding,
            schema,
            cache,
            metrics,
            identity,
            last_plan: Mutex::new(None),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Plan of the most recent scan, for EXPLAIN-style reporting.
    pub fn last_plan(&self) -> Option<ForeignScanPlan> {
        self.last_plan
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Converts engine filters into a restriction list, one clause per
    /// conjunct.
    pub fn restrictions_from_filters(&self, filters: &[Expr]) -> Vec<Restriction> {
        filters
            .iter()
            .flat_map(split_conjunction)
            .map(|expr| restriction_from_expr(expr, &self.relation))
            .collect()
    }

    fn filter_is_pushable(&self, filter: &Expr) -> bool {
        split_conjunction(filter).into_iter().all(|expr| {
            is_pushable(
                &restriction_from_expr(expr, &self.relation),
                &self.relation,
                &self.binding,
            )
        })
    }
}

impl fmt::Debug for CassandraTableProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CassandraTableProvider")
            .field("table_name", &self.table_name)
            .field("remote_table", &self.binding.remote_table())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TableProvider for CassandraTableProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        filters: &[Expr],
        limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let attrs_used = AttrsUsed::from_projection(&self.relation, projection);
        let restrictions = self.restrictions_from_filters(filters);
        let plan = plan_foreign_scan(
            &self.relation,
            &self.binding,
            &attrs_used,
            &restrictions,
            RelationStats::default(),
        );
        self.metrics.record_pushdown(
            plan.pushed_clauses.len() as u64,
            (restrictions.len() - plan.pushed_clauses.len()) as u64,
        );
        debug!(
            table = %self.table_name,
            query = %plan.query,
            filters = filters.len(),
            estimated_rows = plan.estimate.rows,
            limit = ?limit,
            "starting foreign table scan"
        );
        *self
            .last_plan
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(plan.clone());

        let catalog = Arc::clone(&self.catalog);
        let cache = Arc::clone(&self.cache);
        let metrics = Arc::clone(&self.metrics);
        let table_name = self.table_name.clone();
        let identity = self.identity;
        let rows = tokio::task::spawn_blocking(move || {
            run_scan(&catalog, &table_name, cache, metrics, identity, &plan)
        })
        .await
        .map_err(|err| DataFusionError::External(Box::new(err)))?
        .map_err(df_external)?;

        let batch = rows_to_batch(self.schema(), &self.relation, &rows).map_err(df_external)?;
        let mem = MemTable::try_new(self.schema(), vec![vec![batch]])?;
        mem.scan(state, projection, &[], limit).await
    }

    fn supports_filters_pushdown(
        &self,
        filters: &[&Expr],
    ) -> DFResult<Vec<TableProviderFilterPushDown>> {
        Ok(filters
            .iter()
            .map(|filter| {
                // The engine re-checks every filter on the returned rows.
                if self.filter_is_pushable(filter) {
                    TableProviderFilterPushDown::Inexact
                } else {
                    TableProviderFilterPushDown::Unsupported
                }
            })
            .collect())
    }
}

/// Runs one full scan on the calling (blocking) thread.
fn run_scan(
    catalog: &ForeignCatalog,
    table_name: &str,
    cache: Arc<ConnectionCache>,
    metrics: Arc<ScanMetrics>,
    identity: ScanIdentity,
    plan: &ForeignScanPlan,
) -> FdwResult<Vec<LocalRow>> {
    let mut controller = ScanController::new(cache, metrics);
    controller.begin(ScanRequest {
        catalog,
        table: table_name,
        identity,
        plan,
        flags: ScanFlags::default(),
    })?;
    let mut rows = Vec::new();
    let outcome = loop {
        match controller.next() {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => break Ok(rows),
            Err(err) => break Err(err),
        }
    };
    controller.end();
    outcome
}

/// Builds one record batch over the relation's visible columns.
fn rows_to_batch(
    schema: SchemaRef,
    relation: &LocalRelation,
    rows: &[LocalRow],
) -> FdwResult<RecordBatch> {
    if rows.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }
    let columns = relation
        .visible_ordinals()
        .into_iter()
        .map(|attno| {
            let null = relation
                .column(attno)
                .map(|column| column.ty.null_value())
                .unwrap_or(ScalarValue::Null);
            ScalarValue::iter_to_array(
                rows.iter()
                    .map(|row| row.get(attno).cloned().unwrap_or_else(|| null.clone())),
            )
            .map_err(|err| FdwError::Consistency(format!("build column {attno}: {err}")))
        })
        .collect::<FdwResult<Vec<ArrayRef>>>()?;
    let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
    RecordBatch::try_new_with_options(schema, columns, &options)
        .map_err(|err| FdwError::Consistency(format!("build record batch: {err}")))
}

/// Maps one conjunct onto a restriction clause.
fn restriction_from_expr(expr: &Expr, relation: &LocalRelation) -> Restriction {
    match expr {
        Expr::BinaryExpr(BinaryExpr { left, op, right }) => match operator_name(op) {
            Some(name) => {
                // A constant compared with a column takes the column's type.
                let left_column = column_type(left, relation);
                let right_column = column_type(right, relation);
                Restriction::binary(
                    relation,
                    name,
                    operand_from_expr(left, relation, right_column),
                    operand_from_expr(right, relation, left_column),
                )
            }
            None => Restriction::other(expr.to_string()),
        },
        other => Restriction::other(other.to_string()),
    }
}

fn column_type(expr: &Expr, relation: &LocalRelation) -> Option<LocalType> {
    match expr {
        Expr::Column(column) => relation
            .attno_of(&column.name)
            .and_then(|attno| relation.column(attno))
            .map(|column| column.ty),
        _ => None,
    }
}

fn operand_from_expr(expr: &Expr, relation: &LocalRelation, peer: Option<LocalType>) -> Operand {
    let opaque = || Operand::Expression {
        description: expr.to_string(),
    };
    match expr {
        Expr::Column(column) => match relation.attno_of(&column.name) {
            Some(attno) => Operand::column(attno),
            None => opaque(),
        },
        Expr::Literal(value, _) => {
            let constant = match peer {
                Some(ty) => constant_for_column(value, ty).map(|value| (ty, value)),
                None => LocalType::from_data_type(&value.data_type()).map(|ty| (ty, value.clone())),
            };
            match constant {
                Some((ty, value)) => Operand::Const { ty, value },
                None => opaque(),
            }
        }
        _ => opaque(),
    }
}

/// Converts a literal into a value of the column type `ty`, or `None` when
/// it has no faithful representation there.
fn constant_for_column(value: &ScalarValue, ty: LocalType) -> Option<ScalarValue> {
    let target = ty.data_type();
    if value.is_null() {
        return Some(ty.null_value());
    }
    match ty {
        LocalType::Uuid => match value {
            ScalarValue::Utf8(Some(text))
            | ScalarValue::LargeUtf8(Some(text))
            | ScalarValue::Utf8View(Some(text)) => ty.input(text).ok(),
            _ => None,
        },
        LocalType::Interval => None,
        _ if value.data_type() == target => Some(value.clone()),
        _ => value
            .cast_to(&target)
            .ok()
            .filter(|converted| !converted.is_null()),
    }
}

fn operator_name(op: &Operator) -> Option<&'static str> {
    Some(match op {
        Operator::Eq => "=",
        Operator::NotEq => "<>",
        Operator::Lt => "<",
        Operator::LtEq => "<=",
        Operator::Gt => ">",
        Operator::GtEq => ">=",
        _ => return None,
    })
}

fn df_external(err: FdwError) -> DataFusionError {
    DataFusionError::External(Box::new(err))
}
