//! Builds the remote `SELECT` for a foreign scan.
//!
//! The target list and the retrieved-attribute list are produced together
//! so that result position `i` always decodes into `retrieved_attrs[i]`.
//! Only `column = constant` style equalities on allow-listed columns reach
//! the `WHERE` clause; everything else is left to the caller, which
//! re-evaluates the full restriction list locally.

use tracing::debug;

use crate::codec::{format_literal, quote_identifier};
use crate::options::TableBinding;
use crate::relation::{AttrNumber, AttrsUsed, LocalRelation, LocalType, SELF_ITEM_POINTER_ATTNO};
use crate::restriction::{OpExpr, Operand, Restriction};

/// Remote query text plus the bookkeeping the executor and planner need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushdownQuery {
    pub query: String,
    /// Local ordinals in remote result-column order.
    pub retrieved_attrs: Vec<AttrNumber>,
    /// Indexes into the restriction list of clauses rendered remotely.
    pub pushed_clauses: Vec<usize>,
    /// Indexes of clauses that stay local only.
    pub skipped_clauses: Vec<usize>,
}

/// Translates a scan request into remote query text.
pub fn build_query(
    attrs_used: &AttrsUsed,
    restrictions: &[Restriction],
    relation: &LocalRelation,
    binding: &TableBinding,
) -> PushdownQuery {
    let (targets, retrieved_attrs) = deparse_target_list(relation, attrs_used);

    let mut query = format!("SELECT {targets} FROM {}", binding.remote_table());
    let mut pushed_clauses = Vec::new();
    let mut skipped_clauses = Vec::new();
    for (index, restriction) in restrictions.iter().enumerate() {
        match deparse_clause(restriction, relation, binding) {
            Some(clause) => {
                query.push_str(if pushed_clauses.is_empty() {
                    " WHERE "
                } else {
                    " AND "
                });
                query.push_str(&clause);
                pushed_clauses.push(index);
            }
            None => {
                debug!(clause = %restriction, "restriction left for local evaluation");
                skipped_clauses.push(index);
            }
        }
    }

    PushdownQuery {
        query,
        retrieved_attrs,
        pushed_clauses,
        skipped_clauses,
    }
}

/// Emits the remote names of the used columns in ordinal order, then the
/// row locator if requested. An empty list becomes `NULL`.
pub fn deparse_target_list(
    relation: &LocalRelation,
    attrs_used: &AttrsUsed,
) -> (String, Vec<AttrNumber>) {
    let mut targets = Vec::new();
    let mut retrieved_attrs = Vec::new();
    for (attno, column) in relation.numbered_columns() {
        if column.dropped || !attrs_used.contains(attno) {
            continue;
        }
        targets.push(quote_identifier(column.remote_name()).into_owned());
        retrieved_attrs.push(attno);
    }
    if attrs_used.has_self_item_pointer() {
        targets.push("ctid".to_string());
        retrieved_attrs.push(SELF_ITEM_POINTER_ATTNO);
    }
    if targets.is_empty() {
        return ("NULL".to_string(), retrieved_attrs);
    }
    (targets.join(", "), retrieved_attrs)
}

/// Renders one restriction as `left = right`, or `None` if it cannot be
/// evaluated remotely.
pub fn deparse_clause(
    restriction: &Restriction,
    relation: &LocalRelation,
    binding: &TableBinding,
) -> Option<String> {
    let Restriction::Operator(OpExpr { operator, args }) = restriction else {
        return None;
    };
    if operator.name != "=" {
        return None;
    }
    let interval = |ty: Option<_>| ty.is_some_and(LocalType::is_interval);
    if interval(operator.left_type) || interval(operator.right_type) {
        return None;
    }
    let [left, right] = args.as_slice() else {
        return None;
    };
    let left = deparse_operand(left, relation, binding)?;
    let right = deparse_operand(right, relation, binding)?;
    Some(format!("{left} = {right}"))
}

pub fn is_pushable(
    restriction: &Restriction,
    relation: &LocalRelation,
    binding: &TableBinding,
) -> bool {
    deparse_clause(restriction, relation, binding).is_some()
}

fn deparse_operand(
    operand: &Operand,
    relation: &LocalRelation,
    binding: &TableBinding,
) -> Option<String> {
    match operand {
        Operand::Const { ty, value } => format_literal(value, *ty),
        Operand::Column { attno } => {
            // System columns are never pushed.
            if *attno < 1 {
                return None;
            }
            let remote = relation.remote_column_name(*attno)?;
            binding
                .is_queryable(remote)
                .then(|| quote_identifier(remote).into_owned())
        }
        Operand::Expression { .. } => None,
    }
}
