//! Restriction clauses handed to the translator by the planner.

use std::fmt;

use datafusion::common::ScalarValue;

use crate::relation::{AttrNumber, LocalRelation, LocalType};

/// Operator metadata as resolved from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorInfo {
    pub name: String,
    pub left_type: Option<LocalType>,
    pub right_type: Option<LocalType>,
}

/// One side of an operator expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Reference to a column of the scanned relation.
    Column { attno: AttrNumber },
    /// Constant of a known local type.
    Const { ty: LocalType, value: ScalarValue },
    /// Anything else (casts, function calls, parameters).
    Expression { description: String },
}

impl Operand {
    pub fn column(attno: AttrNumber) -> Self {
        Self::Column { attno }
    }

    pub fn constant(ty: LocalType, value: impl Into<ScalarValue>) -> Self {
        Self::Const {
            ty,
            value: value.into(),
        }
    }

    /// Local type of the operand, when the relation or constant fixes it.
    pub fn local_type(&self, relation: &LocalRelation) -> Option<LocalType> {
        match self {
            Self::Column { attno } => relation.column(*attno).map(|column| column.ty),
            Self::Const { ty, .. } => Some(*ty),
            Self::Expression { .. } => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column { attno } => write!(f, "${attno}"),
            Self::Const { value, .. } => write!(f, "{value}"),
            Self::Expression { description } => f.write_str(description),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpExpr {
    pub operator: OperatorInfo,
    pub args: Vec<Operand>,
}

/// One clause of a restriction list.
#[derive(Debug, Clone, PartialEq)]
pub enum Restriction {
    Operator(OpExpr),
    /// A clause that is not an operator expression (boolean tests, `OR`
    /// trees, sub-plans).
    Other { description: String },
}

impl Restriction {
    /// Binary operator expression with argument types taken from the
    /// operands.
    pub fn binary(
        relation: &LocalRelation,
        operator: impl Into<String>,
        left: Operand,
        right: Operand,
    ) -> Self {
        Self::Operator(OpExpr {
            operator: OperatorInfo {
                name: operator.into(),
                left_type: left.local_type(relation),
                right_type: right.local_type(relation),
            },
            args: vec![left, right],
        })
    }

    pub fn equality(relation: &LocalRelation, left: Operand, right: Operand) -> Self {
        Self::binary(relation, "=", left, right)
    }

    pub fn other(description: impl Into<String>) -> Self {
        Self::Other {
            description: description.into(),
        }
    }
}

impl fmt::Display for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operator(op) => match op.args.as_slice() {
                [left, right] => write!(f, "{left} {} {right}", op.operator.name),
                args => {
                    write!(f, "{}(", op.operator.name)?;
                    for (index, arg) in args.iter().enumerate() {
                        if index > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    f.write_str(")")
                }
            },
            Self::Other { description } => f.write_str(description),
        }
    }
}
