//! Typed cell values as they come off the wire.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Column types understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteType {
    Int,
    BigInt,
    Boolean,
    Double,
    Text,
    Ascii,
    Varchar,
    Uuid,
    Timestamp,
    Blob,
    List,
    Set,
    Map,
}

impl RemoteType {
    /// Returns the CQL spelling of the type.
    pub fn cql_name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Boolean => "boolean",
            Self::Double => "double",
            Self::Text => "text",
            Self::Ascii => "ascii",
            Self::Varchar => "varchar",
            Self::Uuid => "uuid",
            Self::Timestamp => "timestamp",
            Self::Blob => "blob",
            Self::List => "list",
            Self::Set => "set",
            Self::Map => "map",
        }
    }

    /// Returns `true` for the three textual types that share one value shape.
    pub fn is_textual(self) -> bool {
        matches!(self, Self::Text | Self::Ascii | Self::Varchar)
    }
}

impl fmt::Display for RemoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cql_name())
    }
}

/// One cell of a result row.
///
/// Scalar kinds the scan path can render carry their payload. Everything
/// else (collections, blobs) is surfaced as `Unsupported` with its type tag
/// so consumers can decide how to degrade.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteValue {
    Null,
    Int32(i32),
    Int64(i64),
    Boolean(bool),
    Double(f64),
    Text(String),
    Uuid(Uuid),
    /// Milliseconds since the Unix epoch, UTC.
    Timestamp(i64),
    Unsupported(RemoteType),
}

impl RemoteValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the wire type of a non-null value.
    pub fn remote_type(&self) -> Option<RemoteType> {
        match self {
            Self::Null => None,
            Self::Int32(_) => Some(RemoteType::Int),
            Self::Int64(_) => Some(RemoteType::BigInt),
            Self::Boolean(_) => Some(RemoteType::Boolean),
            Self::Double(_) => Some(RemoteType::Double),
            Self::Text(_) => Some(RemoteType::Text),
            Self::Uuid(_) => Some(RemoteType::Uuid),
            Self::Timestamp(_) => Some(RemoteType::Timestamp),
            Self::Unsupported(ty) => Some(*ty),
        }
    }

    /// Checks whether this value may be stored in a column of `ty`.
    pub fn fits(&self, ty: RemoteType) -> bool {
        match self {
            Self::Null => true,
            Self::Text(_) => ty.is_textual(),
            other => other.remote_type() == Some(ty),
        }
    }
}

impl From<i32> for RemoteValue {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<i64> for RemoteValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<bool> for RemoteValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<f64> for RemoteValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for RemoteValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RemoteValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for RemoteValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl<T: Into<RemoteValue>> From<Option<T>> for RemoteValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}
