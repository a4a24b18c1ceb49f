//! Error taxonomy for foreign scans.
//!
//! Every variant is terminal for the scan that raised it; nothing here is
//! retried. Remote values without a local rendering are not errors: the
//! codec degrades them to placeholder text.

use thiserror::Error;

/// Errors raised while planning or executing a foreign scan.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FdwError {
    /// A required option is missing or an option value is malformed.
    #[error("{0}")]
    Configuration(String),

    /// An option name is not valid for the object it was given on.
    #[error("invalid option \"{name}\" ({hint})")]
    InvalidOption { name: String, hint: String },

    /// The same option was given more than once.
    #[error("conflicting or redundant options: \"{0}\"")]
    RedundantOption(String),

    /// Connecting or authenticating to the remote store failed.
    #[error("could not connect to server \"{server}\": {detail}")]
    Connection { server: String, detail: String },

    /// The remote store rejected or failed the query.
    #[error("Unable to run query: '{message}'")]
    RemoteExecution { query: String, message: String },

    /// The remote result no longer lines up with the retrieved-column list.
    #[error("remote query result does not match the foreign table: {0}")]
    Consistency(String),

    /// A remote value's text was rejected by the local column type.
    #[error("invalid input syntax for type {type_name}: \"{value}\" ({reason})")]
    TypeInput {
        type_name: &'static str,
        value: String,
        reason: String,
    },

    /// A scan operation was called in a state that does not allow it.
    #[error("foreign scan is not in a valid state: {0}")]
    ScanState(String),
}

/// Result alias used across the crate.
pub type FdwResult<T> = Result<T, FdwError>;
