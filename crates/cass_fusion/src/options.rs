//! Foreign-object option schema, validation, and typed option records.
//!
//! Options arrive as name/value pairs attached to a foreign server, a user
//! mapping, a foreign table, or one of its columns. [`validate_options`]
//! checks them against the schema below; the typed records are built from
//! validated pairs and merged into a [`TableBinding`] once per scan.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use cass_store::{ConnectConfig, Credentials};
use serde::{Deserialize, Serialize};

use crate::catalog::{ForeignServer, ForeignTable, ServerId, UserId, UserMapping};
use crate::error::{FdwError, FdwResult};

/// Username presented when the user mapping does not set one.
pub const DEFAULT_USERNAME: &str = "cassandra";
/// Password presented when the user mapping does not set one.
pub const DEFAULT_PASSWORD: &str = "cassandra";

/// Kind of catalog object an option is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionScope {
    Server,
    UserMapping,
    ForeignTable,
    Column,
}

impl fmt::Display for OptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "foreign server",
            Self::UserMapping => "user mapping",
            Self::ForeignTable => "foreign table",
            Self::Column => "foreign table column",
        })
    }
}

struct OptionSpec {
    name: &'static str,
    scope: OptionScope,
}

const VALID_OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "url",
        scope: OptionScope::Server,
    },
    OptionSpec {
        name: "querytimeout",
        scope: OptionScope::Server,
    },
    OptionSpec {
        name: "portNumber",
        scope: OptionScope::Server,
    },
    OptionSpec {
        name: "username",
        scope: OptionScope::UserMapping,
    },
    OptionSpec {
        name: "password",
        scope: OptionScope::UserMapping,
    },
    OptionSpec {
        name: "table",
        scope: OptionScope::ForeignTable,
    },
    OptionSpec {
        name: "queryable_columns",
        scope: OptionScope::ForeignTable,
    },
    OptionSpec {
        name: "column_name",
        scope: OptionScope::Column,
    },
];

/// Returns `true` if `name` may appear on an object of `scope`.
pub fn is_valid_option(name: &str, scope: OptionScope) -> bool {
    VALID_OPTIONS
        .iter()
        .any(|spec| spec.scope == scope && spec.name == name)
}

/// Lists the option names accepted for `scope`, in schema order.
pub fn valid_options_for(scope: OptionScope) -> Vec<&'static str> {
    VALID_OPTIONS
        .iter()
        .filter(|spec| spec.scope == scope)
        .map(|spec| spec.name)
        .collect()
}

/// Validates one object's option list.
///
/// Rejects unknown names (with a hint listing the valid ones), repeated
/// names, malformed integers, and missing required options.
pub fn validate_options<'a, I>(scope: OptionScope, options: I) -> FdwResult<()>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut seen = HashSet::new();
    for (name, value) in options {
        if !is_valid_option(name, scope) {
            let valid = valid_options_for(scope);
            let hint = if valid.is_empty() {
                "There are no valid options in this context.".to_string()
            } else {
                format!("Valid options in this context are: {}", valid.join(", "))
            };
            return Err(FdwError::InvalidOption {
                name: name.to_string(),
                hint,
            });
        }
        if !seen.insert(name) {
            return Err(FdwError::RedundantOption(name.to_string()));
        }
        match name {
            "querytimeout" => {
                parse_int_option::<u64>(name, value)?;
            }
            "portNumber" => {
                parse_int_option::<u16>(name, value)?;
            }
            _ => {}
        }
    }

    match scope {
        OptionScope::Server if !seen.contains("url") => {
            Err(FdwError::Configuration("URL must be specified".to_string()))
        }
        OptionScope::ForeignTable
            if !seen.contains("table") || !seen.contains("queryable_columns") =>
        {
            Err(FdwError::Configuration(
                "Table and queryable columns must be specified".to_string(),
            ))
        }
        _ => Ok(()),
    }
}

fn parse_int_option<T: std::str::FromStr>(name: &str, value: &str) -> FdwResult<T> {
    value.trim().parse::<T>().map_err(|_| {
        FdwError::Configuration(format!(
            "invalid value for integer option \"{name}\": {value}"
        ))
    })
}

fn lookup<'a>(options: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    options
        .iter()
        .find(|(option, _)| *option == name)
        .map(|(_, value)| *value)
}

/// Connection options of a foreign server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Contact points of the remote cluster.
    pub url: String,
    /// Per-request timeout handed to the driver, in milliseconds.
    pub query_timeout_ms: Option<u64>,
    pub port: Option<u16>,
}

impl ServerOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query_timeout_ms: None,
            port: None,
        }
    }

    /// Validates and parses a server option list.
    pub fn from_options(options: &[(&str, &str)]) -> FdwResult<Self> {
        validate_options(OptionScope::Server, options.iter().copied())?;
        let url = lookup(options, "url")
            .ok_or_else(|| FdwError::Configuration("URL must be specified".to_string()))?;
        Ok(Self {
            url: url.to_string(),
            query_timeout_ms: lookup(options, "querytimeout")
                .map(|value| parse_int_option("querytimeout", value))
                .transpose()?,
            port: lookup(options, "portNumber")
                .map(|value| parse_int_option("portNumber", value))
                .transpose()?,
        })
    }
}

/// Credentials of a user mapping. Unset fields fall back to the defaults
/// at connect time.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMappingOptions {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl UserMappingOptions {
    pub fn from_options(options: &[(&str, &str)]) -> FdwResult<Self> {
        validate_options(OptionScope::UserMapping, options.iter().copied())?;
        Ok(Self {
            username: lookup(options, "username").map(str::to_string),
            password: lookup(options, "password").map(str::to_string),
        })
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(DEFAULT_USERNAME)
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or(DEFAULT_PASSWORD)
    }
}

impl fmt::Debug for UserMappingOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserMappingOptions")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Remote table binding options of a foreign table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    /// Remote table name, optionally keyspace-qualified.
    pub table: String,
    /// Remote column names that may appear in a pushed-down `WHERE`.
    pub queryable_columns: Vec<String>,
}

impl TableOptions {
    pub fn new(table: impl Into<String>, queryable_columns: &str) -> Self {
        Self {
            table: table.into(),
            queryable_columns: split_column_list(queryable_columns),
        }
    }

    pub fn from_options(options: &[(&str, &str)]) -> FdwResult<Self> {
        validate_options(OptionScope::ForeignTable, options.iter().copied())?;
        let table = lookup(options, "table").ok_or_else(|| {
            FdwError::Configuration("Table and queryable columns must be specified".to_string())
        })?;
        Ok(Self::new(
            table,
            lookup(options, "queryable_columns").unwrap_or_default(),
        ))
    }

    pub fn is_queryable(&self, remote_column: &str) -> bool {
        self.queryable_columns
            .iter()
            .any(|column| column == remote_column)
    }
}

/// Splits a comma-separated column allow-list, dropping empty entries.
pub fn split_column_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|column| !column.is_empty())
        .map(str::to_string)
        .collect()
}

/// Per-column options of a foreign table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOptions {
    /// Remote column name when it differs from the local one.
    pub column_name: Option<String>,
}

impl ColumnOptions {
    pub fn from_options(options: &[(&str, &str)]) -> FdwResult<Self> {
        validate_options(OptionScope::Column, options.iter().copied())?;
        Ok(Self {
            column_name: lookup(options, "column_name").map(str::to_string),
        })
    }
}

/// Builds the driver connect parameters from server and user-mapping options.
pub fn connect_config(server: &ServerOptions, user: &UserMappingOptions) -> ConnectConfig {
    ConnectConfig {
        contact_points: server.url.clone(),
        port: server.port,
        credentials: Some(Credentials {
            username: user.username().to_string(),
            password: user.password().to_string(),
        }),
        request_timeout: server.query_timeout_ms.map(Duration::from_millis),
    }
}

/// Everything one scan needs to know about where its table lives.
///
/// Resolved once per scan from the server, user mapping, and table options;
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBinding {
    pub server_id: ServerId,
    pub server_name: String,
    pub user_id: UserId,
    pub server: ServerOptions,
    pub user: UserMappingOptions,
    pub table: TableOptions,
}

impl TableBinding {
    pub fn resolve(server: &ForeignServer, user: &UserMapping, table: &ForeignTable) -> Self {
        Self {
            server_id: server.id,
            server_name: server.name.clone(),
            user_id: user.user_id,
            server: server.options.clone(),
            user: user.options.clone(),
            table: table.options.clone(),
        }
    }

    pub fn remote_table(&self) -> &str {
        &self.table.table
    }

    pub fn queryable_columns(&self) -> &[String] {
        &self.table.queryable_columns
    }

    pub fn is_queryable(&self, remote_column: &str) -> bool {
        self.table.is_queryable(remote_column)
    }

    pub fn connect_config(&self) -> ConnectConfig {
        connect_config(&self.server, &self.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_option_lists_valid_names_for_scope() {
        let err = validate_options(OptionScope::Server, [("url", "h"), ("table", "t")])
            .expect_err("table is not a server option");
        assert_eq!(
            err,
            FdwError::InvalidOption {
                name: "table".to_string(),
                hint: "Valid options in this context are: url, querytimeout, portNumber"
                    .to_string(),
            }
        );
    }

    #[test]
    fn repeated_option_is_redundant() {
        let err = validate_options(
            OptionScope::UserMapping,
            [("username", "a"), ("username", "b")],
        )
        .expect_err("duplicate");
        assert_eq!(err, FdwError::RedundantOption("username".to_string()));
    }

    #[test]
    fn server_requires_url() {
        let err = validate_options(OptionScope::Server, [("portNumber", "9042")])
            .expect_err("missing url");
        assert_eq!(err.to_string(), "URL must be specified");
    }

    #[test]
    fn table_requires_table_and_queryable_columns() {
        let err = validate_options(OptionScope::ForeignTable, [("table", "users")])
            .expect_err("missing allow-list");
        assert_eq!(
            err.to_string(),
            "Table and queryable columns must be specified"
        );
        validate_options(
            OptionScope::ForeignTable,
            [("table", "users"), ("queryable_columns", "id")],
        )
        .expect("complete table options");
    }

    #[test]
    fn integer_options_must_parse() {
        let err = validate_options(
            OptionScope::Server,
            [("url", "h"), ("portNumber", "ninety")],
        )
        .expect_err("bad port");
        assert!(matches!(err, FdwError::Configuration(_)));
    }

    #[test]
    fn server_options_parse_typed_values() {
        let options = ServerOptions::from_options(&[
            ("url", "10.0.0.1,10.0.0.2"),
            ("querytimeout", "1500"),
            ("portNumber", "9042"),
        ])
        .expect("server options");
        assert_eq!(options.url, "10.0.0.1,10.0.0.2");
        assert_eq!(options.query_timeout_ms, Some(1500));
        assert_eq!(options.port, Some(9042));
    }

    #[test]
    fn credentials_default_when_unset() {
        let user = UserMappingOptions::from_options(&[]).expect("empty mapping");
        let config = connect_config(&ServerOptions::new("h"), &user);
        let credentials = config.credentials.expect("credentials");
        assert_eq!(credentials.username, DEFAULT_USERNAME);
        assert_eq!(credentials.password, DEFAULT_PASSWORD);
    }

    #[test]
    fn debug_output_redacts_password() {
        let user = UserMappingOptions::from_options(&[("username", "u"), ("password", "hunter2")])
            .expect("mapping");
        let rendered = format!("{user:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn queryable_columns_are_trimmed() {
        let options = TableOptions::new("users", " id , name,,");
        assert_eq!(options.queryable_columns, vec!["id", "name"]);
        assert!(options.is_queryable("name"));
        assert!(!options.is_queryable("email"));
    }

    #[test]
    fn column_scope_accepts_only_column_name() {
        let options =
            ColumnOptions::from_options(&[("column_name", "user_name")]).expect("column options");
        assert_eq!(options.column_name.as_deref(), Some("user_name"));
        assert!(ColumnOptions::from_options(&[("url", "h")]).is_err());
    }
}
