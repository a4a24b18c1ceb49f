//! Foreign catalog: servers, user mappings and foreign tables, plus their
//! registration into a DataFusion session.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use datafusion::prelude::SessionContext;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::connection::ConnectionCache;
use crate::error::{FdwError, FdwResult};
use crate::metrics::ScanMetrics;
use crate::options::{
    ColumnOptions, ServerOptions, TableBinding, TableOptions, UserMappingOptions,
};
use crate::provider::CassandraTableProvider;
use crate::relation::{LocalColumn, LocalRelation, LocalType};
use crate::scan::ScanIdentity;

/// Catalog-assigned foreign server identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub u32);

/// Catalog-assigned local user identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server:{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user:{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignServer {
    pub id: ServerId,
    pub name: String,
    pub options: ServerOptions,
}

/// A user mapping resolved for one acting user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMapping {
    pub user_id: UserId,
    pub server_id: ServerId,
    pub options: UserMappingOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignTable {
    pub server_id: ServerId,
    pub relation: LocalRelation,
    pub options: TableOptions,
}

impl ForeignTable {
    pub fn name(&self) -> &str {
        self.relation.name()
    }
}

/// In-memory option source for foreign objects.
#[derive(Debug, Clone, Default)]
pub struct ForeignCatalog {
    servers: BTreeMap<ServerId, ForeignServer>,
    /// `None` user is the PUBLIC mapping, used when no per-user one exists.
    user_mappings: HashMap<(ServerId, Option<UserId>), UserMappingOptions>,
    tables: BTreeMap<String, ForeignTable>,
    next_server_id: u32,
}

impl ForeignCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(
        &mut self,
        name: impl Into<String>,
        options: ServerOptions,
    ) -> FdwResult<ServerId> {
        let name = name.into();
        if self.server_by_name(&name).is_some() {
            return Err(FdwError::Configuration(format!(
                "server \"{name}\" already exists"
            )));
        }
        self.next_server_id += 1;
        let id = ServerId(self.next_server_id);
        self.servers.insert(id, ForeignServer { id, name, options });
        Ok(id)
    }

    /// Adds a user mapping; `user: None` creates the PUBLIC mapping.
    pub fn add_user_mapping(
        &mut self,
        server_id: ServerId,
        user: Option<UserId>,
        options: UserMappingOptions,
    ) -> FdwResult<()> {
        let server = self.server_or_err(server_id)?;
        if self.user_mappings.contains_key(&(server_id, user)) {
            let who = user.map_or_else(|| "public".to_string(), |user| user.to_string());
            return Err(FdwError::Configuration(format!(
                "user mapping for \"{who}\" already exists for server \"{}\"",
                server.name
            )));
        }
        self.user_mappings.insert((server_id, user), options);
        Ok(())
    }

    pub fn add_table(
        &mut self,
        server_id: ServerId,
        relation: LocalRelation,
        options: TableOptions,
    ) -> FdwResult<()> {
        self.server_or_err(server_id)?;
        relation.check_attnos()?;
        if self.tables.contains_key(relation.name()) {
            return Err(FdwError::Configuration(format!(
                "relation \"{}\" already exists",
                relation.name()
            )));
        }
        self.tables.insert(
            relation.name().to_string(),
            ForeignTable {
                server_id,
                relation,
                options,
            },
        );
        Ok(())
    }

    pub fn server(&self, id: ServerId) -> Option<&ForeignServer> {
        self.servers.get(&id)
    }

    pub fn server_by_name(&self, name: &str) -> Option<&ForeignServer> {
        self.servers.values().find(|server| server.name == name)
    }

    pub fn table(&self, name: &str) -> Option<&ForeignTable> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &ForeignTable> {
        self.tables.values()
    }

    /// Looks up the mapping for `user`, falling back to the PUBLIC one.
    pub fn user_mapping(&self, server_id: ServerId, user: UserId) -> FdwResult<UserMapping> {
        let server = self.server_or_err(server_id)?;
        let options = self
            .user_mappings
            .get(&(server_id, Some(user)))
            .or_else(|| self.user_mappings.get(&(server_id, None)))
            .ok_or_else(|| {
                FdwError::Configuration(format!(
                    "user mapping not found for \"{user}\" on server \"{}\"",
                    server.name
                ))
            })?;
        Ok(UserMapping {
            user_id: user,
            server_id,
            options: options.clone(),
        })
    }

    /// Resolves everything a scan of `table` by `user` needs.
    pub fn binding(&self, table: &str, user: UserId) -> FdwResult<TableBinding> {
        let table = self.table_or_err(table)?;
        let server = self.server_or_err(table.server_id)?;
        let mapping = self.user_mapping(table.server_id, user)?;
        Ok(TableBinding::resolve(server, &mapping, table))
    }

    pub(crate) fn table_or_err(&self, name: &str) -> FdwResult<&ForeignTable> {
        self.table(name).ok_or_else(|| {
            FdwError::Configuration(format!("foreign table \"{name}\" does not exist"))
        })
    }

    pub(crate) fn server_or_err(&self, id: ServerId) -> FdwResult<&ForeignServer> {
        self.server(id)
            .ok_or_else(|| FdwError::Configuration(format!("foreign server {id} does not exist")))
    }

    /// Builds a catalog from its JSON definition, validating every option
    /// list against its scope.
    pub fn from_json_str(text: &str) -> FdwResult<Self> {
        let definition: CatalogDefinition = serde_json::from_str(text)
            .map_err(|err| FdwError::Configuration(format!("invalid catalog definition: {err}")))?;

        let mut catalog = Self::new();
        for server in &definition.servers {
            let options = ServerOptions::from_options(&option_pairs(&server.options))?;
            catalog.add_server(server.name.clone(), options)?;
        }
        for mapping in &definition.user_mappings {
            let server_id = catalog.server_id_by_name(&mapping.server)?;
            let options = UserMappingOptions::from_options(&option_pairs(&mapping.options))?;
            catalog.add_user_mapping(server_id, mapping.user.map(UserId), options)?;
        }
        for table in &definition.tables {
            let server_id = catalog.server_id_by_name(&table.server)?;
            let options = TableOptions::from_options(&option_pairs(&table.options))?;
            let columns = table
                .columns
                .iter()
                .map(|column| {
                    Ok(LocalColumn {
                        name: column.name.clone(),
                        ty: column.ty,
                        dropped: false,
                        options: ColumnOptions::from_options(&option_pairs(&column.options))?,
                    })
                })
                .collect::<FdwResult<Vec<_>>>()?;
            catalog.add_table(
                server_id,
                LocalRelation::new(table.name.clone(), columns),
                options,
            )?;
        }
        Ok(catalog)
    }

    fn server_id_by_name(&self, name: &str) -> FdwResult<ServerId> {
        self.server_by_name(name)
            .map(|server| server.id)
            .ok_or_else(|| FdwError::Configuration(format!("server \"{name}\" does not exist")))
    }
}

fn option_pairs(options: &BTreeMap<String, String>) -> Vec<(&str, &str)> {
    options
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct CatalogDefinition {
    #[serde(default)]
    servers: Vec<ServerDefinition>,
    #[serde(default)]
    user_mappings: Vec<UserMappingDefinition>,
    #[serde(default)]
    tables: Vec<TableDefinition>,
}

#[derive(Debug, Deserialize)]
struct ServerDefinition {
    name: String,
    #[serde(default)]
    options: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct UserMappingDefinition {
    server: String,
    #[serde(default)]
    user: Option<u32>,
    #[serde(default)]
    options: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TableDefinition {
    name: String,
    server: String,
    columns: Vec<ColumnDefinition>,
    #[serde(default)]
    options: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ColumnDefinition {
    name: String,
    #[serde(rename = "type")]
    ty: LocalType,
    #[serde(default)]
    options: BTreeMap<String, String>,
}

/// Registers every foreign table of `catalog` into `session_context`.
///
/// Returns the names registered by this call; names that already resolve
/// to a provider are skipped.
pub async fn register_foreign_tables(
    session_context: &SessionContext,
    catalog: Arc<ForeignCatalog>,
    cache: Arc<ConnectionCache>,
    metrics: Arc<ScanMetrics>,
    identity: ScanIdentity,
) -> Result<Vec<String>> {
    let mut registered = Vec::new();
    for table in catalog.tables() {
        let name = table.name();
        if session_context.table_provider(name).await.is_ok() {
            warn!(table = %name, "skipping foreign table that is already registered");
            continue;
        }
        let provider = Arc::new(
            CassandraTableProvider::new(
                Arc::clone(&catalog),
                name,
                Arc::clone(&cache),
                Arc::clone(&metrics),
                identity,
            )
            .with_context(|| format!("build provider for foreign table {name}"))?,
        );
        session_context
            .register_table(name, provider)
            .with_context(|| format!("register foreign table {name}"))?;
        info!(table = %name, remote_table = %table.options.table, "registered foreign table");
        registered.push(name.to_string());
    }
    Ok(registered)
}
