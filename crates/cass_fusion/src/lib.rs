//! Cassandra foreign tables for DataFusion.
//!
//! A foreign table is declared in a [`ForeignCatalog`] (server, user
//! mapping, table and column options). Scans translate the engine's
//! projection and equality filters into a CQL `SELECT`, run it over a
//! session from the process-wide [`ConnectionCache`], and decode the result
//! into typed local rows.
//!
//! [`CassFusion`] is the composition root: it owns the session context,
//! the connection cache and the scan metrics.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use cass_store::Driver;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::prelude::SessionContext;
use tracing::info;

pub mod catalog;
pub mod codec;
pub mod connection;
pub mod cursor;
pub mod deparse;
pub mod error;
pub mod estimate;
pub mod metrics;
pub mod options;
pub mod provider;
pub mod relation;
pub mod restriction;
pub mod scan;

pub use catalog::{register_foreign_tables, ForeignCatalog, ServerId, UserId};
pub use connection::ConnectionCache;
pub use error::{FdwError, FdwResult};
pub use estimate::ForeignScanPlan;
pub use metrics::{ScanMetrics, ScanMetricsSnapshot};
pub use provider::CassandraTableProvider;
pub use scan::ScanIdentity;

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CassFusionConfig {
    /// JSON catalog definition to load at startup.
    pub catalog_path: Option<PathBuf>,
    /// Local user that scans run as.
    pub acting_user: UserId,
}

impl Default for CassFusionConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            acting_user: UserId(1),
        }
    }
}

impl CassFusionConfig {
    /// Builds configuration from `CASS_FUSION_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_values(
            std::env::var("CASS_FUSION_CATALOG").ok(),
            std::env::var("CASS_FUSION_ACTING_USER").ok(),
        )
    }

    fn from_values(catalog_path: Option<String>, acting_user: Option<String>) -> Result<Self> {
        let catalog_path = catalog_path
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        let acting_user = UserId(parse_u32(acting_user, 1)?);
        Ok(Self {
            catalog_path,
            acting_user,
        })
    }

    /// Loads the configured catalog file, if any.
    pub fn load_catalog(&self) -> Result<Option<ForeignCatalog>> {
        let Some(path) = &self.catalog_path else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read catalog file {}", path.display()))?;
        let catalog = ForeignCatalog::from_json_str(&text)
            .with_context(|| format!("load catalog file {}", path.display()))?;
        Ok(Some(catalog))
    }
}

/// Parses an optional `u32` with fallback default.
fn parse_u32(value: Option<String>, default_value: u32) -> Result<u32> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid u32 value: {raw}")),
        None => Ok(default_value),
    }
}

/// A DataFusion session with every foreign table of a catalog registered.
pub struct CassFusion {
    session_context: SessionContext,
    catalog: Arc<ForeignCatalog>,
    cache: Arc<ConnectionCache>,
    metrics: Arc<ScanMetrics>,
    registered_tables: Vec<String>,
}

impl CassFusion {
    pub async fn new(
        driver: Arc<dyn Driver>,
        catalog: ForeignCatalog,
        identity: ScanIdentity,
    ) -> Result<Self> {
        let metrics = Arc::new(ScanMetrics::default());
        let cache = Arc::new(ConnectionCache::new(driver).with_metrics(Arc::clone(&metrics)));
        let catalog = Arc::new(catalog);
        let session_context = SessionContext::new();
        let registered_tables = register_foreign_tables(
            &session_context,
            Arc::clone(&catalog),
            Arc::clone(&cache),
            Arc::clone(&metrics),
            identity,
        )
        .await
        .context("register foreign tables")?;
        info!(tables = registered_tables.len(), "cass_fusion session ready");
        Ok(Self {
            session_context,
            catalog,
            cache,
            metrics,
            registered_tables,
        })
    }

    pub fn session_context(&self) -> &SessionContext {
        &self.session_context
    }

    pub fn catalog(&self) -> &ForeignCatalog {
        &self.catalog
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<ScanMetrics> {
        &self.metrics
    }

    pub fn registered_tables(&self) -> &[String] {
        &self.registered_tables
    }

    /// Plans and executes one SQL statement.
    pub async fn sql(&self, sql: &str) -> Result<Vec<RecordBatch>> {
        let frame = self
            .session_context
            .sql(sql)
            .await
            .with_context(|| format!("plan sql: {sql}"))?;
        frame
            .collect()
            .await
            .with_context(|| format!("execute sql: {sql}"))
    }

    /// Plan of the most recent scan of `table`.
    pub async fn last_plan(&self, table: &str) -> Result<Option<ForeignScanPlan>> {
        let provider = self
            .session_context
            .table_provider(table)
            .await
            .with_context(|| format!("resolve table {table}"))?;
        let provider = provider
            .as_any()
            .downcast_ref::<CassandraTableProvider>()
            .ok_or_else(|| anyhow!("table {table} is not a foreign table"))?;
        Ok(provider.last_plan())
    }

    /// Closes every cached session and the shared cluster.
    pub fn shutdown(&self) {
        self.cache.shutdown_all();
    }
}
