//! Binary entrypoint for trying foreign-table scans against an embedded node.
//!
//! `demo` seeds an in-memory store, registers the catalog's foreign tables
//! and runs one SQL statement, printing the pushed-down remote query next to
//! the result.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cass_fusion::{CassFusion, CassFusionConfig, ForeignCatalog, ScanIdentity};
use cass_store::{MemoryNode, RemoteType};
use clap::{Parser, Subcommand};
use datafusion::arrow::util::pretty::pretty_format_batches;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_CATALOG: &str = r#"{
    "servers": [{"name": "cass", "options": {"url": "127.0.0.1"}}],
    "user_mappings": [{"server": "cass"}],
    "tables": [{
        "name": "users",
        "server": "cass",
        "columns": [
            {"name": "id", "type": "bigint"},
            {"name": "name", "type": "text"}
        ],
        "options": {"table": "users", "queryable_columns": "id"}
    }]
}"#;

#[derive(Parser, Debug)]
#[command(name = "cass-fusion")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs one query against a seeded in-memory node.
    Demo(DemoArgs),
}

#[derive(Parser, Debug, Clone)]
struct DemoArgs {
    /// Catalog definition; overrides `CASS_FUSION_CATALOG`.
    #[arg(long)]
    catalog: Option<PathBuf>,

    #[arg(long, default_value = "SELECT id, name FROM users WHERE id = 5")]
    sql: String,

    /// Rows seeded into the demo `users` table.
    #[arg(long, default_value_t = 10)]
    rows: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cass_fusion=info,cass_store=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = CassFusionConfig::from_env()?;
    match cli.command {
        Command::Demo(args) => {
            if args.catalog.is_some() {
                config.catalog_path = args.catalog.clone();
            }
            run_demo(config, &args).await
        }
    }
}

async fn run_demo(config: CassFusionConfig, args: &DemoArgs) -> Result<()> {
    let catalog = match config.load_catalog()? {
        Some(catalog) => catalog,
        None => ForeignCatalog::from_json_str(DEMO_CATALOG).context("load demo catalog")?,
    };

    let node = MemoryNode::new("127.0.0.1");
    seed_users(&node, args.rows)?;

    let fusion = CassFusion::new(
        Arc::new(node.clone()),
        catalog,
        ScanIdentity::new(config.acting_user),
    )
    .await?;

    let result = fusion.sql(&args.sql).await;
    for table in fusion.registered_tables() {
        if let Some(plan) = fusion.last_plan(table).await? {
            for (label, value) in plan.explain(true) {
                println!("{table}: {label}: {value}");
            }
        }
    }
    let batches = result?;
    println!("{}", pretty_format_batches(&batches)?);

    info!(
        metrics = %fusion.metrics().render_text().replace('\n', " "),
        remote_executes = node.stats().executes,
        "demo finished"
    );
    fusion.shutdown();
    Ok(())
}

fn seed_users(node: &MemoryNode, rows: i64) -> Result<()> {
    node.create_table("users", &[("id", RemoteType::BigInt), ("name", RemoteType::Text)]);
    for id in 1..=rows {
        node.insert("users", vec![id.into(), format!("user-{id}").into()])
            .with_context(|| format!("seed users row {id}"))?;
    }
    Ok(())
}
