use std::sync::Arc;

use anyhow::{Context, Result};
use cass_fusion::{CassFusion, ForeignCatalog, ScanIdentity, UserId};
use cass_store::{MemoryNode, RemoteType, RemoteValue};
use datafusion::arrow::array::{Array, Int64Array, StringArray, TimestampNanosecondArray};
use datafusion::arrow::record_batch::RecordBatch;
use uuid::Uuid;

const USERS_CATALOG: &str = r#"{
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

struct Harness {
    node: MemoryNode,
    fusion: CassFusion,
}

impl Harness {
    async fn start() -> Result<Self> {
        Self::start_with(USERS_CATALOG).await
    }

    async fn start_with(catalog_json: &str) -> Result<Self> {
        let node = MemoryNode::new("127.0.0.1");
        node.create_table("users", &[("id", RemoteType::BigInt), ("name", RemoteType::Text)]);
        for (id, name) in [(5_i64, "alice"), (6, "bob"), (7, "carol")] {
            node.insert("users", vec![id.into(), name.into()])
                .with_context(|| format!("seed user {id}"))?;
        }
        Self::on_node(node, catalog_json).await
    }

    async fn on_node(node: MemoryNode, catalog_json: &str) -> Result<Self> {
        let catalog = ForeignCatalog::from_json_str(catalog_json).context("load catalog")?;
        let fusion = CassFusion::new(
            Arc::new(node.clone()),
            catalog,
            ScanIdentity::new(UserId(1)),
        )
        .await?;
        Ok(Self { node, fusion })
    }

    async fn remote_query(&self) -> Result<String> {
        self.remote_query_of("users").await
    }

    async fn remote_query_of(&self, table: &str) -> Result<String> {
        let plan = self
            .fusion
            .last_plan(table)
            .await?
            .with_context(|| format!("{table} has not been scanned"))?;
        Ok(plan.query)
    }
}

fn row_count(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}

fn text_column(batches: &[RecordBatch], index: usize) -> Result<Vec<String>> {
    let mut values = Vec::new();
    for batch in batches {
        let column = batch
            .column(index)
            .as_any()
            .downcast_ref::<StringArray>()
            .with_context(|| format!("column {index} is not Utf8"))?;
        for row in 0..batch.num_rows() {
            values.push(column.value(row).to_string());
        }
    }
    values.sort();
    Ok(values)
}

fn id_name_rows(batches: &[RecordBatch]) -> Result<Vec<(i64, String)>> {
    let mut rows = Vec::new();
    for batch in batches {
        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .context("id column is not Int64")?;
        let names = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .context("name column is not Utf8")?;
        for index in 0..batch.num_rows() {
            rows.push((ids.value(index), names.value(index).to_string()));
        }
    }
    rows.sort();
    Ok(rows)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn equality_on_queryable_column_is_pushed_down() -> Result<()> {
    let harness = Harness::start().await?;

    let batches = harness
        .fusion
        .sql("SELECT id, name FROM users WHERE id = 5")
        .await?;
    assert_eq!(id_name_rows(&batches)?, vec![(5, "alice".to_string())]);

    let plan = harness
        .fusion
        .last_plan("users")
        .await?
        .context("scan plan")?;
    assert_eq!(plan.query, "SELECT id, name FROM users WHERE id = 5");
    assert_eq!(plan.retrieved_attrs, vec![1, 2]);
    assert_eq!(plan.pushed_clauses, vec![0]);
    assert_eq!(harness.fusion.metrics().snapshot().pushed_clauses, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_queryable_column_is_filtered_locally() -> Result<()> {
    let harness = Harness::start().await?;

    let batches = harness
        .fusion
        .sql("SELECT id, name FROM users WHERE name = 'bob'")
        .await?;
    assert_eq!(id_name_rows(&batches)?, vec![(6, "bob".to_string())]);
    assert_eq!(harness.remote_query().await?, "SELECT id, name FROM users");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn count_star_selects_null() -> Result<()> {
    let harness = Harness::start().await?;

    let batches = harness.fusion.sql("SELECT COUNT(*) FROM users").await?;
    assert_eq!(row_count(&batches), 1);
    let counts = batches[0]
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .context("count column is not Int64")?;
    assert_eq!(counts.value(0), 3);
    assert_eq!(harness.remote_query().await?, "SELECT NULL FROM users");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_node_fails_the_query() -> Result<()> {
    let harness = Harness::start().await?;
    harness.node.set_unavailable(true);

    let err = harness
        .fusion
        .sql("SELECT id FROM users")
        .await
        .expect_err("remote failure");
    let message = format!("{err:#}");
    assert!(
        message.contains("Unable to run query: 'Cannot achieve consistency level ONE'"),
        "unexpected error: {message}"
    );
    assert_eq!(harness.fusion.metrics().snapshot().remote_errors, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scans_share_one_cached_session() -> Result<()> {
    let harness = Harness::start().await?;

    for id in [5, 6, 7] {
        let batches = harness
            .fusion
            .sql(&format!("SELECT name FROM users WHERE id = {id}"))
            .await?;
        assert_eq!(row_count(&batches), 1);
    }

    let stats = harness.node.stats();
    assert_eq!(stats.clusters_created, 1);
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.executes, 3);
    assert_eq!(harness.fusion.cache().session_count(), 1);

    let metrics = harness.fusion.metrics().snapshot();
    assert_eq!(metrics.cache_misses, 1);
    assert_eq!(metrics.cache_hits, 2);

    harness.fusion.shutdown();
    let stats = harness.node.stats();
    assert_eq!(stats.sessions_closed, 1);
    assert_eq!(stats.clusters_closed, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_contact_point_reports_connection_error() -> Result<()> {
    let catalog = USERS_CATALOG.replace("127.0.0.1", "10.0.0.9");
    let harness = Harness::start_with(&catalog).await?;

    let err = harness
        .fusion
        .sql("SELECT id FROM users")
        .await
        .expect_err("no reachable host");
    let message = format!("{err:#}");
    assert!(message.contains("No hosts available"), "unexpected error: {message}");
    assert_eq!(harness.fusion.metrics().snapshot().connect_failures, 1);
    assert_eq!(harness.node.stats().failed_connects, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remapped_column_name_is_used_remotely() -> Result<()> {
    let catalog = r#"{
        "servers": [{"name": "cass", "options": {"url": "127.0.0.1"}}],
        "user_mappings": [{"server": "cass"}],
        "tables": [{
            "name": "people",
            "server": "cass",
            "columns": [
                {"name": "person_id", "type": "bigint", "options": {"column_name": "id"}},
                {"name": "name", "type": "text"}
            ],
            "options": {"table": "users", "queryable_columns": "id"}
        }]
    }"#;
    let harness = Harness::start_with(catalog).await?;

    let batches = harness
        .fusion
        .sql("SELECT person_id, name FROM people WHERE person_id = 7")
        .await?;
    assert_eq!(id_name_rows(&batches)?, vec![(7, "carol".to_string())]);
    let plan = harness
        .fusion
        .last_plan("people")
        .await?
        .context("scan plan")?;
    assert_eq!(plan.query, "SELECT id, name FROM users WHERE id = 7");

    let missing = harness
        .fusion
        .sql("SELECT name FROM people WHERE person_id = 99")
        .await?;
    assert_eq!(row_count(&missing), 0);
    Ok(())
}

const THING_ID: &str = "123e4567-e89b-12d3-a456-426614174000";

async fn things_harness() -> Result<Harness> {
    let node = MemoryNode::new("127.0.0.1");
    node.create_table("things", &[("uid", RemoteType::Uuid), ("name", RemoteType::Text)]);
    for (uid, name) in [(THING_ID, "lamp"), ("9f3c2a10-0d4e-4b8a-9c1f-5e6d7a8b9c0d", "desk")] {
        let uid = Uuid::parse_str(uid).context("seed uuid")?;
        node.insert("things", vec![uid.into(), name.into()])
            .with_context(|| format!("seed thing {name}"))?;
    }
    let catalog = r#"{
        "servers": [{"name": "cass", "options": {"url": "127.0.0.1"}}],
        "user_mappings": [{"server": "cass"}],
        "tables": [{
            "name": "things",
            "server": "cass",
            "columns": [
                {"name": "uid", "type": "uuid"},
                {"name": "name", "type": "text"}
            ],
            "options": {"table": "things", "queryable_columns": "uid"}
        }]
    }"#;
    Harness::on_node(node, catalog).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uuid_string_literal_is_pushed_bare() -> Result<()> {
    let harness = things_harness().await?;

    let batches = harness
        .fusion
        .sql(&format!("SELECT name FROM things WHERE uid = '{THING_ID}'"))
        .await?;
    assert_eq!(text_column(&batches, 0)?, vec!["lamp".to_string()]);
    assert_eq!(
        harness.remote_query_of("things").await?,
        format!("SELECT uid, name FROM things WHERE uid = {THING_ID}")
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_uuid_literal_stays_local() -> Result<()> {
    let harness = things_harness().await?;

    let batches = harness
        .fusion
        .sql("SELECT name FROM things WHERE uid = 'not-a-uuid'")
        .await?;
    assert_eq!(row_count(&batches), 0);
    assert_eq!(
        harness.remote_query_of("things").await?,
        "SELECT uid, name FROM things"
    );
    assert_eq!(harness.fusion.metrics().snapshot().remote_errors, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn char_and_name_literals_are_quoted() -> Result<()> {
    let node = MemoryNode::new("127.0.0.1");
    node.create_table("labels", &[("code", RemoteType::Text), ("label", RemoteType::Varchar)]);
    for (code, label) in [("a", "alpha"), ("b", "beta"), ("o'k", "gamma")] {
        node.insert("labels", vec![code.into(), label.into()])
            .with_context(|| format!("seed label {code}"))?;
    }
    let catalog = r#"{
        "servers": [{"name": "cass", "options": {"url": "127.0.0.1"}}],
        "user_mappings": [{"server": "cass"}],
        "tables": [{
            "name": "labels",
            "server": "cass",
            "columns": [
                {"name": "code", "type": "char"},
                {"name": "label", "type": "name"}
            ],
            "options": {"table": "labels", "queryable_columns": "code,label"}
        }]
    }"#;
    let harness = Harness::on_node(node, catalog).await?;

    let batches = harness
        .fusion
        .sql("SELECT label FROM labels WHERE code = 'b'")
        .await?;
    assert_eq!(text_column(&batches, 0)?, vec!["beta".to_string()]);
    assert_eq!(
        harness.remote_query_of("labels").await?,
        "SELECT code, label FROM labels WHERE code = 'b'"
    );

    let batches = harness
        .fusion
        .sql("SELECT code FROM labels WHERE label = 'gamma'")
        .await?;
    assert_eq!(text_column(&batches, 0)?, vec!["o'k".to_string()]);
    assert_eq!(
        harness.remote_query_of("labels").await?,
        "SELECT code, label FROM labels WHERE label = 'gamma'"
    );

    let batches = harness
        .fusion
        .sql("SELECT label FROM labels WHERE code = 'o''k'")
        .await?;
    assert_eq!(text_column(&batches, 0)?, vec!["gamma".to_string()]);
    assert_eq!(
        harness.remote_query_of("labels").await?,
        "SELECT code, label FROM labels WHERE code = 'o''k'"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timestamp_literal_is_pushed_quoted() -> Result<()> {
    const AT_MILLIS: i64 = 1_704_164_645_000;

    let node = MemoryNode::new("127.0.0.1");
    node.create_table("events", &[("id", RemoteType::BigInt), ("at", RemoteType::Timestamp)]);
    for (id, millis) in [(1_i64, AT_MILLIS), (2, 1_704_240_000_000)] {
        node.insert("events", vec![id.into(), RemoteValue::Timestamp(millis)])
            .with_context(|| format!("seed event {id}"))?;
    }
    let catalog = r#"{
        "servers": [{"name": "cass", "options": {"url": "127.0.0.1"}}],
        "user_mappings": [{"server": "cass"}],
        "tables": [{
            "name": "events",
            "server": "cass",
            "columns": [
                {"name": "id", "type": "bigint"},
                {"name": "at", "type": "timestamp"}
            ],
            "options": {"table": "events", "queryable_columns": "at"}
        }]
    }"#;
    let harness = Harness::on_node(node, catalog).await?;

    let batches = harness
        .fusion
        .sql("SELECT id, at FROM events WHERE at = '2024-01-02 03:04:05'")
        .await?;
    assert_eq!(row_count(&batches), 1);
    let ids = batches
        .iter()
        .find(|batch| batch.num_rows() > 0)
        .context("matching batch")?;
    let id = ids
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .context("id column is not Int64")?;
    let at = ids
        .column(1)
        .as_any()
        .downcast_ref::<TimestampNanosecondArray>()
        .context("at column is not a nanosecond timestamp")?;
    assert_eq!(id.value(0), 1);
    assert_eq!(at.value(0), AT_MILLIS * 1_000_000);
    assert_eq!(
        harness.remote_query_of("events").await?,
        "SELECT id, at FROM events WHERE at = '2024-01-02 03:04:05'"
    );
    Ok(())
}
