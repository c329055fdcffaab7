use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use tempfile::{tempdir, TempDir};

use medallion::app::ports::{InputLocation, TransformationRunner};
use medallion::checkpoint::{self, CheckpointStore};
use medallion::config::{self, PipelineConfig};
use medallion::dataset::Dataset;
use medallion::domain::{Tier, TransformSpec};
use medallion::error::{PipelineError, TransformError};
use medallion::infra::object_store::local_path;
use medallion::infra::{ExactMatchDedup, LocalObjectStore};
use medallion::observability::RecordingObserver;
use medallion::pipeline::{PipelineDriver, Services};
use medallion::quality::ContractQualityGate;

/// Runner that unions its inputs into the candidate and remembers what it ran.
#[derive(Default)]
struct UnionRunner {
    calls: Mutex<Vec<String>>,
}

impl UnionRunner {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransformationRunner for UnionRunner {
    async fn run(
        &self,
        spec: &TransformSpec,
        inputs: &[InputLocation],
        output: &Path,
    ) -> Result<PathBuf, TransformError> {
        self.calls.lock().unwrap().push(spec.name.clone());
        let mut out = Dataset::default();
        for input in inputs {
            let path = local_path(&input.location)
                .ok_or_else(|| TransformError::new(&spec.name, format!("not a file URI: {}", input.location)))?;
            let dataset = Dataset::read_from(&path).map_err(|e| TransformError::new(&spec.name, e))?;
            out.union(dataset);
        }
        out.write_atomic(output).map_err(|e| TransformError::new(&spec.name, e))?;
        Ok(output.to_path_buf())
    }
}

const CONFIG: &str = r#"
[pipeline]
max_concurrency = 2

[[sources]]
name = "erp"
kind = "sqlite"
database = "DATABASE"
tables = [
  { name = "orders", query = "SELECT id, email, total FROM orders", incremental_column = "id" },
  { name = "customers", query = "SELECT id, name, ssn, email FROM customers" },
]

[privacy.customers]
exclude_columns = ["ssn"]
pseudonymize_columns = ["email"]

[contracts.orders_clean]
required_columns = ["id", "total"]
rules = [{ name = "has_rows", kind = "min_rows", params = { min = MIN_ROWS } }]

[tiers.cleaned]
transforms = [
  { name = "orders_clean", inputs = ["raw:erp.orders"], contract = "orders_clean", dedup = { match_columns = ["id"] } },
  { name = "customers_clean", inputs = ["raw:erp.customers"] },
]

[tiers.aggregated]
transforms = [{ name = "order_summary", inputs = ["cleaned:orders_clean"] }]
"#;

fn seed_database(path: &Path) -> Result<()> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, email TEXT, total REAL);
         INSERT INTO orders VALUES (1, 'a@example.com', 10.0), (2, 'b@example.com', 12.5), (3, 'c@example.com', 7.25);
         CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, ssn TEXT, email TEXT);
         INSERT INTO customers VALUES (1, 'Ada', '123-45-6789', 'ada@example.com');",
    )?;
    Ok(())
}

struct Fixture {
    dir: TempDir,
    config: PipelineConfig,
    runner: Arc<UnionRunner>,
    observer: Arc<RecordingObserver>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl Fixture {
    fn new(database: &str, min_rows: u64) -> Result<Self> {
        let dir = tempdir()?;
        seed_database(&dir.path().join("erp.db"))?;
        let text = CONFIG
            .replace("DATABASE", database)
            .replace("MIN_ROWS", &min_rows.to_string());
        let config = config::resolve(config::parse(&text)?, dir.path())?;
        let checkpoints = checkpoint::open(config.checkpoint_backend, &config.checkpoint_path)?;
        Ok(Self {
            dir,
            config,
            runner: Arc::new(UnionRunner::default()),
            observer: Arc::new(RecordingObserver::default()),
            checkpoints,
        })
    }

    fn driver(&self) -> PipelineDriver {
        let services = Services {
            runner: self.runner.clone(),
            gate: Arc::new(ContractQualityGate::default()),
            dedup: Arc::new(ExactMatchDedup),
            store: Arc::new(LocalObjectStore::new(&self.config.object_store_root)),
            checkpoints: self.checkpoints.clone(),
            observer: self.observer.clone(),
        };
        PipelineDriver::from_config(&self.config, services)
    }

    fn published(&self, remote: &str) -> Result<Dataset> {
        Ok(Dataset::read_from(&self.config.object_store_root.join(remote))?)
    }
}

#[tokio::test]
async fn full_run_publishes_every_tier() -> Result<()> {
    let fixture = Fixture::new("erp.db", 1)?;

    let outcome = fixture.driver().run(None).await?;

    assert_eq!(outcome.tiers[&Tier::Raw].artifacts.len(), 2);
    assert_eq!(outcome.tiers[&Tier::Cleaned].artifacts.len(), 2);
    assert_eq!(outcome.tiers[&Tier::Aggregated].artifacts.len(), 1);
    assert!(outcome.locations().iter().all(|l| l.starts_with("file://")));
    assert_eq!(outcome.reports.len(), 1);
    assert!(outcome.reports[0].passed);

    let customers = fixture.published("raw/erp/customers.ndjson")?;
    let names = customers.column_names();
    assert!(names.contains(&"email_Hash"));
    assert!(!names.contains(&"email"));
    assert!(!names.contains(&"ssn"));

    assert_eq!(fixture.published("cleaned/refined/orders_clean.ndjson")?.len(), 3);
    assert_eq!(fixture.published("aggregated/metrics/order_summary.ndjson")?.len(), 3);
    assert_eq!(fixture.checkpoints.get("erp.orders")?.as_deref(), Some("3"));

    let calls = fixture.runner.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls.last().map(String::as_str), Some("order_summary"));
    Ok(())
}

#[tokio::test]
async fn second_run_reads_only_new_rows() -> Result<()> {
    let fixture = Fixture::new("erp.db", 1)?;
    fixture.driver().run(None).await?;

    let conn = Connection::open(fixture.dir.path().join("erp.db"))?;
    conn.execute_batch("INSERT INTO orders VALUES (4, 'd@example.com', 1.0), (5, 'e@example.com', 2.0);")?;
    drop(conn);

    fixture.driver().run(Some(&[Tier::Raw])).await?;

    let orders = fixture.published("raw/erp/orders.ndjson")?;
    let ids: Vec<i64> = orders.column_values("id")?.filter_map(|v| v.as_i64()).collect();
    assert_eq!(ids, vec![4, 5]);
    assert_eq!(fixture.checkpoints.get("erp.orders")?.as_deref(), Some("5"));
    Ok(())
}

#[tokio::test]
async fn raw_failure_stops_before_any_transformation() -> Result<()> {
    let fixture = Fixture::new("missing.db", 1)?;

    let failure = fixture.driver().run(None).await.unwrap_err();

    assert_eq!(failure.tier, Tier::Raw);
    assert!(matches!(failure.error, PipelineError::Connector(_)));
    assert!(fixture.runner.calls().is_empty());
    assert!(fixture.checkpoints.entries()?.is_empty());
    assert!(fixture.observer.events().contains(&"tier_failed raw".to_string()));
    Ok(())
}

#[tokio::test]
async fn quality_rejection_stops_the_pipeline() -> Result<()> {
    let fixture = Fixture::new("erp.db", 100)?;

    let failure = fixture.driver().run(None).await.unwrap_err();

    assert_eq!(failure.tier, Tier::Cleaned);
    assert_eq!(failure.transformation.as_deref(), Some("orders_clean"));
    assert!(matches!(failure.error, PipelineError::QualityGate(_)));
    assert_eq!(failure.reports.len(), 1);
    assert!(!failure.reports[0].passed);

    // Raw exports stay published and checkpointed.
    assert_eq!(failure.published.iter().filter(|a| a.tier == Tier::Raw).count(), 2);
    assert_eq!(fixture.checkpoints.get("erp.orders")?.as_deref(), Some("3"));

    assert!(!fixture.runner.calls().contains(&"order_summary".to_string()));
    assert!(!fixture
        .config
        .object_store_root
        .join("cleaned/refined/orders_clean.ndjson")
        .exists());
    let cleaned_local = &fixture.config.tiers[0].local_path;
    assert!(!cleaned_local.join("orders_clean.ndjson").exists());
    Ok(())
}

#[tokio::test]
async fn selected_tier_reads_earlier_publications() -> Result<()> {
    let fixture = Fixture::new("erp.db", 1)?;
    fixture.driver().run(None).await?;

    let outcome = fixture.driver().run(Some(&[Tier::Aggregated])).await?;

    assert_eq!(outcome.tiers.keys().copied().collect::<Vec<_>>(), vec![Tier::Aggregated]);
    let events = fixture.observer.events();
    assert!(events.contains(&"tier_skipped raw".to_string()));
    assert!(events.contains(&"tier_skipped cleaned".to_string()));
    Ok(())
}

#[tokio::test]
async fn cancelled_run_starts_nothing() -> Result<()> {
    let fixture = Fixture::new("erp.db", 1)?;
    let driver = fixture.driver();
    driver.cancel_token().cancel();

    let failure = driver.run(None).await.unwrap_err();

    assert!(matches!(failure.error, PipelineError::Cancelled(Tier::Raw)));
    assert!(fixture.runner.calls().is_empty());
    assert!(fixture.checkpoints.entries()?.is_empty());
    Ok(())
}
