use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use medallion::checkpoint;
use medallion::config::{self, PipelineConfig};
use medallion::dataset::{Column, DataType};
use medallion::domain::Tier;
use medallion::infra::{CommandTransformationRunner, ExactMatchDedup, LocalObjectStore};
use medallion::observability::{self, metrics, TracingObserver};
use medallion::pipeline::{PipelineDriver, Services};
use medallion::policy;
use medallion::quality::ContractQualityGate;

#[derive(Parser)]
#[command(name = "medallion")]
#[command(about = "Raw -> cleaned -> aggregated data pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConfigArg {
    /// Pipeline configuration file
    #[arg(long, short, default_value = "medallion.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run {
        #[command(flatten)]
        config: ConfigArg,
        /// Only run these tiers (repeatable): raw, cleaned, aggregated
        #[arg(long = "tier")]
        tiers: Vec<Tier>,
        /// Write Prometheus metrics here when the run ends
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },
    /// Inspect or edit incremental-extraction checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Inspect privacy rules
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List every committed checkpoint
    List {
        #[command(flatten)]
        config: ConfigArg,
    },
    /// Show the watermark stored under a key
    Get {
        #[command(flatten)]
        config: ConfigArg,
        key: String,
    },
    /// Overwrite the watermark stored under a key
    Set {
        #[command(flatten)]
        config: ConfigArg,
        key: String,
        value: String,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Show the projection a table's privacy rule produces
    Preview {
        #[command(flatten)]
        config: ConfigArg,
        #[arg(long)]
        table: String,
        /// Comma-separated `name:type` list, e.g. `id:integer,email:text`
        #[arg(long)]
        columns: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            tiers,
            metrics_out,
        } => run(&config.config, tiers, metrics_out).await,
        Commands::Checkpoints { action } => checkpoints(action),
        Commands::Policy {
            action: PolicyAction::Preview { config, table, columns },
        } => preview(&config.config, &table, &columns),
    }
}

fn services(config: &PipelineConfig) -> anyhow::Result<Services> {
    let mut runner = CommandTransformationRunner::new().with_working_dir(&config.base_dir);
    for (kind, command) in &config.runners {
        runner = runner.with_command(*kind, command.clone());
    }
    let checkpoints = checkpoint::open(config.checkpoint_backend, &config.checkpoint_path)
        .with_context(|| format!("opening checkpoint store {}", config.checkpoint_path.display()))?;

    Ok(Services {
        runner: Arc::new(runner),
        gate: Arc::new(ContractQualityGate::default()),
        dedup: Arc::new(ExactMatchDedup),
        store: Arc::new(LocalObjectStore::new(&config.object_store_root)),
        checkpoints,
        observer: Arc::new(TracingObserver),
    })
}

async fn run(path: &Path, tiers: Vec<Tier>, metrics_out: Option<PathBuf>) -> anyhow::Result<()> {
    let config = config::load(path)?;
    let _guard = observability::init_logging(&config.log_dir);
    let handle = match metrics::init() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Metrics recorder unavailable: {}", e);
            None
        }
    };

    info!(pipeline = %config.name, config = %path.display(), "📋 Configuration loaded");
    let driver = PipelineDriver::from_config(&config, services(&config)?);

    let cancel = driver.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, finishing in-flight work");
            cancel.cancel();
        }
    });

    let filter = (!tiers.is_empty()).then_some(tiers.as_slice());
    let result = driver.run(filter).await;

    if let (Some(handle), Some(out)) = (&handle, &metrics_out) {
        fs::write(out, handle.render()).with_context(|| format!("writing metrics to {}", out.display()))?;
    }

    match result {
        Ok(outcome) => {
            println!("✅ Run {} published {} artifacts", outcome.run_id, outcome.locations().len());
            for location in outcome.locations() {
                println!("   - {}", location);
            }
            for report in outcome.reports.iter().filter(|r| r.warnings().next().is_some()) {
                println!("⚠️  {} passed with warnings", report.dataset_name);
            }
            Ok(())
        }
        Err(failure) => {
            error!("Pipeline failed: {}", failure);
            println!("❌ {}", failure);
            if !failure.published.is_empty() {
                println!("   Already published:");
                for artifact in &failure.published {
                    println!("   - {} {}", artifact.name, artifact.published_location);
                }
            }
            for report in failure.reports.iter().filter(|r| !r.passed) {
                for check in report.failed() {
                    println!("   {} / {}: {}", report.dataset_name, check.check_name, check.detail);
                }
            }
            Err(failure.into())
        }
    }
}

fn checkpoints(action: CheckpointAction) -> anyhow::Result<()> {
    let open = |arg: &ConfigArg| -> anyhow::Result<_> {
        let config = config::load(&arg.config)?;
        Ok(checkpoint::open(config.checkpoint_backend, &config.checkpoint_path)?)
    };

    match action {
        CheckpointAction::List { config } => {
            let store = open(&config)?;
            for entry in store.entries()? {
                let updated = entry.updated_at.map(|t| t.to_rfc3339()).unwrap_or_default();
                println!("{}\t{}\t{}", entry.key, entry.value, updated);
            }
        }
        CheckpointAction::Get { config, key } => match open(&config)?.get(&key)? {
            Some(value) => println!("{}", value),
            None => bail!("no checkpoint stored under '{}'", key),
        },
        CheckpointAction::Set { config, key, value } => {
            open(&config)?.update(&key, &value)?;
            println!("✅ {} = {}", key, value);
        }
    }
    Ok(())
}

fn parse_columns(spec: &str) -> anyhow::Result<Vec<Column>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let (name, ty) = item.split_once(':').unwrap_or((item, "unknown"));
            let data_type = match ty.trim().to_ascii_lowercase().as_str() {
                "integer" | "int" => DataType::Integer,
                "real" | "float" => DataType::Real,
                "text" | "string" => DataType::Text,
                "boolean" | "bool" => DataType::Boolean,
                "blob" => DataType::Blob,
                "unknown" => DataType::Unknown,
                other => bail!("unknown column type '{}' for '{}'", other, name),
            };
            Ok(Column::new(name.trim(), data_type))
        })
        .collect()
}

fn preview(path: &Path, table: &str, columns: &str) -> anyhow::Result<()> {
    let config = config::load(path)?;
    let columns = parse_columns(columns)?;
    let rule = match config.privacy_rule(table) {
        Some(rule) => rule.clone(),
        None => {
            println!("⚠️  No privacy rule for {}; every column is kept", table);
            medallion::domain::PrivacyRule::retain_all()
        }
    };

    for (column, decision) in policy::explain(&columns, &rule) {
        println!("{:<32} {}", column, decision);
    }
    let projection = policy::apply(table, &columns, &rule)?;
    println!();
    for expr in &projection {
        println!("{}", expr);
    }
    Ok(())
}
