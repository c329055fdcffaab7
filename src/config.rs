//! Pipeline configuration.
//!
//! [`load`] parses TOML into the `Raw*` structs, then [`resolve`] builds the
//! immutable [`PipelineConfig`] every component reads: relative paths are
//! joined to the config file's directory once, references are resolved and
//! validated. Any problem is a [`ConfigError`] and nothing runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::json;

use crate::checkpoint::CheckpointBackend;
use crate::connector::is_identifier;
use crate::domain::{
    CheckKind, CheckRule, Contract, DedupSpec, HashAlgorithm, InputRef, PrivacyRule, Severity, TableConfig, Tier,
    TransformKind, TransformSpec,
};
use crate::error::ConfigError;
use crate::infra::CommandSpec;
use crate::pipeline::stage::execution_order;
use crate::pipeline::template;
use crate::policy::{MissingRulePolicy, PolicyRegistry};

fn default_name() -> String {
    "medallion".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_template() -> String {
    template::DEFAULT_TEMPLATE.to_string()
}

fn default_raw_path() -> PathBuf {
    PathBuf::from("data/raw")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("state/checkpoints.db")
}

fn default_backend() -> CheckpointBackend {
    CheckpointBackend::Sqlite
}

fn default_store_root() -> PathBuf {
    PathBuf::from("lake")
}

fn yes() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub pipeline: RawPipeline,
    #[serde(default)]
    pub checkpoints: RawCheckpoints,
    #[serde(default)]
    pub object_store: RawObjectStore,
    #[serde(default)]
    pub sources: Vec<RawSource>,
    #[serde(default)]
    pub privacy: BTreeMap<String, RawPrivacyRule>,
    #[serde(default)]
    pub contracts: BTreeMap<String, RawContract>,
    #[serde(default)]
    pub tiers: BTreeMap<String, RawTier>,
    #[serde(default)]
    pub runners: BTreeMap<String, CommandSpec>,
}

#[derive(Debug, Deserialize)]
pub struct RawPipeline {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_template")]
    pub remote_path_template: String,
    #[serde(default = "default_raw_path")]
    pub local_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for RawPipeline {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_concurrency: default_concurrency(),
            remote_path_template: default_template(),
            local_path: default_raw_path(),
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RawCheckpoints {
    #[serde(default = "default_backend")]
    pub backend: CheckpointBackend,
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
}

impl Default for RawCheckpoints {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_checkpoint_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RawObjectStore {
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

impl Default for RawObjectStore {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawSourceKind {
    Sqlite,
    FileReplay,
}

#[derive(Debug, Deserialize)]
pub struct RawSource {
    pub name: String,
    pub kind: RawSourceKind,
    pub database: Option<PathBuf>,
    pub root: Option<PathBuf>,
    #[serde(default = "yes")]
    pub apply_privacy: bool,
    #[serde(default)]
    pub missing_rule: MissingRulePolicy,
    #[serde(default)]
    pub tables: Vec<RawTable>,
}

#[derive(Debug, Deserialize)]
pub struct RawTable {
    pub name: String,
    pub query: Option<String>,
    pub source_file_pattern: Option<String>,
    pub incremental_column: Option<String>,
    pub partition_column: Option<String>,
    pub checkpoint_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawPrivacyRule {
    #[serde(default)]
    pub exclude_columns: Vec<String>,
    #[serde(default)]
    pub pseudonymize_columns: Vec<String>,
    #[serde(default)]
    pub retain_columns: Vec<String>,
    pub hash_algorithm: Option<String>,
    #[serde(default)]
    pub retain_all: bool,
}

#[derive(Debug, Deserialize)]
pub struct RawContract {
    pub dataset_name: Option<String>,
    #[serde(default)]
    pub required_columns: Vec<String>,
    #[serde(default)]
    pub rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
pub struct RawRule {
    pub name: String,
    pub kind: String,
    pub params: Option<toml::Value>,
    #[serde(default)]
    pub severity: Severity,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawTier {
    pub local_path: Option<PathBuf>,
    pub source_label: Option<String>,
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub transforms: Vec<RawTransform>,
}

#[derive(Debug, Deserialize)]
pub struct RawTransform {
    pub name: String,
    #[serde(default)]
    pub kind: TransformKind,
    pub model: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    pub privacy_rule: Option<String>,
    pub contract: Option<String>,
    pub dedup: Option<RawDedup>,
}

#[derive(Debug, Deserialize)]
pub struct RawDedup {
    #[serde(default)]
    pub match_columns: Vec<String>,
    pub settings: Option<toml::Value>,
}

/// Resolved, immutable configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub name: String,
    pub base_dir: PathBuf,
    pub max_concurrency: usize,
    pub remote_path_template: String,
    pub raw_local_path: PathBuf,
    pub log_dir: PathBuf,
    pub checkpoint_backend: CheckpointBackend,
    pub checkpoint_path: PathBuf,
    pub object_store_root: PathBuf,
    pub sources: Vec<SourceConfig>,
    pub privacy: BTreeMap<String, PrivacyRule>,
    pub contracts: BTreeMap<String, Contract>,
    /// Cleaned and aggregated tiers, in tier order.
    pub tiers: Vec<TierConfig>,
    pub runners: BTreeMap<TransformKind, CommandSpec>,
}

impl PipelineConfig {
    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Privacy rule for `table`, matched case-insensitively.
    pub fn privacy_rule(&self, table: &str) -> Option<&PrivacyRule> {
        self.privacy
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, rule)| rule)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Sqlite { database: PathBuf },
    FileReplay { root: PathBuf },
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    pub apply_privacy: bool,
    pub policy: PolicyRegistry,
    pub tables: Vec<SourceTable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTable {
    pub table: TableConfig,
    pub checkpoint_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TierConfig {
    pub tier: Tier,
    pub local_path: PathBuf,
    pub source_label: String,
    pub max_concurrency: usize,
    pub transforms: Vec<TransformSpec>,
}

pub fn load(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = parse(&text)?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    resolve(raw, base_dir)
}

pub fn parse(text: &str) -> Result<RawConfig, ConfigError> {
    Ok(toml::from_str(text)?)
}

fn under(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn identifier(name: &str) -> Result<(), ConfigError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(ConfigError::Identifier(name.to_string()))
    }
}

/// Build the immutable configuration. Pure apart from path joining: nothing
/// is opened or created here.
pub fn resolve(raw: RawConfig, base_dir: &Path) -> Result<PipelineConfig, ConfigError> {
    let pipeline = raw.pipeline;
    template::validate(&pipeline.remote_path_template)
        .map_err(|e| ConfigError::invalid(format!("remote_path_template: {e}")))?;
    if pipeline.max_concurrency == 0 {
        return Err(ConfigError::invalid("pipeline.max_concurrency must be at least 1"));
    }

    let privacy = raw
        .privacy
        .into_iter()
        .map(|(table, rule)| Ok((table, resolve_privacy(rule)?)))
        .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

    let contracts = raw
        .contracts
        .into_iter()
        .map(|(name, contract)| {
            let resolved = resolve_contract(&name, contract)?;
            Ok((name, resolved))
        })
        .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

    let sources = resolve_sources(raw.sources, &privacy, base_dir)?;
    let raw_tables: HashSet<String> = sources
        .iter()
        .flat_map(|s| s.tables.iter().map(move |t| format!("{}.{}", s.name, t.table.name)))
        .collect();

    let mut tiers = Vec::new();
    let mut produced: HashMap<Tier, HashSet<String>> = HashMap::new();
    produced.insert(Tier::Raw, raw_tables);
    let mut raw_tiers: Vec<(Tier, RawTier)> = raw
        .tiers
        .into_iter()
        .map(|(name, tier)| Ok((name.parse::<Tier>()?, tier)))
        .collect::<Result<_, ConfigError>>()?;
    raw_tiers.sort_by_key(|(tier, _)| *tier);
    for (tier, raw_tier) in raw_tiers {
        if tier == Tier::Raw {
            return Err(ConfigError::invalid(
                "[tiers.raw] is not configurable; raw exports come from [[sources]]",
            ));
        }
        let resolved = resolve_tier(tier, raw_tier, &pipeline, &privacy, &contracts, &produced, base_dir)?;
        produced.insert(tier, resolved.transforms.iter().map(|t| t.name.clone()).collect());
        tiers.push(resolved);
    }

    let runners = raw
        .runners
        .into_iter()
        .map(|(kind, command)| {
            let kind = match kind.as_str() {
                "declarative" => TransformKind::Declarative,
                "rule_based" => TransformKind::RuleBased,
                other => return Err(ConfigError::invalid(format!("unknown runner kind '{other}'"))),
            };
            Ok((kind, command))
        })
        .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

    Ok(PipelineConfig {
        name: pipeline.name,
        base_dir: base_dir.to_path_buf(),
        max_concurrency: pipeline.max_concurrency,
        remote_path_template: pipeline.remote_path_template,
        raw_local_path: under(base_dir, &pipeline.local_path),
        log_dir: under(base_dir, &pipeline.log_dir),
        checkpoint_backend: raw.checkpoints.backend,
        checkpoint_path: under(base_dir, &raw.checkpoints.path),
        object_store_root: under(base_dir, &raw.object_store.root),
        sources,
        privacy,
        contracts,
        tiers,
        runners,
    })
}

fn resolve_privacy(rule: RawPrivacyRule) -> Result<PrivacyRule, ConfigError> {
    let hash_algorithm = match rule.hash_algorithm {
        Some(name) => name.parse::<HashAlgorithm>()?,
        None => HashAlgorithm::default(),
    };
    Ok(PrivacyRule {
        exclude_columns: rule.exclude_columns.into_iter().collect(),
        pseudonymize_columns: rule.pseudonymize_columns.into_iter().collect(),
        retain_columns: rule.retain_columns.into_iter().collect(),
        hash_algorithm,
        retain_all: rule.retain_all,
    })
}

fn toml_to_json(value: Option<toml::Value>, context: &str) -> Result<serde_json::Value, ConfigError> {
    match value {
        Some(value) => serde_json::to_value(value).map_err(|e| ConfigError::invalid(format!("{context}: {e}"))),
        None => Ok(json!({})),
    }
}

fn resolve_contract(name: &str, contract: RawContract) -> Result<Contract, ConfigError> {
    let mut seen = HashSet::new();
    let rules = contract
        .rules
        .into_iter()
        .map(|rule| {
            let context = format!("contract '{name}' rule '{}'", rule.name);
            if !seen.insert(rule.name.clone()) {
                return Err(ConfigError::invalid(format!("{context} is declared twice")));
            }
            let params = toml_to_json(rule.params, &context)?;
            let kind: CheckKind = serde_json::from_value(json!({ "kind": rule.kind, "params": params }))
                .map_err(|e| ConfigError::invalid(format!("{context}: {e}")))?;
            Ok(CheckRule {
                name: rule.name,
                kind,
                severity: rule.severity,
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;
    Ok(Contract {
        dataset_name: contract.dataset_name.unwrap_or_else(|| name.to_string()),
        required_columns: contract.required_columns,
        rules,
    })
}

fn resolve_sources(
    sources: Vec<RawSource>,
    privacy: &BTreeMap<String, PrivacyRule>,
    base_dir: &Path,
) -> Result<Vec<SourceConfig>, ConfigError> {
    let mut names = HashSet::new();
    let mut checkpoint_keys = HashSet::new();
    let mut out = Vec::with_capacity(sources.len());

    for source in sources {
        identifier(&source.name)?;
        if !names.insert(source.name.clone()) {
            return Err(ConfigError::invalid(format!("source '{}' is declared twice", source.name)));
        }
        let kind = match source.kind {
            RawSourceKind::Sqlite => SourceKind::Sqlite {
                database: under(
                    base_dir,
                    source.database.as_deref().ok_or_else(|| {
                        ConfigError::invalid(format!("sqlite source '{}' needs a database path", source.name))
                    })?,
                ),
            },
            RawSourceKind::FileReplay => SourceKind::FileReplay {
                root: under(
                    base_dir,
                    source.root.as_deref().ok_or_else(|| {
                        ConfigError::invalid(format!("file_replay source '{}' needs a root", source.name))
                    })?,
                ),
            },
        };

        let mut tables = Vec::with_capacity(source.tables.len());
        let mut table_names = HashSet::new();
        for raw in source.tables {
            let context = format!("{}.{}", source.name, raw.name);
            if !table_names.insert(raw.name.to_ascii_lowercase()) {
                return Err(ConfigError::invalid(format!("table {context} is declared twice")));
            }
            let mut table = match (&kind, raw.query, raw.source_file_pattern) {
                (SourceKind::Sqlite { .. }, Some(query), None) => TableConfig::query(&raw.name, query),
                (SourceKind::FileReplay { .. }, None, pattern) => TableConfig::files(&raw.name, pattern),
                (SourceKind::Sqlite { .. }, _, _) => {
                    return Err(ConfigError::invalid(format!("table {context} needs a query and no source_file_pattern")))
                }
                (SourceKind::FileReplay { .. }, Some(_), _) => {
                    return Err(ConfigError::invalid(format!("table {context} is file replay and cannot have a query")))
                }
            };
            if let Some(column) = raw.incremental_column {
                identifier(&column)?;
                table = table.with_incremental_column(column);
            }
            if let Some(column) = raw.partition_column {
                identifier(&column)?;
                table = table.with_partition_column(column);
            }
            let checkpoint_key = match (&table.incremental_column, raw.checkpoint_key) {
                (Some(_), Some(key)) => Some(key),
                (Some(_), None) => Some(context.clone()),
                (None, Some(_)) => {
                    return Err(ConfigError::invalid(format!(
                        "table {context} sets checkpoint_key without incremental_column"
                    )))
                }
                (None, None) => None,
            };
            if let Some(key) = &checkpoint_key {
                if !checkpoint_keys.insert(key.clone()) {
                    return Err(ConfigError::invalid(format!("checkpoint key '{key}' is shared by two tables")));
                }
            }
            tables.push(SourceTable { table, checkpoint_key });
        }

        let mut policy = PolicyRegistry::new(source.missing_rule);
        for (table, rule) in privacy {
            policy.insert(table, rule.clone());
        }
        out.push(SourceConfig {
            name: source.name,
            kind,
            apply_privacy: source.apply_privacy,
            policy,
            tables,
        });
    }
    Ok(out)
}

fn resolve_tier(
    tier: Tier,
    raw: RawTier,
    pipeline: &RawPipeline,
    privacy: &BTreeMap<String, PrivacyRule>,
    contracts: &BTreeMap<String, Contract>,
    produced: &HashMap<Tier, HashSet<String>>,
    base_dir: &Path,
) -> Result<TierConfig, ConfigError> {
    let declared: HashSet<&str> = raw.transforms.iter().map(|t| t.name.as_str()).collect();
    if declared.len() != raw.transforms.len() {
        return Err(ConfigError::invalid(format!("{tier} tier declares a transformation twice")));
    }

    let mut transforms = Vec::with_capacity(raw.transforms.len());
    for transform in &raw.transforms {
        let context = format!("{tier} transformation '{}'", transform.name);
        let mut spec = TransformSpec::new(&transform.name, transform.kind);
        if let Some(model) = &transform.model {
            spec.model = model.clone();
        }
        for input in &transform.inputs {
            let input: InputRef = input.parse()?;
            if input.tier > tier {
                return Err(ConfigError::invalid(format!(
                    "{context} reads {input} from a later tier"
                )));
            }
            let known = if input.tier == tier {
                declared.contains(input.name.as_str())
            } else {
                produced.get(&input.tier).is_some_and(|names| names.contains(&input.name))
            };
            if !known {
                return Err(ConfigError::UnknownReference {
                    kind: "input",
                    name: input.to_string(),
                    context,
                });
            }
            spec = spec.with_input(input);
        }
        if let Some(name) = &transform.privacy_rule {
            let rule = privacy.get(name).ok_or_else(|| ConfigError::UnknownReference {
                kind: "privacy rule",
                name: name.clone(),
                context: context.clone(),
            })?;
            spec = spec.with_privacy_rule(rule.clone());
        }
        if let Some(name) = &transform.contract {
            let contract = contracts.get(name).ok_or_else(|| ConfigError::UnknownReference {
                kind: "contract",
                name: name.clone(),
                context: context.clone(),
            })?;
            spec = spec.with_contract(contract.clone());
        }
        if let Some(dedup) = &transform.dedup {
            spec = spec.with_dedup(DedupSpec {
                match_columns: dedup.match_columns.clone(),
                settings: toml_to_json(dedup.settings.clone(), &context)?,
            });
        }
        transforms.push(spec);
    }
    execution_order(tier, &transforms)?;

    let max_concurrency = raw.max_concurrency.unwrap_or(pipeline.max_concurrency);
    if max_concurrency == 0 {
        return Err(ConfigError::invalid(format!("{tier} max_concurrency must be at least 1")));
    }
    let default_label = match tier {
        Tier::Aggregated => "metrics",
        _ => "refined",
    };
    Ok(TierConfig {
        tier,
        local_path: under(
            base_dir,
            &raw.local_path.unwrap_or_else(|| PathBuf::from(format!("data/{tier}"))),
        ),
        source_label: raw.source_label.unwrap_or_else(|| default_label.to_string()),
        max_concurrency,
        transforms,
    })
}
