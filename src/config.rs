use anyhow::{Context, Result};
use casebridge_core::models::EntityKind;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub richtext: RichTextConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    /// Rows per staging write.
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            batch_rows: default_batch_rows(),
            progress_interval_ms: default_progress_interval_ms(),
            sample_rows: default_sample_rows(),
        }
    }
}

fn default_batch_rows() -> usize {
    1000
}
fn default_progress_interval_ms() -> u64 {
    500
}
fn default_sample_rows() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    #[serde(default = "default_status_interval_items")]
    pub status_interval_items: u64,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default = "default_max_deferred_passes")]
    pub max_deferred_passes: u32,
    /// Skip a whole custom-field value row when one of its options is
    /// unknown, instead of dropping just the unknown option.
    #[serde(default)]
    pub skip_rows_with_unknown_options: bool,
    #[serde(default = "default_true")]
    pub reindex_on_complete: bool,
    /// Per-entity-type chunk overrides, keyed by entity type name.
    #[serde(default)]
    pub chunks: BTreeMap<String, ChunkOverride>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            status_interval_items: default_status_interval_items(),
            status_interval_secs: default_status_interval_secs(),
            max_deferred_passes: default_max_deferred_passes(),
            skip_rows_with_unknown_options: false,
            reindex_on_complete: true,
            chunks: BTreeMap::new(),
        }
    }
}

fn default_status_interval_items() -> u64 {
    250
}
fn default_status_interval_secs() -> u64 {
    3
}
fn default_max_deferred_passes() -> u32 {
    16
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChunkOverride {
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Rows per chunk and the transaction deadline for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub size: u64,
    pub timeout: Duration,
}

impl ImportConfig {
    /// Chunk policy for an entity type: built-in default, then the
    /// `[import.chunks.<entity>]` override if present.
    pub fn chunk_policy(&self, kind: EntityKind) -> ChunkPolicy {
        let heavy = matches!(
            kind,
            EntityKind::RunResult
                | EntityKind::RunResultStep
                | EntityKind::SessionResult
                | EntityKind::AutomationResult
        );
        let (size, secs) = if heavy { (100, 3600) } else { (500, 300) };
        let over = self.chunks.get(kind.as_str());
        ChunkPolicy {
            size: over.and_then(|o| o.size).unwrap_or(size),
            timeout: Duration::from_secs(over.and_then(|o| o.timeout_secs).unwrap_or(secs)),
        }
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RichTextConfig {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for RichTextConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_cache_capacity() -> usize {
    casebridge_core::richtext::DEFAULT_CACHE_CAPACITY
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }

    if config.analyzer.batch_rows == 0 {
        anyhow::bail!("analyzer.batch_rows must be > 0");
    }
    if config.analyzer.progress_interval_ms == 0 {
        anyhow::bail!("analyzer.progress_interval_ms must be > 0");
    }

    if config.import.status_interval_items == 0 || config.import.status_interval_secs == 0 {
        anyhow::bail!("import.status_interval_items and import.status_interval_secs must be > 0");
    }

    for (key, over) in &config.import.chunks {
        if key.parse::<EntityKind>().is_err() {
            anyhow::bail!(
                "Unknown entity type in [import.chunks.{}]. Expected one of: {}",
                key,
                EntityKind::ALL
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if over.size == Some(0) || over.timeout_secs == Some(0) {
            anyhow::bail!("import.chunks.{}: size and timeout_secs must be > 0", key);
        }
    }

    if config.richtext.cache_capacity == 0 {
        anyhow::bail!("richtext.cache_capacity must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let cfg: Config = toml::from_str(&format!("[db]\npath = \"/tmp/x.sqlite\"\n{}", extra))?;
        validate(&cfg)?;
        Ok(cfg)
    }

    #[test]
    fn defaults_apply_when_sections_are_missing() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.db.max_connections, 5);
        assert_eq!(cfg.analyzer.batch_rows, 1000);
        assert_eq!(cfg.analyzer.sample_rows, 5);
        assert_eq!(cfg.import.status_interval_items, 250);
        assert_eq!(cfg.import.max_deferred_passes, 16);
        assert!(cfg.import.reindex_on_complete);
        assert_eq!(cfg.richtext.cache_capacity, 5000);
    }

    #[test]
    fn chunk_policy_defaults_and_overrides() {
        let cfg = parse("[import.chunks.run_result]\nsize = 25\n").unwrap();
        let p = cfg.import.chunk_policy(EntityKind::RunResult);
        assert_eq!(p.size, 25);
        assert_eq!(p.timeout, Duration::from_secs(3600));
        let p = cfg.import.chunk_policy(EntityKind::Project);
        assert_eq!(p.size, 500);
        assert_eq!(p.timeout, Duration::from_secs(300));
        assert_eq!(cfg.import.chunk_policy(EntityKind::RunResultStep).size, 100);
    }

    #[test]
    fn rejects_unknown_chunk_key_and_zero_sizes() {
        assert!(parse("[import.chunks.widgets]\nsize = 5\n").is_err());
        assert!(parse("[import.chunks.project]\nsize = 0\n").is_err());
        assert!(parse("[analyzer]\nbatch_rows = 0\n").is_err());
    }
}
