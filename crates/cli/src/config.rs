use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use extract::AnalyzerConfig;
use index::{CacheConfig, ChunkerConfig, EmbedderConfig, IndexConfig, RetryPolicy};
use ingest::DetectorConfig;
use query::QueryConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: OperationMode,
    pub detector: DetectorConfig,
    pub analyzer: AnalyzerConfig,
    pub chunker: ChunkerConfig,
    pub embedder: EmbedderConfig,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Many requests in flight, few retries, small answers
    Fast,
    /// Default
    Balanced,
    /// Careful retries, no cache, wider retrieval
    Accurate,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::Balanced,
            detector: DetectorConfig::default(),
            analyzer: AnalyzerConfig::default(),
            chunker: ChunkerConfig::default(),
            embedder: EmbedderConfig::default(),
            index: IndexConfig::default(),
            cache: CacheConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn for_mode(mode: OperationMode) -> Self {
        match mode {
            OperationMode::Fast => Self::fast_mode(),
            OperationMode::Balanced => Self::default(),
            OperationMode::Accurate => Self::accurate_mode(),
        }
    }

    pub fn fast_mode() -> Self {
        let defaults = Self::default();
        Self {
            mode: OperationMode::Fast,
            chunker: ChunkerConfig {
                preview_rows: 2,
                ..defaults.chunker
            },
            index: IndexConfig {
                max_in_flight: 16,
                retry: RetryPolicy::new(1, 100, 1_000),
            },
            cache: CacheConfig {
                enabled: true,
                max_entries: 50_000,
            },
            query: QueryConfig {
                top_k: 3,
                ..defaults.query
            },
            ..defaults
        }
    }

    pub fn accurate_mode() -> Self {
        let defaults = Self::default();
        Self {
            mode: OperationMode::Accurate,
            chunker: ChunkerConfig {
                preview_rows: 5,
                ..defaults.chunker
            },
            index: IndexConfig {
                max_in_flight: 2,
                retry: RetryPolicy::new(5, 500, 10_000),
            },
            cache: CacheConfig {
                enabled: false,
                max_entries: 0,
            },
            query: QueryConfig {
                top_k: 8,
                candidate_multiplier: 6,
                ..defaults.query
            },
            ..defaults
        }
    }

    /// Preset for the mode (command line first, then the file, then
    /// balanced), with the file's values laid over it.
    pub async fn load(path: Option<&Path>, mode: Option<OperationMode>) -> Result<Self> {
        let overlay = match path {
            Some(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                let value: Value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Config {} is not valid JSON", path.display()))?;
                Some(value)
            }
            None => None,
        };
        Self::resolve(overlay, mode)
    }

    fn resolve(overlay: Option<Value>, mode: Option<OperationMode>) -> Result<Self> {
        let file_mode = overlay
            .as_ref()
            .and_then(|v| v.get("mode"))
            .map(|m| serde_json::from_value::<OperationMode>(m.clone()))
            .transpose()
            .context("Unknown operation mode in config")?;
        let mode = mode.or(file_mode).unwrap_or(OperationMode::Balanced);

        let mut merged = serde_json::to_value(Self::for_mode(mode)).context("Failed to encode config preset")?;
        if let Some(overlay) = overlay {
            merge(&mut merged, overlay);
        }
        let mut config: AppConfig = serde_json::from_value(merged).context("Invalid config")?;
        config.mode = mode;
        Ok(config)
    }
}

/// Recursively overwrites `base` with the fields present in `overlay`.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use index::EmbedderKind;
    use serde_json::json;

    #[test]
    fn test_presets_differ() {
        let fast = AppConfig::for_mode(OperationMode::Fast);
        let accurate = AppConfig::for_mode(OperationMode::Accurate);
        assert!(fast.index.max_in_flight > accurate.index.max_in_flight);
        assert!(fast.cache.enabled);
        assert!(!accurate.cache.enabled);
        assert_eq!(AppConfig::default().query.top_k, 5);
    }

    #[test]
    fn test_partial_file_overrides_preset() {
        let overlay = json!({
            "mode": "accurate",
            "query": { "top_k": 2 },
            "embedder": { "kind": "ollama" }
        });
        let config = AppConfig::resolve(Some(overlay), None).unwrap();

        assert_eq!(config.mode, OperationMode::Accurate);
        assert_eq!(config.query.top_k, 2);
        assert_eq!(config.query.candidate_multiplier, 6);
        assert_eq!(config.embedder.kind, EmbedderKind::Ollama);
        assert_eq!(config.embedder.model, "nomic-embed-text");
        assert_eq!(config.index.max_in_flight, 2);
    }

    #[test]
    fn test_command_line_mode_wins() {
        let overlay = json!({ "mode": "accurate" });
        let config = AppConfig::resolve(Some(overlay), Some(OperationMode::Fast)).unwrap();
        assert_eq!(config.mode, OperationMode::Fast);
        assert_eq!(config.index.max_in_flight, 16);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(AppConfig::resolve(Some(json!({ "mode": "turbo" })), None).is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tablerag.json");
        tokio::fs::write(&path, br#"{"detector": {"min_rows": 3}}"#).await.unwrap();

        let config = AppConfig::load(Some(&path), None).await.unwrap();
        assert_eq!(config.mode, OperationMode::Balanced);
        assert_eq!(config.detector.min_rows, 3);
        assert_eq!(config.detector.min_cols, 2);

        assert!(AppConfig::load(Some(&dir.path().join("missing.json")), None).await.is_err());
    }
}
