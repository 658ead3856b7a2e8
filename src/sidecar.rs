//! Model config sidecars.
//!
//! [`ModelConfig`] normalizes the many spellings found in source
//! `config.json` files; [`EngineConfig`] is what gets written next to a
//! converted archive.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::archive::write_atomic;
use crate::config::ConvertConfig;
use crate::error::{CodecError, Result};
use crate::{FORMAT_NAME, FORMAT_VERSION};

/// Sidecar file name.
pub const CONFIG_FILE: &str = "config.json";
/// Architecture written to the engine config.
pub const TARGET_ARCH: &str = "llama";
pub const DEFAULT_ROPE_THETA: f64 = 10000.0;
pub const DEFAULT_MAX_POSITION_EMBEDDINGS: usize = 2048;

/// Architecture dimensions of the source model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub n_heads: Option<usize>,
    pub n_kv_heads: Option<usize>,
    pub intermediate_dim: Option<usize>,
    pub rope_theta: f64,
    pub max_position_embeddings: usize,
}

fn first_of<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
}

fn usize_of(obj: &Map<String, Value>, keys: &[&str]) -> Result<Option<usize>> {
    match first_of(obj, keys) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| CodecError::InvalidConfig(format!("'{}' must be a non-negative integer, got {v}", keys[0]))),
    }
}

fn required(obj: &Map<String, Value>, keys: &[&str]) -> Result<usize> {
    usize_of(obj, keys)?.ok_or_else(|| CodecError::MissingConfigKey(keys.join("|")))
}

impl ModelConfig {
    /// Normalize a parsed `config.json`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| CodecError::InvalidConfig("model config must be a JSON object".to_string()))?;

        let n_heads = usize_of(obj, &["num_attention_heads", "n_heads"])?;
        let rope_theta = match first_of(obj, &["rope_theta"]) {
            Some(v) => v
                .as_f64()
                .ok_or_else(|| CodecError::InvalidConfig(format!("'rope_theta' must be a number, got {v}")))?,
            None => DEFAULT_ROPE_THETA,
        };

        Ok(ModelConfig {
            vocab_size: required(obj, &["vocab_size"])?,
            hidden_dim: required(obj, &["hidden_size", "hidden_dim"])?,
            num_layers: required(obj, &["num_hidden_layers", "num_layers", "n_layers"])?,
            n_heads,
            n_kv_heads: usize_of(obj, &["num_key_value_heads", "n_kv_heads"])?.or(n_heads),
            intermediate_dim: usize_of(obj, &["intermediate_size", "intermediate_dim"])?,
            rope_theta,
            max_position_embeddings: usize_of(obj, &["max_position_embeddings"])?
                .unwrap_or(DEFAULT_MAX_POSITION_EMBEDDINGS),
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::from_value(&serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CodecError::archive(path, e))?;
        Self::from_json_str(&text)
    }
}

/// Locate the source `config.json` for a model file or shard directory.
///
/// A file input is looked up next to the file. A directory input is looked up
/// inside the directory, then in its parent.
pub fn find_model_config(input: &Path) -> Option<PathBuf> {
    if !input.is_dir() {
        let candidate = input.parent()?.join(CONFIG_FILE);
        return candidate.is_file().then_some(candidate);
    }
    [Some(input.join(CONFIG_FILE)), input.parent().map(|p| p.join(CONFIG_FILE))]
        .into_iter()
        .flatten()
        .find(|p| p.is_file())
}

/// Packing parameters an engine needs to read the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub format: String,
    pub format_version: String,
    pub layout: String,
    pub max_bases: usize,
    pub rounding: String,
}

/// Config written next to a converted archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub arch: String,
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub n_heads: Option<usize>,
    pub n_kv_heads: Option<usize>,
    pub intermediate_dim: Option<usize>,
    pub rope_theta: f64,
    pub max_position_embeddings: usize,
    pub quantization: QuantizationInfo,
}

impl EngineConfig {
    pub fn new(model: &ModelConfig, config: &ConvertConfig) -> Self {
        EngineConfig {
            arch: TARGET_ARCH.to_string(),
            vocab_size: model.vocab_size,
            hidden_dim: model.hidden_dim,
            num_layers: model.num_layers,
            n_heads: model.n_heads,
            n_kv_heads: model.n_kv_heads,
            intermediate_dim: model.intermediate_dim,
            rope_theta: model.rope_theta,
            max_position_embeddings: model.max_position_embeddings,
            quantization: QuantizationInfo {
                format: FORMAT_NAME.to_string(),
                format_version: FORMAT_VERSION.to_string(),
                layout: config.layout.tag().to_string(),
                max_bases: config.max_bases,
                rounding: config.rounding.as_str().to_string(),
            },
        }
    }

    /// Write as pretty JSON.
    /// Pretty JSON text of the config.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.to_json()?.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hf_style_keys() {
        let cfg = ModelConfig::from_value(&json!({
            "vocab_size": 32000,
            "hidden_size": 2048,
            "num_hidden_layers": 22,
            "num_attention_heads": 32,
            "num_key_value_heads": 4,
            "intermediate_size": 5632,
            "rope_theta": 500000.0
        }))
        .unwrap();

        assert_eq!(cfg.hidden_dim, 2048);
        assert_eq!(cfg.num_layers, 22);
        assert_eq!(cfg.n_heads, Some(32));
        assert_eq!(cfg.n_kv_heads, Some(4));
        assert_eq!(cfg.intermediate_dim, Some(5632));
        assert_eq!(cfg.rope_theta, 500000.0);
        assert_eq!(cfg.max_position_embeddings, 2048);
    }

    #[test]
    fn test_short_keys_and_defaults() {
        let cfg = ModelConfig::from_json_str(
            r#"{"vocab_size": 100, "hidden_dim": 64, "n_layers": 2, "n_heads": 8}"#,
        )
        .unwrap();
        assert_eq!(cfg.num_layers, 2);
        assert_eq!(cfg.n_kv_heads, Some(8));
        assert_eq!(cfg.intermediate_dim, None);
        assert_eq!(cfg.rope_theta, DEFAULT_ROPE_THETA);
    }

    #[test]
    fn test_missing_required_key() {
        let err = ModelConfig::from_json_str(r#"{"vocab_size": 100, "num_layers": 2}"#).unwrap_err();
        match err {
            CodecError::MissingConfigKey(key) => assert_eq!(key, "hidden_size|hidden_dim"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_engine_config_records_layout() {
        let model = ModelConfig::from_json_str(
            r#"{"vocab_size": 100, "hidden_size": 64, "num_layers": 2}"#,
        )
        .unwrap();
        let engine = EngineConfig::new(&model, &ConvertConfig::default());
        let value = serde_json::to_value(&engine).unwrap();

        assert_eq!(value["arch"], "llama");
        assert_eq!(value["quantization"]["layout"], "ternary2_v1");
        assert_eq!(value["quantization"]["max_bases"], 3);
        assert_eq!(value["quantization"]["format_version"], FORMAT_VERSION);
    }

    #[test]
    fn test_find_model_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let sub = dir.path().join("weights");
        std::fs::create_dir(&sub).unwrap();
        let model = sub.join("model.safetensors");
        std::fs::write(&model, b"").unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();

        // a file input only looks next to itself
        assert_eq!(find_model_config(&model), None);
        // a directory input falls back to its parent
        assert_eq!(find_model_config(&sub), Some(dir.path().join(CONFIG_FILE)));

        std::fs::write(sub.join(CONFIG_FILE), "{}").unwrap();
        assert_eq!(find_model_config(&model), Some(sub.join(CONFIG_FILE)));
        assert_eq!(find_model_config(&sub), Some(sub.join(CONFIG_FILE)));
    }
}
