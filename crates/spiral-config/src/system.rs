// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Process-level settings consumed by the session driver.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a [`SystemConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed system configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

fn one() -> usize {
    1
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreprocessConfig {
    #[serde(default = "one")]
    pub num_threads: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self { num_threads: 1 }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Checkpoint restored when a session starts.
    #[serde(default)]
    pub load: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    #[serde(default = "one")]
    pub num_gpus: usize,
    #[serde(default = "one")]
    pub batch_size_per_gpu: usize,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Seed for every overrider random stream; unseeded streams follow
    /// [`crate::determinism`].
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            num_gpus: 1,
            batch_size_per_gpu: 1,
            preprocess: PreprocessConfig::default(),
            checkpoint: CheckpointConfig::default(),
            seed: None,
        }
    }
}

impl SystemConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SystemConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("num_gpus", self.num_gpus),
            ("batch_size_per_gpu", self.batch_size_per_gpu),
            ("preprocess.num_threads", self.preprocess.num_threads),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Batch size across every device.
    pub fn batch_size(&self) -> usize {
        self.batch_size_per_gpu * self.num_gpus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_sections() {
        let config = SystemConfig::from_json(
            r#"{
                "num_gpus": 2,
                "batch_size_per_gpu": 16,
                "preprocess": { "num_threads": 4 },
                "checkpoint": { "load": "ckpt/latest" },
                "seed": 7
            }"#,
        )
        .unwrap();
        assert_eq!(config.batch_size(), 32);
        assert_eq!(config.preprocess.num_threads, 4);
        assert_eq!(config.checkpoint.load, Some(PathBuf::from("ckpt/latest")));
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = SystemConfig::from_json("{}").unwrap();
        assert_eq!(config, SystemConfig::default());
    }

    #[test]
    fn rejects_zero_devices_and_unknown_keys() {
        assert!(matches!(
            SystemConfig::from_json(r#"{ "num_gpus": 0 }"#),
            Err(ConfigError::Invalid { field: "num_gpus", .. })
        ));
        assert!(matches!(
            SystemConfig::from_json(r#"{ "gpus": 2 }"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
