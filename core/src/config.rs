//! Training configuration.
//!
//! Every knob a run needs is passed explicitly through `TrainConfig`; there
//! are no module-level defaults consulted at call sites. Config files are
//! YAML and may omit any field.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Hyper-parameters for a training run on synthetic regression data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Seed for parameter initialization and data generation.
    pub seed: u64,
    /// Input features per example.
    pub features: usize,
    /// Regression targets per example.
    pub outputs: usize,
    pub batch_size: usize,
    /// Number of optimizer steps in total, counting resumed steps.
    pub steps: u64,
    pub learning_rate: f64,
    /// Decay of the batch-norm running averages.
    pub momentum: f64,
    pub epsilon: f64,
    /// Standard deviation of the noise added to targets.
    pub noise: f64,
    /// Log progress every N steps. Zero disables progress logs.
    pub log_every: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            seed: 0,
            features: 4,
            outputs: 1,
            batch_size: 64,
            steps: 200,
            learning_rate: 0.05,
            momentum: 0.9,
            epsilon: 1e-5,
            noise: 0.01,
            log_every: 20,
        }
    }
}

impl TrainConfig {
    /// Load a config from a YAML file.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a YAML config. An empty document yields defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self, StoreError> {
        let config: TrainConfig = if content.trim().is_empty() {
            TrainConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String, StoreError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Save this config as YAML.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        std::fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }

    /// Reject values no run can use.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.features == 0 {
            return Err(StoreError::InvalidConfig("features must be at least 1".into()));
        }
        if self.outputs == 0 {
            return Err(StoreError::InvalidConfig("outputs must be at least 1".into()));
        }
        if self.batch_size < 2 {
            return Err(StoreError::InvalidConfig(
                "batch_size must be at least 2 for batch statistics".into(),
            ));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(StoreError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(StoreError::InvalidConfig(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        if !(self.epsilon > 0.0 && self.epsilon.is_finite()) {
            return Err(StoreError::InvalidConfig(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        if !(self.noise >= 0.0 && self.noise.is_finite()) {
            return Err(StoreError::InvalidConfig(format!(
                "noise must be a non-negative number, got {}",
                self.noise
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(suffix: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("varstate_config_{}", suffix));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn defaults_are_valid() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config = TrainConfig::from_yaml_str("learning_rate: 0.2\nsteps: 10\n").unwrap();
        assert_eq!(config.learning_rate, 0.2);
        assert_eq!(config.steps, 10);
        assert_eq!(config.batch_size, TrainConfig::default().batch_size);
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(TrainConfig::from_yaml_str("").unwrap(), TrainConfig::default());
    }

    #[test]
    fn invalid_values_rejected() {
        for yaml in [
            "learning_rate: 0",
            "momentum: 1.0",
            "batch_size: 1",
            "features: 0",
            "epsilon: -1",
            "epsilon: .nan",
            "epsilon: .inf",
            "noise: .nan",
            "noise: -0.5",
            "learning_rate: .nan",
            "momentum: .nan",
        ] {
            match TrainConfig::from_yaml_str(yaml) {
                Err(StoreError::InvalidConfig(_)) => {}
                other => panic!("{}: expected InvalidConfig, got {:?}", yaml, other),
            }
        }
    }

    #[test]
    fn malformed_yaml_is_yaml_error() {
        assert!(matches!(
            TrainConfig::from_yaml_str("steps: [unclosed"),
            Err(StoreError::Yaml(_))
        ));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = test_dir("round_trip");
        let path = dir.join("train.yaml");
        let config = TrainConfig {
            seed: 42,
            steps: 7,
            ..TrainConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(TrainConfig::load(&path).unwrap(), config);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = test_dir("missing");
        assert!(matches!(
            TrainConfig::load(&dir.join("nope.yaml")),
            Err(StoreError::Io(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
