use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::ml::features::FeatureConfig;
use crate::ml::models::ensemble::patterns::PatternConfig;
use crate::ml::models::ensemble::EnsembleConfig;
use crate::ml::models::statistical::StatisticalConfig;
use crate::ml::training::TrainingConfig;
use crate::parallel::ParallelConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub features: FeatureConfig,

    #[serde(default)]
    pub statistical: StatisticalConfig,

    #[serde(default)]
    pub ensemble: EnsembleConfig,

    #[serde(default)]
    pub patterns: PatternConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    #[serde(default)]
    pub parallel: ParallelConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Check every section. Called on load so bad settings never reach scoring.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.features.validate()?;
        self.statistical.validate()?;
        self.ensemble.validate()?;
        self.patterns.validate()?;
        self.training.validate()?;
        self.parallel.validate()?;
        Ok(())
    }

    /// Apply overrides from the process environment and re-validate.
    pub fn with_env_overrides(mut self) -> crate::Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    /// Apply `KEY=value` overrides from any lookup source, then re-validate.
    ///
    /// Recognized keys: `WINDOW_LENGTH`, `VOLUME_ZSCORE_THRESHOLD`,
    /// `VOLATILITY_RATIO_THRESHOLD`, `WASH_TRADING_CORRELATION_THRESHOLD`,
    /// `DECISION_THRESHOLD`, `CONTAMINATION`, `N_ESTIMATORS`, `RANDOM_STATE`,
    /// `NUM_THREADS`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> std::result::Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_override::<usize>(&lookup, "WINDOW_LENGTH")? {
            self.features.window_length = v;
        }
        if let Some(v) = parse_override::<f64>(&lookup, "VOLUME_ZSCORE_THRESHOLD")? {
            self.statistical.volume_z_threshold = v;
        }
        if let Some(v) = parse_override::<f64>(&lookup, "VOLATILITY_RATIO_THRESHOLD")? {
            self.statistical.volatility_ratio_threshold = v;
        }
        if let Some(v) = parse_override::<f64>(&lookup, "WASH_TRADING_CORRELATION_THRESHOLD")? {
            self.statistical.correlation_threshold = v;
            self.patterns.wash.max_correlation = v;
        }
        if let Some(v) = parse_override::<f64>(&lookup, "DECISION_THRESHOLD")? {
            self.ensemble.decision_threshold = v;
        }
        if let Some(v) = parse_override::<f64>(&lookup, "CONTAMINATION")? {
            self.training.contamination = v;
        }
        if let Some(v) = parse_override::<usize>(&lookup, "N_ESTIMATORS")? {
            self.training.isolation_forest.num_trees = v;
        }
        if let Some(v) = parse_override::<u64>(&lookup, "RANDOM_STATE")? {
            self.training.seed = v;
        }
        if let Some(v) = parse_override::<usize>(&lookup, "NUM_THREADS")? {
            self.parallel.num_threads = v;
        }

        self.validate()
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> std::result::Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidParameter {
                name: key,
                reason: format!("cannot parse `{raw}`"),
            }),
    }
}

/// Reject non-finite or out-of-range numeric settings.
pub(crate) fn check_range(
    name: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> std::result::Result<(), ConfigError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ConfigError::InvalidParameter {
            name,
            reason: format!("{value} is outside [{min}, {max}]"),
        });
    }
    Ok(())
}

pub(crate) fn check_positive(name: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidParameter {
            name,
            reason: format!("must be positive, got {value}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.features.window_length, 30);
        assert!((config.ensemble.decision_threshold - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            [features]
            window_length = 20

            [statistical]
            volume_z_threshold = 2.5
            "#,
        )
        .unwrap();

        assert_eq!(config.features.window_length, 20);
        assert_eq!(config.features.rsi_period, 14);
        assert!((config.statistical.volume_z_threshold - 2.5).abs() < f64::EPSILON);
        assert!((config.ensemble.weights.statistical - 0.30).abs() < f64::EPSILON);
    }

    #[test]
    fn test_weights_not_summing_to_one_rejected_at_load() {
        let err = Config::from_toml_str(
            r#"
            [ensemble.weights]
            statistical = 0.3
            outlier = 0.25
            reconstruction = 0.25
            sequence = 0.25
            "#,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            crate::SurveillanceError::Configuration(ConfigError::WeightSum { .. })
        ));
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = Config::from_toml_str("[features]\nwindow_length = 0\n").unwrap_err();
        assert!(matches!(
            err,
            crate::SurveillanceError::Configuration(ConfigError::InvalidWindowLength(0))
        ));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = Config::from_toml_str("[features\nwindow_length = ").unwrap_err();
        assert!(matches!(
            err,
            crate::SurveillanceError::Configuration(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_overrides_applied_and_validated() {
        let env: HashMap<&str, &str> = [
            ("VOLUME_ZSCORE_THRESHOLD", "2.0"),
            ("WASH_TRADING_CORRELATION_THRESHOLD", "0.25"),
            ("N_ESTIMATORS", "50"),
            ("RANDOM_STATE", "7"),
            ("NUM_THREADS", "3"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert!((config.statistical.volume_z_threshold - 2.0).abs() < f64::EPSILON);
        assert!((config.patterns.wash.max_correlation - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.training.isolation_forest.num_trees, 50);
        assert_eq!(config.training.seed, 7);
        assert_eq!(config.parallel.num_threads, 3);
    }

    #[test]
    fn test_parallel_section_parsed() {
        let config = Config::from_toml_str("[parallel]\nnum_threads = 2\n").unwrap();
        assert_eq!(config.parallel.num_threads, 2);
        assert_eq!(config.parallel.actual_threads(), 2);
        assert_eq!(Config::default().parallel.num_threads, 0);
    }

    #[test]
    fn test_bad_override_reports_key() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|k| (k == "DECISION_THRESHOLD").then(|| "1.5".to_string()))
            .unwrap_err();
        assert_eq!(err, ConfigError::DecisionThreshold(1.5));

        let mut config = Config::default();
        let err = config
            .apply_overrides(|k| (k == "WINDOW_LENGTH").then(|| "thirty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { name: "WINDOW_LENGTH", .. }));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tapewatch.toml");

        let mut config = Config::default();
        config.features.window_length = 12;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
