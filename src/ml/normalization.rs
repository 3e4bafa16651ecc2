//! Feature Standardization
//!
//! Trained detectors work on standardized features. The scaler is fitted with
//! the model and travels inside its artifact.

use serde::{Deserialize, Serialize};

use super::features::NUM_FEATURES;
use crate::error::ConfigError;

/// Running statistics for one feature
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    /// Minimum value seen
    pub min: f64,
    /// Maximum value seen
    pub max: f64,
    /// Running mean
    pub mean: f64,
    /// Running M2 for variance (Welford's algorithm)
    pub m2: f64,
    /// Sample count
    pub count: u64,
}

impl FeatureStats {
    /// Update statistics with a new value using Welford's online algorithm
    pub fn update(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    /// Population variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).max(0.0)
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Standardize a value; constant features map to 0
    pub fn standardize(&self, value: f64) -> f64 {
        let std = self.std();
        if std > f64::EPSILON {
            (value - self.mean) / std
        } else {
            0.0
        }
    }
}

/// Per-feature z-score standardizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaler {
    stats: Vec<FeatureStats>,
}

impl Default for FeatureScaler {
    fn default() -> Self {
        Self::new(NUM_FEATURES)
    }
}

impl FeatureScaler {
    pub fn new(dimension: usize) -> Self {
        Self {
            stats: vec![FeatureStats::default(); dimension],
        }
    }

    /// Fit on rows of equal width
    pub fn fit<'a, I>(rows: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let mut rows = rows.into_iter().peekable();
        let dimension = rows.peek().map(|r| r.len()).unwrap_or(NUM_FEATURES);
        let mut scaler = Self::new(dimension);
        for row in rows {
            scaler.update(row)?;
        }
        Ok(scaler)
    }

    pub fn update(&mut self, row: &[f64]) -> Result<(), ConfigError> {
        self.check_dimension(row.len())?;
        for (stats, &v) in self.stats.iter_mut().zip(row) {
            stats.update(v);
        }
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.stats.len()
    }

    pub fn stats(&self) -> &[FeatureStats] {
        &self.stats
    }

    pub fn transform(&self, row: &[f64]) -> Result<Vec<f64>, ConfigError> {
        self.check_dimension(row.len())?;
        Ok(self
            .stats
            .iter()
            .zip(row)
            .map(|(stats, &v)| stats.standardize(v))
            .collect())
    }

    fn check_dimension(&self, got: usize) -> Result<(), ConfigError> {
        if got != self.stats.len() {
            return Err(ConfigError::DimensionMismatch {
                expected: self.stats.len(),
                got,
            });
        }
        Ok(())
    }
}
