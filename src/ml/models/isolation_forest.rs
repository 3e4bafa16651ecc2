//! Isolation Forest implementation
//!
//! Anomaly detection using isolation trees. Anomalies are easier to isolate
//! and thus have shorter path lengths in the trees. Points beyond the
//! training range land in edge leaves, so their score saturates instead of
//! failing.

use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{check_artifact, quiescent_input};
use crate::config::check_range;
use crate::error::{ConfigError, ModelUnavailable, Result};
use crate::ml::artifact::{ArtifactKind, ModelParams, ModelVersion, TrainedModelArtifact};
use crate::ml::{
    Detector, DetectorId, DetectorScore, NormalizedScore, ScoringInput, Unavailability,
};

/// Forest hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationForestConfig {
    /// Number of trees
    pub num_trees: usize,
    /// Sample size for each tree
    pub sample_size: usize,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            num_trees: 100,
            sample_size: 256,
        }
    }
}

impl IsolationForestConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_range("isolation_forest.num_trees", self.num_trees as f64, 1.0, 10_000.0)?;
        check_range("isolation_forest.sample_size", self.sample_size as f64, 2.0, 1e7)
    }
}

/// Isolation Forest model over standardized rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    /// Individual isolation trees
    trees: Vec<IsolationTree>,
    /// Rows drawn per tree
    sample_size: usize,
    /// Row width the forest was fitted on
    input_dim: usize,
    /// Average path length normalization factor c(sample_size)
    avg_path_length: f64,
}

impl IsolationForest {
    /// Fit a forest; `seed` makes tree construction reproducible.
    pub fn fit(rows: &[Vec<f64>], config: &IsolationForestConfig, seed: u64) -> Result<Self> {
        let Some(first) = rows.first() else {
            return Err(crate::SurveillanceError::InsufficientTrainingData { needed: 2, got: 0 });
        };
        let input_dim = first.len();
        if let Some(bad) = rows.iter().find(|r| r.len() != input_dim) {
            return Err(ConfigError::DimensionMismatch {
                expected: input_dim,
                got: bad.len(),
            }
            .into());
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let sample_size = config.sample_size.min(rows.len()).max(1);
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;

        let trees = (0..config.num_trees)
            .map(|_| {
                // Sample with replacement
                let sample: Vec<&[f64]> = (0..sample_size)
                    .map(|_| rows[rng.random_range(0..rows.len())].as_slice())
                    .collect();
                IsolationTree::build(&sample, input_dim, max_depth, &mut rng)
            })
            .collect();

        Ok(Self {
            trees,
            sample_size,
            input_dim,
            avg_path_length: Self::average_path_length(sample_size),
        })
    }

    /// Calculate average path length for normalization (c(n) function)
    pub fn average_path_length(n: usize) -> f64 {
        match n {
            0 | 1 => 0.0,
            2 => 1.0,
            _ => {
                let n = n as f64;
                2.0 * ((n - 1.0).ln() + 0.5772156649) - 2.0 * (n - 1.0) / n
            }
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Anomaly score 2^(-E[h(x)] / c(psi)) in (0, 1]; higher = more isolated
    pub fn score(&self, row: &[f64]) -> std::result::Result<f64, ConfigError> {
        if row.len() != self.input_dim {
            return Err(ConfigError::DimensionMismatch {
                expected: self.input_dim,
                got: row.len(),
            });
        }
        if self.trees.is_empty() || self.avg_path_length == 0.0 {
            return Ok(0.5);
        }

        let total: f64 = self.trees.iter().map(|t| t.path_length(row)).sum();
        let avg_path = total / self.trees.len() as f64;
        Ok(2.0_f64.powf(-avg_path / self.avg_path_length))
    }
}

/// A single isolation tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IsolationTree {
    root: IsolationNode,
}

/// Node in an isolation tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum IsolationNode {
    /// Internal node with split
    Internal {
        feature_idx: usize,
        split_value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    /// Leaf node
    Leaf { size: usize },
}

impl IsolationTree {
    fn build<R: Rng>(samples: &[&[f64]], n_features: usize, max_depth: usize, rng: &mut R) -> Self {
        Self {
            root: Self::build_node(samples, n_features, 0, max_depth, rng),
        }
    }

    fn build_node<R: Rng>(
        samples: &[&[f64]],
        n_features: usize,
        depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> IsolationNode {
        if depth >= max_depth || samples.len() <= 1 {
            return IsolationNode::Leaf {
                size: samples.len(),
            };
        }

        // Only features that still vary can split this node
        let spreads: Vec<(usize, f64, f64)> = (0..n_features)
            .filter_map(|f| {
                let (lo, hi) = samples
                    .iter()
                    .fold((f64::MAX, f64::MIN), |(lo, hi), s| (lo.min(s[f]), hi.max(s[f])));
                (hi > lo).then_some((f, lo, hi))
            })
            .collect();

        let Some(&(feature_idx, min_val, max_val)) = spreads.choose(rng) else {
            return IsolationNode::Leaf {
                size: samples.len(),
            };
        };

        let split_value = rng.random_range(min_val..max_val);
        let (left, right): (Vec<&[f64]>, Vec<&[f64]>) =
            samples.iter().copied().partition(|s| s[feature_idx] < split_value);

        IsolationNode::Internal {
            feature_idx,
            split_value,
            left: Box::new(Self::build_node(&left, n_features, depth + 1, max_depth, rng)),
            right: Box::new(Self::build_node(&right, n_features, depth + 1, max_depth, rng)),
        }
    }

    fn path_length(&self, sample: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0usize;
        loop {
            match node {
                IsolationNode::Leaf { size } => {
                    // Expected remaining depth for leaves holding several samples
                    return depth as f64 + IsolationForest::average_path_length(*size);
                }
                IsolationNode::Internal {
                    feature_idx,
                    split_value,
                    left,
                    right,
                } => {
                    node = if sample[*feature_idx] < *split_value { &**left } else { &**right };
                    depth += 1;
                }
            }
        }
    }
}

/// Outlier detector backed by an isolation forest artifact
#[derive(Debug, Clone)]
pub struct OutlierDetector {
    artifact: Arc<TrainedModelArtifact>,
}

impl OutlierDetector {
    pub fn from_artifact(artifact: Arc<TrainedModelArtifact>) -> std::result::Result<Self, ConfigError> {
        check_artifact(&artifact, ArtifactKind::IsolationForest)?;
        Ok(Self { artifact })
    }

    pub fn artifact(&self) -> &Arc<TrainedModelArtifact> {
        &self.artifact
    }

    fn forest(&self) -> Result<&IsolationForest> {
        match self.artifact.params() {
            ModelParams::IsolationForest(forest) => Ok(forest),
            _ => Err(ModelUnavailable::Corrupt {
                detector: DetectorId::Outlier,
                reason: "parameters do not hold an isolation forest".to_string(),
            }
            .into()),
        }
    }
}

impl Detector for OutlierDetector {
    fn id(&self) -> DetectorId {
        DetectorId::Outlier
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<DetectorScore> {
        let row = self.artifact.scaler().transform(input.point.as_slice())?;
        let value = self.forest()?.score(&row)?;
        Ok(DetectorScore::new(DetectorId::Outlier, value))
    }

    fn normalize(&self, score: &DetectorScore) -> NormalizedScore {
        NormalizedScore::new(DetectorId::Outlier, self.artifact.calibrator().calibrate(score.value))
    }

    fn abstain_reason(&self, input: &ScoringInput<'_>) -> Option<Unavailability> {
        quiescent_input(input.point)
    }

    fn model_version(&self) -> Option<ModelVersion> {
        Some(self.artifact.version().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, Normal};

    fn gaussian_rows(n: usize, dim: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n)
            .map(|_| (0..dim).map(|_| normal.sample(&mut rng)).collect())
            .collect()
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(IsolationForest::average_path_length(1), 0.0);
        assert_eq!(IsolationForest::average_path_length(2), 1.0);
        let c256 = IsolationForest::average_path_length(256);
        assert!(c256 > 9.0 && c256 < 11.0);
    }

    #[test]
    fn test_isolation_forest_training() {
        let rows = gaussian_rows(300, 6, 1);
        let config = IsolationForestConfig {
            num_trees: 10,
            sample_size: 64,
        };
        let forest = IsolationForest::fit(&rows, &config, 42).unwrap();
        assert_eq!(forest.num_trees(), 10);
        assert_eq!(forest.input_dim(), 6);
    }

    #[test]
    fn test_isolation_forest_scoring() {
        let rows = gaussian_rows(500, 6, 2);
        let forest = IsolationForest::fit(&rows, &IsolationForestConfig::default(), 42).unwrap();

        let normal_score = forest.score(&[0.0; 6]).unwrap();
        let anomalous_score = forest.score(&[8.0, -8.0, 8.0, 8.0, -8.0, 8.0]).unwrap();
        let far_score = forest.score(&[1e6; 6]).unwrap();

        assert!(normal_score > 0.0 && normal_score <= 1.0);
        assert!(anomalous_score > normal_score);
        assert!(anomalous_score > 0.6);
        // saturates rather than growing without bound
        assert!(far_score <= 1.0);
        assert!((far_score - anomalous_score).abs() < 0.1);
    }

    #[test]
    fn test_fit_is_reproducible_for_seed() {
        let rows = gaussian_rows(200, 6, 3);
        let config = IsolationForestConfig {
            num_trees: 20,
            sample_size: 64,
        };
        let a = IsolationForest::fit(&rows, &config, 7).unwrap();
        let b = IsolationForest::fit(&rows, &config, 7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_dimension_is_configuration_error() {
        let rows = gaussian_rows(100, 6, 4);
        let forest = IsolationForest::fit(&rows, &IsolationForestConfig::default(), 1).unwrap();
        assert_eq!(
            forest.score(&[0.0; 4]).unwrap_err(),
            ConfigError::DimensionMismatch { expected: 6, got: 4 }
        );
    }

    #[test]
    fn test_constant_population_does_not_split() {
        let rows = vec![vec![1.0; 6]; 50];
        let forest = IsolationForest::fit(&rows, &IsolationForestConfig::default(), 1).unwrap();
        let score = forest.score(&[1.0; 6]).unwrap();
        assert!(score.is_finite());
        assert!(score <= 0.5);
    }
}
