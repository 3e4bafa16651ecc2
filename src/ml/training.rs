//! Offline training of the trainable detectors
//!
//! Training is a separate, blocking API. It turns a population of bar series
//! into three versioned artifacts (isolation forest, autoencoder, sequence
//! model) that share one feature scaler and one train/calibration split.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::artifact::{ArtifactKind, ArtifactMetadata, ModelParams, ModelVersion, TrainedModelArtifact};
use super::features::{FeatureExtractor, FeatureVector, FEATURE_NAMES};
use super::models::autoencoder::{AutoencoderConfig, AutoencoderDataset, AutoencoderTrainer};
use super::models::ensemble::calibration::ScoreCalibrator;
use super::models::isolation_forest::{IsolationForest, IsolationForestConfig};
use super::models::temporal::{clean_windows, SequenceConfig, SequenceModel};
use super::normalization::FeatureScaler;
use crate::config::{check_range, Config};
use crate::error::{ConfigError, Result, SurveillanceError};
use crate::market::BarSeries;
use crate::parallel::{self, WorkerPool};
use crate::tracking::{EventSink, NoopSink, TrackingEvent};

/// Training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Seed for every random draw made during training
    pub seed: u64,
    /// Expected share of anomalous points; sets the calibration floor quantile
    pub contamination: f64,
    /// Share of clean points held out to fit the score calibrators
    pub calibration_fraction: f64,
    /// Minimum clean feature vectors needed to train
    pub min_training_vectors: usize,
    /// Order statistics kept per calibrator
    pub calibration_points: usize,
    /// Version stamped on produced artifacts
    pub model_version: ModelVersion,
    pub isolation_forest: IsolationForestConfig,
    pub autoencoder: AutoencoderConfig,
    pub sequence: SequenceConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            contamination: 0.05,
            calibration_fraction: 0.2,
            min_training_vectors: 64,
            calibration_points: 1024,
            model_version: ModelVersion::default(),
            isolation_forest: IsolationForestConfig::default(),
            autoencoder: AutoencoderConfig::default(),
            sequence: SequenceConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_range("training.contamination", self.contamination, 0.0, 0.5)?;
        check_range("training.calibration_fraction", self.calibration_fraction, 0.01, 0.9)?;
        check_range("training.min_training_vectors", self.min_training_vectors as f64, 4.0, 1e12)?;
        check_range("training.calibration_points", self.calibration_points as f64, 2.0, 1e9)?;
        self.isolation_forest.validate()?;
        self.autoencoder.validate()?;
        self.sequence.validate()
    }

    fn params(&self, window_length: usize) -> BTreeMap<String, String> {
        [
            ("seed", self.seed.to_string()),
            ("contamination", self.contamination.to_string()),
            ("calibration_fraction", self.calibration_fraction.to_string()),
            ("window_length", window_length.to_string()),
            ("n_estimators", self.isolation_forest.num_trees.to_string()),
            ("max_samples", self.isolation_forest.sample_size.to_string()),
            ("encoder_dims", format!("{:?}", self.autoencoder.hidden_dims)),
            ("latent_dim", self.autoencoder.latent_dim.to_string()),
            ("epochs", self.autoencoder.epochs.to_string()),
            ("hidden_units", self.sequence.hidden_units.to_string()),
            ("sequence_epochs", self.sequence.epochs.to_string()),
            ("model_version", self.model_version.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Feature vectors of one ticker, in bar order
#[derive(Debug, Clone, PartialEq)]
pub struct TickerFeatures {
    pub ticker: String,
    pub vectors: Vec<FeatureVector>,
}

/// Training population: per-ticker feature vectors extracted with one window length
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    window_length: usize,
    tickers: Vec<TickerFeatures>,
}

impl TrainingSet {
    /// Extract features from every series, in parallel across tickers
    pub fn from_series(series: &[BarSeries], extractor: &FeatureExtractor) -> Self {
        let tickers = parallel::par_map(series, |s| TickerFeatures {
            ticker: s.ticker().to_string(),
            vectors: extractor.extract(s),
        });
        Self {
            window_length: extractor.window_length(),
            tickers,
        }
    }

    pub fn from_features(window_length: usize, tickers: Vec<TickerFeatures>) -> Self {
        Self {
            window_length,
            tickers,
        }
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    pub fn tickers(&self) -> &[TickerFeatures] {
        &self.tickers
    }

    /// Total feature vectors, quiescent ones included
    pub fn len(&self) -> usize {
        self.tickers.iter().map(|t| t.vectors.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vectors the point detectors may learn from
    pub fn clean_points(&self) -> impl Iterator<Item = &FeatureVector> {
        self.tickers
            .iter()
            .flat_map(|t| t.vectors.iter())
            .filter(|fv| !fv.quiescent)
    }

    /// Full windows free of quiescent vectors, ticker by ticker
    pub fn clean_windows(&self) -> impl Iterator<Item = &[FeatureVector]> {
        let w = self.window_length;
        self.tickers.iter().flat_map(move |t| clean_windows(&t.vectors, w))
    }
}

/// The three artifacts from one training run
#[derive(Debug, Clone)]
pub struct TrainedModels {
    pub outlier: Arc<TrainedModelArtifact>,
    pub reconstruction: Arc<TrainedModelArtifact>,
    pub sequence: Arc<TrainedModelArtifact>,
}

impl TrainedModels {
    pub fn get(&self, kind: ArtifactKind) -> &Arc<TrainedModelArtifact> {
        match kind {
            ArtifactKind::IsolationForest => &self.outlier,
            ArtifactKind::Autoencoder => &self.reconstruction,
            ArtifactKind::Sequence => &self.sequence,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TrainedModelArtifact>> {
        [&self.outlier, &self.reconstruction, &self.sequence].into_iter()
    }

    /// Write each artifact as `<tag>.bin` under `dir`
    pub fn save_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        for artifact in self.iter() {
            artifact.save(dir.as_ref().join(format!("{}.bin", artifact.kind().tag())))?;
        }
        Ok(())
    }

    /// Read all three artifacts written by [`TrainedModels::save_dir`]
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let load = |kind: ArtifactKind| -> Result<Arc<TrainedModelArtifact>> {
            let path = dir.as_ref().join(format!("{}.bin", kind.tag()));
            Ok(Arc::new(TrainedModelArtifact::load_as(path, kind)?))
        };
        Ok(Self {
            outlier: load(ArtifactKind::IsolationForest)?,
            reconstruction: load(ArtifactKind::Autoencoder)?,
            sequence: load(ArtifactKind::Sequence)?,
        })
    }
}

/// Standardized, split training data shared by all three fits
struct Prepared {
    scaler: FeatureScaler,
    train_rows: Vec<Vec<f64>>,
    calib_rows: Vec<Vec<f64>>,
    train_windows: Vec<Vec<Vec<f64>>>,
    calib_windows: Vec<Vec<Vec<f64>>>,
}

/// Fits the trainable detectors
pub struct ModelTrainer {
    config: TrainingConfig,
    extractor: FeatureExtractor,
    sink: Arc<dyn EventSink>,
    pool: WorkerPool,
}

impl ModelTrainer {
    pub fn new(config: &Config) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: config.training.clone(),
            extractor: FeatureExtractor::new(config.features.clone())?,
            sink: Arc::new(NoopSink),
            pool: WorkerPool::new(&config.parallel)?,
        })
    }

    /// Send tracking events to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Extract features from `series` and fit all three detectors
    pub fn fit_all(&self, series: &[BarSeries]) -> Result<TrainedModels> {
        let set = self
            .pool
            .install(|| TrainingSet::from_series(series, &self.extractor));
        info!(
            tickers = series.len(),
            vectors = set.len(),
            threads = self.pool.threads(),
            "extracted training features"
        );
        self.fit_set(&set)
    }

    /// Fit all three detectors on a prepared training set, concurrently
    pub fn fit_set(&self, set: &TrainingSet) -> Result<TrainedModels> {
        self.check_window(set)?;
        self.sink.record(TrackingEvent::ParametersLogged {
            params: self.config.params(set.window_length()),
        });

        let prepared = self.prepare(set)?;
        let window = set.window_length();
        let (outlier, (reconstruction, sequence)) = self.pool.install(|| {
            parallel::join(
                || self.outlier_artifact(&prepared, window),
                || {
                    parallel::join(
                        || self.reconstruction_artifact(&prepared, window),
                        || self.sequence_artifact(&prepared, window),
                    )
                },
            )
        });

        Ok(TrainedModels {
            outlier: Arc::new(outlier?),
            reconstruction: Arc::new(reconstruction?),
            sequence: Arc::new(sequence?),
        })
    }

    pub fn fit_outlier(&self, set: &TrainingSet) -> Result<TrainedModelArtifact> {
        self.check_window(set)?;
        self.outlier_artifact(&self.prepare(set)?, set.window_length())
    }

    pub fn fit_reconstruction(&self, set: &TrainingSet) -> Result<TrainedModelArtifact> {
        self.check_window(set)?;
        self.reconstruction_artifact(&self.prepare(set)?, set.window_length())
    }

    pub fn fit_sequence(&self, set: &TrainingSet) -> Result<TrainedModelArtifact> {
        self.check_window(set)?;
        self.sequence_artifact(&self.prepare(set)?, set.window_length())
    }

    fn check_window(&self, set: &TrainingSet) -> std::result::Result<(), ConfigError> {
        if set.window_length() != self.extractor.window_length() {
            return Err(ConfigError::WindowMismatch {
                artifact: set.window_length(),
                configured: self.extractor.window_length(),
            });
        }
        Ok(())
    }

    /// Shuffle, split, fit the scaler on the training share and standardize
    fn prepare(&self, set: &TrainingSet) -> Result<Prepared> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let mut points: Vec<&FeatureVector> = set.clean_points().collect();
        if points.len() < self.config.min_training_vectors {
            return Err(SurveillanceError::InsufficientTrainingData {
                needed: self.config.min_training_vectors,
                got: points.len(),
            });
        }
        points.shuffle(&mut rng);
        let n_calib = self.calibration_count(points.len());
        let (calib_points, train_points) = points.split_at(n_calib);

        let scaler = FeatureScaler::fit(train_points.iter().map(|fv| fv.as_slice()))?;
        let standardize = |fv: &FeatureVector| scaler.transform(fv.as_slice());

        let train_rows = train_points
            .iter()
            .map(|fv| standardize(*fv))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let calib_rows = calib_points
            .iter()
            .map(|fv| standardize(*fv))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut windows: Vec<&[FeatureVector]> = set.clean_windows().collect();
        if windows.len() < 2 {
            return Err(SurveillanceError::InsufficientTrainingData {
                needed: 2,
                got: windows.len(),
            });
        }
        windows.shuffle(&mut rng);
        let n_calib = self.calibration_count(windows.len());
        let (calib_w, train_w) = windows.split_at(n_calib);
        let train_w = thin_evenly(train_w, self.config.sequence.max_training_windows);

        let standardize_window = |w: &[FeatureVector]| {
            w.iter()
                .map(|fv| standardize(fv))
                .collect::<std::result::Result<Vec<_>, _>>()
        };
        let train_windows = train_w
            .iter()
            .map(|w| standardize_window(*w))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let calib_windows = calib_w
            .iter()
            .map(|w| standardize_window(*w))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        debug!(
            train_rows = train_rows.len(),
            calib_rows = calib_rows.len(),
            train_windows = train_windows.len(),
            calib_windows = calib_windows.len(),
            "prepared training data"
        );

        Ok(Prepared {
            scaler,
            train_rows,
            calib_rows,
            train_windows,
            calib_windows,
        })
    }

    /// Held-out count: at least one, never all
    fn calibration_count(&self, n: usize) -> usize {
        ((n as f64 * self.config.calibration_fraction).round() as usize).clamp(1, n - 1)
    }

    fn calibrator(&self, scores: &[f64]) -> ScoreCalibrator {
        ScoreCalibrator::fit_percentile(
            scores,
            1.0 - self.config.contamination,
            self.config.calibration_points,
        )
    }

    fn metadata(&self, training: usize, calibration: usize, seed: u64, window: usize) -> ArtifactMetadata {
        ArtifactMetadata {
            trained_at: Utc::now(),
            training_samples: training,
            calibration_samples: calibration,
            seed,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            window_length: window,
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn finish(
        &self,
        prepared: &Prepared,
        calibrator: ScoreCalibrator,
        params: ModelParams,
        metadata: ArtifactMetadata,
        mut metrics: BTreeMap<String, f64>,
    ) -> Result<TrainedModelArtifact> {
        let artifact = TrainedModelArtifact::new(
            self.config.model_version.clone(),
            prepared.scaler.clone(),
            calibrator,
            params,
            metadata,
        )?;

        metrics.insert("training_samples".to_string(), artifact.metadata().training_samples as f64);
        metrics.insert(
            "calibration_samples".to_string(),
            artifact.metadata().calibration_samples as f64,
        );
        info!(
            kind = %artifact.kind(),
            version = %artifact.version(),
            checksum = artifact.checksum(),
            "trained artifact"
        );
        self.sink.record(TrackingEvent::TrainingCompleted {
            kind: artifact.kind(),
            version: artifact.version().clone(),
            checksum: artifact.checksum().to_string(),
            metrics,
        });
        Ok(artifact)
    }

    fn outlier_artifact(&self, prepared: &Prepared, window: usize) -> Result<TrainedModelArtifact> {
        let seed = self.config.seed;
        let forest = IsolationForest::fit(&prepared.train_rows, &self.config.isolation_forest, seed)?;
        let scores = prepared
            .calib_rows
            .iter()
            .map(|r| forest.score(r))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut metrics = BTreeMap::new();
        metrics.insert("calibration_mean_score".to_string(), mean(&scores));
        metrics.insert("num_trees".to_string(), forest.num_trees() as f64);

        let metadata = self.metadata(prepared.train_rows.len(), scores.len(), seed, window);
        self.finish(
            prepared,
            self.calibrator(&scores),
            ModelParams::IsolationForest(forest),
            metadata,
            metrics,
        )
    }

    fn reconstruction_artifact(&self, prepared: &Prepared, window: usize) -> Result<TrainedModelArtifact> {
        let seed = self.config.seed.wrapping_add(1);
        let dataset = AutoencoderDataset::from_rows(prepared.train_rows.clone());
        let mut trainer = AutoencoderTrainer::new(self.config.autoencoder.clone());
        let trained = trainer.train(&dataset, seed)?;
        let scores = trained.model.reconstruction_errors(&prepared.calib_rows)?;

        let mut metrics = BTreeMap::new();
        metrics.insert("final_loss".to_string(), trained.final_loss);
        metrics.insert("best_loss".to_string(), trained.best_loss);
        metrics.insert("epochs".to_string(), trained.epochs_trained as f64);
        metrics.insert("calibration_mean_error".to_string(), mean(&scores));

        let metadata = self.metadata(dataset.len(), scores.len(), seed, window);
        self.finish(
            prepared,
            self.calibrator(&scores),
            ModelParams::Autoencoder(trained.model),
            metadata,
            metrics,
        )
    }

    fn sequence_artifact(&self, prepared: &Prepared, window: usize) -> Result<TrainedModelArtifact> {
        let seed = self.config.seed.wrapping_add(2);
        let model = SequenceModel::fit(&prepared.train_windows, window, &self.config.sequence, seed)?;
        let scores = model.scores(&prepared.calib_windows)?;

        let mut metrics = BTreeMap::new();
        metrics.insert("calibration_mean_error".to_string(), mean(&scores));

        let metadata = self.metadata(prepared.train_windows.len(), scores.len(), seed, window);
        self.finish(
            prepared,
            self.calibrator(&scores),
            ModelParams::Sequence(model),
            metadata,
            metrics,
        )
    }
}

/// Keep at most `max` items, evenly spaced, first item always kept
fn thin_evenly<'a, T>(items: &[&'a T], max: usize) -> Vec<&'a T>
where
    T: ?Sized,
{
    if items.len() <= max || max == 0 {
        return items.to_vec();
    }
    (0..max).map(|k| items[k * items.len() / max]).collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::DetectorId;
    use crate::testing::synthetic::MarketGenerator;
    use crate::tracking::MemorySink;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.features.window_length = 10;
        config.training.isolation_forest.num_trees = 20;
        config.training.isolation_forest.sample_size = 64;
        config.training.autoencoder.epochs = 5;
        config
    }

    fn population(n: usize, bars: usize) -> Vec<BarSeries> {
        (0..n as u64)
            .map(|i| MarketGenerator::new(100 + i).series(&format!("T{i}"), bars).unwrap())
            .collect()
    }

    #[test]
    fn test_training_config_validation() {
        let mut config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        config.contamination = 0.7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_thin_evenly() {
        let items: Vec<usize> = (0..10).collect();
        let refs: Vec<&usize> = items.iter().collect();
        let thinned = thin_evenly(&refs, 4);
        assert_eq!(thinned, vec![&0, &2, &5, &7]);
        assert_eq!(thin_evenly(&refs, 20).len(), 10);
    }

    #[test]
    fn test_training_set_excludes_quiescent() {
        let config = small_config();
        let trainer = ModelTrainer::new(&config).unwrap();
        let mut series = population(1, 40);
        series.push(MarketGenerator::flat_series("FLAT", 40, 10.0, 1000.0).unwrap());
        let set = TrainingSet::from_series(&series, trainer.extractor());

        assert_eq!(set.len(), 60);
        assert_eq!(set.clean_points().count(), 30);
        assert!(set.clean_windows().all(|w| w.len() == 10));
    }

    #[test]
    fn test_insufficient_data() {
        let trainer = ModelTrainer::new(&small_config()).unwrap();
        let err = trainer.fit_all(&population(1, 30)).unwrap_err();
        assert!(matches!(
            err,
            SurveillanceError::InsufficientTrainingData { needed: 64, got: 20 }
        ));
    }

    #[test]
    fn test_fit_all_produces_three_artifacts() {
        let sink = Arc::new(MemorySink::new());
        let trainer = ModelTrainer::new(&small_config())
            .unwrap()
            .with_sink(sink.clone());
        let models = trainer.fit_all(&population(4, 80)).unwrap();

        assert_eq!(models.outlier.kind(), ArtifactKind::IsolationForest);
        assert_eq!(models.reconstruction.kind(), ArtifactKind::Autoencoder);
        assert_eq!(models.sequence.kind(), ArtifactKind::Sequence);
        for artifact in models.iter() {
            assert_eq!(artifact.metadata().window_length, 10);
            assert_eq!(artifact.scaler(), models.outlier.scaler());
            assert!(artifact.metadata().calibration_samples > 0);
        }

        let events = sink.events();
        assert!(matches!(events[0], TrackingEvent::ParametersLogged { .. }));
        let completed = events
            .iter()
            .filter(|e| matches!(e, TrackingEvent::TrainingCompleted { .. }))
            .count();
        assert_eq!(completed, 3);
    }

    #[test]
    fn test_training_is_seeded() {
        let trainer = ModelTrainer::new(&small_config()).unwrap();
        let series = population(3, 80);
        let set = TrainingSet::from_series(&series, trainer.extractor());
        let a = trainer.fit_outlier(&set).unwrap();
        let b = trainer.fit_outlier(&set).unwrap();
        assert_eq!(a.params(), b.params());
        assert_eq!(a.calibrator(), b.calibrator());
    }

    #[test]
    fn test_window_mismatch_rejected() {
        let trainer = ModelTrainer::new(&small_config()).unwrap();
        let set = TrainingSet::from_features(30, Vec::new());
        assert!(matches!(
            trainer.fit_sequence(&set),
            Err(SurveillanceError::Configuration(ConfigError::WindowMismatch { .. }))
        ));
    }

    #[test]
    fn test_save_and_load_dir() {
        let trainer = ModelTrainer::new(&small_config()).unwrap();
        let models = trainer.fit_all(&population(3, 70)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        models.save_dir(dir.path()).unwrap();

        let loaded = TrainedModels::load_dir(dir.path()).unwrap();
        for kind in ArtifactKind::ALL {
            assert_eq!(loaded.get(kind).checksum(), models.get(kind).checksum());
        }
    }

    #[test]
    fn test_single_bar_window_trains_all_detectors() {
        let mut config = small_config();
        config.features.window_length = 1;
        let trainer = ModelTrainer::new(&config).unwrap();
        let models = trainer.fit_all(&population(3, 60)).unwrap();

        for artifact in models.iter() {
            assert_eq!(artifact.metadata().window_length, 1);
        }
        let ModelParams::Sequence(sequence) = models.sequence.params() else {
            panic!("sequence artifact holds another model");
        };
        assert_eq!(sequence.window_length(), 1);

        let engine = crate::engine::ScoringEngine::new(config)
            .unwrap()
            .with_models(&models)
            .unwrap();
        let series = MarketGenerator::new(99).series("ONE", 40).unwrap();
        let verdicts = engine
            .score_range(&series, crate::market::TimeRange::all())
            .unwrap();
        assert!(!verdicts.is_empty());
        assert!(verdicts
            .iter()
            .filter(|v| !v.features.quiescent)
            .all(|v| v.normalized_scores.contains_key(&DetectorId::Sequence)));
    }

    #[test]
    fn test_dedicated_pool_trains_same_forest() {
        let mut pooled = small_config();
        pooled.parallel.num_threads = 2;
        let series = population(3, 80);

        let a = ModelTrainer::new(&pooled).unwrap().fit_all(&series).unwrap();
        let b = ModelTrainer::new(&small_config()).unwrap().fit_all(&series).unwrap();
        assert_eq!(a.outlier.params(), b.outlier.params());
        assert_eq!(a.outlier.calibrator(), b.outlier.calibrator());
    }
}
