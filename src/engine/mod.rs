//! Scoring Engine
//!
//! Owns the detector set and turns a validated series into one verdict per
//! scoreable bar.
//!
//! # Architecture
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌──────────────┐
//! │  BarSeries  │────▶│ FeatureExtractor │────▶│   Vectors    │
//! └─────────────┘     └──────────────────┘     └──────────────┘
//!                                                     │
//!        ┌──────────────────┬──────────────────┬──────┴───────────┐
//!        ▼                  ▼                  ▼                  ▼
//! ┌─────────────┐    ┌─────────────┐    ┌──────────────┐   ┌─────────────┐
//! │ Statistical │    │   Outlier   │    │Reconstruction│   │  Sequence   │
//! │ (no model)  │    │  (forest)   │    │(autoencoder) │   │  (window)   │
//! └─────────────┘    └─────────────┘    └──────────────┘   └─────────────┘
//!        └──────────────────┴─────────┬────────┴──────────────────┘
//!                                     ▼
//!                             ┌──────────────┐
//!                             │EnsembleFuser │──▶ EnsembleVerdict
//!                             └──────────────┘
//! ```
//!
//! Trained detectors are optional. A detector without a usable artifact sits
//! in a `Missing` slot and every verdict it would have fed comes out partial.

pub mod explain;

pub use explain::{DetectorContribution, Explanation};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ConfigError, Result, SurveillanceError};
use crate::market::{BarSeries, TimeRange};
use crate::ml::artifact::{ArtifactKind, ModelVersion, TrainedModelArtifact};
use crate::ml::features::{FeatureExtractor, FeatureVector};
use crate::ml::models::ensemble::{EnsembleFuser, EnsembleVerdict};
use crate::ml::models::temporal::trailing_window;
use crate::ml::models::{OutlierDetector, ReconstructionDetector, SequenceDetector, StatisticalDetector};
use crate::ml::training::TrainedModels;
use crate::ml::{Detector, DetectorId, DetectorOutcome, ScoringInput, Unavailability};
use crate::parallel::{self, ScoringStats, WorkerPool};
use crate::tracking::{EventSink, NoopSink, TrackingEvent};

/// Cooperative cancellation for long scoring calls.
///
/// Checked between scoring points. A cancelled call returns
/// [`SurveillanceError::Cancelled`] and no verdicts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Detector state inside the engine
#[derive(Clone)]
enum DetectorSlot {
    Ready(Arc<dyn Detector>),
    Missing(Unavailability),
}

/// Scores bar series with the full detector ensemble
pub struct ScoringEngine {
    config: Config,
    extractor: FeatureExtractor,
    statistical: StatisticalDetector,
    slots: BTreeMap<DetectorId, DetectorSlot>,
    fuser: EnsembleFuser,
    sink: Arc<dyn EventSink>,
    stats: Arc<ScoringStats>,
    pool: WorkerPool,
}

impl std::fmt::Debug for ScoringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringEngine")
            .field("window_length", &self.extractor.window_length())
            .field("status", &self.detector_status())
            .finish()
    }
}

impl ScoringEngine {
    /// Validate the configuration and build an engine with only the
    /// statistical detector ready.
    pub fn new(config: Config) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let extractor = FeatureExtractor::new(config.features.clone())?;
        let statistical = StatisticalDetector::new(config.statistical.clone());
        let fuser = EnsembleFuser::new(config.ensemble.clone(), &config.patterns)?;
        let pool = WorkerPool::new(&config.parallel)?;

        let mut slots = BTreeMap::new();
        slots.insert(
            DetectorId::Statistical,
            DetectorSlot::Ready(Arc::new(statistical.clone()) as Arc<dyn Detector>),
        );
        for id in [DetectorId::Outlier, DetectorId::Reconstruction, DetectorId::Sequence] {
            slots.insert(id, DetectorSlot::Missing(Unavailability::NotLoaded));
        }

        Ok(Self {
            config,
            extractor,
            statistical,
            slots,
            fuser,
            sink: Arc::new(NoopSink),
            stats: ScoringStats::shared(),
            pool,
        })
    }

    /// Send tracking events to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Attach all three artifacts from a training run
    pub fn with_models(mut self, models: &TrainedModels) -> std::result::Result<Self, ConfigError> {
        for artifact in models.iter() {
            self.attach(Arc::clone(artifact))?;
        }
        Ok(self)
    }

    pub fn with_artifact(
        mut self,
        artifact: Arc<TrainedModelArtifact>,
    ) -> std::result::Result<Self, ConfigError> {
        self.attach(artifact)?;
        Ok(self)
    }

    /// Put an artifact behind its detector, replacing whatever was there.
    ///
    /// Wrong kind, feature width or window length is a configuration error.
    pub fn attach(&mut self, artifact: Arc<TrainedModelArtifact>) -> std::result::Result<(), ConfigError> {
        let kind = artifact.kind();
        let version = artifact.version().clone();
        let detector: Arc<dyn Detector> = match kind {
            ArtifactKind::IsolationForest => Arc::new(OutlierDetector::from_artifact(artifact)?),
            ArtifactKind::Autoencoder => Arc::new(ReconstructionDetector::from_artifact(artifact)?),
            ArtifactKind::Sequence => Arc::new(SequenceDetector::from_artifact(
                artifact,
                self.extractor.window_length(),
            )?),
        };

        info!(kind = %kind, version = %version, "artifact loaded");
        self.sink.record(TrackingEvent::ArtifactLoaded { kind, version });
        self.slots.insert(kind.detector(), DetectorSlot::Ready(detector));
        Ok(())
    }

    /// Decode and attach an artifact of the given kind.
    ///
    /// Undecodable or tampered bytes leave the detector missing and the
    /// engine usable; a kind mismatch is still a configuration error.
    pub fn load_artifact_bytes(&mut self, kind: ArtifactKind, bytes: &[u8]) -> Result<()> {
        match TrainedModelArtifact::from_bytes_as(bytes, kind) {
            Ok(artifact) => Ok(self.attach(Arc::new(artifact))?),
            Err(SurveillanceError::ModelUnavailable(e)) => {
                warn!(kind = %kind, error = %e, "artifact unusable, detector disabled");
                self.slots.insert(
                    kind.detector(),
                    DetectorSlot::Missing(Unavailability::Corrupt(e.to_string())),
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Read and attach an artifact file. A missing file leaves the detector not loaded.
    pub fn load_artifact_file<P: AsRef<Path>>(&mut self, kind: ArtifactKind, path: P) -> Result<()> {
        match std::fs::read(path.as_ref()) {
            Ok(bytes) => self.load_artifact_bytes(kind, &bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(kind = %kind, path = %path.as_ref().display(), "artifact file not found");
                self.slots
                    .insert(kind.detector(), DetectorSlot::Missing(Unavailability::NotLoaded));
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a trained detector
    pub fn detach(&mut self, id: DetectorId) {
        if id != DetectorId::Statistical {
            self.slots.insert(id, DetectorSlot::Missing(Unavailability::NotLoaded));
        }
    }

    /// `None` for ready detectors, the reason otherwise
    pub fn detector_status(&self) -> BTreeMap<DetectorId, Option<Unavailability>> {
        self.slots
            .iter()
            .map(|(id, slot)| {
                let status = match slot {
                    DetectorSlot::Ready(_) => None,
                    DetectorSlot::Missing(reason) => Some(reason.clone()),
                };
                (*id, status)
            })
            .collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn stats(&self) -> &Arc<ScoringStats> {
        &self.stats
    }

    /// Verdicts for every scoreable bar whose timestamp falls in `range`
    pub fn score_range(&self, series: &BarSeries, range: TimeRange) -> Result<Vec<EnsembleVerdict>> {
        self.score_series(series, range, None)
    }

    /// As [`ScoringEngine::score_range`], stopping early once `cancel` is set
    pub fn score_range_cancellable(
        &self,
        series: &BarSeries,
        range: TimeRange,
        cancel: &CancelFlag,
    ) -> Result<Vec<EnsembleVerdict>> {
        self.score_series(series, range, Some(cancel))
    }

    /// Score many tickers in parallel on the engine's worker pool.
    /// Output order follows `universe`.
    pub fn score_universe(
        &self,
        universe: &[BarSeries],
        range: TimeRange,
    ) -> Result<Vec<Vec<EnsembleVerdict>>> {
        debug!(tickers = universe.len(), threads = self.pool.threads(), "scoring universe");
        self.pool
            .install(|| parallel::par_map(universe, |series| self.score_series(series, range, None)))
            .into_iter()
            .collect()
    }

    pub fn explain(&self, verdict: &EnsembleVerdict) -> Explanation {
        Explanation::from(verdict)
    }

    fn model_versions(&self) -> BTreeMap<DetectorId, ModelVersion> {
        self.slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                DetectorSlot::Ready(d) => d.model_version().map(|v| (*id, v)),
                DetectorSlot::Missing(_) => None,
            })
            .collect()
    }

    fn score_series(
        &self,
        series: &BarSeries,
        range: TimeRange,
        cancel: Option<&CancelFlag>,
    ) -> Result<Vec<EnsembleVerdict>> {
        let is_cancelled = || cancel.is_some_and(|c| c.is_cancelled());
        if is_cancelled() {
            return Err(SurveillanceError::Cancelled);
        }

        let vectors = self.extractor.extract(series);
        let versions = self.model_versions();
        let mut verdicts = Vec::new();
        let mut absorbed = 0usize;

        for (position, fv) in vectors.iter().enumerate() {
            if is_cancelled() {
                debug!(ticker = series.ticker(), position, "scoring cancelled");
                return Err(SurveillanceError::Cancelled);
            }
            if !range.contains(fv.timestamp) {
                continue;
            }

            let (verdict, failures) = self.score_point(series.ticker(), &vectors, position, fv, &versions)?;
            absorbed += failures;
            verdicts.push(verdict);
        }

        if absorbed > 0 {
            warn!(
                ticker = series.ticker(),
                points = absorbed,
                "model failures absorbed into partial verdicts"
            );
        }

        let flagged = verdicts.iter().filter(|v| v.is_flagged()).count();
        let partial = verdicts.iter().filter(|v| v.partial).count();
        self.stats
            .record_series(verdicts.len() as u64, flagged as u64, partial as u64);
        debug!(
            ticker = series.ticker(),
            bars = series.len(),
            verdicts = verdicts.len(),
            flagged,
            partial,
            "scored series"
        );
        self.sink.record(TrackingEvent::ScoresProduced {
            ticker: series.ticker().to_string(),
            verdicts: verdicts.len(),
            flagged,
            partial,
        });

        Ok(verdicts)
    }

    /// One verdict, plus how many detectors failed at scoring time
    fn score_point(
        &self,
        ticker: &str,
        vectors: &[FeatureVector],
        position: usize,
        fv: &FeatureVector,
        versions: &BTreeMap<DetectorId, ModelVersion>,
    ) -> Result<(EnsembleVerdict, usize)> {
        let input = match trailing_window(vectors, position, self.extractor.window_length()) {
            Some(window) => ScoringInput::with_window(fv, window),
            None => ScoringInput::point(fv),
        };

        let mut outcomes = BTreeMap::new();
        let mut failures = 0;
        for (id, slot) in &self.slots {
            let outcome = match slot {
                DetectorSlot::Ready(detector) => DetectorOutcome::evaluate(detector.as_ref(), &input)?,
                DetectorSlot::Missing(reason) => DetectorOutcome::Unavailable(reason.clone()),
            };
            if matches!(slot, DetectorSlot::Ready(_))
                && matches!(outcome, DetectorOutcome::Unavailable(Unavailability::Corrupt(_)))
            {
                failures += 1;
            }
            outcomes.insert(*id, outcome);
        }

        let breakdown = self.statistical.breakdown(fv);
        let verdict = self
            .fuser
            .fuse(ticker, fv, &outcomes, versions, Some(breakdown));
        Ok((verdict, failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::synthetic::MarketGenerator;
    use crate::tracking::MemorySink;

    fn engine() -> ScoringEngine {
        let mut config = Config::default();
        config.features.window_length = 10;
        ScoringEngine::new(config).unwrap()
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        let shared = flag.clone();
        assert!(!flag.is_cancelled());
        shared.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_new_engine_has_only_statistical() {
        let status = engine().detector_status();
        assert_eq!(status[&DetectorId::Statistical], None);
        assert_eq!(status[&DetectorId::Outlier], Some(Unavailability::NotLoaded));
        assert_eq!(status[&DetectorId::Sequence], Some(Unavailability::NotLoaded));
    }

    #[test]
    fn test_statistical_only_verdicts_are_partial() {
        let engine = engine();
        let series = MarketGenerator::new(3).series("ACME", 40).unwrap();
        let verdicts = engine.score_range(&series, TimeRange::all()).unwrap();

        assert_eq!(verdicts.len(), 30);
        for v in &verdicts {
            assert!(v.partial);
            assert_eq!(v.missing.len(), 3);
            assert!((v.effective_weights[&DetectorId::Statistical] - 1.0).abs() < 1e-9);
            assert!(v.model_versions.is_empty());
        }
    }

    #[test]
    fn test_range_filters_timestamps() {
        let engine = engine();
        let series = MarketGenerator::new(3).series("ACME", 40).unwrap();
        let bars = series.bars();
        let range = TimeRange::new(bars[20].timestamp, bars[24].timestamp);
        let verdicts = engine.score_range(&series, range).unwrap();
        assert_eq!(verdicts.len(), 5);
        assert_eq!(verdicts[0].timestamp, bars[20].timestamp);
    }

    #[test]
    fn test_short_series_yields_nothing() {
        let series = MarketGenerator::new(3).series("ACME", 10).unwrap();
        assert!(engine().score_range(&series, TimeRange::all()).unwrap().is_empty());
    }

    #[test]
    fn test_pre_cancelled_call_returns_error() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let series = MarketGenerator::new(3).series("ACME", 40).unwrap();
        let err = engine()
            .score_range_cancellable(&series, TimeRange::all(), &cancel)
            .unwrap_err();
        assert!(matches!(err, SurveillanceError::Cancelled));
    }

    #[test]
    fn test_garbage_bytes_leave_detector_missing() {
        let mut engine = engine();
        engine
            .load_artifact_bytes(ArtifactKind::Autoencoder, b"not an artifact")
            .unwrap();
        assert!(matches!(
            engine.detector_status()[&DetectorId::Reconstruction],
            Some(Unavailability::Corrupt(_))
        ));
    }

    #[test]
    fn test_missing_file_is_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine();
        engine
            .load_artifact_file(ArtifactKind::Sequence, dir.path().join("absent.bin"))
            .unwrap();
        assert_eq!(
            engine.detector_status()[&DetectorId::Sequence],
            Some(Unavailability::NotLoaded)
        );
    }

    #[test]
    fn test_universe_keeps_order_and_counts() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine().with_sink(sink.clone());
        let universe: Vec<BarSeries> = (0..4)
            .map(|i| MarketGenerator::new(i).series(&format!("T{i}"), 30 + i as usize).unwrap())
            .collect();

        let results = engine.score_universe(&universe, TimeRange::all()).unwrap();
        let lengths: Vec<usize> = results.iter().map(|r| r.len()).collect();
        assert_eq!(lengths, vec![20, 21, 22, 23]);
        assert_eq!(results[2][0].ticker, "T2");
        assert_eq!(engine.stats().get_series(), 4);
        assert_eq!(engine.stats().get_verdicts(), 86);
        assert_eq!(sink.len(), 4);
    }

    #[test]
    fn test_dedicated_pool_matches_global() {
        let mut config = Config::default();
        config.features.window_length = 10;
        config.parallel.num_threads = 2;
        let pooled = ScoringEngine::new(config).unwrap();
        let universe: Vec<BarSeries> = (0..3)
            .map(|i| MarketGenerator::new(20 + i).series(&format!("P{i}"), 40).unwrap())
            .collect();

        let a = pooled.score_universe(&universe, TimeRange::all()).unwrap();
        let b = engine().score_universe(&universe, TimeRange::all()).unwrap();
        assert_eq!(a, b);
    }
}
