//! Feature extraction from OHLCV bars
//!
//! Each scoring point gets six features computed from the bar itself and its
//! trailing history. Only bars up to and including the current index are
//! read, so extending a series never changes earlier vectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::check_positive;
use crate::error::ConfigError;
use crate::market::{BarSeries, RawBar};

/// Number of features per vector
pub const NUM_FEATURES: usize = 6;

/// Canonical feature order
pub const FEATURE_NAMES: [&str; NUM_FEATURES] = [
    "volume_zscore",
    "volatility_ratio",
    "volume_price_correlation",
    "rsi",
    "vwap_deviation",
    "price_zscore",
];

/// Feature extraction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Trailing window length W; the first W bars produce no vector
    pub window_length: usize,
    /// Returns in the short realized-volatility window
    pub volatility_short_window: usize,
    /// RSI smoothing period
    pub rsi_period: usize,
    /// Z-scores are clipped to +/- this value
    pub max_abs_zscore: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            window_length: 30,
            volatility_short_window: 5,
            rsi_period: 14,
            max_abs_zscore: 25.0,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_length < 1 {
            return Err(ConfigError::InvalidWindowLength(self.window_length));
        }
        if self.volatility_short_window < 1 {
            return Err(ConfigError::InvalidParameter {
                name: "volatility_short_window",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.rsi_period < 1 {
            return Err(ConfigError::InvalidParameter {
                name: "rsi_period",
                reason: "must be at least 1".to_string(),
            });
        }
        check_positive("max_abs_zscore", self.max_abs_zscore)
    }
}

/// Six features for one bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Index of the source bar within its series
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    /// Values in [`FEATURE_NAMES`] order
    pub values: [f64; NUM_FEATURES],
    /// Price and volume showed no dispersion at all over the window
    pub quiescent: bool,
}

impl FeatureVector {
    pub fn new(index: usize, timestamp: DateTime<Utc>, values: [f64; NUM_FEATURES]) -> Self {
        Self {
            index,
            timestamp,
            values,
            quiescent: false,
        }
    }

    pub fn volume_zscore(&self) -> f64 {
        self.values[0]
    }

    pub fn volatility_ratio(&self) -> f64 {
        self.values[1]
    }

    pub fn volume_price_correlation(&self) -> f64 {
        self.values[2]
    }

    pub fn rsi(&self) -> f64 {
        self.values[3]
    }

    pub fn vwap_deviation(&self) -> f64 {
        self.values[4]
    }

    pub fn price_zscore(&self) -> f64 {
        self.values[5]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        NUM_FEATURES
    }

    /// (name, value) pairs in canonical order
    pub fn named(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        FEATURE_NAMES.iter().copied().zip(self.values.iter().copied())
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Turns a bar series into feature vectors
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self {
            config: FeatureConfig::default(),
        }
    }
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn window_length(&self) -> usize {
        self.config.window_length
    }

    /// One vector per bar index >= W, in order
    pub fn extract(&self, series: &BarSeries) -> Vec<FeatureVector> {
        let bars = series.bars();
        let w = self.config.window_length;
        if bars.len() <= w {
            debug!(
                ticker = series.ticker(),
                bars = bars.len(),
                window = w,
                "series shorter than warm-up, no features"
            );
            return Vec::new();
        }

        (w..bars.len())
            .filter_map(|i| {
                let fv = self.extract_at(bars, i);
                if fv.is_none() {
                    debug!(ticker = series.ticker(), index = i, "dropped non-finite feature vector");
                }
                fv
            })
            .collect()
    }

    /// Features for bar `index`, reading only `bars[..=index]`.
    ///
    /// Returns `None` during warm-up or if any value comes out non-finite.
    pub fn extract_at(&self, bars: &[RawBar], index: usize) -> Option<FeatureVector> {
        let w = self.config.window_length;
        if index < w || index >= bars.len() {
            return None;
        }

        let bar = &bars[index];
        let prior = &bars[index - w..index];
        // W bars ending at index; index - w >= 0 so every bar here has a predecessor
        let recent = index + 1 - w..=index;

        let (volume_mean, volume_std) = mean_std(prior.iter().map(|b| b.volume));
        let (price_mean, price_std) = mean_std(prior.iter().map(|b| b.close));
        let clip = self.config.max_abs_zscore;
        let volume_z = zscore(bar.volume, volume_mean, volume_std).clamp(-clip, clip);
        let price_z = zscore(bar.close, price_mean, price_std).clamp(-clip, clip);

        let returns: Vec<f64> = recent
            .clone()
            .map(|j| (bars[j].close / bars[j - 1].close).ln())
            .collect();
        let changes: Vec<f64> = recent
            .clone()
            .map(|j| bars[j].close - bars[j - 1].close)
            .collect();

        let long_vol = rms(&returns);
        let short_n = self.config.volatility_short_window.min(returns.len());
        let short_vol = rms(&returns[returns.len() - short_n..]);
        let volatility_ratio = if long_vol <= f64::EPSILON { 0.0 } else { short_vol / long_vol };

        let volumes: Vec<f64> = recent.clone().map(|j| bars[j].volume).collect();
        let abs_changes: Vec<f64> = changes.iter().map(|c| c.abs()).collect();
        let correlation = pearson(&volumes, &abs_changes);

        let rsi = wilder_rsi(&changes, self.config.rsi_period);

        let total_volume: f64 = volumes.iter().sum();
        let vwap_deviation = if total_volume <= 0.0 {
            0.0
        } else {
            let vwap = recent
                .map(|j| bars[j].typical_price() * bars[j].volume)
                .sum::<f64>()
                / total_volume;
            (bar.close - vwap) / vwap
        };

        let mut fv = FeatureVector::new(
            index,
            bar.timestamp,
            [volume_z, volatility_ratio, correlation, rsi, vwap_deviation, price_z],
        );
        fv.quiescent = is_flat(volume_mean, volume_std) && is_flat(price_mean, price_std) && long_vol <= f64::EPSILON;

        fv.is_finite().then_some(fv)
    }
}

/// Population mean and standard deviation
pub(crate) fn mean_std(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    (mean, var.max(0.0).sqrt())
}

fn is_flat(mean: f64, std: f64) -> bool {
    std <= f64::EPSILON * mean.abs().max(1.0)
}

/// Z-score that is exactly 0 when the dispersion is zero
fn zscore(value: f64, mean: f64, std: f64) -> f64 {
    if is_flat(mean, std) {
        0.0
    } else {
        (value - mean) / std
    }
}

fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Pearson correlation; 0 when either side has no variance
pub(crate) fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let ma = a[..n].iter().sum::<f64>() / n as f64;
    let mb = b[..n].iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a[..n].iter().zip(&b[..n]) {
        cov += (x - ma) * (y - mb);
        va += (x - ma).powi(2);
        vb += (y - mb).powi(2);
    }

    let scale_a = f64::EPSILON * ma.abs().max(1.0);
    let scale_b = f64::EPSILON * mb.abs().max(1.0);
    if va.sqrt() <= scale_a || vb.sqrt() <= scale_b {
        return 0.0;
    }
    (cov / (va.sqrt() * vb.sqrt())).clamp(-1.0, 1.0)
}

/// Wilder-smoothed RSI over a run of price changes.
///
/// The first `period` changes seed the averages; the rest are smoothed.
fn wilder_rsi(changes: &[f64], period: usize) -> f64 {
    let period = period.min(changes.len());
    if period == 0 {
        return 50.0;
    }

    let (seed, rest) = changes.split_at(period);
    let mut avg_gain = seed.iter().map(|c| c.max(0.0)).sum::<f64>() / period as f64;
    let mut avg_loss = seed.iter().map(|c| (-c).max(0.0)).sum::<f64>() / period as f64;

    let p = period as f64;
    for &c in rest {
        avg_gain = (avg_gain * (p - 1.0) + c.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-c).max(0.0)) / p;
    }

    if avg_gain <= 0.0 && avg_loss <= 0.0 {
        return 50.0;
    }
    if avg_loss <= 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
}
