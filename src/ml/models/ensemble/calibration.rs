//! Score Calibration
//!
//! Maps detector-native scores onto a common [0, 1] scale. Detectors with no
//! training use a fixed linear ramp; trained detectors use an empirical
//! percentile mapping fitted on held-out normal data. Both mappings are
//! non-decreasing in the native score.

use serde::{Deserialize, Serialize};

/// Calibration method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationMethod {
    /// Linear ramp between a floor and a ceiling
    Linear,
    /// Exceedance over an empirical quantile of calibration scores
    Percentile,
}

/// Fitted calibrator for one detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCalibrator {
    method: CalibrationMethod,
    /// Linear: native value mapping to 0. Percentile: quantile mapping to 0.
    floor: f64,
    /// Linear only: native value mapping to 1
    ceiling: f64,
    /// Percentile only: sorted calibration scores
    points: Vec<f64>,
}

impl ScoreCalibrator {
    /// Linear ramp: `floor` and below map to 0, `ceiling` and above to 1.
    pub fn linear(floor: f64, ceiling: f64) -> Self {
        Self {
            method: CalibrationMethod::Linear,
            floor,
            ceiling,
            points: Vec::new(),
        }
    }

    /// Fit a percentile mapping.
    ///
    /// Scores up to the `floor_quantile` of the calibration population map to
    /// 0; the remaining tail is spread linearly over (0, 1]. Anything at or
    /// above the calibration maximum saturates at 1. At most `max_points`
    /// evenly spaced order statistics are kept.
    pub fn fit_percentile(scores: &[f64], floor_quantile: f64, max_points: usize) -> Self {
        let mut sorted: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);

        let max_points = max_points.max(2);
        let points = if sorted.len() > max_points {
            let last = sorted.len() - 1;
            (0..max_points)
                .map(|k| sorted[k * last / (max_points - 1)])
                .collect()
        } else {
            sorted
        };

        Self {
            method: CalibrationMethod::Percentile,
            floor: floor_quantile.clamp(0.0, 1.0),
            ceiling: 1.0,
            points,
        }
    }

    pub fn method(&self) -> CalibrationMethod {
        self.method
    }

    /// Number of stored calibration points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Empirical CDF of the calibration scores, interpolated between order statistics
    pub fn cdf(&self, score: f64) -> f64 {
        let v = &self.points;
        match v.len() {
            0 => 0.0,
            1 => {
                if score >= v[0] {
                    1.0
                } else {
                    0.0
                }
            }
            n => {
                if score < v[0] {
                    return 0.0;
                }
                if score >= v[n - 1] {
                    return 1.0;
                }
                let i = v.partition_point(|&p| p <= score);
                let (lo, hi) = (v[i - 1], v[i]);
                let frac = if hi > lo { (score - lo) / (hi - lo) } else { 0.0 };
                ((i - 1) as f64 + frac) / (n - 1) as f64
            }
        }
    }

    /// Map a native score to [0, 1]
    pub fn calibrate(&self, score: f64) -> f64 {
        if score.is_nan() {
            return 0.0;
        }
        let value = match self.method {
            CalibrationMethod::Linear => {
                let span = self.ceiling - self.floor;
                if span <= 0.0 {
                    if score >= self.ceiling {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    (score - self.floor) / span
                }
            }
            CalibrationMethod::Percentile => {
                let tail = 1.0 - self.floor;
                let cdf = self.cdf(score);
                if tail <= 0.0 {
                    if cdf >= 1.0 {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    (cdf - self.floor) / tail
                }
            }
        };
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_calibration() {
        let cal = ScoreCalibrator::linear(0.5, 1.0);
        assert_eq!(cal.calibrate(0.2), 0.0);
        assert!((cal.calibrate(0.75) - 0.5).abs() < 1e-12);
        assert_eq!(cal.calibrate(3.0), 1.0);
        assert_eq!(cal.calibrate(f64::NAN), 0.0);
    }

    #[test]
    fn test_percentile_cdf() {
        let scores: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        let cal = ScoreCalibrator::fit_percentile(&scores, 0.9, 1000);

        assert_eq!(cal.cdf(-1.0), 0.0);
        assert!((cal.cdf(50.0) - 0.5).abs() < 1e-12);
        assert!((cal.cdf(50.5) - 0.505).abs() < 1e-12);
        assert_eq!(cal.cdf(100.0), 1.0);

        assert_eq!(cal.calibrate(80.0), 0.0);
        assert!((cal.calibrate(95.0) - 0.5).abs() < 1e-9);
        assert_eq!(cal.calibrate(1e9), 1.0);
    }

    #[test]
    fn test_percentile_is_monotonic() {
        let scores = [0.3, 0.1, 0.1, 0.7, 0.2, 0.9, 0.4, 0.4, 0.5];
        let cal = ScoreCalibrator::fit_percentile(&scores, 0.5, 64);

        let mut previous = 0.0;
        for k in 0..=120 {
            let x = k as f64 / 100.0;
            let y = cal.calibrate(x);
            assert!(y >= previous, "not monotonic at {x}");
            assert!((0.0..=1.0).contains(&y));
            previous = y;
        }
    }

    #[test]
    fn test_downsampling_keeps_extremes() {
        let scores: Vec<f64> = (0..10_000).map(|i| i as f64).collect();
        let cal = ScoreCalibrator::fit_percentile(&scores, 0.95, 256);
        assert_eq!(cal.len(), 256);
        assert_eq!(cal.cdf(0.0), 0.0);
        assert_eq!(cal.cdf(9_999.0), 1.0);
    }
}
