//! Data quality report
//!
//! Structural problems are already rejected by [`BarSeries::new`]. This report
//! covers the softer checks a desk runs before trusting a feed: missing
//! intervals, implausible moves, and stale data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::BarSeries;

/// Thresholds for the quality checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Minimum share of expected bars that must be present, in percent
    pub min_completeness_pct: f64,
    /// An interval longer than this multiple of the median counts as a gap
    pub gap_factor: f64,
    /// Absolute simple return treated as implausible
    pub extreme_return: f64,
    /// Number of implausible returns tolerated (exclusive)
    pub max_extreme_returns: usize,
    /// Data older than this many days is stale
    pub max_age_days: i64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_completeness_pct: 95.0,
            gap_factor: 3.5,
            extreme_return: 0.5,
            max_extreme_returns: 5,
            max_age_days: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletenessCheck {
    pub present: usize,
    pub missing: usize,
    pub completeness_pct: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyCheck {
    pub extreme_returns: usize,
    pub zero_volume_bars: usize,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinessCheck {
    pub latest: Option<DateTime<Utc>>,
    pub days_old: Option<i64>,
    pub passed: bool,
}

/// Quality report for one series, evaluated against an explicit `as_of` instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub ticker: String,
    pub as_of: DateTime<Utc>,
    pub completeness: CompletenessCheck,
    pub accuracy: AccuracyCheck,
    pub timeliness: TimelinessCheck,
}

impl QualityReport {
    pub fn evaluate(series: &BarSeries, as_of: DateTime<Utc>, thresholds: &QualityThresholds) -> Self {
        let completeness = check_completeness(series, thresholds);
        let accuracy = check_accuracy(series, thresholds);
        let timeliness = check_timeliness(series, as_of, thresholds);

        let report = Self {
            ticker: series.ticker().to_string(),
            as_of,
            completeness,
            accuracy,
            timeliness,
        };

        if report.passed() {
            info!(ticker = %report.ticker, "data quality PASS");
        } else {
            warn!(
                ticker = %report.ticker,
                completeness = report.completeness.completeness_pct,
                extreme_returns = report.accuracy.extreme_returns,
                days_old = ?report.timeliness.days_old,
                "data quality FAIL"
            );
        }
        report
    }

    pub fn passed(&self) -> bool {
        self.completeness.passed && self.accuracy.passed && self.timeliness.passed
    }

    /// "PASS" or "FAIL"
    pub fn status(&self) -> &'static str {
        if self.passed() {
            "PASS"
        } else {
            "FAIL"
        }
    }
}

fn check_completeness(series: &BarSeries, thresholds: &QualityThresholds) -> CompletenessCheck {
    let bars = series.bars();
    let mut intervals: Vec<i64> = bars
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).num_seconds())
        .collect();

    let mut missing = 0usize;
    if !intervals.is_empty() {
        let mut sorted = intervals.clone();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2].max(1) as f64;

        for interval in intervals.drain(..) {
            let interval = interval as f64;
            if interval > thresholds.gap_factor * median {
                missing += ((interval / median).round() as usize).saturating_sub(1);
            }
        }
    }

    let present = bars.len();
    let expected = present + missing;
    let completeness_pct = if expected == 0 {
        0.0
    } else {
        100.0 * present as f64 / expected as f64
    };

    CompletenessCheck {
        present,
        missing,
        completeness_pct,
        passed: expected > 0 && completeness_pct >= thresholds.min_completeness_pct,
    }
}

fn check_accuracy(series: &BarSeries, thresholds: &QualityThresholds) -> AccuracyCheck {
    let bars = series.bars();
    let extreme_returns = bars
        .windows(2)
        .filter(|w| (w[1].close / w[0].close - 1.0).abs() > thresholds.extreme_return)
        .count();
    let zero_volume_bars = bars.iter().filter(|b| b.volume == 0.0).count();

    AccuracyCheck {
        extreme_returns,
        zero_volume_bars,
        passed: extreme_returns < thresholds.max_extreme_returns,
    }
}

fn check_timeliness(
    series: &BarSeries,
    as_of: DateTime<Utc>,
    thresholds: &QualityThresholds,
) -> TimelinessCheck {
    let latest = series.bars().last().map(|b| b.timestamp);
    let days_old = latest.map(|ts| (as_of - ts).num_days());

    TimelinessCheck {
        latest,
        days_old,
        passed: days_old.is_some_and(|d| d < thresholds.max_age_days),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::RawBar;
    use chrono::{Duration, TimeZone};

    fn series_from_days(days: &[i64], closes: &[f64]) -> BarSeries {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let bars = days
            .iter()
            .zip(closes)
            .map(|(&d, &c)| RawBar::new(base + Duration::days(d), c, c, c, c, 1_000.0))
            .collect();
        BarSeries::new("QQQ", bars).unwrap()
    }

    #[test]
    fn test_clean_series_passes() {
        let days: Vec<i64> = (0..40).collect();
        let closes = vec![50.0; 40];
        let series = series_from_days(&days, &closes);
        let as_of = series.bars().last().unwrap().timestamp + Duration::hours(12);

        let report = QualityReport::evaluate(&series, as_of, &QualityThresholds::default());
        assert!(report.passed());
        assert_eq!(report.status(), "PASS");
        assert_eq!(report.completeness.missing, 0);
        assert_eq!(report.timeliness.days_old, Some(0));
    }

    #[test]
    fn test_weekend_gaps_are_not_missing() {
        // Mon..Fri, skip Sat/Sun, Mon..Fri
        let days = [0, 1, 2, 3, 4, 7, 8, 9, 10, 11];
        let series = series_from_days(&days, &[10.0; 10]);
        let as_of = series.bars().last().unwrap().timestamp;

        let report = QualityReport::evaluate(&series, as_of, &QualityThresholds::default());
        assert_eq!(report.completeness.missing, 0);
    }

    #[test]
    fn test_long_gap_counts_missing_bars() {
        let mut days: Vec<i64> = (0..10).collect();
        days.extend(20..30);
        let series = series_from_days(&days, &[10.0; 20]);
        let as_of = series.bars().last().unwrap().timestamp;

        let report = QualityReport::evaluate(&series, as_of, &QualityThresholds::default());
        assert_eq!(report.completeness.missing, 10);
        assert!(!report.completeness.passed);
        assert_eq!(report.status(), "FAIL");
    }

    #[test]
    fn test_extreme_returns_and_stale_data() {
        let days: Vec<i64> = (0..12).collect();
        let closes: Vec<f64> = (0..12).map(|i| if i % 2 == 0 { 10.0 } else { 30.0 }).collect();
        let series = series_from_days(&days, &closes);
        let as_of = series.bars().last().unwrap().timestamp + Duration::days(5);

        let report = QualityReport::evaluate(&series, as_of, &QualityThresholds::default());
        assert_eq!(report.accuracy.extreme_returns, 11);
        assert!(!report.accuracy.passed);
        assert_eq!(report.timeliness.days_old, Some(5));
        assert!(!report.timeliness.passed);
    }
}
