//! Detection accuracy metrics
//!
//! Compares verdicts against labelled ground truth, keyed by
//! (ticker, timestamp).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::market::BarSeries;
use crate::ml::models::ensemble::EnsembleVerdict;

/// Points known to be manipulated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroundTruth {
    positives: BTreeSet<(String, DateTime<Utc>)>,
}

impl GroundTruth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, ticker: &str, timestamp: DateTime<Utc>) {
        self.positives.insert((ticker.to_string(), timestamp));
    }

    /// Mark bars of `series` by index, as returned by the injectors
    pub fn mark_indices(&mut self, series: &BarSeries, indices: &[usize]) {
        for &i in indices {
            if let Some(bar) = series.bars().get(i) {
                self.mark(series.ticker(), bar.timestamp);
            }
        }
    }

    pub fn is_positive(&self, ticker: &str, timestamp: DateTime<Utc>) -> bool {
        self.positives.contains(&(ticker.to_string(), timestamp))
    }

    pub fn len(&self) -> usize {
        self.positives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positives.is_empty()
    }
}

/// Confusion counts plus the rates derived from them
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetrics {
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub true_negatives: u64,
    /// TP / (TP + FP)
    pub precision: f64,
    /// TP / (TP + FN)
    pub recall: f64,
    pub f1_score: f64,
    /// FP / (FP + TN)
    pub false_positive_rate: f64,
}

impl DetectionMetrics {
    /// A verdict counts as a detection when it carries a pattern label
    pub fn evaluate<'a, I>(verdicts: I, truth: &GroundTruth) -> Self
    where
        I: IntoIterator<Item = &'a EnsembleVerdict>,
    {
        Self::evaluate_by(verdicts, truth, EnsembleVerdict::is_flagged)
    }

    /// As [`DetectionMetrics::evaluate`] with a caller-chosen detection rule
    pub fn evaluate_by<'a, I, F>(verdicts: I, truth: &GroundTruth, detected: F) -> Self
    where
        I: IntoIterator<Item = &'a EnsembleVerdict>,
        F: Fn(&EnsembleVerdict) -> bool,
    {
        let mut m = Self::default();
        for v in verdicts {
            match (detected(v), truth.is_positive(&v.ticker, v.timestamp)) {
                (true, true) => m.true_positives += 1,
                (true, false) => m.false_positives += 1,
                (false, true) => m.false_negatives += 1,
                (false, false) => m.true_negatives += 1,
            }
        }
        m.calculate_derived();
        m
    }

    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.false_negatives + self.true_negatives
    }

    fn calculate_derived(&mut self) {
        let tp_fp = self.true_positives + self.false_positives;
        if tp_fp > 0 {
            self.precision = self.true_positives as f64 / tp_fp as f64;
        }

        let tp_fn = self.true_positives + self.false_negatives;
        if tp_fn > 0 {
            self.recall = self.true_positives as f64 / tp_fn as f64;
        }

        let fp_tn = self.false_positives + self.true_negatives;
        if fp_tn > 0 {
            self.false_positive_rate = self.false_positives as f64 / fp_tn as f64;
        }

        if self.precision + self.recall > 0.0 {
            self.f1_score = 2.0 * (self.precision * self.recall) / (self.precision + self.recall);
        }
    }
}
