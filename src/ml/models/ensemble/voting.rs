//! Weighted voting with proportional redistribution
//!
//! Each available detector votes with its normalized score. Weights of
//! unavailable detectors are redistributed over the available ones in
//! proportion to their configured weights, so effective weights always sum
//! to 1 and every unit of the fused confidence is attributed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ml::DetectorId;

/// A single detector's vote
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelVote {
    pub detector: DetectorId,
    /// Normalized score in [0, 1]; `None` when the detector is unavailable
    pub score: Option<f64>,
    /// Configured weight
    pub weight: f64,
}

impl ModelVote {
    pub fn new(detector: DetectorId, score: f64, weight: f64) -> Self {
        Self {
            detector,
            score: Some(score.clamp(0.0, 1.0)),
            weight,
        }
    }

    /// A vote from a detector that produced no score
    pub fn unavailable(detector: DetectorId, weight: f64) -> Self {
        Self {
            detector,
            score: None,
            weight,
        }
    }
}

/// Outcome of aggregating one set of votes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FusedVote {
    /// Sum of the contributions
    pub confidence: f64,
    /// Effective weight times normalized score, per available detector
    pub contributions: BTreeMap<DetectorId, f64>,
    /// Weights after redistribution, per available detector
    pub effective_weights: BTreeMap<DetectorId, f64>,
    /// Detectors that did not vote
    pub missing: Vec<DetectorId>,
}

/// Vote aggregator
#[derive(Debug, Clone, Default)]
pub struct VoteAggregator {
    votes: BTreeMap<DetectorId, ModelVote>,
}

impl VoteAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vote; a later vote from the same detector replaces the earlier one
    pub fn add_vote(&mut self, vote: ModelVote) {
        self.votes.insert(vote.detector, vote);
    }

    pub fn clear(&mut self) {
        self.votes.clear();
    }

    pub fn votes(&self) -> impl Iterator<Item = &ModelVote> {
        self.votes.values()
    }

    /// Effective weights over the available detectors.
    ///
    /// If the available detectors carry no configured weight at all they share
    /// equally, so a verdict is always fully attributed.
    pub fn effective_weights(&self) -> BTreeMap<DetectorId, f64> {
        let available: Vec<&ModelVote> = self.votes.values().filter(|v| v.score.is_some()).collect();
        let total: f64 = available.iter().map(|v| v.weight).sum();

        available
            .iter()
            .map(|v| {
                let w = if total > 0.0 {
                    v.weight / total
                } else {
                    1.0 / available.len() as f64
                };
                (v.detector, w)
            })
            .collect()
    }

    /// Aggregate the votes
    pub fn aggregate(&self) -> FusedVote {
        let effective_weights = self.effective_weights();

        let contributions: BTreeMap<DetectorId, f64> = effective_weights
            .iter()
            .filter_map(|(id, w)| {
                let score = self.votes.get(id)?.score?;
                Some((*id, w * score))
            })
            .collect();

        let missing = self
            .votes
            .values()
            .filter(|v| v.score.is_none())
            .map(|v| v.detector)
            .collect();

        FusedVote {
            // Summed in key order so the total matches the map exactly
            confidence: contributions.values().sum::<f64>().clamp(0.0, 1.0),
            contributions,
            effective_weights,
            missing,
        }
    }

    /// One line per vote plus the aggregate
    pub fn breakdown(&self) -> String {
        let fused = self.aggregate();
        let mut lines: Vec<String> = self
            .votes
            .values()
            .map(|v| match v.score {
                Some(s) => format!(
                    "{}: score={:.3} weight={:.2} effective={:.3}",
                    v.detector,
                    s,
                    v.weight,
                    fused.effective_weights.get(&v.detector).copied().unwrap_or(0.0)
                ),
                None => format!("{}: unavailable weight={:.2}", v.detector, v.weight),
            })
            .collect();
        lines.push(format!("confidence={:.3}", fused.confidence));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_panel(scores: [f64; 4]) -> VoteAggregator {
        let weights = [0.30, 0.25, 0.25, 0.20];
        let mut agg = VoteAggregator::new();
        for ((id, s), w) in DetectorId::ALL.into_iter().zip(scores).zip(weights) {
            agg.add_vote(ModelVote::new(id, s, w));
        }
        agg
    }

    #[test]
    fn test_weighted_voting() {
        let fused = full_panel([1.0, 0.0, 0.0, 0.0]).aggregate();
        assert!((fused.confidence - 0.30).abs() < 1e-12);
        assert!(fused.missing.is_empty());
    }

    #[test]
    fn test_contributions_sum_to_confidence() {
        let fused = full_panel([0.9, 0.4, 0.7, 0.2]).aggregate();
        let sum: f64 = fused.contributions.values().sum();
        assert!((sum - fused.confidence).abs() < 1e-12);
        // 0.27 + 0.10 + 0.175 + 0.04
        assert!((fused.confidence - 0.585).abs() < 1e-12);
    }

    #[test]
    fn test_missing_weight_redistributed() {
        let mut agg = full_panel([0.5, 0.5, 0.5, 0.5]);
        agg.add_vote(ModelVote::unavailable(DetectorId::Sequence, 0.20));
        let fused = agg.aggregate();

        assert_eq!(fused.missing, vec![DetectorId::Sequence]);
        let total: f64 = fused.effective_weights.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!((fused.effective_weights[&DetectorId::Statistical] - 0.375).abs() < 1e-12);
        assert!((fused.confidence - 0.5).abs() < 1e-12);
        assert!(!fused.contributions.contains_key(&DetectorId::Sequence));
    }

    #[test]
    fn test_only_statistical_left() {
        let mut agg = VoteAggregator::new();
        agg.add_vote(ModelVote::new(DetectorId::Statistical, 0.8, 0.30));
        for id in [DetectorId::Outlier, DetectorId::Reconstruction, DetectorId::Sequence] {
            agg.add_vote(ModelVote::unavailable(id, 0.25));
        }
        let fused = agg.aggregate();
        assert_eq!(fused.effective_weights[&DetectorId::Statistical], 1.0);
        assert!((fused.confidence - 0.8).abs() < 1e-12);
        assert_eq!(fused.missing.len(), 3);
    }

    #[test]
    fn test_zero_weight_survivors_share_equally() {
        let mut agg = VoteAggregator::new();
        agg.add_vote(ModelVote::new(DetectorId::Statistical, 0.6, 0.0));
        agg.add_vote(ModelVote::new(DetectorId::Outlier, 0.2, 0.0));
        agg.add_vote(ModelVote::unavailable(DetectorId::Reconstruction, 1.0));
        let fused = agg.aggregate();
        assert_eq!(fused.effective_weights[&DetectorId::Outlier], 0.5);
        assert!((fused.confidence - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_breakdown_lists_every_vote() {
        let mut agg = full_panel([0.1, 0.2, 0.3, 0.4]);
        agg.add_vote(ModelVote::unavailable(DetectorId::Outlier, 0.25));
        let text = agg.breakdown();
        assert!(text.contains("outlier: unavailable"));
        assert!(text.contains("confidence="));
        assert_eq!(text.lines().count(), 5);
    }
}
