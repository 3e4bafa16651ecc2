//! Verdict explanations
//!
//! Flattens a verdict into what a reviewer needs to audit it: each detector's
//! weight and score, the feature values, and the statistical terms.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ml::features::FEATURE_NAMES;
use crate::ml::models::ensemble::{EnsembleVerdict, PatternLabel};
use crate::ml::models::StatisticalBreakdown;
use crate::ml::{DetectorId, Unavailability};

/// One detector's share of the fused confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorContribution {
    pub detector: DetectorId,
    pub weight: f64,
    pub raw_score: f64,
    pub normalized_score: f64,
    pub contribution: f64,
}

/// Audit view of one verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub label: PatternLabel,
    pub rationale: Option<String>,
    /// Largest contribution first
    pub contributions: Vec<DetectorContribution>,
    /// Detectors that did not run, with the reason
    pub missing: Vec<(DetectorId, Unavailability)>,
    /// Feature values in canonical order
    pub features: Vec<(String, f64)>,
    pub statistical: Option<StatisticalBreakdown>,
    pub dominant_detector: Option<DetectorId>,
    /// Largest statistical term, when the breakdown is present
    pub dominant_term: Option<String>,
}

impl Explanation {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .contributions
            .iter()
            .map(|c| format!("{} {:.3}", c.detector, c.contribution))
            .collect();
        let mut line = format!(
            "{} {} confidence {:.3} ({}): {}",
            self.ticker,
            self.timestamp.to_rfc3339(),
            self.confidence,
            self.label,
            parts.join(", ")
        );
        if !self.missing.is_empty() {
            let missing: Vec<&str> = self.missing.iter().map(|(id, _)| id.as_str()).collect();
            line.push_str(&format!("; missing {}", missing.join(", ")));
        }
        line
    }
}

impl From<&EnsembleVerdict> for Explanation {
    fn from(verdict: &EnsembleVerdict) -> Self {
        let mut contributions: Vec<DetectorContribution> = verdict
            .contributions
            .iter()
            .map(|(&id, &contribution)| DetectorContribution {
                detector: id,
                weight: verdict.effective_weights.get(&id).copied().unwrap_or(0.0),
                raw_score: verdict.raw_scores.get(&id).copied().unwrap_or(0.0),
                normalized_score: verdict.normalized_scores.get(&id).copied().unwrap_or(0.0),
                contribution,
            })
            .collect();
        // Stable sort keeps detector order among ties
        contributions.sort_by(|a, b| b.contribution.total_cmp(&a.contribution));

        let missing = verdict
            .missing
            .iter()
            .map(|id| {
                let reason = verdict
                    .missing_reasons
                    .get(id)
                    .cloned()
                    .unwrap_or(Unavailability::NotLoaded);
                (*id, reason)
            })
            .collect();

        let features = FEATURE_NAMES
            .iter()
            .zip(verdict.features.as_slice())
            .map(|(name, value)| (name.to_string(), *value))
            .collect();

        Self {
            ticker: verdict.ticker.clone(),
            timestamp: verdict.timestamp,
            confidence: verdict.confidence,
            label: verdict.label,
            rationale: verdict.rationale.clone(),
            contributions,
            missing,
            features,
            statistical: verdict.statistical,
            dominant_detector: verdict.dominant_detector(),
            dominant_term: verdict.statistical.map(|b| b.dominant().to_string()),
        }
    }
}

impl fmt::Display for Explanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary())?;
        if let Some(rationale) = &self.rationale {
            writeln!(f, "  rationale: {rationale}")?;
        }
        for c in &self.contributions {
            writeln!(
                f,
                "  {:<15} weight {:.3}  score {:.3}  raw {:.4}  contribution {:.3}",
                c.detector.as_str(),
                c.weight,
                c.normalized_score,
                c.raw_score,
                c.contribution
            )?;
        }
        for (name, value) in &self.features {
            writeln!(f, "  {name:<25} {value:>10.4}")?;
        }
        if let Some(term) = &self.dominant_term {
            writeln!(f, "  dominant statistical term: {term}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::features::FeatureVector;
    use crate::ml::models::ensemble::{EnsembleConfig, EnsembleFuser, PatternConfig};
    use crate::ml::{DetectorOutcome, DetectorScore, NormalizedScore};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn verdict() -> EnsembleVerdict {
        let fv = FeatureVector::new(
            45,
            Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap(),
            [6.0, 1.1, 0.1, 58.0, 0.01, 1.0],
        );
        let mut outcomes = BTreeMap::new();
        for (id, raw, norm) in [
            (DetectorId::Statistical, 2.0, 1.0),
            (DetectorId::Outlier, 0.7, 0.9),
            (DetectorId::Reconstruction, 3.2, 0.6),
        ] {
            outcomes.insert(
                id,
                DetectorOutcome::Scored {
                    raw: DetectorScore::new(id, raw),
                    normalized: NormalizedScore::new(id, norm),
                },
            );
        }
        outcomes.insert(
            DetectorId::Sequence,
            DetectorOutcome::Unavailable(Unavailability::WarmUp),
        );
        let breakdown = StatisticalBreakdown {
            volume: 2.0,
            volatility: 0.0,
            decoupling: 0.9,
            rsi: 0.0,
        };
        EnsembleFuser::new(EnsembleConfig::default(), &PatternConfig::default())
            .unwrap()
            .fuse("ACME", &fv, &outcomes, &BTreeMap::new(), Some(breakdown))
    }

    #[test]
    fn test_explanation_orders_contributions() {
        let v = verdict();
        let e = Explanation::from(&v);

        assert_eq!(e.contributions.len(), 3);
        assert_eq!(e.contributions[0].detector, DetectorId::Statistical);
        assert!(e
            .contributions
            .windows(2)
            .all(|w| w[0].contribution >= w[1].contribution));
        let total: f64 = e.contributions.iter().map(|c| c.contribution).sum();
        assert!((total - e.confidence).abs() < 1e-9);
        assert_eq!(e.dominant_detector, Some(DetectorId::Statistical));
        assert_eq!(e.dominant_term.as_deref(), Some("volume"));
    }

    #[test]
    fn test_explanation_carries_features_and_missing() {
        let e = Explanation::from(&verdict());
        assert_eq!(e.features.len(), 6);
        assert_eq!(e.features[0], ("volume_zscore".to_string(), 6.0));
        assert_eq!(e.missing, vec![(DetectorId::Sequence, Unavailability::WarmUp)]);
        assert_eq!(e.label, PatternLabel::WashTrading);
    }

    #[test]
    fn test_summary_and_display() {
        let e = Explanation::from(&verdict());
        let summary = e.summary();
        assert!(summary.starts_with("ACME 2024-03-04T00:00:00+00:00"));
        assert!(summary.contains("wash_trading"));
        assert!(summary.ends_with("missing sequence"));

        let text = e.to_string();
        assert!(text.contains("rationale:"));
        assert!(text.contains("dominant statistical term: volume"));
        assert!(e.to_json().unwrap().contains("\"dominant_detector\": \"statistical\""));
    }
}
