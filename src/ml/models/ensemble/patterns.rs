//! Manipulation pattern rules
//!
//! Once the fused confidence clears the decision threshold, rules are tried
//! in priority order against the scored feature vector. The first match names
//! the pattern; no match leaves the label at `none`.

use std::fmt;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::config::{check_positive, check_range};
use crate::error::ConfigError;
use crate::ml::features::FeatureVector;

/// Manipulation pattern named on a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternLabel {
    PumpAndDump,
    WashTrading,
    MarkingTheClose,
    None,
}

impl PatternLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternLabel::PumpAndDump => "pump_and_dump",
            PatternLabel::WashTrading => "wash_trading",
            PatternLabel::MarkingTheClose => "marking_the_close",
            PatternLabel::None => "none",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, PatternLabel::None)
    }
}

impl fmt::Display for PatternLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule fired, with a human-readable reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub label: PatternLabel,
    pub rationale: String,
}

/// One pluggable pattern rule
pub trait PatternRule: fmt::Debug + Send + Sync {
    fn label(&self) -> PatternLabel;

    /// Rationale if the rule matches this vector
    fn evaluate(&self, features: &FeatureVector) -> Option<String>;
}

/// Price and volume both far above their recent range, momentum overbought
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpRule {
    pub min_price_z: f64,
    pub min_volume_z: f64,
    pub min_rsi: f64,
}

impl Default for PumpRule {
    fn default() -> Self {
        Self {
            min_price_z: 2.0,
            min_volume_z: 2.0,
            min_rsi: 65.0,
        }
    }
}

impl PatternRule for PumpRule {
    fn label(&self) -> PatternLabel {
        PatternLabel::PumpAndDump
    }

    fn evaluate(&self, fv: &FeatureVector) -> Option<String> {
        (fv.price_zscore() >= self.min_price_z
            && fv.volume_zscore() >= self.min_volume_z
            && fv.rsi() >= self.min_rsi)
            .then(|| {
                format!(
                    "price z {:.2} and volume z {:.2} with RSI {:.1}",
                    fv.price_zscore(),
                    fv.volume_zscore(),
                    fv.rsi()
                )
            })
    }
}

/// Heavy volume that does not move the price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WashRule {
    pub min_volume_z: f64,
    pub max_correlation: f64,
}

impl Default for WashRule {
    fn default() -> Self {
        Self {
            min_volume_z: 1.5,
            max_correlation: 0.3,
        }
    }
}

impl PatternRule for WashRule {
    fn label(&self) -> PatternLabel {
        PatternLabel::WashTrading
    }

    fn evaluate(&self, fv: &FeatureVector) -> Option<String> {
        (fv.volume_zscore() >= self.min_volume_z
            && fv.volume_price_correlation() < self.max_correlation)
            .then(|| {
                format!(
                    "volume z {:.2} with volume/price-change correlation {:.2}",
                    fv.volume_zscore(),
                    fv.volume_price_correlation()
                )
            })
    }
}

/// Close pushed away from VWAP on elevated volume just before the session close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkingRule {
    /// Session close in UTC; `None` disables the rule
    pub session_close: Option<NaiveTime>,
    /// Minutes before the close that count as the closing window
    pub window_minutes: u32,
    pub min_abs_vwap_deviation: f64,
    pub min_volume_z: f64,
}

impl Default for MarkingRule {
    fn default() -> Self {
        Self {
            session_close: NaiveTime::from_hms_opt(16, 0, 0),
            window_minutes: 30,
            min_abs_vwap_deviation: 0.02,
            min_volume_z: 1.0,
        }
    }
}

impl MarkingRule {
    /// Whether a bar stamped at `time` falls in [close - window, close]
    pub fn in_closing_window(&self, time: NaiveTime) -> bool {
        let Some(close) = self.session_close else {
            return false;
        };
        const DAY: i64 = 86_400;
        let close = i64::from(close.num_seconds_from_midnight());
        let t = i64::from(time.num_seconds_from_midnight());
        let start = close - i64::from(self.window_minutes) * 60;
        if start >= 0 {
            t >= start && t <= close
        } else {
            t >= start + DAY || t <= close
        }
    }
}

impl PatternRule for MarkingRule {
    fn label(&self) -> PatternLabel {
        PatternLabel::MarkingTheClose
    }

    fn evaluate(&self, fv: &FeatureVector) -> Option<String> {
        (self.in_closing_window(fv.timestamp.time())
            && fv.vwap_deviation().abs() >= self.min_abs_vwap_deviation
            && fv.volume_zscore() >= self.min_volume_z)
            .then(|| {
                format!(
                    "close {:+.2}% from VWAP at {} on volume z {:.2}",
                    fv.vwap_deviation() * 100.0,
                    fv.timestamp.format("%H:%M"),
                    fv.volume_zscore()
                )
            })
    }
}

/// Thresholds for the built-in rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub pump: PumpRule,
    pub wash: WashRule,
    pub marking: MarkingRule,
}

impl PatternConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("patterns.pump.min_rsi", self.pump.min_rsi, 0.0, 100.0)?;
        check_range("patterns.pump.min_price_z", self.pump.min_price_z, f64::MIN, f64::MAX)?;
        check_range("patterns.pump.min_volume_z", self.pump.min_volume_z, f64::MIN, f64::MAX)?;
        check_range("patterns.wash.max_correlation", self.wash.max_correlation, -1.0, 1.0)?;
        check_range("patterns.wash.min_volume_z", self.wash.min_volume_z, f64::MIN, f64::MAX)?;
        check_positive(
            "patterns.marking.min_abs_vwap_deviation",
            self.marking.min_abs_vwap_deviation,
        )?;
        check_range("patterns.marking.window_minutes", self.marking.window_minutes as f64, 0.0, 1440.0)
    }
}

/// Ordered rule set; the first matching rule wins
#[derive(Debug)]
pub struct PatternClassifier {
    rules: Vec<Box<dyn PatternRule>>,
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::from_config(&PatternConfig::default())
    }
}

impl PatternClassifier {
    /// Built-in rules in priority order: pump, wash, marking
    pub fn from_config(config: &PatternConfig) -> Self {
        Self {
            rules: vec![
                Box::new(config.pump.clone()),
                Box::new(config.wash.clone()),
                Box::new(config.marking.clone()),
            ],
        }
    }

    /// No rules at all
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule at the lowest priority
    pub fn with_rule(mut self, rule: Box<dyn PatternRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn classify(&self, features: &FeatureVector) -> Option<PatternMatch> {
        self.rules.iter().find_map(|rule| {
            rule.evaluate(features).map(|rationale| PatternMatch {
                label: rule.label(),
                rationale,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn fv_at(hour: u32, minute: u32, values: [f64; 6]) -> FeatureVector {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, hour, minute, 0).unwrap();
        FeatureVector::new(50, ts, values)
    }

    #[test]
    fn test_label_names() {
        assert_eq!(PatternLabel::WashTrading.to_string(), "wash_trading");
        assert_eq!(
            serde_json::to_string(&PatternLabel::MarkingTheClose).unwrap(),
            "\"marking_the_close\""
        );
        assert!(PatternLabel::None.is_none());
    }

    #[test]
    fn test_pump_takes_priority_over_wash() {
        let classifier = PatternClassifier::default();
        // volume z 3, corr 0.1, rsi 80, price z 2.5: both pump and wash match
        let m = classifier.classify(&fv_at(0, 0, [3.0, 1.0, 0.1, 80.0, 0.01, 2.5])).unwrap();
        assert_eq!(m.label, PatternLabel::PumpAndDump);
    }

    #[test]
    fn test_wash_trading() {
        let classifier = PatternClassifier::default();
        let m = classifier.classify(&fv_at(0, 0, [4.0, 1.0, 0.05, 52.0, 0.0, 0.3])).unwrap();
        assert_eq!(m.label, PatternLabel::WashTrading);
        assert!(m.rationale.contains("correlation 0.05"));
    }

    #[test]
    fn test_marking_the_close_window() {
        let rule = MarkingRule::default();
        assert!(rule.in_closing_window(NaiveTime::from_hms_opt(15, 45, 0).unwrap()));
        assert!(rule.in_closing_window(NaiveTime::from_hms_opt(16, 0, 0).unwrap()));
        assert!(!rule.in_closing_window(NaiveTime::from_hms_opt(16, 1, 0).unwrap()));
        assert!(!rule.in_closing_window(NaiveTime::from_hms_opt(0, 0, 0).unwrap()));

        let classifier = PatternClassifier::default();
        // correlated volume so wash does not claim it first
        let late = fv_at(15, 55, [1.2, 1.0, 0.6, 55.0, 0.03, 0.5]);
        assert_eq!(classifier.classify(&late).unwrap().label, PatternLabel::MarkingTheClose);

        let daily = fv_at(0, 0, [1.2, 1.0, 0.6, 55.0, 0.03, 0.5]);
        assert!(classifier.classify(&daily).is_none());
    }

    #[test]
    fn test_closing_window_wraps_midnight() {
        let rule = MarkingRule {
            session_close: NaiveTime::from_hms_opt(0, 10, 0),
            ..Default::default()
        };
        assert!(rule.in_closing_window(NaiveTime::from_hms_opt(23, 50, 0).unwrap()));
        assert!(rule.in_closing_window(NaiveTime::from_hms_opt(0, 5, 0).unwrap()));
        assert!(!rule.in_closing_window(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
    }

    #[test]
    fn test_disabled_marking_rule() {
        let rule = MarkingRule {
            session_close: None,
            ..Default::default()
        };
        assert!(!rule.in_closing_window(NaiveTime::from_hms_opt(15, 50, 0).unwrap()));
    }

    #[test]
    fn test_no_rule_matches() {
        let classifier = PatternClassifier::default();
        assert!(classifier.classify(&fv_at(0, 0, [0.5, 3.0, 0.5, 50.0, 0.0, 0.0])).is_none());
    }

    #[derive(Debug)]
    struct VolatilityRule;

    impl PatternRule for VolatilityRule {
        fn label(&self) -> PatternLabel {
            PatternLabel::PumpAndDump
        }

        fn evaluate(&self, fv: &FeatureVector) -> Option<String> {
            (fv.volatility_ratio() > 2.5).then(|| "volatility burst".to_string())
        }
    }

    #[test]
    fn test_custom_rule_appended() {
        let classifier = PatternClassifier::empty().with_rule(Box::new(VolatilityRule));
        assert_eq!(classifier.len(), 1);
        let m = classifier.classify(&fv_at(0, 0, [0.0, 3.0, 0.5, 50.0, 0.0, 0.0])).unwrap();
        assert_eq!(m.rationale, "volatility burst");
    }

    #[test]
    fn test_config_validation() {
        let mut config = PatternConfig::default();
        assert!(config.validate().is_ok());
        config.wash.max_correlation = 1.5;
        assert!(config.validate().is_err());
    }
}
