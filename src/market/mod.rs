//! Market data model
//!
//! Bars are validated once, when a [`BarSeries`] is built. Everything
//! downstream can assume ordered timestamps and sane prices.

pub mod quality;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InputError;

/// One trading interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl RawBar {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// (high + low + close) / 3
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    fn validate(&self, index: usize) -> Result<(), InputError> {
        let fields = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ];
        for (field, value) in fields {
            if !value.is_finite() {
                return Err(InputError::NonFiniteField { index, field });
            }
        }

        for &(field, value) in &fields[..4] {
            if value <= 0.0 {
                return Err(InputError::NonPositivePrice {
                    index,
                    field,
                    value,
                });
            }
        }

        if self.volume < 0.0 {
            return Err(InputError::NegativeVolume {
                index,
                volume: self.volume,
            });
        }
        if self.high < self.low {
            return Err(InputError::InvertedRange {
                index,
                high: self.high,
                low: self.low,
            });
        }
        if self.close < self.low || self.close > self.high {
            return Err(InputError::CloseOutsideRange {
                index,
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }
}

/// Validated, time-ordered bars for a single ticker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarSeries {
    ticker: String,
    bars: Vec<RawBar>,
}

impl BarSeries {
    /// Validate and wrap a bar sequence. Malformed input is rejected, never repaired.
    pub fn new(ticker: impl Into<String>, bars: Vec<RawBar>) -> Result<Self, InputError> {
        let ticker = ticker.into();
        if ticker.trim().is_empty() {
            return Err(InputError::EmptyTicker);
        }

        for (index, bar) in bars.iter().enumerate() {
            bar.validate(index)?;
            if index > 0 {
                let previous = bars[index - 1].timestamp;
                if bar.timestamp <= previous {
                    return Err(InputError::NonMonotonicTimestamp {
                        index,
                        previous,
                        current: bar.timestamp,
                    });
                }
            }
        }

        Ok(Self { ticker, bars })
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn bars(&self) -> &[RawBar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// First and last timestamps, if any bars exist
    pub fn span(&self) -> Option<TimeRange> {
        let first = self.bars.first()?;
        let last = self.bars.last()?;
        Some(TimeRange::new(first.timestamp, last.timestamp))
    }

    pub fn into_bars(self) -> Vec<RawBar> {
        self.bars
    }
}

impl<'de> Deserialize<'de> for BarSeries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Unchecked {
            ticker: String,
            bars: Vec<RawBar>,
        }

        let raw = Unchecked::deserialize(deserializer)?;
        BarSeries::new(raw.ticker, raw.bars).map_err(serde::de::Error::custom)
    }
}

/// Inclusive time range used to select scoring points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Range covering every representable timestamp
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}
