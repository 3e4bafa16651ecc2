//! Synthetic market data for testing
//!
//! Seeded random-walk OHLCV bars with volume loosely coupled to the size of
//! each move, plus injectors that overwrite a stretch of bars with a known
//! manipulation footprint.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::InputError;
use crate::market::{BarSeries, RawBar};

/// Bars before an injection point used as the volume reference
const VOLUME_LOOKBACK: usize = 30;

/// Random-walk parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub start_price: f64,
    pub base_volume: f64,
    /// Standard deviation of per-bar log returns
    pub volatility: f64,
    /// Standard deviation of the log-normal volume noise
    pub volume_noise: f64,
    /// Extra volume per unit of |return shock|
    pub volume_coupling: f64,
    /// Standard deviation of the open gap versus the previous close
    pub gap_noise: f64,
    /// Scale of the high/low wicks
    pub wick_noise: f64,
    pub start: DateTime<Utc>,
    /// Seconds between bars
    pub interval_secs: i64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            start_price: 100.0,
            base_volume: 1_000_000.0,
            volatility: 0.02,
            volume_noise: 0.15,
            volume_coupling: 0.5,
            gap_noise: 0.002,
            wick_noise: 0.005,
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            interval_secs: 86_400,
        }
    }
}

/// Seeded OHLCV generator
#[derive(Debug, Clone)]
pub struct MarketGenerator {
    config: GeneratorConfig,
    rng: StdRng,
}

impl MarketGenerator {
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, GeneratorConfig::default())
    }

    pub fn with_config(seed: u64, config: GeneratorConfig) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    fn normal(&mut self, std: f64) -> f64 {
        match Normal::new(0.0, std) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 0.0,
        }
    }

    /// `n` consecutive bars starting at the configured instant
    pub fn bars(&mut self, n: usize) -> Vec<RawBar> {
        let mut bars = Vec::with_capacity(n);
        let mut prev_close = self.config.start_price;

        for i in 0..n {
            let shock: f64 = StandardNormal.sample(&mut self.rng);
            let gap = self.normal(self.config.gap_noise);
            let open = prev_close * gap.exp();
            let close = prev_close * (self.config.volatility * shock).exp();

            let upper = self.normal(self.config.wick_noise).abs().min(0.5);
            let lower = self.normal(self.config.wick_noise).abs().min(0.5);
            let high = open.max(close) * (1.0 + upper);
            let low = open.min(close) * (1.0 - lower);

            let volume_noise = self.normal(self.config.volume_noise);
            let volume = self.config.base_volume
                * volume_noise.exp()
                * (1.0 + self.config.volume_coupling * shock.abs());

            bars.push(RawBar::new(self.timestamp(i), open, high, low, close, volume));
            prev_close = close;
        }
        bars
    }

    /// Generated bars wrapped in a validated series
    pub fn series(&mut self, ticker: &str, n: usize) -> Result<BarSeries, InputError> {
        BarSeries::new(ticker, self.bars(n))
    }

    fn timestamp(&self, i: usize) -> DateTime<Utc> {
        self.config.start + Duration::seconds(self.config.interval_secs * i as i64)
    }

    /// Constant price and volume: every rolling dispersion is zero
    pub fn flat_bars(n: usize, price: f64, volume: f64) -> Vec<RawBar> {
        let start = GeneratorConfig::default().start;
        (0..n)
            .map(|i| {
                RawBar::new(
                    start + Duration::days(i as i64),
                    price,
                    price,
                    price,
                    price,
                    volume,
                )
            })
            .collect()
    }

    pub fn flat_series(ticker: &str, n: usize, price: f64, volume: f64) -> Result<BarSeries, InputError> {
        BarSeries::new(ticker, Self::flat_bars(n, price, volume))
    }
}

/// Median volume of up to [`VOLUME_LOOKBACK`] bars before `index`
pub fn reference_volume(bars: &[RawBar], index: usize) -> f64 {
    let start = index.saturating_sub(VOLUME_LOOKBACK);
    let mut volumes: Vec<f64> = bars[start..index.min(bars.len())]
        .iter()
        .map(|b| b.volume)
        .collect();
    if volumes.is_empty() {
        return 0.0;
    }
    volumes.sort_by(|a, b| a.total_cmp(b));
    let mid = volumes.len() / 2;
    if volumes.len() % 2 == 0 {
        (volumes[mid - 1] + volumes[mid]) / 2.0
    } else {
        volumes[mid]
    }
}

/// Rewrite one bar so it opens at `prev_close` and closes at `close`.
fn reshape(bar: &mut RawBar, prev_close: f64, close: f64, volume: f64) {
    bar.open = prev_close;
    bar.close = close;
    bar.high = prev_close.max(close) * 1.001;
    bar.low = prev_close.min(close) * 0.999;
    bar.volume = volume;
}

/// Heavy, price-neutral volume: `len` bars at `multiplier` times the
/// reference volume, each closing only 0.1% above the previous close.
///
/// Returns the affected bar indices.
pub fn inject_wash_trading(bars: &mut [RawBar], start: usize, len: usize, multiplier: f64) -> Vec<usize> {
    if start == 0 || start >= bars.len() {
        return Vec::new();
    }
    let volume = reference_volume(bars, start) * multiplier;
    let end = (start + len).min(bars.len());
    for i in start..end {
        let prev_close = bars[i - 1].close;
        reshape(&mut bars[i], prev_close, prev_close * 1.001, volume);
    }
    (start..end).collect()
}

/// Price ramp on rising volume, then a collapse back to the pre-pump level.
///
/// `rise` is the total fractional gain at the top, e.g. 0.3 for +30%.
/// Bars after the dump keep their original prices.
pub fn inject_pump_and_dump(
    bars: &mut [RawBar],
    start: usize,
    pump_len: usize,
    dump_len: usize,
    rise: f64,
    volume_multiplier: f64,
) -> Vec<usize> {
    if start == 0 || start >= bars.len() || pump_len == 0 {
        return Vec::new();
    }
    let base_volume = reference_volume(bars, start);
    let base_close = bars[start - 1].close;
    let end = (start + pump_len + dump_len).min(bars.len());

    for i in start..end {
        let step = i - start + 1;
        let level = if step <= pump_len {
            1.0 + rise * step as f64 / pump_len as f64
        } else {
            let down = (step - pump_len) as f64 / dump_len.max(1) as f64;
            1.0 + rise * (1.0 - down).max(0.0)
        };
        let prev_close = bars[i - 1].close;
        reshape(&mut bars[i], prev_close, base_close * level, base_volume * volume_multiplier);
    }
    (start..end).collect()
}

/// Push one bar's close away from its open on a volume burst
pub fn inject_marking_the_close(bars: &mut [RawBar], index: usize, push: f64, volume_multiplier: f64) -> Vec<usize> {
    if index == 0 || index >= bars.len() {
        return Vec::new();
    }
    let volume = reference_volume(bars, index) * volume_multiplier;
    let prev_close = bars[index - 1].close;
    reshape(&mut bars[index], prev_close, prev_close * (1.0 + push), volume);
    vec![index]
}
