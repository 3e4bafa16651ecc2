//! Detection testing tools
//!
//! # Modules
//!
//! - `synthetic` - Seeded market generator and manipulation injectors
//! - `metrics` - Precision, recall, F1 and false-positive rate against ground truth

pub mod metrics;
pub mod synthetic;

pub use metrics::{DetectionMetrics, GroundTruth};
pub use synthetic::{
    inject_marking_the_close, inject_pump_and_dump, inject_wash_trading, GeneratorConfig,
    MarketGenerator,
};
