//! Risk classification for certification review.
//!
//! Pure and deterministic: the same item and configuration always produce
//! the same score and bucket. No I/O, no clocks, no randomness.

#![deny(unsafe_code)]

mod classifier;
mod config;

pub use classifier::{Classification, Partition, RiskClassifier};
pub use config::{AutoRevokeRule, RiskConfig, RiskError, RiskThresholds, RiskWeights};
