//! Metrics module for distance, pace, and energy computation.

pub mod accumulator;
pub mod kinds;

pub use accumulator::{MetricsAccumulator, MetricsConfig, PositionOutcome, RejectReason};
pub use kinds::{KindProfile, KindTable};
