//! Measure bandwidth and latency against HTTP speed-test endpoints.
//!
//! A [`orchestrator::TestOrchestrator`] walks a [`plan::TestPlan`], issuing one
//! timed probe at a time through a [`sampler::Probe`]. Each raw sample is sent
//! to a [`aggregator::PercentileAggregator`] task, which derives speed and
//! latency figures and publishes a fresh [`types::SessionSummary`] with
//! nearest-rank 90th percentiles after every sample.

pub mod aggregator;
pub mod calculator;
mod error;
pub mod metadata;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod sampler;
pub mod settings;
pub mod transport;
pub mod types;
pub mod urls;

pub use error::{Error, Result};
