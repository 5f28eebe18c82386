//! Concurrent evaluation run engine.
//!
//! A run scores every sample of a [`dataset::Dataset`] against a set of
//! [`metrics_api::Metric`]s with bounded concurrency, per-sample failure
//! isolation, retries with backoff, live progress and cancellation, and produces
//! an aggregated [`result::EvalResult`]. Start here: [`engine::Engine`].

pub mod cache;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod errors;
pub mod metrics_api;
pub mod model;
pub mod plugins;
pub mod registry;
pub mod result;
pub mod telemetry;

pub use config::{EvalConfig, RunConfig};
pub use engine::{Engine, EngineBuilder, Progress};
pub use errors::{EngineError, EngineResult, ScoringError};
pub use metrics_api::{Metric, MetricContext, MetricRef};
pub use model::{Sample, SampleResult, SampleType};
pub use result::EvalResult;
