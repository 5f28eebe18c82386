use crate::errors::ScoringError;
use crate::model::{Sample, SampleType};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Context handed to every metric invocation.
#[derive(Debug, Clone)]
pub struct MetricContext {
    pub run_id: String,
    pub model: String,
    pub seed: Option<u64>,
    /// This metric's entry from `EvalConfig::metric_options`.
    pub options: serde_json::Value,
}

/// A named scoring function. Implementations usually call out to an LLM; the
/// engine wraps every `evaluate` in middleware, retries, and a hard timeout.
#[async_trait]
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    /// Sample fields that must be present and non-empty.
    fn required_fields(&self) -> Vec<String> {
        Vec::new()
    }

    fn sample_types(&self) -> Vec<SampleType> {
        vec![SampleType::SingleTurn, SampleType::MultiTurn]
    }

    fn score_range(&self) -> (f64, f64) {
        (0.0, 1.0)
    }

    /// Input to the cache key; two calls with the same payload, model and
    /// options are interchangeable. Defaults to the sample's fields.
    fn cache_payload(&self, sample: &Sample) -> String {
        format!(
            "{}\n{}",
            self.name(),
            serde_json::to_string(&sample.fields).unwrap_or_default()
        )
    }

    async fn evaluate(&self, sample: &Sample, ctx: &MetricContext) -> Result<f64, ScoringError>;
}

/// Check a sample against a metric's declared requirements.
pub fn check_compatibility(metric: &dyn Metric, sample: &Sample) -> Result<(), ScoringError> {
    if !metric.sample_types().contains(&sample.sample_type) {
        return Err(ScoringError::validation(format!(
            "metric '{}' does not support {} samples",
            metric.name(),
            sample.sample_type.as_str()
        )));
    }
    let missing: Vec<String> = metric
        .required_fields()
        .into_iter()
        .filter(|f| !sample.has_field(f))
        .collect();
    if !missing.is_empty() {
        return Err(ScoringError::validation(format!(
            "metric '{}' missing required field(s): {}",
            metric.name(),
            missing.join(", ")
        )));
    }
    Ok(())
}

/// A metric given either by registered name or directly.
#[derive(Clone)]
pub enum MetricRef {
    Named(String),
    Direct(Arc<dyn Metric>),
}

impl MetricRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::Direct(metric) => metric.name(),
        }
    }
}

impl From<&str> for MetricRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for MetricRef {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<Arc<dyn Metric>> for MetricRef {
    fn from(metric: Arc<dyn Metric>) -> Self {
        Self::Direct(metric)
    }
}

impl fmt::Debug for MetricRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Direct(metric) => f.debug_tuple("Direct").field(&metric.name()).finish(),
        }
    }
}
