use crate::text::field_text;
use async_trait::async_trait;
use tally_core::errors::ScoringError;
use tally_core::metrics_api::{Metric, MetricContext};
use tally_core::model::Sample;

/// 1.0 when the field holds non-blank text. A missing field scores 0.0 rather
/// than failing validation.
pub struct NonEmptyMetric {
    field: String,
}

impl NonEmptyMetric {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Default for NonEmptyMetric {
    fn default() -> Self {
        Self::new("answer")
    }
}

#[async_trait]
impl Metric for NonEmptyMetric {
    fn name(&self) -> &str {
        "non_empty"
    }

    async fn evaluate(&self, sample: &Sample, _ctx: &MetricContext) -> Result<f64, ScoringError> {
        let filled = field_text(sample, &self.field).is_some_and(|t| !t.trim().is_empty());
        Ok(if filled { 1.0 } else { 0.0 })
    }
}
