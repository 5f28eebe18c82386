use crate::text::{field_text, normalize, option_bool};
use async_trait::async_trait;
use tally_core::errors::ScoringError;
use tally_core::metrics_api::{Metric, MetricContext};
use tally_core::model::Sample;

/// 1.0 when the answer equals the reference after whitespace normalization.
/// Comparison ignores case unless the `case_sensitive` option is set.
pub struct ExactMatchMetric {
    answer_field: String,
    reference_field: String,
}

impl ExactMatchMetric {
    pub fn new(answer_field: impl Into<String>, reference_field: impl Into<String>) -> Self {
        Self {
            answer_field: answer_field.into(),
            reference_field: reference_field.into(),
        }
    }
}

impl Default for ExactMatchMetric {
    fn default() -> Self {
        Self::new("answer", "reference")
    }
}

#[async_trait]
impl Metric for ExactMatchMetric {
    fn name(&self) -> &str {
        "exact_match"
    }

    fn required_fields(&self) -> Vec<String> {
        vec![self.answer_field.clone(), self.reference_field.clone()]
    }

    async fn evaluate(&self, sample: &Sample, ctx: &MetricContext) -> Result<f64, ScoringError> {
        let case_sensitive = option_bool(&ctx.options, "case_sensitive", false);
        let answer = field_text(sample, &self.answer_field).unwrap_or_default();
        let reference = field_text(sample, &self.reference_field).unwrap_or_default();

        if normalize(&answer, case_sensitive) == normalize(&reference, case_sensitive) {
            Ok(1.0)
        } else {
            Ok(0.0)
        }
    }
}
