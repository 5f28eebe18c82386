use crate::text::field_text;
use async_trait::async_trait;
use regex::Regex;
use tally_core::errors::ScoringError;
use tally_core::metrics_api::{Metric, MetricContext};
use tally_core::model::Sample;

/// 1.0 when the answer matches the `pattern` option (or the sample's `pattern`
/// field), else 0.0.
pub struct RegexMatchMetric {
    field: String,
}

impl RegexMatchMetric {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Default for RegexMatchMetric {
    fn default() -> Self {
        Self::new("answer")
    }
}

#[async_trait]
impl Metric for RegexMatchMetric {
    fn name(&self) -> &str {
        "regex_match"
    }

    fn required_fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    async fn evaluate(&self, sample: &Sample, ctx: &MetricContext) -> Result<f64, ScoringError> {
        let pattern = ctx
            .options
            .get("pattern")
            .and_then(|v| v.as_str())
            .or_else(|| sample.field_str("pattern"))
            .ok_or_else(|| {
                ScoringError::validation("regex_match needs a 'pattern' option or field")
            })?;

        let re = Regex::new(pattern).map_err(|e| {
            tracing::debug!(pattern, error = %e, "invalid regex");
            ScoringError::validation(format!("invalid pattern '{}': {}", pattern, e))
        })?;

        let text = field_text(sample, &self.field).unwrap_or_default();
        Ok(if re.is_match(&text) { 1.0 } else { 0.0 })
    }
}
