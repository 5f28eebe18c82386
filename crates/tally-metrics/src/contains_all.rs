use crate::text::{field_text, normalize, option_bool};
use async_trait::async_trait;
use tally_core::errors::ScoringError;
use tally_core::metrics_api::{Metric, MetricContext};
use tally_core::model::Sample;

/// Fraction of expected terms found in the answer.
///
/// Terms come from the `terms` option, or else from the sample's
/// `expected_terms` field (array of strings). Matching is substring-based on
/// normalized text.
pub struct ContainsAllMetric {
    field: String,
}

impl ContainsAllMetric {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Default for ContainsAllMetric {
    fn default() -> Self {
        Self::new("answer")
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Option<Vec<String>> {
    let items = value?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|v| v.as_str())
            .map(ToString::to_string)
            .collect(),
    )
}

#[async_trait]
impl Metric for ContainsAllMetric {
    fn name(&self) -> &str {
        "contains_all"
    }

    fn required_fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    async fn evaluate(&self, sample: &Sample, ctx: &MetricContext) -> Result<f64, ScoringError> {
        let terms = string_list(ctx.options.get("terms"))
            .or_else(|| string_list(sample.field("expected_terms")))
            .unwrap_or_default();
        if terms.is_empty() {
            return Err(ScoringError::validation(
                "contains_all needs a non-empty 'terms' option or 'expected_terms' field",
            ));
        }

        let case_sensitive = option_bool(&ctx.options, "case_sensitive", false);
        let haystack = normalize(
            &field_text(sample, &self.field).unwrap_or_default(),
            case_sensitive,
        );
        let found = terms
            .iter()
            .filter(|t| haystack.contains(&normalize(t, case_sensitive)))
            .count();

        Ok(found as f64 / terms.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(options: serde_json::Value) -> MetricContext {
        MetricContext {
            run_id: "run".into(),
            model: "none".into(),
            seed: None,
            options,
        }
    }

    #[tokio::test]
    async fn scores_fraction_of_terms_from_options() {
        let metric = ContainsAllMetric::default();
        let sample = Sample::new("s").with_field("answer", "Paris is the capital of France");
        let options = serde_json::json!({"terms": ["paris", "france", "berlin", "capital"]});
        let score = metric.evaluate(&sample, &ctx(options)).await.unwrap();
        assert_eq!(score, 0.75);
    }

    #[tokio::test]
    async fn falls_back_to_sample_terms() {
        let metric = ContainsAllMetric::default();
        let sample = Sample::new("s")
            .with_field("answer", "refund issued")
            .with_field("expected_terms", serde_json::json!(["refund", "issued"]));
        let score = metric.evaluate(&sample, &ctx(serde_json::json!({}))).await.unwrap();
        assert_eq!(score, 1.0);
    }

    #[tokio::test]
    async fn missing_terms_is_validation_error() {
        let metric = ContainsAllMetric::default();
        let sample = Sample::new("s").with_field("answer", "anything");
        let err = metric
            .evaluate(&sample, &ctx(serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ScoringError::Validation { .. }));
    }
}
