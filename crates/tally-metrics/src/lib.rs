//! Deterministic (non-LLM) metrics for Tally.
//!
//! Each metric reads text fields from the sample and scores in `[0, 1]`.
//! Register them all with [`register_defaults`].

use std::sync::Arc;
use tally_core::errors::RegistryError;
use tally_core::metrics_api::Metric;
use tally_core::registry::{Component, ComponentKind, ComponentRegistry};

pub mod contains_all;
pub mod exact_match;
pub mod non_empty;
pub mod regex_match;
mod text;

pub use contains_all::ContainsAllMetric;
pub use exact_match::ExactMatchMetric;
pub use non_empty::NonEmptyMetric;
pub use regex_match::RegexMatchMetric;

/// Every built-in metric with its default field names.
pub fn default_metrics() -> Vec<Arc<dyn Metric>> {
    vec![
        Arc::new(ExactMatchMetric::default()),
        Arc::new(ContainsAllMetric::default()),
        Arc::new(RegexMatchMetric::default()),
        Arc::new(NonEmptyMetric::default()),
    ]
}

pub fn register_defaults(registry: &ComponentRegistry) -> Result<(), RegistryError> {
    for metric in default_metrics() {
        registry.register(ComponentKind::Metric, Component::Metric(metric))?;
    }
    tracing::debug!(count = registry.list(ComponentKind::Metric).len(), "registered default metrics");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_unique_names() {
        let mut names: Vec<String> = default_metrics()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names, ["contains_all", "exact_match", "non_empty", "regex_match"]);
    }

    #[test]
    fn register_defaults_is_idempotent_by_name() {
        let registry = ComponentRegistry::new();
        register_defaults(&registry).unwrap();
        register_defaults(&registry).unwrap();
        assert_eq!(registry.list(ComponentKind::Metric).len(), 4);
        assert!(registry.metric("regex_match").is_ok());
    }
}
