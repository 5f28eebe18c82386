use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    #[default]
    SingleTurn,
    MultiTurn,
}

impl SampleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleTurn => "single_turn",
            Self::MultiTurn => "multi_turn",
        }
    }
}

/// One unit of evaluation input. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    #[serde(default)]
    pub sample_type: SampleType,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Tags,
}

impl Sample {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sample_type: SampleType::SingleTurn,
            fields: BTreeMap::new(),
            tags: Tags::new(),
        }
    }

    pub fn with_type(mut self, sample_type: SampleType) -> Self {
        self.sample_type = sample_type;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    /// A field counts as present when it exists and is not null or empty.
    pub fn has_field(&self, key: &str) -> bool {
        match self.fields.get(key) {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(serde_json::Value::Array(a)) => !a.is_empty(),
            Some(serde_json::Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        }
    }
}

/// Per-sample outcome. Exactly one is produced for every accepted assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    pub sample_id: String,
    pub scores: BTreeMap<String, f64>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SampleResult {
    /// Result for a sample that never reached the metrics (timeout, crash).
    pub fn failed(sample: &Sample, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            sample_id: sample.id.clone(),
            scores: BTreeMap::new(),
            latency_ms,
            error: Some(error.into()),
            tags: sample.tags.clone(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Completed: no error and at least one score. Only these count toward pass rate.
    pub fn is_scored(&self) -> bool {
        self.error.is_none() && !self.scores.is_empty()
    }

    /// Every produced score meets `threshold`.
    pub fn passes(&self, threshold: f64) -> bool {
        self.scores.values().all(|s| *s >= threshold)
    }

    pub fn mean_score(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        Some(self.scores.values().sum::<f64>() / self.scores.len() as f64)
    }
}
