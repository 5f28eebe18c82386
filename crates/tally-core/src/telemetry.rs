//! Run telemetry: lifecycle events with a measurement map and metadata.
//!
//! Events are fanned out synchronously to every registered handler. Handlers run
//! on the controller or worker task that emitted the event, so they must be cheap.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TelemetryEventName {
    #[serde(rename = "run.start")]
    RunStart,
    #[serde(rename = "run.stop")]
    RunStop,
    #[serde(rename = "sample.start")]
    SampleStart,
    #[serde(rename = "sample.stop")]
    SampleStop,
    #[serde(rename = "metric.start")]
    MetricStart,
    #[serde(rename = "metric.stop")]
    MetricStop,
    #[serde(rename = "progress")]
    Progress,
}

impl TelemetryEventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStart => "run.start",
            Self::RunStop => "run.stop",
            Self::SampleStart => "sample.start",
            Self::SampleStop => "sample.stop",
            Self::MetricStart => "metric.start",
            Self::MetricStop => "metric.stop",
            Self::Progress => "progress",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub name: TelemetryEventName,
    pub measurements: BTreeMap<String, f64>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TelemetryEvent {
    pub fn new(name: TelemetryEventName, run_id: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("run_id".to_string(), serde_json::json!(run_id));
        Self {
            name,
            measurements: BTreeMap::new(),
            metadata,
        }
    }

    pub fn measure(mut self, key: &str, value: f64) -> Self {
        self.measurements.insert(key.to_string(), value);
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn run_id(&self) -> Option<&str> {
        self.metadata.get("run_id").and_then(|v| v.as_str())
    }
}

pub trait TelemetryHandler: Send + Sync {
    fn handle(&self, event: &TelemetryEvent);
}

impl<F> TelemetryHandler for F
where
    F: Fn(&TelemetryEvent) + Send + Sync,
{
    fn handle(&self, event: &TelemetryEvent) {
        self(event)
    }
}

/// Re-emits telemetry as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHandler;

impl TelemetryHandler for TracingHandler {
    fn handle(&self, event: &TelemetryEvent) {
        let run_id = event.run_id().unwrap_or("");
        if event.name == TelemetryEventName::Progress {
            tracing::trace!(event = event.name.as_str(), run_id, measurements = ?event.measurements, "telemetry");
        } else {
            tracing::debug!(
                event = event.name.as_str(),
                run_id,
                measurements = ?event.measurements,
                metadata = ?event.metadata,
                "telemetry"
            );
        }
    }
}

#[derive(Clone, Default)]
pub struct Telemetry {
    handlers: Vec<Arc<dyn TelemetryHandler>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn TelemetryHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn emit(&self, event: TelemetryEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
