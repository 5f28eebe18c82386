//! Scores one sample against every configured metric.

use super::middleware::{Endpoint, MetricCall, Middleware, Next};
use super::retry::RetryingCaller;
use crate::cache::cache_key;
use crate::errors::ScoringError;
use crate::metrics_api::{check_compatibility, Metric, MetricContext};
use crate::model::{Sample, SampleResult};
use crate::telemetry::{Telemetry, TelemetryEvent, TelemetryEventName};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

/// A metric after name resolution at run start.
#[derive(Clone)]
pub enum ResolvedMetric {
    Ready(Arc<dyn Metric>),
    /// Could not be resolved; every sample gets a validation error for it.
    Unresolved { name: String },
}

impl ResolvedMetric {
    pub fn name(&self) -> &str {
        match self {
            Self::Ready(metric) => metric.name(),
            Self::Unresolved { name } => name,
        }
    }
}

impl std::fmt::Debug for ResolvedMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(metric) => write!(f, "Ready({})", metric.name()),
            Self::Unresolved { name } => write!(f, "Unresolved({})", name),
        }
    }
}

pub struct SampleProcessor {
    run_id: String,
    model: String,
    seed: Option<u64>,
    options: BTreeMap<String, serde_json::Value>,
    metrics: Vec<ResolvedMetric>,
    middleware: Vec<Arc<dyn Middleware>>,
    caller: RetryingCaller,
    telemetry: Telemetry,
}

impl SampleProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        model: impl Into<String>,
        seed: Option<u64>,
        options: BTreeMap<String, serde_json::Value>,
        metrics: Vec<ResolvedMetric>,
        middleware: Vec<Arc<dyn Middleware>>,
        caller: RetryingCaller,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            model: model.into(),
            seed,
            options,
            metrics,
            middleware,
            caller,
            telemetry,
        }
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.name().to_string()).collect()
    }

    fn context_for(&self, metric: &str) -> MetricContext {
        MetricContext {
            run_id: self.run_id.clone(),
            model: self.model.clone(),
            seed: self.seed,
            options: self
                .options
                .get(metric)
                .cloned()
                .unwrap_or_else(|| serde_json::json!({})),
        }
    }

    /// Score `sample` against every metric. Per-metric failures are recorded and
    /// never stop the remaining metrics. The first error becomes the result's
    /// `error`; all of them are kept under `metadata.metric_errors`.
    pub async fn process(self: &Arc<Self>, sample: &Sample) -> SampleResult {
        let started = Instant::now();
        let mut scores = BTreeMap::new();
        let mut errors: Vec<(String, String)> = Vec::new();

        for resolved in &self.metrics {
            let name = resolved.name().to_string();
            let outcome = match resolved {
                ResolvedMetric::Unresolved { name } => Err(ScoringError::validation(format!(
                    "unknown metric '{}'",
                    name
                ))),
                ResolvedMetric::Ready(metric) => match check_compatibility(metric.as_ref(), sample) {
                    Err(e) => Err(e),
                    Ok(()) => self.score_isolated(metric.clone(), sample).await,
                },
            };

            match outcome {
                Ok(score) => {
                    scores.insert(name, score);
                }
                Err(e) => {
                    tracing::debug!(
                        run_id = %self.run_id,
                        sample_id = %sample.id,
                        metric = %name,
                        error = %e,
                        "metric failed"
                    );
                    errors.push((name, e.to_string()));
                }
            }
        }

        let metadata = if errors.is_empty() {
            serde_json::json!({})
        } else {
            let by_metric: serde_json::Map<String, serde_json::Value> = errors
                .iter()
                .map(|(m, e)| (m.clone(), serde_json::Value::String(e.clone())))
                .collect();
            serde_json::json!({ "metric_errors": by_metric })
        };

        SampleResult {
            sample_id: sample.id.clone(),
            scores,
            latency_ms: started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
            error: errors.into_iter().next().map(|(_, e)| e),
            tags: sample.tags.clone(),
            metadata,
        }
    }

    /// Run one metric in its own task so a panic is contained. Dropping the
    /// returned future drops the set, which aborts the task.
    async fn score_isolated(
        self: &Arc<Self>,
        metric: Arc<dyn Metric>,
        sample: &Sample,
    ) -> Result<f64, ScoringError> {
        let name = metric.name().to_string();
        let started = Instant::now();
        self.telemetry.emit(
            TelemetryEvent::new(TelemetryEventName::MetricStart, &self.run_id)
                .meta("sample_id", sample.id.as_str())
                .meta("metric", name.as_str()),
        );

        let this = Arc::clone(self);
        let owned = sample.clone();
        let mut set = JoinSet::new();
        set.spawn(async move { this.score(metric.as_ref(), &owned).await });

        let outcome = match set.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) if e.is_panic() => Err(ScoringError::crashed(format!(
                "metric '{}' panicked: {}",
                name,
                panic_message(e.into_panic())
            ))),
            Some(Err(e)) => Err(ScoringError::crashed(format!(
                "metric '{}' task failed: {}",
                name, e
            ))),
            None => Err(ScoringError::crashed(format!(
                "metric '{}' task vanished",
                name
            ))),
        };

        let mut stop = TelemetryEvent::new(TelemetryEventName::MetricStop, &self.run_id)
            .measure("duration_ms", started.elapsed().as_millis() as f64)
            .meta("sample_id", sample.id.as_str())
            .meta("metric", name.as_str());
        stop = match &outcome {
            Ok(score) => stop.measure("score", *score),
            Err(e) => stop.meta("error", e.to_string()),
        };
        self.telemetry.emit(stop);

        outcome
    }

    async fn score(&self, metric: &dyn Metric, sample: &Sample) -> Result<f64, ScoringError> {
        let ctx = self.context_for(metric.name());
        let call = MetricCall {
            sample,
            metric,
            ctx: &ctx,
        };
        let endpoint = ScoringEndpoint {
            caller: &self.caller,
            model: &self.model,
        };
        Next::new(&self.middleware, &endpoint).run(&call).await
    }
}

impl std::fmt::Debug for SampleProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleProcessor")
            .field("run_id", &self.run_id)
            .field("metrics", &self.metrics)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

struct ScoringEndpoint<'a> {
    caller: &'a RetryingCaller,
    model: &'a str,
}

#[async_trait]
impl<'a> Endpoint for ScoringEndpoint<'a> {
    async fn invoke(&self, call: &MetricCall<'_>) -> Result<f64, ScoringError> {
        let key = self.caller.is_caching().then(|| {
            cache_key(
                self.model,
                &call.metric.cache_payload(call.sample),
                &call.ctx.options,
            )
        });
        let outcome = self
            .caller
            .execute(key.as_deref(), || call.metric.evaluate(call.sample, call.ctx))
            .await;
        if outcome.attempts > 1 {
            tracing::debug!(
                sample_id = %call.sample.id,
                metric = call.metric_name(),
                attempts = outcome.attempts,
                "scored after retries"
            );
        }
        outcome.result
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
