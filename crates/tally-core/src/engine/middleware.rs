//! Ordered decorators around each metric invocation.
//!
//! A chain `[a, b]` runs as `a(b(endpoint))`. Each middleware receives the call
//! and a [`Next`] it may invoke at most once.

use crate::errors::ScoringError;
use crate::metrics_api::{Metric, MetricContext};
use crate::model::Sample;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info_span, Instrument};

/// One metric invocation as seen by middleware.
pub struct MetricCall<'a> {
    pub sample: &'a Sample,
    pub metric: &'a dyn Metric,
    pub ctx: &'a MetricContext,
}

impl MetricCall<'_> {
    pub fn metric_name(&self) -> &str {
        self.metric.name()
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, call: &MetricCall<'_>, next: Next<'_>) -> Result<f64, ScoringError>;
}

/// Innermost step of the chain; in the engine this is the retrying scoring call.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn invoke(&self, call: &MetricCall<'_>) -> Result<f64, ScoringError>;
}

pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Endpoint) -> Self {
        Self { chain, endpoint }
    }

    pub async fn run(self, call: &MetricCall<'_>) -> Result<f64, ScoringError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.call(
                    call,
                    Next {
                        chain: rest,
                        endpoint: self.endpoint,
                    },
                )
                .await
            }
            None => self.endpoint.invoke(call).await,
        }
    }
}

/// Default middleware: wraps each invocation in a `tally.metric` span.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn call(&self, call: &MetricCall<'_>, next: Next<'_>) -> Result<f64, ScoringError> {
        let span = info_span!(
            "tally.metric",
            "tally.run_id" = call.ctx.run_id.as_str(),
            "tally.sample_id" = call.sample.id.as_str(),
            "tally.metric" = call.metric_name(),
            "tally.score" = tracing::field::Empty,
            "error" = tracing::field::Empty,
            "error.message" = tracing::field::Empty
        );

        async move {
            let result = next.run(call).await;

            let span = tracing::Span::current();
            match &result {
                Ok(score) => {
                    span.record("tally.score", *score);
                }
                Err(e) => {
                    span.record("error", true);
                    span.record("error.message", e.to_string().as_str());
                }
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Constant;

    #[async_trait]
    impl Metric for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        async fn evaluate(&self, _s: &Sample, _c: &MetricContext) -> Result<f64, ScoringError> {
            Ok(0.25)
        }
    }

    struct Direct;

    #[async_trait]
    impl Endpoint for Direct {
        async fn invoke(&self, call: &MetricCall<'_>) -> Result<f64, ScoringError> {
            call.metric.evaluate(call.sample, call.ctx).await
        }
    }

    struct Recording {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recording {
        fn name(&self) -> &str {
            self.label
        }

        async fn call(&self, call: &MetricCall<'_>, next: Next<'_>) -> Result<f64, ScoringError> {
            self.log.lock().unwrap().push(format!("{}>", self.label));
            let out = next.run(call).await;
            self.log.lock().unwrap().push(format!("<{}", self.label));
            out
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        fn name(&self) -> &str {
            "short"
        }

        async fn call(&self, _call: &MetricCall<'_>, _next: Next<'_>) -> Result<f64, ScoringError> {
            Err(ScoringError::validation("blocked"))
        }
    }

    fn ctx() -> MetricContext {
        MetricContext {
            run_id: "run".into(),
            model: "m".into(),
            seed: None,
            options: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn chain_runs_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recording {
                label: "a",
                log: log.clone(),
            }),
            Arc::new(Recording {
                label: "b",
                log: log.clone(),
            }),
            Arc::new(TracingMiddleware),
        ];
        let sample = Sample::new("s1");
        let ctx = ctx();
        let call = MetricCall {
            sample: &sample,
            metric: &Constant,
            ctx: &ctx,
        };

        let score = Next::new(&chain, &Direct).run(&call).await.unwrap();
        assert_eq!(score, 0.25);
        assert_eq!(*log.lock().unwrap(), vec!["a>", "b>", "<b", "<a"]);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(ShortCircuit)];
        let sample = Sample::new("s1");
        let ctx = ctx();
        let call = MetricCall {
            sample: &sample,
            metric: &Constant,
            ctx: &ctx,
        };
        let err = Next::new(&chain, &Direct).run(&call).await.unwrap_err();
        assert!(err.to_string().starts_with("validation:"));
    }
}
