//! Run façade: start, observe, await and cancel evaluation runs.
//!
//! Each run gets its own controller task ([`pool`]). The engine keeps only a
//! command channel per live run, in a concurrent map the controller removes
//! itself from after its retention period.

pub mod middleware;
pub mod pool;
pub mod processor;
pub mod retry;
pub mod worker;

pub use middleware::{Endpoint, MetricCall, Middleware, Next, TracingMiddleware};
pub use pool::{Progress, WorkerInfo};
pub use processor::{ResolvedMetric, SampleProcessor};
pub use retry::{CallOutcome, RetryPolicy, RetryingCaller};
pub use worker::{WorkerId, WorkerState};

use crate::cache::{self, ResponseCache};
use crate::config::EvalConfig;
use crate::dataset::Dataset;
use crate::errors::{EngineError, EngineResult, RegistryError};
use crate::metrics_api::MetricRef;
use crate::plugins::RunContext;
use crate::registry::{self, Component, ComponentKind, ComponentRegistry};
use crate::result::EvalResult;
use crate::telemetry::{Telemetry, TelemetryHandler, TracingHandler};
use chrono::Utc;
use dashmap::DashMap;
use lazy_static::lazy_static;
use pool::{Components, PoolCommand, PoolSetup, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

type RunMap = Arc<DashMap<String, RunHandle>>;

lazy_static! {
    static ref GLOBAL_RUNS: RunMap = Arc::new(DashMap::new());
}

/// Engine-side handle to a live run.
#[derive(Debug, Clone)]
pub(crate) struct RunHandle {
    commands: mpsc::UnboundedSender<PoolCommand>,
}

#[derive(Clone)]
pub struct Engine {
    registry: Arc<ComponentRegistry>,
    cache: Arc<ResponseCache>,
    telemetry: Telemetry,
    runs: RunMap,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Engine over the process-wide registry, cache and run table, logging
    /// telemetry via `tracing`. Every `Engine::new()` sees the same runs.
    pub fn new() -> Self {
        Self::builder()
            .handler(Arc::new(TracingHandler))
            .shared_runs()
            .build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Start a run and return its id. Fails only if the configuration is invalid,
    /// a configured component is unknown, or the dataset cannot be opened.
    /// Unknown metric names do not fail the start; they surface per sample.
    pub async fn start_run(
        &self,
        dataset: Arc<dyn Dataset>,
        config: EvalConfig,
        metrics: Vec<MetricRef>,
    ) -> EngineResult<String> {
        config.validate()?;

        let components = self.resolve_components(&config)?;
        let middleware = self.resolve_middleware(&config)?;
        let resolved: Vec<ResolvedMetric> = metrics
            .into_iter()
            .map(|m| self.resolve_metric(m))
            .collect();

        let stream = dataset.stream().map_err(|e| EngineError::Dataset {
            message: format!("{:#}", e),
        })?;
        let total = dataset.count();
        let run_id = uuid::Uuid::new_v4().to_string();

        let mut ctx = RunContext {
            run_id: run_id.clone(),
            config: config.clone(),
            metric_names: resolved.iter().map(|m| m.name().to_string()).collect(),
            total,
            started_at: Utc::now(),
            metadata: serde_json::Map::new(),
        };
        for processor in &components.processors {
            if let Err(e) = processor.pre_process(&mut ctx) {
                warn!(run_id = %run_id, processor = processor.name(), error = %e, "pre-processor failed");
            }
        }

        let mut caller = RetryingCaller::new(config.run.retry.clone());
        if config.run.cache.enabled {
            caller = caller.with_cache(self.cache.clone(), config.run.cache.ttl());
        }
        let processor = Arc::new(SampleProcessor::new(
            run_id.clone(),
            config.model.clone(),
            config.run.seed,
            config.metric_options.clone(),
            resolved,
            middleware,
            caller,
            self.telemetry.clone(),
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(PoolSetup {
            ctx,
            processor,
            stream,
            components,
            telemetry: self.telemetry.clone(),
            max_workers: config.run.max_workers,
            sample_timeout: config.run.sample_timeout(),
            retention: config.run.retention(),
            commands: rx,
        });
        self.runs
            .insert(run_id.clone(), RunHandle { commands: tx });
        tokio::spawn(pool.run(self.runs.clone()));

        info!(
            run_id = %run_id,
            total = ?total,
            max_workers = config.run.max_workers,
            "run started"
        );
        Ok(run_id)
    }

    /// Start a run and wait for its result. On timeout the run is cancelled.
    pub async fn evaluate(
        &self,
        dataset: Arc<dyn Dataset>,
        config: EvalConfig,
        metrics: Vec<MetricRef>,
        timeout: Duration,
    ) -> EngineResult<EvalResult> {
        let run_id = self.start_run(dataset, config, metrics).await?;
        match self.await_result(&run_id, timeout).await {
            Err(e @ EngineError::Timeout { .. }) => {
                if let Err(cancel_err) = self.cancel(&run_id).await {
                    warn!(run_id = %run_id, error = %cancel_err, "cancel after timeout failed");
                }
                Err(e)
            }
            other => other,
        }
    }

    pub async fn get_progress(&self, run_id: &str) -> EngineResult<Progress> {
        self.request(run_id, PoolCommand::Progress).await
    }

    /// Wait for the finalized result. A cancelled run yields its partial result
    /// with `cancelled` set.
    pub async fn await_result(&self, run_id: &str, timeout: Duration) -> EngineResult<EvalResult> {
        let (reply, rx) = oneshot::channel();
        self.send(run_id, PoolCommand::Await(reply))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(EngineError::Shutdown {
                run_id: run_id.to_string(),
            }),
            Err(_) => Err(EngineError::Timeout {
                run_id: run_id.to_string(),
                waited_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
        }
    }

    pub async fn cancel(&self, run_id: &str) -> EngineResult<()> {
        self.request(run_id, PoolCommand::Cancel).await
    }

    /// Progress of every run that has not finished yet.
    pub async fn list_running(&self) -> Vec<Progress> {
        let ids: Vec<String> = self.runs.iter().map(|e| e.key().clone()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(progress) = self.get_progress(&id).await {
                if !progress.finished {
                    out.push(progress);
                }
            }
        }
        out.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        out
    }

    pub async fn list_workers(&self, run_id: &str) -> EngineResult<Vec<WorkerInfo>> {
        self.request(run_id, PoolCommand::ListWorkers).await
    }

    /// Hard-kill one worker. The pool handles it as a crash. Returns `false` if
    /// the run has no such worker.
    pub async fn terminate_worker(&self, run_id: &str, worker_id: WorkerId) -> EngineResult<bool> {
        self.request(run_id, |reply| PoolCommand::TerminateWorker { worker_id, reply })
            .await
    }

    fn send(&self, run_id: &str, command: PoolCommand) -> EngineResult<()> {
        let handle = self
            .runs
            .get(run_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| EngineError::not_found(run_id))?;
        handle
            .commands
            .send(command)
            .map_err(|_| EngineError::not_found(run_id))
    }

    async fn request<T>(
        &self,
        run_id: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(run_id, make(reply))?;
        rx.await.map_err(|_| EngineError::not_found(run_id))
    }

    fn resolve_metric(&self, metric: MetricRef) -> ResolvedMetric {
        match metric {
            MetricRef::Direct(metric) => ResolvedMetric::Ready(metric),
            MetricRef::Named(name) => match self.registry.metric(&name) {
                Ok(metric) => ResolvedMetric::Ready(metric),
                Err(e) => {
                    warn!(metric = %name, error = %e, "metric not resolvable, samples will record an error");
                    ResolvedMetric::Unresolved { name }
                }
            },
        }
    }

    fn resolve_components(&self, config: &EvalConfig) -> Result<Components, RegistryError> {
        let lookup = |kind: ComponentKind, names: &[String]| -> Result<Vec<Component>, RegistryError> {
            names
                .iter()
                .map(|name| self.registry.lookup(kind, name))
                .collect()
        };
        Ok(Components {
            reporters: lookup(ComponentKind::Reporter, &config.reporters)?
                .into_iter()
                .filter_map(Component::into_reporter)
                .collect(),
            stores: lookup(ComponentKind::Store, &config.stores)?
                .into_iter()
                .filter_map(Component::into_store)
                .collect(),
            broadcasters: lookup(ComponentKind::Broadcaster, &config.broadcasters)?
                .into_iter()
                .filter_map(Component::into_broadcaster)
                .collect(),
            processors: lookup(ComponentKind::Processor, &config.processors)?
                .into_iter()
                .filter_map(Component::into_processor)
                .collect(),
        })
    }

    fn resolve_middleware(&self, config: &EvalConfig) -> Result<Vec<Arc<dyn Middleware>>, RegistryError> {
        if config.middleware.is_empty() {
            return Ok(vec![Arc::new(TracingMiddleware)]);
        }
        config
            .middleware
            .iter()
            .map(|name| {
                self.registry
                    .lookup(ComponentKind::Middleware, name)?
                    .into_middleware()
                    .ok_or_else(|| RegistryError::NotFound {
                        kind: ComponentKind::Middleware.to_string(),
                        name: name.clone(),
                    })
            })
            .collect()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("runs", &self.runs.len())
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

/// Builds an [`Engine`]. Registry and cache default to the process-wide ones;
/// the run table is private to the built engine unless `shared_runs` is set.
#[derive(Default)]
pub struct EngineBuilder {
    registry: Option<Arc<ComponentRegistry>>,
    cache: Option<Arc<ResponseCache>>,
    telemetry: Telemetry,
    shared_runs: bool,
}

impl EngineBuilder {
    pub fn registry(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn TelemetryHandler>) -> Self {
        self.telemetry = self.telemetry.with_handler(handler);
        self
    }

    /// Register runs in the process-wide run table used by `Engine::new`.
    pub fn shared_runs(mut self) -> Self {
        self.shared_runs = true;
        self
    }

    pub fn build(self) -> Engine {
        let runs = if self.shared_runs {
            GLOBAL_RUNS.clone()
        } else {
            Arc::new(DashMap::new())
        };
        Engine {
            registry: self.registry.unwrap_or_else(registry::global),
            cache: self.cache.unwrap_or_else(cache::global),
            telemetry: self.telemetry,
            runs,
        }
    }
}
