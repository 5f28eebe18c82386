//! Per-run controller.
//!
//! One `WorkerPool` task owns all mutable state of a run: the pending queue, the
//! lazy sample stream, the worker set and the result accumulator. Workers and the
//! engine talk to it only through channels, so nothing here is locked.
//!
//! Worker tasks live in a `JoinSet`; a task that ends while the run is live is a
//! crash. Its in-flight sample gets a synthesized `crash:` result and a
//! replacement is spawned while samples remain.

use super::processor::SampleProcessor;
use super::worker::{elapsed_ms, Worker, WorkerId, WorkerReport, WorkerState};
use super::RunHandle;
use crate::dataset::SampleStream;
use crate::model::{Sample, SampleResult};
use crate::plugins::{BroadcastEvent, Broadcaster, Processor, Reporter, RunContext, Store};
use crate::result::{EvalResult, ResultAccumulator};
use crate::telemetry::{Telemetry, TelemetryEvent, TelemetryEventName};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub run_id: String,
    pub total: Option<usize>,
    /// Samples with a recorded result, successful or not.
    pub completed: usize,
    pub errors: usize,
    /// `total - completed` when the total is known, otherwise in-flight plus queued.
    pub pending: usize,
    pub active_workers: usize,
    pub elapsed_ms: u64,
    pub cancelled: bool,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub state: WorkerState,
    pub sample_id: Option<String>,
    pub busy_ms: Option<u64>,
}

/// Requests from the engine façade.
#[derive(Debug)]
pub(crate) enum PoolCommand {
    Progress(oneshot::Sender<Progress>),
    Await(oneshot::Sender<EvalResult>),
    Cancel(oneshot::Sender<()>),
    ListWorkers(oneshot::Sender<Vec<WorkerInfo>>),
    TerminateWorker {
        worker_id: WorkerId,
        reply: oneshot::Sender<bool>,
    },
}

/// Components resolved from the registry at run start, in configuration order.
#[derive(Clone, Default)]
pub(crate) struct Components {
    pub reporters: Vec<Arc<dyn Reporter>>,
    pub stores: Vec<Arc<dyn Store>>,
    pub broadcasters: Vec<Arc<dyn Broadcaster>>,
    pub processors: Vec<Arc<dyn Processor>>,
}

/// Everything the controller needs, assembled by `Engine::start_run`.
pub(crate) struct PoolSetup {
    pub ctx: RunContext,
    pub processor: Arc<SampleProcessor>,
    pub stream: SampleStream,
    pub components: Components,
    pub telemetry: Telemetry,
    pub max_workers: usize,
    pub sample_timeout: Duration,
    pub retention: Duration,
    pub commands: mpsc::UnboundedReceiver<PoolCommand>,
}

struct InFlight {
    sample: Sample,
    started: Instant,
}

struct WorkerSlot {
    assignments: mpsc::Sender<Sample>,
    abort: AbortHandle,
    in_flight: Option<InFlight>,
}

pub(crate) struct WorkerPool {
    run_id: String,
    ctx: RunContext,
    processor: Arc<SampleProcessor>,
    components: Components,
    telemetry: Telemetry,
    max_workers: usize,
    sample_timeout: Duration,
    retention: Duration,

    /// `None` once the stream is exhausted.
    stream: Option<SampleStream>,
    pending: VecDeque<Sample>,
    total: Option<usize>,

    workers: BTreeMap<WorkerId, WorkerSlot>,
    task_ids: HashMap<tokio::task::Id, WorkerId>,
    tasks: JoinSet<()>,
    next_worker_id: WorkerId,
    replacements: usize,
    reports_tx: mpsc::UnboundedSender<WorkerReport>,
    reports_rx: mpsc::UnboundedReceiver<WorkerReport>,
    commands: mpsc::UnboundedReceiver<PoolCommand>,
    cancel: CancellationToken,

    acc: ResultAccumulator,
    waiters: Vec<oneshot::Sender<EvalResult>>,
    cancelled: bool,
    result: Option<EvalResult>,
    expires_at: Option<tokio::time::Instant>,
}

impl WorkerPool {
    pub(crate) fn new(setup: PoolSetup) -> Self {
        let PoolSetup {
            ctx,
            processor,
            stream,
            components,
            telemetry,
            max_workers,
            sample_timeout,
            retention,
            commands,
        } = setup;
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let run_id = ctx.run_id.clone();
        let total = ctx.total;
        Self {
            acc: ResultAccumulator::new(run_id.clone(), total),
            run_id,
            ctx,
            processor,
            components,
            telemetry,
            max_workers: max_workers.max(1),
            sample_timeout,
            retention,
            stream: Some(stream),
            pending: VecDeque::new(),
            total,
            workers: BTreeMap::new(),
            task_ids: HashMap::new(),
            tasks: JoinSet::new(),
            next_worker_id: 0,
            replacements: 0,
            reports_tx,
            reports_rx,
            commands,
            cancel: CancellationToken::new(),
            waiters: Vec::new(),
            cancelled: false,
            result: None,
            expires_at: None,
        }
    }

    /// Controller loop. Runs until the retention period after finalize has
    /// elapsed, then drops the run from `runs`.
    pub(crate) async fn run(mut self, runs: Arc<DashMap<String, RunHandle>>) {
        self.telemetry.emit(
            TelemetryEvent::new(TelemetryEventName::RunStart, &self.run_id)
                .measure("total", self.total.map(|t| t as f64).unwrap_or(-1.0))
                .measure("max_workers", self.max_workers as f64)
                .meta("metrics", self.ctx.metric_names.clone())
                .meta("seed", self.ctx.config.run.seed),
        );

        for _ in 0..self.max_workers {
            self.spawn_worker();
        }
        self.dispatch();
        self.maybe_finalize().await;

        loop {
            let expires_at = self.expires_at;
            tokio::select! {
                biased;
                Some(report) = self.reports_rx.recv() => self.on_report(report).await,
                Some(command) = self.commands.recv() => self.on_command(command).await,
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.on_worker_exit(joined).await
                }
                _ = sleep_until(expires_at), if expires_at.is_some() => break,
                else => break,
            }
        }

        self.tasks.shutdown().await;
        runs.remove(&self.run_id);
        debug!(run_id = %self.run_id, "run retired");
    }

    async fn on_report(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::Completed { worker_id, result } => {
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.in_flight = None;
                }
                self.record(result);
                self.dispatch();
                self.maybe_finalize().await;
            }
            WorkerReport::Rejected { worker_id, sample } => {
                warn!(run_id = %self.run_id, worker_id, sample_id = %sample.id, "worker rejected assignment");
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    if slot
                        .in_flight
                        .as_ref()
                        .is_some_and(|f| f.sample.id == sample.id)
                    {
                        slot.in_flight = None;
                    }
                }
                if self.result.is_none() {
                    self.pending.push_front(sample);
                }
            }
        }
    }

    async fn on_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Progress(reply) => {
                let _ = reply.send(self.progress());
            }
            PoolCommand::Await(reply) => match &self.result {
                Some(result) => {
                    let _ = reply.send(result.clone());
                }
                None => self.waiters.push(reply),
            },
            PoolCommand::Cancel(reply) => {
                if self.result.is_none() {
                    info!(run_id = %self.run_id, completed = self.acc.sample_count(), "cancelling run");
                    self.cancelled = true;
                    self.cancel.cancel();
                    self.finalize().await;
                }
                let _ = reply.send(());
            }
            PoolCommand::ListWorkers(reply) => {
                let _ = reply.send(self.worker_infos());
            }
            PoolCommand::TerminateWorker { worker_id, reply } => {
                let found = match self.workers.get(&worker_id) {
                    Some(slot) => {
                        warn!(run_id = %self.run_id, worker_id, "terminating worker on request");
                        slot.abort.abort();
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
        }
    }

    async fn on_worker_exit(&mut self, joined: Result<(tokio::task::Id, ()), JoinError>) {
        let (task_id, reason) = match joined {
            Ok((id, ())) => (id, "exited".to_string()),
            Err(e) => (e.id(), exit_reason(e)),
        };
        let Some(worker_id) = self.task_ids.remove(&task_id) else {
            return;
        };
        let Some(slot) = self.workers.remove(&worker_id) else {
            return;
        };
        if self.result.is_some() {
            return;
        }

        warn!(run_id = %self.run_id, worker_id, reason = %reason, "worker terminated");
        if let Some(in_flight) = slot.in_flight {
            self.record(SampleResult::failed(
                &in_flight.sample,
                format!("crash: worker {} terminated ({})", worker_id, reason),
                elapsed_ms(in_flight.started),
            ));
        }

        if self.samples_remain() {
            let replacement = self.spawn_worker();
            self.replacements += 1;
            info!(
                run_id = %self.run_id,
                worker_id = replacement,
                replaced = worker_id,
                "spawned replacement worker"
            );
        }
        self.dispatch();
        self.maybe_finalize().await;
    }

    fn spawn_worker(&mut self) -> WorkerId {
        self.next_worker_id += 1;
        let id = self.next_worker_id;
        let (tx, rx) = mpsc::channel(1);
        let worker = Worker::new(
            id,
            self.processor.clone(),
            self.sample_timeout,
            rx,
            self.reports_tx.clone(),
            self.cancel.child_token(),
        );
        let abort = self.tasks.spawn(worker.run());
        self.task_ids.insert(abort.id(), id);
        self.workers.insert(
            id,
            WorkerSlot {
                assignments: tx,
                abort,
                in_flight: None,
            },
        );
        debug!(run_id = %self.run_id, worker_id = id, "worker spawned");
        id
    }

    fn samples_remain(&self) -> bool {
        !self.pending.is_empty() || self.stream.is_some()
    }

    /// Queue first, then the stream. Marks the stream exhausted on its end.
    fn next_sample(&mut self) -> Option<Sample> {
        if let Some(sample) = self.pending.pop_front() {
            return Some(sample);
        }
        let next = self.stream.as_mut()?.next();
        if next.is_none() {
            self.stream = None;
        }
        next
    }

    /// Hand one sample to every idle worker while samples are available.
    fn dispatch(&mut self) {
        if self.result.is_some() {
            return;
        }
        let idle: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, slot)| slot.in_flight.is_none())
            .map(|(id, _)| *id)
            .collect();

        for worker_id in idle {
            let Some(sample) = self.next_sample() else {
                break;
            };
            let Some(slot) = self.workers.get_mut(&worker_id) else {
                self.pending.push_front(sample);
                continue;
            };
            match slot.assignments.try_send(sample.clone()) {
                Ok(()) => {
                    self.telemetry.emit(
                        TelemetryEvent::new(TelemetryEventName::SampleStart, &self.run_id)
                            .meta("sample_id", sample.id.as_str())
                            .meta("worker_id", worker_id),
                    );
                    slot.in_flight = Some(InFlight {
                        sample,
                        started: Instant::now(),
                    });
                }
                Err(e) => {
                    debug!(run_id = %self.run_id, worker_id, error = %e, "assignment failed, requeueing");
                    self.pending.push_front(sample);
                }
            }
        }
    }

    fn in_flight_count(&self) -> usize {
        self.workers
            .values()
            .filter(|slot| slot.in_flight.is_some())
            .count()
    }

    fn is_complete(&self) -> bool {
        if self.cancelled {
            return true;
        }
        if matches!(self.total, Some(total) if self.acc.sample_count() >= total) {
            return true;
        }
        !self.samples_remain() && self.in_flight_count() == 0
    }

    /// Append one result and fan it out. Late or duplicate results are dropped.
    fn record(&mut self, result: SampleResult) {
        if self.result.is_some() {
            debug!(run_id = %self.run_id, sample_id = %result.sample_id, "dropping result after finalize");
            return;
        }
        if !self.acc.record(result.clone()) {
            warn!(run_id = %self.run_id, sample_id = %result.sample_id, "duplicate result dropped");
            return;
        }

        let mut stop = TelemetryEvent::new(TelemetryEventName::SampleStop, &self.run_id)
            .measure("latency_ms", result.latency_ms as f64)
            .measure("scores", result.scores.len() as f64)
            .meta("sample_id", result.sample_id.as_str());
        if let Some(error) = &result.error {
            stop = stop.meta("error", error.as_str());
        }
        self.telemetry.emit(stop);

        for reporter in &self.components.reporters {
            if let Err(e) = reporter.handle_sample(&result, &self.ctx) {
                warn!(run_id = %self.run_id, reporter = reporter.name(), error = %e, "reporter failed");
            }
        }

        let progress = self.progress();
        self.telemetry.emit(
            TelemetryEvent::new(TelemetryEventName::Progress, &self.run_id)
                .measure("completed", progress.completed as f64)
                .measure("errors", progress.errors as f64)
                .measure("pending", progress.pending as f64)
                .measure("active_workers", progress.active_workers as f64),
        );
        if !self.components.broadcasters.is_empty() {
            match serde_json::to_value(&progress) {
                Ok(data) => self.broadcast(BroadcastEvent::Progress, &data),
                Err(e) => warn!(run_id = %self.run_id, error = %e, "progress not serializable"),
            }
        }
    }

    fn broadcast(&self, event: BroadcastEvent, data: &serde_json::Value) {
        for broadcaster in &self.components.broadcasters {
            if let Err(e) = broadcaster.publish(event, data) {
                warn!(run_id = %self.run_id, broadcaster = broadcaster.name(), error = %e, "broadcast failed");
            }
        }
    }

    async fn maybe_finalize(&mut self) {
        if self.result.is_none() && self.is_complete() {
            self.finalize().await;
        }
    }

    async fn finalize(&mut self) {
        let cancelled = self.cancelled;
        self.cancel.cancel();
        self.workers.clear();
        self.pending.clear();
        self.stream = None;

        let mut result = self.acc.finalize(cancelled, self.ctx.metadata.clone());
        for processor in &self.components.processors {
            if let Err(e) = processor.post_process(&mut result, &self.ctx) {
                warn!(run_id = %self.run_id, processor = processor.name(), error = %e, "post-processor failed");
            }
        }

        if !cancelled {
            for reporter in &self.components.reporters {
                if let Err(e) = reporter.handle_summary(&result, &self.ctx) {
                    warn!(run_id = %self.run_id, reporter = reporter.name(), error = %e, "summary reporter failed");
                }
            }
            for store in &self.components.stores {
                if let Err(e) = persist(store.as_ref(), &self.ctx, &result).await {
                    warn!(run_id = %self.run_id, store = store.name(), error = %e, "store failed");
                }
            }
        }

        let summary = serde_json::json!({
            "run_id": result.run_id,
            "sample_count": result.sample_count,
            "completed_count": result.completed_count,
            "error_count": result.error_count,
            "pass_rate": result.pass_rate,
            "duration_ms": result.duration_ms,
            "cancelled": cancelled,
        });
        self.broadcast(BroadcastEvent::Completed, &summary);

        self.telemetry.emit(
            TelemetryEvent::new(TelemetryEventName::RunStop, &self.run_id)
                .measure("duration_ms", result.duration_ms as f64)
                .measure("sample_count", result.sample_count as f64)
                .measure("error_count", result.error_count as f64)
                .measure("replacements", self.replacements as f64)
                .meta("cancelled", cancelled),
        );
        info!(
            run_id = %self.run_id,
            samples = result.sample_count,
            errors = result.error_count,
            duration_ms = result.duration_ms,
            cancelled,
            "run finished"
        );

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        self.result = Some(result);
        self.expires_at = Some(tokio::time::Instant::now() + self.retention);
    }

    fn progress(&self) -> Progress {
        let completed = self.acc.sample_count();
        let pending = match self.total {
            Some(total) => total.saturating_sub(completed),
            None => self.in_flight_count() + self.pending.len(),
        };
        Progress {
            run_id: self.run_id.clone(),
            total: self.total,
            completed,
            errors: self.acc.error_count(),
            pending,
            active_workers: self.workers.len(),
            elapsed_ms: self
                .result
                .as_ref()
                .map(|r| r.duration_ms)
                .unwrap_or_else(|| self.acc.elapsed_ms()),
            cancelled: self.cancelled,
            finished: self.result.is_some(),
        }
    }

    fn worker_infos(&self) -> Vec<WorkerInfo> {
        self.workers
            .iter()
            .map(|(id, slot)| WorkerInfo {
                worker_id: *id,
                state: if slot.in_flight.is_some() {
                    WorkerState::Busy
                } else {
                    WorkerState::Idle
                },
                sample_id: slot.in_flight.as_ref().map(|f| f.sample.id.clone()),
                busy_ms: slot.in_flight.as_ref().map(|f| elapsed_ms(f.started)),
            })
            .collect()
    }
}

async fn persist(store: &dyn Store, ctx: &RunContext, result: &EvalResult) -> anyhow::Result<()> {
    let mut session = store.init(ctx).await?;
    session.persist(result).await?;
    session.finalize().await
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn exit_reason(e: JoinError) -> String {
    if e.is_cancelled() {
        "killed".to_string()
    } else if e.is_panic() {
        let payload = e.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|s| format!("panicked: {}", s))
            .or_else(|| {
                payload
                    .downcast_ref::<String>()
                    .map(|s| format!("panicked: {}", s))
            })
            .unwrap_or_else(|| "panicked".to_string())
    } else {
        e.to_string()
    }
}
