//! A worker owns at most one in-flight sample and reports exactly one outcome
//! for every sample it accepts.

use super::processor::SampleProcessor;
use crate::model::{Sample, SampleResult};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Cancelled,
}

/// Messages a worker sends to its pool.
#[derive(Debug)]
pub(crate) enum WorkerReport {
    Completed {
        worker_id: WorkerId,
        result: SampleResult,
    },
    /// An assignment arrived while busy; the sample is handed back untouched.
    Rejected { worker_id: WorkerId, sample: Sample },
}

pub(crate) struct Worker {
    id: WorkerId,
    processor: Arc<SampleProcessor>,
    sample_timeout: Duration,
    assignments: mpsc::Receiver<Sample>,
    reports: mpsc::UnboundedSender<WorkerReport>,
    cancel: CancellationToken,
    state: WorkerState,
}

impl Worker {
    pub(crate) fn new(
        id: WorkerId,
        processor: Arc<SampleProcessor>,
        sample_timeout: Duration,
        assignments: mpsc::Receiver<Sample>,
        reports: mpsc::UnboundedSender<WorkerReport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            processor,
            sample_timeout,
            assignments,
            reports,
            cancel,
            state: WorkerState::Idle,
        }
    }

    /// Run until cancelled or until the pool drops the assignment channel.
    pub(crate) async fn run(mut self) {
        tracing::trace!(worker_id = self.id, "worker started");
        loop {
            let sample = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.assignments.recv() => match next {
                    Some(sample) => sample,
                    None => break,
                },
            };

            self.state = WorkerState::Busy;
            match self.process(sample).await {
                Some(result) => {
                    let report = WorkerReport::Completed {
                        worker_id: self.id,
                        result,
                    };
                    if self.reports.send(report).is_err() {
                        break;
                    }
                    self.state = WorkerState::Idle;
                }
                None => break,
            }
        }
        self.state = WorkerState::Cancelled;
        tracing::trace!(worker_id = self.id, state = ?self.state, "worker stopped");
    }

    /// Process one sample under the hard timeout. Returns `None` when cancelled;
    /// the in-flight work is dropped, which aborts it.
    async fn process(&mut self, sample: Sample) -> Option<SampleResult> {
        let started = Instant::now();
        let work = tokio::time::timeout(self.sample_timeout, self.processor.process(&sample));
        tokio::pin!(work);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                done = &mut work => {
                    return Some(match done {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::warn!(
                                worker_id = self.id,
                                sample_id = %sample.id,
                                timeout_ms = self.sample_timeout.as_millis() as u64,
                                "sample timed out"
                            );
                            SampleResult::failed(
                                &sample,
                                format!(
                                    "timeout: sample exceeded {}ms",
                                    self.sample_timeout.as_millis()
                                ),
                                elapsed_ms(started),
                            )
                        }
                    });
                }
                extra = self.assignments.recv() => match extra {
                    Some(other) => {
                        tracing::warn!(
                            worker_id = self.id,
                            sample_id = %other.id,
                            "assignment while busy, handing back"
                        );
                        let _ = self.reports.send(WorkerReport::Rejected {
                            worker_id: self.id,
                            sample: other,
                        });
                    }
                    None => return None,
                },
            }
        }
    }
}

pub(crate) fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}
