//! Task dispatch: lease a worker, run one task, resolve exactly once

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parallite_ipc::{encode_failure, Submission, WorkerReply};

use crate::error::ExecutionError;
use crate::executor::{Executor, FailMode};
use crate::pool::WorkerPool;
use crate::registry::{Registration, TaskRegistry};
use crate::worker::WorkerProcess;

/// Runs submissions against the worker pool.
///
/// Errors never propagate past this type: every failure is converted into
/// a response envelope for the client. The pool lock is never held while a
/// leased worker's stdio is in use.
pub struct Dispatcher {
    pool: WorkerPool,
    registry: Arc<TaskRegistry>,
    fail_mode: FailMode,
    /// Cancelled to ask the supervisor for shutdown (`fail_mode = stop`).
    shutdown_trigger: CancellationToken,
    timeout_ms: u64,
}

enum ExchangeOutcome {
    Done(Result<Bytes, ExecutionError>),
    DeadlineFired,
}

impl Dispatcher {
    pub fn new(
        pool: WorkerPool,
        registry: Arc<TaskRegistry>,
        fail_mode: FailMode,
        shutdown_trigger: CancellationToken,
    ) -> Self {
        let timeout_ms = registry.timeout().as_millis() as u64;
        Self {
            pool,
            registry,
            fail_mode,
            shutdown_trigger,
            timeout_ms,
        }
    }

    async fn dispatch_inner(&self, submission: Submission) -> Bytes {
        let task_id = submission.task_id().to_owned();

        let registration = match self.registry.register(&task_id) {
            Ok(registration) => registration,
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "submission refused");
                return encode_failure(&task_id, &e.to_string());
            }
        };

        // The deadline covers the wait for a worker as well as execution.
        let worker = match self.pool.lease(registration.expired_token()).await {
            Ok(worker) => worker,
            Err(ExecutionError::Cancelled) => {
                debug!(task_id = %task_id, "deadline fired while waiting for a worker");
                return self.expired_response(&task_id);
            }
            Err(e @ ExecutionError::ShuttingDown) => {
                registration.try_complete();
                return encode_failure(&task_id, &e.to_string());
            }
            Err(e) => {
                registration.try_complete();
                self.note_worker_failure();
                warn!(task_id = %task_id, error = %e, "worker lease failed");
                return encode_failure(&task_id, &e.to_string());
            }
        };

        // The deadline may have fired between the lease grant and here; the
        // worker did nothing yet, so it goes straight back.
        if registration.is_expired() {
            self.pool.release(worker);
            return self.expired_response(&task_id);
        }

        let mut worker = worker;
        debug!(task_id = %task_id, worker = %worker.id(), "dispatching task");
        match run_exchange(&mut worker, &submission, &registration).await {
            ExchangeOutcome::Done(Ok(frame)) => {
                self.finish_with_reply(&registration, worker, &task_id, frame)
            }
            ExchangeOutcome::Done(Err(e)) => {
                self.pool.recycle(worker);
                self.note_worker_failure();
                warn!(task_id = %task_id, error = %e, "worker exchange failed");
                if registration.try_complete() {
                    encode_failure(&task_id, &e.to_string())
                } else {
                    self.expired_response(&task_id)
                }
            }
            ExchangeOutcome::DeadlineFired => {
                // The worker's response is still pending; it cannot be
                // reused, so the deadline costs it its process.
                self.pool.recycle(worker);
                self.note_worker_failure();
                self.expired_response(&task_id)
            }
        }
    }

    fn finish_with_reply(
        &self,
        registration: &Registration,
        worker: WorkerProcess,
        task_id: &str,
        frame: Bytes,
    ) -> Bytes {
        match WorkerReply::decode(frame) {
            Ok(reply) if reply.task_id() == task_id => {
                if registration.try_complete() {
                    if !reply.ok() {
                        debug!(task_id = %task_id, "worker reported task failure");
                    }
                    self.pool.release(worker);
                    reply.into_raw()
                } else {
                    // The deadline won the race; the late reply is dropped.
                    self.pool.recycle(worker);
                    self.expired_response(task_id)
                }
            }
            Ok(reply) => {
                let detail = format!(
                    "response task_id {:?} does not match {:?}",
                    reply.task_id(),
                    task_id
                );
                self.fail_reply(registration, worker, task_id, &detail)
            }
            Err(e) => {
                let detail = format!("malformed response: {e}");
                self.fail_reply(registration, worker, task_id, &detail)
            }
        }
    }

    fn fail_reply(
        &self,
        registration: &Registration,
        worker: WorkerProcess,
        task_id: &str,
        detail: &str,
    ) -> Bytes {
        warn!(task_id = %task_id, worker = %worker.id(), detail, "worker response rejected");
        self.pool.recycle(worker);
        self.note_worker_failure();
        if registration.try_complete() {
            encode_failure(task_id, &format!("worker execute failed: {detail}"))
        } else {
            self.expired_response(task_id)
        }
    }

    fn expired_response(&self, task_id: &str) -> Bytes {
        encode_failure(
            task_id,
            &ExecutionError::Timeout {
                timeout_ms: self.timeout_ms,
            }
            .to_string(),
        )
    }

    fn note_worker_failure(&self) {
        if self.fail_mode == FailMode::Stop {
            warn!("worker failure with fail-mode stop, requesting shutdown");
            self.shutdown_trigger.cancel();
        }
    }
}

/// Race the worker exchange against the task deadline.
async fn run_exchange(
    worker: &mut WorkerProcess,
    submission: &Submission,
    registration: &Registration,
) -> ExchangeOutcome {
    tokio::select! {
        result = worker.execute(submission.raw()) => ExchangeOutcome::Done(result),
        _ = registration.expired_token().cancelled() => ExchangeOutcome::DeadlineFired,
    }
}

#[async_trait]
impl Executor for Dispatcher {
    async fn dispatch(&self, submission: Submission) -> Bytes {
        self.dispatch_inner(submission).await
    }
}
