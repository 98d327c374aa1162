//! Fixed-capacity pool of worker subprocesses.
//!
//! A single actor task owns the slot array and the FIFO queue, so slot
//! assignment needs no locking. Each running job moves its [`WorkerProcess`]
//! into a task that reports back on a completion channel; on completion the
//! queue is consulted before the slot is marked empty:
//!
//! - queued job, same framework: the subprocess is reused
//! - queued job, other framework: the subprocess is terminated and replaced
//! - empty queue: the subprocess is terminated and the slot becomes empty

pub mod process;
pub mod spawner;

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

pub use process::WorkerProcess;
pub use spawner::{CommandSpawner, SpawnError, WorkerSpawner};

use crate::bridge::protocol::WorkerJob;

pub type JobReply = oneshot::Sender<Result<Value, PoolError>>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("worker pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker pipe missing: {0}")]
    Pipe(&'static str),
    #[error("{framework} worker exited before returning a result")]
    WorkerExited { framework: String },
    #[error("job {0} was cancelled")]
    Cancelled(String),
    #[error("worker pool has no slots")]
    NoCapacity,
    #[error("worker pool is shut down")]
    Closed,
}

/// What occupies one position of the slot array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSlot {
    Empty,
    Busy { request_id: String, framework: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub capacity: usize,
    pub active: usize,
    pub queued: usize,
    pub slots: Vec<WorkerSlot>,
}

enum PoolCommand {
    Submit(QueuedJob),
    Cancel {
        request_id: String,
        reply: oneshot::Sender<bool>,
    },
    Status(oneshot::Sender<PoolStatus>),
    Shutdown,
}

struct QueuedJob {
    job: WorkerJob,
    progress: Option<mpsc::Sender<Value>>,
    reply: JobReply,
}

struct ActiveJob {
    request_id: String,
    framework: String,
    /// Taken on cancel; the eventual result is then discarded.
    reply: Option<JobReply>,
}

struct Completion {
    slot: usize,
    request_id: String,
    /// `None` when the subprocess failed and must not be reused.
    process: Option<WorkerProcess>,
    result: Result<Value, PoolError>,
}

/// Handle to the pool actor. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    tx: mpsc::Sender<PoolCommand>,
    capacity: usize,
}

impl WorkerPool {
    /// Start the pool actor on the current runtime.
    pub fn start(capacity: usize, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let (done_tx, done_rx) = mpsc::channel(capacity.max(1));
        let actor = PoolActor {
            spawner,
            slots: (0..capacity).map(|_| None).collect(),
            queue: VecDeque::new(),
            done_tx,
        };
        tokio::spawn(actor.run(rx, done_rx));
        tracing::info!(capacity, "Worker pool started");
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hand a job to the pool and return the receiver for its result.
    ///
    /// Jobs dispatched in sequence are queued in that order.
    pub async fn dispatch(
        &self,
        job: WorkerJob,
        progress: Option<mpsc::Sender<Value>>,
    ) -> Result<oneshot::Receiver<Result<Value, PoolError>>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Submit(QueuedJob {
                job,
                progress,
                reply,
            }))
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(rx)
    }

    /// Run a job to completion, forwarding streamed steps to `progress`.
    pub async fn submit(
        &self,
        job: WorkerJob,
        progress: Option<mpsc::Sender<Value>>,
    ) -> Result<Value, PoolError> {
        self.dispatch(job, progress)
            .await?
            .await
            .map_err(|_| PoolError::Closed)?
    }

    /// Best-effort cancel. Returns whether the job was known to the pool.
    pub async fn cancel(&self, request_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = PoolCommand::Cancel {
            request_id: request_id.to_string(),
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Status(reply))
            .await
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Fail all waiting jobs and stop the actor. Running subprocesses are
    /// killed when their tasks drop them.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(PoolCommand::Shutdown).await;
    }
}

struct PoolActor {
    spawner: Arc<dyn WorkerSpawner>,
    slots: Vec<Option<ActiveJob>>,
    queue: VecDeque<QueuedJob>,
    done_tx: mpsc::Sender<Completion>,
}

impl PoolActor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<PoolCommand>,
        mut done_rx: mpsc::Receiver<Completion>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(done) = done_rx.recv() => self.on_completion(done),

                cmd = rx.recv() => match cmd {
                    Some(PoolCommand::Submit(job)) => self.on_submit(job),
                    Some(PoolCommand::Cancel { request_id, reply }) => {
                        let _ = reply.send(self.on_cancel(&request_id));
                    }
                    Some(PoolCommand::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(PoolCommand::Shutdown) | None => break,
                },
            }
        }

        for queued in self.queue.drain(..) {
            let _ = queued.reply.send(Err(PoolError::Closed));
        }
        for active in self.slots.iter_mut().flatten() {
            if let Some(reply) = active.reply.take() {
                let _ = reply.send(Err(PoolError::Closed));
            }
        }
        tracing::info!("Worker pool stopped");
    }

    fn status(&self) -> PoolStatus {
        let slots: Vec<WorkerSlot> = self
            .slots
            .iter()
            .map(|s| match s {
                Some(active) => WorkerSlot::Busy {
                    request_id: active.request_id.clone(),
                    framework: active.framework.clone(),
                },
                None => WorkerSlot::Empty,
            })
            .collect();
        PoolStatus {
            capacity: slots.len(),
            active: self.slots.iter().filter(|s| s.is_some()).count(),
            queued: self.queue.len(),
            slots,
        }
    }

    fn on_submit(&mut self, job: QueuedJob) {
        if self.slots.is_empty() {
            let _ = job.reply.send(Err(PoolError::NoCapacity));
            return;
        }
        match self.slots.iter().position(Option::is_none) {
            Some(slot) => {
                self.start_job(slot, None, job);
            }
            None => {
                tracing::debug!(
                    request_id = %job.job.request.request_id,
                    queued = self.queue.len() + 1,
                    "All slots busy, job queued"
                );
                self.queue.push_back(job);
            }
        }
    }

    /// Assign `queued` to `slot`, reusing `process` when its framework
    /// matches. Returns false (and fails the job) if no subprocess could be
    /// started.
    fn start_job(&mut self, slot: usize, process: Option<WorkerProcess>, queued: QueuedJob) -> bool {
        let QueuedJob {
            job,
            progress,
            reply,
        } = queued;
        let request_id = job.request.request_id.clone();
        let framework = job.request.framework.clone();

        let process = match process {
            Some(p) if p.framework() == framework => {
                tracing::debug!(slot, %framework, "Reusing worker");
                Ok(p)
            }
            other => {
                if let Some(stale) = other {
                    tokio::spawn(stale.terminate());
                }
                WorkerProcess::start(self.spawner.as_ref(), &framework, slot)
            }
        };
        let mut process = match process {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(slot, %request_id, %framework, error = %e, "Failed to start worker");
                let _ = reply.send(Err(e));
                return false;
            }
        };

        tracing::info!(
            target: "gridlet::job",
            slot,
            %request_id,
            %framework,
            mode = %job.request.mode(),
            "Job started"
        );
        self.slots[slot] = Some(ActiveJob {
            request_id: request_id.clone(),
            framework,
            reply: Some(reply),
        });

        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = process.run(job, progress.as_ref()).await;
            let process = if result.is_ok() {
                Some(process)
            } else {
                process.terminate().await;
                None
            };
            let _ = done_tx
                .send(Completion {
                    slot,
                    request_id,
                    process,
                    result,
                })
                .await;
        });
        true
    }

    fn on_completion(&mut self, done: Completion) {
        let Completion {
            slot,
            request_id,
            process,
            result,
        } = done;

        match self.slots.get_mut(slot).and_then(Option::take) {
            Some(ActiveJob {
                reply: Some(reply), ..
            }) => {
                tracing::info!(
                    target: "gridlet::job",
                    slot,
                    %request_id,
                    success = result.is_ok(),
                    "Job finished"
                );
                let _ = reply.send(result);
            }
            Some(_) => {
                tracing::debug!(slot, %request_id, "Discarding result of cancelled job");
            }
            None => {
                tracing::warn!(slot, %request_id, "Completion for empty slot");
            }
        }

        let mut process = process;
        while let Some(next) = self.queue.pop_front() {
            if self.start_job(slot, process.take(), next) {
                return;
            }
        }
        if let Some(idle) = process {
            tokio::spawn(idle.terminate());
        }
    }

    fn on_cancel(&mut self, request_id: &str) -> bool {
        if let Some(pos) = self
            .queue
            .iter()
            .position(|q| q.job.request.request_id == request_id)
            && let Some(queued) = self.queue.remove(pos)
        {
            tracing::debug!(%request_id, "Cancelled queued job");
            let _ = queued
                .reply
                .send(Err(PoolError::Cancelled(request_id.to_string())));
            return true;
        }

        for active in self.slots.iter_mut().flatten() {
            if active.request_id == request_id {
                if let Some(reply) = active.reply.take() {
                    tracing::debug!(%request_id, "Cancelled running job");
                    let _ = reply.send(Err(PoolError::Cancelled(request_id.to_string())));
                }
                return true;
            }
        }
        false
    }
}
