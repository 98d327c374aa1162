//! Completion handles for jobs submitted through a node.
//!
//! Every submitted job gets one entry keyed by `request_id`. Progress values
//! are forwarded to the caller while the job runs; the first resolution
//! removes the entry and completes the handle, later ones are ignored.

use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::node::NodeError;

/// Progress values buffered per job before further steps are dropped.
pub const PROGRESS_BUFFER: usize = 1024;

pub type JobResult = Result<Value, NodeError>;

/// Where a supervised job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTarget {
    Local,
    Remote { machine_id: String },
}

struct PendingJob {
    target: JobTarget,
    reply: oneshot::Sender<JobResult>,
    progress: mpsc::Sender<Value>,
    started_at: Instant,
}

/// Caller's side of a submitted job.
pub struct JobHandle {
    request_id: String,
    result: oneshot::Receiver<JobResult>,
    progress: mpsc::Receiver<Value>,
}

impl JobHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next streamed step. `None` once the job has finished and all
    /// buffered steps were consumed.
    pub async fn next_progress(&mut self) -> Option<Value> {
        self.progress.recv().await
    }

    /// Wait for the result. Unconsumed progress is discarded.
    pub async fn wait(self) -> JobResult {
        self.result.await.unwrap_or(Err(NodeError::Closed))
    }
}

#[derive(Default)]
pub struct JobSupervisor {
    jobs: DashMap<String, PendingJob>,
}

impl JobSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new job. Fails if `request_id` is already in flight.
    pub fn register(&self, request_id: &str, target: JobTarget) -> Result<JobHandle, NodeError> {
        let (reply, result) = oneshot::channel();
        let (progress_tx, progress) = mpsc::channel(PROGRESS_BUFFER);

        match self.jobs.entry(request_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(NodeError::DuplicateRequest(request_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PendingJob {
                    target,
                    reply,
                    progress: progress_tx,
                    started_at: Instant::now(),
                });
            }
        }

        Ok(JobHandle {
            request_id: request_id.to_string(),
            result,
            progress,
        })
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.jobs.contains_key(request_id)
    }

    pub fn target(&self, request_id: &str) -> Option<JobTarget> {
        self.jobs.get(request_id).map(|job| job.target.clone())
    }

    /// Sender for streaming a local job's progress with backpressure.
    pub fn progress_sender(&self, request_id: &str) -> Option<mpsc::Sender<Value>> {
        self.jobs.get(request_id).map(|job| job.progress.clone())
    }

    /// Forward one step without waiting. Steps beyond the buffer are dropped.
    pub fn progress(&self, request_id: &str, value: Value) -> bool {
        let Some(job) = self.jobs.get(request_id) else {
            return false;
        };
        match job.progress.try_send(value) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%request_id, "Progress buffer full, dropping step");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Complete a job. Returns `false` if it was unknown or already resolved.
    pub fn resolve(&self, request_id: &str, result: JobResult) -> bool {
        let Some((_, job)) = self.jobs.remove(request_id) else {
            return false;
        };
        tracing::info!(
            target: "gridlet::job",
            %request_id,
            success = result.is_ok(),
            elapsed_ms = job.started_at.elapsed().as_millis() as u64,
            "Job resolved"
        );
        let _ = job.reply.send(result);
        true
    }

    /// Reject every job running on `machine_id`.
    pub fn fail_remote(&self, machine_id: &str, reason: &str) -> usize {
        self.fail_matching(reason, |target| {
            matches!(target, JobTarget::Remote { machine_id: m } if m == machine_id)
        })
    }

    /// Reject every job running on any remote resource.
    pub fn fail_all_remote(&self, reason: &str) -> usize {
        self.fail_matching(reason, |target| matches!(target, JobTarget::Remote { .. }))
    }

    fn fail_matching(&self, reason: &str, select: impl Fn(&JobTarget) -> bool) -> usize {
        let ids: Vec<String> = self
            .jobs
            .iter()
            .filter(|job| select(&job.target))
            .map(|job| job.key().clone())
            .collect();
        for id in &ids {
            self.resolve(id, Err(NodeError::Undeliverable(reason.to_string())));
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolution_is_single_shot() {
        let supervisor = JobSupervisor::new();
        let handle = supervisor.register("r1", JobTarget::Local).unwrap();

        assert!(supervisor.resolve("r1", Ok(json!(1))));
        assert!(!supervisor.resolve("r1", Ok(json!(2))));

        assert_eq!(handle.wait().await.unwrap(), json!(1));
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn progress_flows_until_resolved() {
        let supervisor = JobSupervisor::new();
        let mut handle = supervisor.register("r1", JobTarget::Local).unwrap();

        assert!(supervisor.progress("r1", json!({"t": 0})));
        assert!(supervisor.progress("r1", json!({"t": 1})));
        supervisor.resolve("r1", Ok(json!({})));

        assert_eq!(handle.next_progress().await, Some(json!({"t": 0})));
        assert_eq!(handle.next_progress().await, Some(json!({"t": 1})));
        assert_eq!(handle.next_progress().await, None);
        assert_eq!(handle.wait().await.unwrap(), json!({}));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let supervisor = JobSupervisor::new();
        let _handle = supervisor.register("r1", JobTarget::Local).unwrap();
        assert!(matches!(
            supervisor.register("r1", JobTarget::Local),
            Err(NodeError::DuplicateRequest(_))
        ));
    }

    #[tokio::test]
    async fn fail_remote_rejects_only_that_machine() {
        let supervisor = JobSupervisor::new();
        let remote = JobTarget::Remote {
            machine_id: "m1".to_string(),
        };
        let a = supervisor.register("a", remote.clone()).unwrap();
        let _b = supervisor.register("b", JobTarget::Local).unwrap();

        assert_eq!(supervisor.fail_remote("m1", "relay gone"), 1);
        assert!(matches!(a.wait().await, Err(NodeError::Undeliverable(_))));
        assert!(supervisor.contains("b"));
        assert_eq!(supervisor.target("b"), Some(JobTarget::Local));
    }

    #[tokio::test]
    async fn fail_all_remote_keeps_local_jobs() {
        let supervisor = JobSupervisor::new();
        for (id, machine) in [("a", "m1"), ("b", "m2")] {
            let _ = supervisor.register(
                id,
                JobTarget::Remote {
                    machine_id: machine.to_string(),
                },
            );
        }
        let _local = supervisor.register("c", JobTarget::Local).unwrap();

        assert_eq!(supervisor.fail_all_remote("relay exhausted"), 2);
        assert_eq!(supervisor.len(), 1);
    }
}
