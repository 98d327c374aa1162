//! A live worker subprocess bound to one framework.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::PoolError;
use super::spawner::WorkerSpawner;
use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{WorkerJob, WorkerRequest, WorkerResponse};

/// Time a worker gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

pub struct WorkerProcess {
    slot: usize,
    framework: String,
    child: Child,
    writer: FramedWrite<ChildStdin, JsonLinesCodec<WorkerRequest>>,
    reader: FramedRead<ChildStdout, JsonLinesCodec<WorkerResponse>>,
}

impl WorkerProcess {
    pub fn start(
        spawner: &dyn WorkerSpawner,
        framework: &str,
        slot: usize,
    ) -> Result<Self, PoolError> {
        let mut child = spawner.spawn(framework)?;
        let stdin = child
            .stdin
            .take()
            .ok_or(PoolError::Pipe("stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(PoolError::Pipe("stdout not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            let framework = framework.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "gridlet::worker", slot, %framework, "{}", line);
                }
            });
        }

        tracing::debug!(slot, framework, pid = ?child.id(), "Worker spawned");
        Ok(Self {
            slot,
            framework: framework.to_string(),
            child,
            writer: FramedWrite::new(stdin, JsonLinesCodec::new()),
            reader: FramedRead::new(stdout, JsonLinesCodec::new()),
        })
    }

    pub fn framework(&self) -> &str {
        &self.framework
    }

    /// Run one job to its `result`, forwarding `dynamics` to `progress`.
    ///
    /// Progress sends wait for the receiver, so a slow consumer slows the
    /// worker down through its stdout pipe. A dropped receiver is ignored.
    pub async fn run(
        &mut self,
        job: WorkerJob,
        progress: Option<&mpsc::Sender<Value>>,
    ) -> Result<Value, PoolError> {
        self.writer.send(WorkerRequest::Job { request: job }).await?;
        loop {
            match self.reader.next().await {
                Some(Ok(WorkerResponse::Dynamics { data })) => {
                    if let Some(tx) = progress {
                        let _ = tx.send(data).await;
                    }
                }
                Some(Ok(WorkerResponse::Result { data })) => return Ok(data),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(PoolError::WorkerExited {
                        framework: self.framework.clone(),
                    });
                }
            }
        }
    }

    /// Close stdin, send SIGTERM, and kill if the process outlives the grace period.
    pub async fn terminate(self) {
        let Self {
            slot,
            framework,
            mut child,
            writer,
            reader,
        } = self;
        drop(writer);
        drop(reader);

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(slot, %framework, error = %e, "SIGTERM failed");
            }
        }

        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(slot, %framework, %status, "Worker exited");
            }
            _ => {
                tracing::warn!(slot, %framework, "Worker did not exit, killing");
                let _ = child.kill().await;
            }
        }
    }
}
