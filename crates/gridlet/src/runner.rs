//! Runs a [`JobRequest`] on the local worker pool.
//!
//! Resolves the entry script, then dispatches by mode. Batched jobs run their
//! `collection` one sweep at a time and concatenate the results; once the
//! accumulated output grows past the side-file threshold it is spilled to
//! `<output_dir>/<request_id>.jsonl` and the job returns a single reference
//! descriptor `[{"filename", "n", "bytes"}]` instead.
//!
//! With a [`BatchScheduler`] attached, jobs are handed to Slurm whole and the
//! compute node resolves the script itself.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchError, BatchScheduler};
use crate::bridge::protocol::WorkerJob;
use crate::credentials::CredentialsProvider;
use crate::job::{InvalidId, JobMode, JobRequest, check_file_id};
use crate::pool::{PoolError, WorkerPool};
use crate::sources::{SourceError, SourceLoader};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error("job {0} was cancelled")]
    Cancelled(String),
    #[error("failed to write job output: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode job output: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct JobRunner {
    pool: WorkerPool,
    sources: SourceLoader,
    credentials: Arc<dyn CredentialsProvider>,
    output_dir: PathBuf,
    side_file_threshold: usize,
    batch: Option<Arc<BatchScheduler>>,
    inflight: Arc<DashMap<String, CancellationToken>>,
}

impl JobRunner {
    pub fn new(
        pool: WorkerPool,
        sources: SourceLoader,
        credentials: Arc<dyn CredentialsProvider>,
        output_dir: impl Into<PathBuf>,
        side_file_threshold: usize,
    ) -> Self {
        Self {
            pool,
            sources,
            credentials,
            output_dir: output_dir.into(),
            side_file_threshold,
            batch: None,
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Send jobs to `scheduler` instead of the local pool.
    pub fn with_batch(mut self, scheduler: BatchScheduler) -> Self {
        self.batch = Some(Arc::new(scheduler));
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Register `request_id` as in flight so a [`cancel`](Self::cancel) issued
    /// before [`run`](Self::run) starts still applies.
    pub fn track(&self, request_id: &str) -> CancellationToken {
        self.inflight
            .entry(request_id.to_string())
            .or_default()
            .clone()
    }

    /// Stop `request_id` wherever it is: downloading, between batches, or
    /// running in a worker. Returns whether anything was stopped.
    pub async fn cancel(&self, request_id: &str) -> bool {
        let tracked = match self.inflight.get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        self.pool.cancel(request_id).await || tracked
    }

    pub async fn run(
        &self,
        request: JobRequest,
        progress: Option<mpsc::Sender<Value>>,
    ) -> Result<Value, JobError> {
        let request_id = request.request_id.clone();
        let _inflight = Inflight {
            map: self.inflight.clone(),
            request_id: request_id.clone(),
        };
        check_file_id("request_id", &request_id)?;
        let cancel = self.track(&request_id);

        let credentials = request
            .credentials
            .clone()
            .or_else(|| self.credentials.credentials());

        if let Some(batch) = &self.batch {
            return match batch.run(&request, credentials, &cancel).await {
                Err(BatchError::Cancelled) => Err(JobError::Cancelled(request_id)),
                other => Ok(other?),
            };
        }

        let script = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobError::Cancelled(request_id)),
            script = self.sources.resolve(&request.sources, credentials.as_ref()) => script?,
        };

        match request.mode() {
            JobMode::Batched => self.run_batched(request, script, &cancel).await,
            _ => {
                // cancelled after download, before the pool knew about it
                if cancel.is_cancelled() {
                    return Err(JobError::Cancelled(request_id));
                }
                Ok(self
                    .pool
                    .submit(WorkerJob { request, script }, progress)
                    .await?)
            }
        }
    }

    async fn run_batched(
        &self,
        request: JobRequest,
        script: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Value, JobError> {
        let mut sweep = request.clone();
        sweep.collection = None;

        let mut output = BatchOutput::new(
            self.output_dir.join(format!("{}.jsonl", request.request_id)),
            self.side_file_threshold,
        );
        for (i, batch) in request.collection.into_iter().flatten().enumerate() {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled(request.request_id));
            }
            tracing::debug!(request_id = %request.request_id, batch = i, size = batch.len(), "Running batch");
            sweep.variable_params = Some(batch);
            let result = self
                .pool
                .submit(
                    WorkerJob {
                        request: sweep.clone(),
                        script: script.clone(),
                    },
                    None,
                )
                .await?;
            match result {
                Value::Array(items) => {
                    for item in items {
                        output.push(item).await?;
                    }
                }
                other => output.push(other).await?,
            }
        }
        output.finish().await
    }
}

/// Drops the cancellation entry when a run ends.
struct Inflight {
    map: Arc<DashMap<String, CancellationToken>>,
    request_id: String,
}

impl Drop for Inflight {
    fn drop(&mut self) {
        self.map.remove(&self.request_id);
    }
}

/// Accumulates batch results inline until they outgrow the threshold.
struct BatchOutput {
    path: PathBuf,
    threshold: usize,
    items: Vec<Value>,
    n: usize,
    bytes: usize,
    file: Option<tokio::fs::File>,
}

impl BatchOutput {
    fn new(path: PathBuf, threshold: usize) -> Self {
        Self {
            path,
            threshold,
            items: Vec::new(),
            n: 0,
            bytes: 0,
            file: None,
        }
    }

    async fn push(&mut self, item: Value) -> Result<(), JobError> {
        let mut line = serde_json::to_vec(&item)?;
        line.push(b'\n');
        self.n += 1;
        self.bytes += line.len();

        if let Some(file) = &mut self.file {
            file.write_all(&line).await?;
            return Ok(());
        }

        self.items.push(item);
        if self.bytes > self.threshold {
            self.spill().await?;
        }
        Ok(())
    }

    async fn spill(&mut self) -> Result<(), JobError> {
        tracing::info!(
            path = %self.path.display(),
            bytes = self.bytes,
            "Batch output over threshold, writing side file"
        );
        let mut file = tokio::fs::File::create(&self.path).await?;
        for item in self.items.drain(..) {
            let mut line = serde_json::to_vec(&item)?;
            line.push(b'\n');
            file.write_all(&line).await?;
        }
        self.file = Some(file);
        Ok(())
    }

    async fn finish(self) -> Result<Value, JobError> {
        match self.file {
            Some(mut file) => {
                file.flush().await?;
                Ok(json!([{
                    "filename": self.path.display().to_string(),
                    "n": self.n,
                    "bytes": self.bytes,
                }]))
            }
            None => Ok(Value::Array(self.items)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::pool::{SpawnError, WorkerSpawner};
    use std::path::Path;
    use std::process::Stdio;
    use tokio::process::{Child, Command};

    /// Answers each job with its `variable_params` entries as the result.
    const SCRIPT: &str = r#"
while IFS= read -r line; do
  vals=$(printf '%s\n' "$line" | sed -n 's/.*"variable_params":\[\([^]]*\)\].*/\1/p')
  printf '{"type":"result","data":[%s]}\n' "$vals"
done
"#;

    struct EchoSpawner(PathBuf);

    impl WorkerSpawner for EchoSpawner {
        fn spawn(&self, _framework: &str) -> Result<Child, SpawnError> {
            Ok(Command::new("sh")
                .arg(&self.0)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()?)
        }

        fn frameworks(&self) -> Vec<String> {
            vec!["sh".to_string()]
        }
    }

    fn runner(dir: &Path, threshold: usize) -> JobRunner {
        let script = dir.join("echo.sh");
        std::fs::write(&script, SCRIPT).unwrap();
        JobRunner::new(
            WorkerPool::start(1, Arc::new(EchoSpawner(script))),
            SourceLoader::disabled(),
            Arc::new(StaticCredentials::anonymous()),
            dir,
            threshold,
        )
    }

    fn batched(batches: &[&[u32]]) -> JobRequest {
        serde_json::from_value(json!({
            "request_id": "batch-1",
            "framework": "sh",
            "collection": batches
                .iter()
                .map(|b| b.iter().map(|v| json!({"v": v})).collect::<Vec<_>>())
                .collect::<Vec<_>>()
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn batches_are_concatenated_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path(), 1024);

        let result = runner.run(batched(&[&[1, 2], &[3], &[4, 5]]), None).await.unwrap();

        assert_eq!(
            result,
            json!([{"v": 1}, {"v": 2}, {"v": 3}, {"v": 4}, {"v": 5}])
        );
        assert!(!dir.path().join("batch-1.jsonl").exists());
    }

    #[tokio::test]
    async fn oversized_output_goes_to_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path(), 16);

        let result = runner.run(batched(&[&[1, 2], &[3, 4]]), None).await.unwrap();

        let path = dir.path().join("batch-1.jsonl");
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "{\"v\":1}\n{\"v\":2}\n{\"v\":3}\n{\"v\":4}\n");
        assert_eq!(
            result,
            json!([{
                "filename": path.display().to_string(),
                "n": 4,
                "bytes": written.len(),
            }])
        );
    }

    #[tokio::test]
    async fn request_id_cannot_escape_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = dir.path().join("outputs");
        std::fs::create_dir(&outputs).unwrap();
        let runner = runner(&outputs, 4);

        let mut request = batched(&[&[1, 2], &[3, 4]]);
        request.request_id = "../escaped".to_string();
        let err = runner.run(request, None).await.unwrap_err();

        assert!(matches!(err, JobError::InvalidId(_)));
        assert!(!dir.path().join("escaped.jsonl").exists());
        assert!(!outputs.join("escaped.jsonl").exists());
    }

    #[tokio::test]
    async fn cancel_stops_job_while_source_downloads() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("echo never")
                    .set_delay(std::time::Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo.sh");
        std::fs::write(&script, SCRIPT).unwrap();
        let runner = JobRunner::new(
            WorkerPool::start(1, Arc::new(EchoSpawner(script))),
            SourceLoader::remote(server.uri(), dir.path()).unwrap(),
            Arc::new(StaticCredentials::anonymous()),
            dir.path(),
            1024,
        );
        let request: JobRequest = serde_json::from_value(json!({
            "request_id": "slow-1",
            "framework": "sh",
            "sources": [{"model_id": "slow", "framework": "sh"}],
            "variable_params": [{"v": 1}]
        }))
        .unwrap();

        let job = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(request, None).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(runner.cancel("slow-1").await);

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), job)
            .await
            .expect("job did not stop")
            .unwrap();
        assert!(matches!(outcome, Err(JobError::Cancelled(id)) if id == "slow-1"));
        assert!(!runner.cancel("slow-1").await);
        assert!(!dir.path().join("script__slow.sh").exists());
    }

    #[tokio::test]
    async fn cancel_before_start_applies() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path(), 1024);

        runner.track("batch-1");
        assert!(runner.cancel("batch-1").await);
        let outcome = runner.run(batched(&[&[1]]), None).await;

        assert!(matches!(outcome, Err(JobError::Cancelled(_))));
    }
}
