//! Job dispatch through a Slurm cluster instead of the local pool.
//!
//! Each job is written with its credentials to `<work_dir>/<request_id>.request`
//! and a fifo is created at `<work_dir>/<request_id>.output`. `sbatch --wrap`
//! then runs `gridlet ... run --output <fifo> <request file>` on a compute
//! node, and the result is read back from the fifo. Both files are removed
//! when the job ends, whatever the outcome.
//!
//! The batch job reports only its final result; streaming steps are not
//! forwarded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::random_machine_id;
use crate::credentials::Credentials;
use crate::job::JobRequest;

pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MEMORY: &str = "1G";

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch dispatch is only available on unix hosts")]
    Unsupported,
    #[error("failed to prepare batch job: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to create result fifo: {0}")]
    Fifo(String),
    #[error("failed to encode batch job: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sbatch exited with {status}: {stderr}")]
    Submit {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("batch job sent no result within {0:?}")]
    TimedOut(Duration),
    #[error("batch job was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Submission command and any leading arguments.
    pub sbatch: Vec<String>,
    /// gridlet binary run on the compute node.
    pub program: PathBuf,
    /// Node flags placed before `run`.
    pub node_args: Vec<String>,
    pub work_dir: PathBuf,
    pub ntasks: usize,
    pub memory: String,
    /// Slurm `--time`; also how long to wait for the result.
    pub time_limit: Duration,
}

impl BatchConfig {
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            sbatch: vec!["sbatch".to_string()],
            program: program.into(),
            node_args: Vec::new(),
            work_dir: work_dir.into(),
            ntasks: 1,
            memory: DEFAULT_MEMORY.to_string(),
            time_limit: DEFAULT_TIME_LIMIT,
        }
    }
}

pub struct BatchScheduler {
    config: BatchConfig,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Submit `request` and wait for its result.
    pub async fn run(
        &self,
        request: &JobRequest,
        credentials: Option<Credentials>,
        cancel: &CancellationToken,
    ) -> Result<Value, BatchError> {
        let request_id = request.request_id.as_str();
        let request_path = self.config.work_dir.join(format!("{request_id}.request"));
        let result_path = self.config.work_dir.join(format!("{request_id}.output"));

        let mut job = request.clone();
        job.credentials = credentials;
        tokio::fs::write(&request_path, serde_json::to_vec(&job)?).await?;
        let _cleanup = Cleanup(vec![request_path.clone(), result_path.clone()]);
        make_fifo(&result_path)?;

        let (submit, leading) = self
            .config
            .sbatch
            .split_first()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty sbatch command")
            })?;
        let output = Command::new(submit)
            .args(leading)
            .args(self.sbatch_args(&request_path, &result_path))
            .output()
            .await?;
        if !output.status.success() {
            return Err(BatchError::Submit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        tracing::info!(
            target: "gridlet::job",
            %request_id,
            sbatch = %String::from_utf8_lossy(&output.stdout).trim(),
            "Batch job submitted"
        );

        let limit = self.config.time_limit;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                release_reader(&result_path);
                Err(BatchError::Cancelled)
            }
            _ = tokio::time::sleep(limit) => {
                release_reader(&result_path);
                Err(BatchError::TimedOut(limit))
            }
            bytes = tokio::fs::read(&result_path) => Ok(serde_json::from_slice(&bytes?)?),
        }
    }

    fn sbatch_args(&self, request_path: &Path, result_path: &Path) -> Vec<String> {
        let config = &self.config;
        let mut command = vec![config.program.display().to_string()];
        command.extend(config.node_args.iter().cloned());
        command.extend([
            "--machine-id".to_string(),
            random_machine_id(),
            "run".to_string(),
            "--output".to_string(),
            result_path.display().to_string(),
            request_path.display().to_string(),
        ]);
        let wrap: Vec<String> = command.iter().map(|arg| shell_quote(arg)).collect();

        vec![
            format!("--time={}", slurm_time(config.time_limit)),
            format!("--mem={}", config.memory),
            format!("--ntasks={}", config.ntasks),
            format!("--wrap={}", wrap.join(" ")),
        ]
    }
}

/// Removes the job's files when dispatch ends.
struct Cleanup(Vec<PathBuf>);

impl Drop for Cleanup {
    fn drop(&mut self) {
        for path in &self.0 {
            if let Err(e) = std::fs::remove_file(path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::debug!(path = %path.display(), error = %e, "Failed to remove batch file");
            }
        }
    }
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> Result<(), BatchError> {
    use nix::sys::stat::Mode;

    if path.exists() {
        std::fs::remove_file(path)?;
    }
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| BatchError::Fifo(e.to_string()))
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> Result<(), BatchError> {
    Err(BatchError::Unsupported)
}

/// Wake a reader blocked opening the fifo: open and close the write end.
#[cfg(unix)]
fn release_reader(path: &Path) {
    use std::os::unix::fs::OpenOptionsExt;

    let _ = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
        .open(path);
}

#[cfg(not(unix))]
fn release_reader(_path: &Path) {}

fn slurm_time(limit: Duration) -> String {
    let secs = limit.as_secs().max(60);
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
