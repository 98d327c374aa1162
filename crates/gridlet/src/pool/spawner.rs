//! Worker subprocess spawning.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("no worker command for framework {0:?}")]
    UnknownFramework(String),
}

/// Extension point for different worker spawn strategies.
///
/// The returned child must have piped stdin and stdout; stderr is optional
/// and forwarded to logs when piped.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, framework: &str) -> Result<Child, SpawnError>;

    /// Frameworks this spawner can start.
    fn frameworks(&self) -> Vec<String>;
}

/// Interpreter command per framework, run from the worker directory.
fn default_commands() -> BTreeMap<String, Vec<String>> {
    [
        ("js", ["node", "worker.js"]),
        ("node.js", ["node", "worker.node.js"]),
        ("py", ["python3", "worker.py"]),
        ("R", ["Rscript", "worker.R"]),
    ]
    .into_iter()
    .map(|(fw, cmd)| (fw.to_string(), cmd.iter().map(|s| s.to_string()).collect()))
    .collect()
}

/// Spawns `worker.<framework>` scripts through their interpreters.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    worker_dir: PathBuf,
    commands: BTreeMap<String, Vec<String>>,
}

impl CommandSpawner {
    /// Spawner knowing the built-in interpreter commands.
    pub fn new(worker_dir: impl Into<PathBuf>) -> Self {
        Self {
            worker_dir: worker_dir.into(),
            commands: default_commands(),
        }
    }

    /// Spawner limited to the `worker.*` files present in `worker_dir`.
    ///
    /// Files for frameworks without a known command are skipped with a warning.
    pub fn discover(worker_dir: impl Into<PathBuf>) -> Result<Self, SpawnError> {
        let worker_dir = worker_dir.into();
        let known = default_commands();
        let mut commands = BTreeMap::new();

        for entry in std::fs::read_dir(&worker_dir)? {
            let name = entry?.file_name();
            let Some(framework) = name.to_str().and_then(|n| n.strip_prefix("worker.")) else {
                continue;
            };
            match known.get(framework) {
                Some(cmd) => {
                    commands.insert(framework.to_string(), cmd.clone());
                }
                None => {
                    tracing::warn!(framework, "Worker file without a known interpreter, skipping");
                }
            }
        }

        tracing::info!(
            worker_dir = %worker_dir.display(),
            frameworks = ?commands.keys().collect::<Vec<_>>(),
            "Discovered worker frameworks"
        );
        Ok(Self {
            worker_dir,
            commands,
        })
    }

    /// Override or add the command for a framework.
    pub fn with_command<I, S>(mut self, framework: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.insert(
            framework.into(),
            command.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn worker_dir(&self) -> &Path {
        &self.worker_dir
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, framework: &str) -> Result<Child, SpawnError> {
        let (program, args) = self
            .commands
            .get(framework)
            .and_then(|cmd| cmd.split_first())
            .ok_or_else(|| SpawnError::UnknownFramework(framework.to_string()))?;

        let child = Command::new(program)
            .args(args)
            .current_dir(&self.worker_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    fn frameworks(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }
}
