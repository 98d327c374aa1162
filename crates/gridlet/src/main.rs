//! gridlet command-line entry point.
//!
//! `gridlet serve` joins the grid and runs jobs for others until SIGINT or
//! SIGTERM. `gridlet run job.json` runs a single job, locally or on
//! `--target`, writes the result and exits 0 on success, 1 on failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use gridlet::config::DispatchMode;
use gridlet::credentials::{Credentials, StaticCredentials};
use gridlet::job::check_file_id;
use gridlet::{JobRequest, Node, NodeConfig, NodeHandle};

#[derive(Parser, Debug)]
#[command(name = "gridlet", version, about = "Peer-assisted compute grid node")]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the grid and serve jobs until terminated
    Serve,
    /// Run one job file and exit
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// Machine id announced to the relay (random when omitted)
    #[arg(long, env = "GRIDLET_MACHINE_ID", global = true)]
    machine_id: Option<String>,

    /// Display name
    #[arg(long, env = "GRIDLET_NAME", global = true)]
    name: Option<String>,

    /// Worker subprocess slots
    #[arg(long, env = "GRIDLET_THREADS", default_value_t = gridlet::config::DEFAULT_CAPACITY, global = true)]
    threads: usize,

    /// Frameworks to advertise (discovered from the worker directory when omitted)
    #[arg(long, env = "GRIDLET_FRAMEWORKS", value_delimiter = ',', global = true)]
    frameworks: Vec<String>,

    /// Relay websocket URL
    #[arg(long, env = "GRIDLET_RELAY_URL", global = true)]
    relay_url: Option<String>,

    /// JSON credentials file (`token`, `user_id`, `cdn`)
    #[arg(long, env = "GRIDLET_CREDENTIALS", global = true)]
    credentials: Option<PathBuf>,

    /// Relay connect retries after a failed first attempt
    #[arg(long, env = "GRIDLET_CONNECT_RETRIES", default_value_t = 0, global = true)]
    connect_retries: u32,

    /// Disable direct peer channels
    #[arg(long, env = "GRIDLET_NO_PEER", global = true)]
    no_peer: bool,

    /// Directory holding `worker.*` entry points and downloaded scripts
    #[arg(long, env = "GRIDLET_WORKER_DIR", default_value = ".", global = true)]
    worker_dir: PathBuf,

    /// Directory for side files and undeliverable results
    #[arg(long, env = "GRIDLET_OUTPUT_DIR", default_value = ".", global = true)]
    output_dir: PathBuf,

    /// Base URL for model sources
    #[arg(long, env = "GRIDLET_PUBLIC_URL", global = true)]
    public_url: Option<String>,

    /// Batch output size in bytes before spilling to a side file
    #[arg(long, env = "GRIDLET_SIDE_FILE_THRESHOLD", default_value_t = gridlet::config::DEFAULT_SIDE_FILE_THRESHOLD, global = true)]
    side_file_threshold: usize,

    /// Where accepted jobs execute
    #[arg(long, env = "GRIDLET_MODE", value_enum, default_value_t = Mode::Subprocess, global = true)]
    mode: Mode,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    /// Local worker subprocesses
    Subprocess,
    /// One sbatch job per request
    Slurm,
}

impl From<Mode> for DispatchMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Subprocess => DispatchMode::Subprocess,
            Mode::Slurm => DispatchMode::Slurm,
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Job request JSON file
    job: PathBuf,

    /// Machine id of the remote resource to run on
    #[arg(long)]
    target: Option<String>,

    /// Result path (default `<output-dir>/<request_id>.output`)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Seconds to wait for the target to appear
    #[arg(long, default_value_t = 60)]
    wait: u64,
}

impl NodeArgs {
    fn config(&self) -> NodeConfig {
        let mut config = NodeConfig::new()
            .with_capacity(self.threads)
            .with_frameworks(self.frameworks.iter().cloned())
            .with_connect_retries(self.connect_retries)
            .with_peer(!self.no_peer)
            .with_worker_dir(&self.worker_dir)
            .with_output_dir(&self.output_dir)
            .with_side_file_threshold(self.side_file_threshold)
            .with_mode(self.mode.into());
        if let Some(id) = &self.machine_id {
            config = config.with_machine_id(id);
            config = config.with_name(id);
        }
        if let Some(name) = &self.name {
            config = config.with_name(name);
        }
        if let Some(url) = &self.relay_url {
            config = config.with_relay_url(url);
        }
        if let Some(url) = &self.public_url {
            config = config.with_public_url(url);
        }
        config
    }

    fn credentials(&self) -> anyhow::Result<StaticCredentials> {
        match &self.credentials {
            Some(path) => Ok(StaticCredentials::new(Credentials::from_file(path)?)),
            None => Ok(StaticCredentials::anonymous()),
        }
    }
}

#[tokio::main]
async fn main() {
    gridlet::logging::init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("gridlet failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let credentials = Arc::new(cli.node.credentials()?);
    let mut config = cli.node.config();

    match cli.command {
        Command::Serve => {
            let (node, task) = Node::launch(config, credentials)?;
            info!(machine_id = %node.machine_id(), "Serving");
            shutdown_signal().await;
            node.shutdown().await;
            task.await?;
            Ok(())
        }
        Command::Run(args) => {
            if args.target.is_some() {
                // jobs go elsewhere; take none from the grid
                config.capacity = 0;
            }
            let (node, task) = Node::launch(config, credentials)?;
            let result = run_job(&node, &args, &cli.node.output_dir).await;
            node.shutdown().await;
            task.await?;
            result
        }
    }
}

async fn run_job(node: &NodeHandle, args: &RunArgs, output_dir: &Path) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(&args.job)
        .await
        .with_context(|| format!("reading {}", args.job.display()))?;
    let mut request: JobRequest =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", args.job.display()))?;
    if request.request_id.is_empty() {
        request.request_id = uuid::Uuid::new_v4().to_string();
    }
    check_file_id("request_id", &request.request_id)?;
    let request_id = request.request_id.clone();

    if let Some(target) = &args.target {
        tokio::time::timeout(Duration::from_secs(args.wait), node.wait_for_resource(target))
            .await
            .with_context(|| format!("resource {target} did not appear"))??;
    }

    let mut job = node.submit_to(request, args.target.as_deref()).await?;
    let mut steps = 0u64;
    let interrupted = shutdown_signal();
    tokio::pin!(interrupted);
    let outcome = loop {
        tokio::select! {
            step = job.next_progress() => match step {
                Some(_) => steps += 1,
                None => break job.wait().await,
            },
            _ = &mut interrupted => {
                node.terminate(&request_id).await?;
                bail!("interrupted");
            }
        }
    };

    let path = args
        .output
        .clone()
        .unwrap_or_else(|| output_dir.join(format!("{request_id}.output")));
    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            // an explicit output may be a pipe someone is blocked on
            if args.output.is_some() {
                let failure = serde_json::json!({ "error": e.to_string() });
                if let Err(write_err) = tokio::fs::write(&path, failure.to_string()).await {
                    tracing::warn!(error = %write_err, "Failed to report job failure");
                }
            }
            return Err(e.into());
        }
    };
    tokio::fs::write(&path, serde_json::to_vec_pretty(&result)?)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(%request_id, steps, path = %path.display(), "Job complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
