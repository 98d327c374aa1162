//! Node configuration.

use std::path::PathBuf;

use crate::batch::BatchConfig;
use crate::message::ResourceDescriptor;
use crate::{peer, relay};

pub const DEFAULT_CAPACITY: usize = 4;
pub const DEFAULT_RECEIVING_CAPACITY: usize = 1024;
pub const DEFAULT_SIDE_FILE_THRESHOLD: usize = 10 * 1024 * 1024;

const MACHINE_ID_LEN: usize = 6;

/// Random alphanumeric machine id.
pub fn random_machine_id() -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(MACHINE_ID_LEN)
        .collect()
}

/// Where jobs accepted by the node are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Local worker subprocesses.
    #[default]
    Subprocess,
    /// One `sbatch` job per request.
    Slurm,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub machine_id: String,
    pub name: String,
    pub kind: String,
    /// Worker subprocess slots.
    pub capacity: usize,
    /// Advertised frameworks. Discovered from the worker directory when empty.
    pub frameworks: Vec<String>,
    pub cost: f64,
    pub time_estimate: f64,
    pub relay_url: Option<String>,
    pub relay_frame_limit: usize,
    pub relay_compression_threshold: usize,
    pub connect_retries: u32,
    pub peer_enabled: bool,
    pub peer_frame_limit: usize,
    pub peer_compression_threshold: usize,
    pub ice_servers: Vec<String>,
    pub worker_dir: PathBuf,
    pub output_dir: PathBuf,
    pub public_url: Option<String>,
    pub receiving_capacity: usize,
    pub side_file_threshold: usize,
    pub mode: DispatchMode,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        let machine_id = random_machine_id();
        Self {
            name: machine_id.clone(),
            machine_id,
            kind: "node".to_string(),
            capacity: DEFAULT_CAPACITY,
            frameworks: Vec::new(),
            cost: 0.0,
            time_estimate: 0.0,
            relay_url: None,
            relay_frame_limit: relay::DEFAULT_FRAME_LIMIT,
            relay_compression_threshold: relay::DEFAULT_COMPRESSION_THRESHOLD,
            connect_retries: 0,
            peer_enabled: true,
            peer_frame_limit: peer::DEFAULT_FRAME_LIMIT,
            peer_compression_threshold: peer::DEFAULT_COMPRESSION_THRESHOLD,
            ice_servers: peer::rtc::default_ice_servers(),
            worker_dir: PathBuf::from("."),
            output_dir: PathBuf::from("."),
            public_url: None,
            receiving_capacity: DEFAULT_RECEIVING_CAPACITY,
            side_file_threshold: DEFAULT_SIDE_FILE_THRESHOLD,
            mode: DispatchMode::default(),
        }
    }

    pub fn with_machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = machine_id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_frameworks<I, S>(mut self, frameworks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.frameworks = frameworks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = Some(url.into());
        self
    }

    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn with_peer(mut self, enabled: bool) -> Self {
        self.peer_enabled = enabled;
        self
    }

    pub fn with_worker_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.worker_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = Some(url.into());
        self
    }

    pub fn with_receiving_capacity(mut self, capacity: usize) -> Self {
        self.receiving_capacity = capacity;
        self
    }

    pub fn with_side_file_threshold(mut self, bytes: usize) -> Self {
        self.side_file_threshold = bytes;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Descriptor announced to the relay for this node.
    pub fn local_descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor {
            machine_id: self.machine_id.clone(),
            connection_id: None,
            kind: self.kind.clone(),
            name: self.name.clone(),
            capacity: self.capacity as u32,
            cost: self.cost,
            time_estimate: self.time_estimate,
            frameworks: self.frameworks.clone(),
        }
    }

    pub fn relay_config(&self, url: &str, token: Option<String>) -> relay::RelayConfig {
        let mut config = relay::RelayConfig::new(url, self.local_descriptor());
        config.token = token;
        config.frame_limit = self.relay_frame_limit;
        config.compression_threshold = self.relay_compression_threshold;
        config.connect_retries = self.connect_retries;
        config
    }

    pub fn peer_config(&self) -> peer::PeerConfig {
        peer::PeerConfig {
            frame_limit: self.peer_frame_limit,
            compression_threshold: self.peer_compression_threshold,
        }
    }

    /// Batch submission running `program` on the compute node with this
    /// node's worker settings. The compute node always uses local workers.
    pub fn batch_config(&self, program: impl Into<PathBuf>) -> BatchConfig {
        let mut config = BatchConfig::new(program, &self.output_dir);
        config.ntasks = self.capacity;
        config.node_args = vec![
            "--threads".to_string(),
            self.capacity.to_string(),
            "--worker-dir".to_string(),
            self.worker_dir.display().to_string(),
            "--output-dir".to_string(),
            self.output_dir.display().to_string(),
            "--mode".to_string(),
            "subprocess".to_string(),
            "--no-peer".to_string(),
        ];
        if let Some(url) = &self.public_url {
            config.node_args.extend(["--public-url".to_string(), url.clone()]);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_short_alphanumeric() {
        let id = random_machine_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_machine_id(), random_machine_id());
    }

    #[test]
    fn defaults() {
        let config = NodeConfig::new();
        assert_eq!(config.capacity, 4);
        assert_eq!(config.receiving_capacity, 1024);
        assert_eq!(config.relay_frame_limit, 30 * 1024);
        assert_eq!(config.peer_frame_limit, 256 * 1024);
        assert_eq!(config.connect_retries, 0);
        assert_eq!(config.name, config.machine_id);
    }

    #[test]
    fn builder_feeds_descriptor_and_relay_config() {
        let config = NodeConfig::new()
            .with_machine_id("abc123")
            .with_name("lab")
            .with_capacity(2)
            .with_frameworks(["py", "js"])
            .with_connect_retries(3);

        let desc = config.local_descriptor();
        assert_eq!(desc.machine_id, "abc123");
        assert_eq!(desc.capacity, 2);
        assert_eq!(desc.frameworks, vec!["py", "js"]);

        let relay = config.relay_config("wss://relay", Some("t".to_string()));
        assert_eq!(relay.connect_retries, 3);
        assert_eq!(relay.token.as_deref(), Some("t"));
        assert_eq!(relay.local, desc);
    }

    #[test]
    fn batch_jobs_run_local_workers() {
        let config = NodeConfig::new()
            .with_capacity(8)
            .with_output_dir("/scratch/out")
            .with_mode(DispatchMode::Slurm);

        let batch = config.batch_config("/opt/gridlet");
        assert_eq!(batch.ntasks, 8);
        assert_eq!(batch.work_dir, PathBuf::from("/scratch/out"));
        assert!(
            batch
                .node_args
                .windows(2)
                .any(|w| w[0] == "--mode" && w[1] == "subprocess")
        );
        assert!(batch.node_args.windows(2).any(|w| w[0] == "--threads" && w[1] == "8"));
    }
}
