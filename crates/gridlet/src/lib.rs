//! gridlet: peer-assisted compute grid.
//!
//! A node runs jobs on a fixed-capacity pool of worker subprocesses and
//! exchanges jobs with remote nodes, through a relay or over direct WebRTC
//! data channels once negotiated.

pub mod batch;
pub mod bridge;
pub mod config;
pub mod credentials;
pub mod envelope;
pub mod job;
pub mod logging;
pub mod message;
pub mod node;
pub mod peer;
pub mod pool;
pub mod registry;
pub mod relay;
pub mod runner;
pub mod sources;
pub mod supervisor;
pub mod worker;

pub use config::NodeConfig;
pub use credentials::{Credentials, CredentialsProvider, StaticCredentials};
pub use envelope::{Envelope, EnvelopeCodec, Reassembler};
pub use job::{JobMode, JobRequest};
pub use message::{Message, MessageKind, ResourceDescriptor};
pub use node::{Node, NodeError, NodeHandle, NodeStatus};
pub use pool::{PoolStatus, WorkerPool, WorkerSlot};
pub use registry::{ConnectionState, ResourceRegistry};
pub use runner::JobRunner;
pub use supervisor::{JobHandle, JobTarget};
pub use worker::{Model, ModelError, run_worker};
