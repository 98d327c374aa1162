//! The node event loop.
//!
//! One task owns the resource registry, the receiving set, the peer
//! transports and the bookkeeping for jobs served to remote callers. Relay
//! events, peer events, caller commands and local job completions are all
//! handled here, one at a time, so none of that state is shared.
//!
//! Routing:
//! - a job for this node runs on the local worker pool
//! - a job for a remote resource goes over its peer channel when open,
//!   otherwise through the relay addressed to its connection id
//! - inbound `request`s run locally; their `dynamics` and `result` go back
//!   to the requester the same way
//! - inbound `result`s resolve the caller's [`JobHandle`]
//!
//! A result for a remote caller that cannot be delivered is written to
//! `<output_dir>/<request_id>.result`. Request ids that could name a path
//! outside the output directory are refused on arrival.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchError, BatchScheduler};
use crate::config::{DispatchMode, NodeConfig};
use crate::credentials::CredentialsProvider;
use crate::envelope::EnvelopeError;
use crate::job::{JobRequest, check_file_id};
use crate::message::{Message, MessageKind, ResourceDescriptor, RtcSignal};
use crate::peer::rtc::RtcConnector;
use crate::peer::{PeerConfig, PeerConnector, PeerError, PeerEvent, PeerHandle, PeerTransport};
use crate::pool::{CommandSpawner, SpawnError, WorkerPool, WorkerSpawner};
use crate::registry::{Discovery, ReceivingSet, Resource, ResourceRegistry, Route};
use crate::relay::{self, RelayError, RelayEvent, RelayHandle, RelayState};
use crate::runner::{JobError, JobRunner};
use crate::sources::{SourceError, SourceLoader};
use crate::supervisor::{JobHandle, JobSupervisor, JobTarget, PROGRESS_BUFFER};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node is shut down")]
    Closed,
    #[error("request {0} is already in flight")]
    DuplicateRequest(String),
    #[error("job could not be delivered: {0}")]
    Undeliverable(String),
    #[error("job {0} was cancelled")]
    Cancelled(String),
    #[error("unknown resource {0}")]
    UnknownResource(String),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Snapshot published by the node after every event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeStatus {
    /// `None` when no relay is configured.
    pub relay: Option<RelayState>,
    /// The relay gave up reconnecting.
    pub relay_exhausted: bool,
    /// Machine ids of known remote resources, sorted.
    pub resources: Vec<String>,
}

enum NodeCommand {
    Submit {
        request: JobRequest,
        target: Option<String>,
        reply: oneshot::Sender<Result<JobHandle, NodeError>>,
    },
    Terminate {
        request_id: String,
        reply: oneshot::Sender<bool>,
    },
    Resources(oneshot::Sender<Vec<Resource>>),
    Shutdown,
}

/// Reports from spawned job tasks.
enum Internal {
    Progress {
        request_id: String,
        data: Value,
    },
    Done {
        request_id: String,
        result: Result<Value, JobError>,
    },
}

/// Where an inbound message arrived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Relay,
    Peer { machine_id: String },
}

/// Remote caller of a job this node is running.
#[derive(Debug, Clone)]
struct Requester {
    machine_id: Option<String>,
    connection_id: Option<String>,
}

#[derive(Clone)]
pub struct NodeHandle {
    machine_id: String,
    tx: mpsc::Sender<NodeCommand>,
    status: watch::Receiver<NodeStatus>,
}

impl NodeHandle {
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// Run a job on this node.
    pub async fn submit(&self, request: JobRequest) -> Result<JobHandle, NodeError> {
        self.submit_to(request, None).await
    }

    /// Run a job on `machine_id`, or locally when `None`.
    pub async fn submit_to(
        &self,
        request: JobRequest,
        machine_id: Option<&str>,
    ) -> Result<JobHandle, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Submit {
            request,
            target: machine_id.map(str::to_string),
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::Closed)?
    }

    /// Best-effort cancel. The handle is rejected with
    /// [`NodeError::Cancelled`]; a running subprocess may still finish.
    pub async fn terminate(&self, request_id: &str) -> Result<bool, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Terminate {
            request_id: request_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::Closed)
    }

    pub async fn resources(&self) -> Result<Vec<Resource>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Resources(reply)).await?;
        rx.await.map_err(|_| NodeError::Closed)
    }

    /// Wait until `machine_id` is known. Fails once the relay gives up.
    pub async fn wait_for_resource(&self, machine_id: &str) -> Result<(), NodeError> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|s| s.relay_exhausted || s.resources.iter().any(|m| m == machine_id))
            .await
            .map_err(|_| NodeError::Closed)?;
        if status.relay_exhausted && !status.resources.iter().any(|m| m == machine_id) {
            return Err(NodeError::Undeliverable("relay unavailable".to_string()));
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(NodeCommand::Shutdown).await;
    }

    async fn command(&self, cmd: NodeCommand) -> Result<(), NodeError> {
        self.tx.send(cmd).await.map_err(|_| NodeError::Closed)
    }
}

pub struct Node {
    registry: ResourceRegistry,
    receiving: ReceivingSet,
    supervisor: JobSupervisor,
    runner: JobRunner,
    relay: Option<RelayHandle>,
    relay_events: Option<mpsc::Receiver<RelayEvent>>,
    relay_exhausted: bool,
    connector: Option<Arc<dyn PeerConnector>>,
    peer_config: PeerConfig,
    peers: HashMap<String, PeerHandle>,
    peer_tx: mpsc::Sender<PeerEvent>,
    peer_rx: mpsc::Receiver<PeerEvent>,
    serving: HashMap<String, Requester>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    status: watch::Sender<NodeStatus>,
    output_dir: PathBuf,
    cancel: CancellationToken,
}

impl Node {
    pub fn new(config: &NodeConfig, runner: JobRunner) -> Self {
        let (peer_tx, peer_rx) = mpsc::channel(EVENT_BUFFER);
        let (internal_tx, internal_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            registry: ResourceRegistry::new(config.local_descriptor()),
            receiving: ReceivingSet::new(config.receiving_capacity),
            supervisor: JobSupervisor::new(),
            runner,
            relay: None,
            relay_events: None,
            relay_exhausted: false,
            connector: None,
            peer_config: config.peer_config(),
            peers: HashMap::new(),
            peer_tx,
            peer_rx,
            serving: HashMap::new(),
            internal_tx,
            internal_rx,
            status: watch::channel(NodeStatus::default()).0,
            output_dir: config.output_dir.clone(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_relay(mut self, relay: RelayHandle, events: mpsc::Receiver<RelayEvent>) -> Self {
        self.relay = Some(relay);
        self.relay_events = Some(events);
        self
    }

    pub fn with_peers(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Token cancelled when the node stops. Child tokens stop the relay and
    /// peer tasks with it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Build the worker pool, source loader, relay client and peer
    /// connector described by `config` and start the node.
    pub fn launch(
        mut config: NodeConfig,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Result<(NodeHandle, JoinHandle<()>), NodeError> {
        let spawner = CommandSpawner::discover(&config.worker_dir)?;
        if config.frameworks.is_empty() {
            config.frameworks = spawner.frameworks();
        }
        let pool = WorkerPool::start(config.capacity, Arc::new(spawner));
        let sources = match &config.public_url {
            Some(url) => SourceLoader::remote(url, &config.worker_dir)?,
            None => SourceLoader::disabled(),
        };
        let mut runner = JobRunner::new(
            pool,
            sources,
            credentials.clone(),
            &config.output_dir,
            config.side_file_threshold,
        );
        if config.mode == DispatchMode::Slurm {
            let program = std::env::current_exe().map_err(BatchError::from)?;
            tracing::info!(program = %program.display(), "Dispatching jobs through sbatch");
            runner = runner.with_batch(BatchScheduler::new(config.batch_config(program)));
        }

        let mut node = Node::new(&config, runner);
        if let Some(url) = &config.relay_url {
            let token = credentials
                .credentials()
                .map(|c| c.token)
                .filter(|t| !t.is_empty());
            let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
            let (handle, _task) = relay::spawn(
                config.relay_config(url, token),
                events_tx,
                node.cancel.child_token(),
            );
            node = node.with_relay(handle, events_rx);

            if config.peer_enabled {
                let connector = RtcConnector::new(config.ice_servers.clone())?;
                node = node.with_peers(Arc::new(connector));
            }
        }
        Ok(node.spawn())
    }

    pub fn spawn(self) -> (NodeHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        self.publish_status();
        let handle = NodeHandle {
            machine_id: self.registry.local().machine_id.clone(),
            tx,
            status: self.status.subscribe(),
        };
        (handle, tokio::spawn(self.run(rx)))
    }

    async fn run(mut self, mut commands: mpsc::Receiver<NodeCommand>) {
        tracing::info!(
            machine_id = %self.registry.local().machine_id,
            relay = self.relay.is_some(),
            peers = self.connector.is_some(),
            "Node started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(internal) = self.internal_rx.recv() => self.on_internal(internal).await,

                cmd = commands.recv() => match cmd {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },

                event = next_relay_event(&mut self.relay_events) => match event {
                    Some(event) => self.on_relay_event(event).await,
                    None => self.relay_events = None,
                },

                Some(event) = self.peer_rx.recv() => self.on_peer_event(event).await,
            }
            self.publish_status();
        }

        self.stop().await;
    }

    async fn stop(&mut self) {
        for (_, peer) in self.peers.drain() {
            let _ = peer.close();
        }
        self.cancel.cancel();
        self.runner.pool().shutdown().await;
        tracing::info!("Node stopped");
    }

    fn publish_status(&self) {
        let mut resources: Vec<String> = self
            .registry
            .iter()
            .map(|r| r.descriptor.machine_id.clone())
            .collect();
        resources.sort();
        let status = NodeStatus {
            relay: self.relay.as_ref().map(RelayHandle::state),
            relay_exhausted: self.relay_exhausted,
            resources,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    async fn on_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Submit {
                request,
                target,
                reply,
            } => {
                let result = self.submit(request, target).await;
                let _ = reply.send(result);
            }
            NodeCommand::Terminate { request_id, reply } => {
                let _ = reply.send(self.terminate(&request_id).await);
            }
            NodeCommand::Resources(reply) => {
                let _ = reply.send(self.registry.iter().cloned().collect());
            }
            NodeCommand::Shutdown => {}
        }
    }

    async fn submit(
        &mut self,
        mut request: JobRequest,
        target: Option<String>,
    ) -> Result<JobHandle, NodeError> {
        if request.request_id.is_empty() {
            request.request_id = uuid::Uuid::new_v4().to_string();
        }
        let request_id = request.request_id.clone();

        let Some(machine_id) = target.filter(|m| *m != self.registry.local().machine_id) else {
            let handle = self.supervisor.register(&request_id, JobTarget::Local)?;
            tracing::info!(
                target: "gridlet::job",
                %request_id,
                framework = %request.framework,
                mode = %request.mode(),
                "Job started"
            );
            let progress = self.supervisor.progress_sender(&request_id);
            self.spawn_local(request, progress);
            return Ok(handle);
        };

        if self.registry.get(&machine_id).is_none() {
            return Err(NodeError::UnknownResource(machine_id));
        }
        let handle = self.supervisor.register(
            &request_id,
            JobTarget::Remote {
                machine_id: machine_id.clone(),
            },
        )?;
        tracing::info!(
            target: "gridlet::job",
            %request_id,
            %machine_id,
            mode = %request.mode(),
            "Job sent to remote resource"
        );
        let message = Message::Request {
            request_id: request_id.clone(),
            user: None,
            job: request,
        };
        if !self.send_to_machine(&machine_id, message) {
            self.supervisor.resolve(
                &request_id,
                Err(NodeError::Undeliverable(format!("no route to {machine_id}"))),
            );
        }
        Ok(handle)
    }

    async fn terminate(&mut self, request_id: &str) -> bool {
        let Some(target) = self.supervisor.target(request_id) else {
            return false;
        };
        match target {
            JobTarget::Local => {
                self.runner.cancel(request_id).await;
            }
            JobTarget::Remote { machine_id } => {
                let message = Message::Terminate {
                    request_id: request_id.to_string(),
                    user: None,
                };
                if !self.send_to_machine(&machine_id, message) {
                    tracing::debug!(%request_id, %machine_id, "Terminate not deliverable");
                }
            }
        }
        self.supervisor
            .resolve(request_id, Err(NodeError::Cancelled(request_id.to_string())))
    }

    fn spawn_local(&self, request: JobRequest, progress: Option<mpsc::Sender<Value>>) {
        // tracked before the task starts so an immediate terminate applies
        self.runner.track(&request.request_id);
        let runner = self.runner.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let request_id = request.request_id.clone();
            let result = runner.run(request, progress).await;
            let _ = internal.send(Internal::Done { request_id, result }).await;
        });
    }

    /// Run a job for a remote caller, forwarding each step to the loop.
    fn spawn_serving(&self, request: JobRequest) {
        self.runner.track(&request.request_id);
        let runner = self.runner.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let request_id = request.request_id.clone();
            let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
            let run = runner.run(request, Some(tx));
            tokio::pin!(run);

            let result = loop {
                tokio::select! {
                    biased;
                    Some(data) = rx.recv() => {
                        let _ = internal
                            .send(Internal::Progress { request_id: request_id.clone(), data })
                            .await;
                    }
                    result = &mut run => break result,
                }
            };
            while let Ok(data) = rx.try_recv() {
                let _ = internal
                    .send(Internal::Progress {
                        request_id: request_id.clone(),
                        data,
                    })
                    .await;
            }
            let _ = internal.send(Internal::Done { request_id, result }).await;
        });
    }

    async fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Progress { request_id, data } => {
                if let Some(requester) = self.serving.get(&request_id) {
                    let message = Message::Dynamics {
                        request_id,
                        user: None,
                        data,
                    };
                    self.reply(requester, message);
                }
            }
            Internal::Done { request_id, result } => {
                if let Some(requester) = self.serving.remove(&request_id) {
                    let data = match result {
                        Ok(data) => data,
                        Err(e) => {
                            tracing::warn!(%request_id, error = %e, "Remote job failed");
                            json!({ "error": e.to_string() })
                        }
                    };
                    tracing::info!(target: "gridlet::job", %request_id, "Remote job finished");
                    let message = Message::Result {
                        request_id: request_id.clone(),
                        user: None,
                        data: data.clone(),
                    };
                    if !self.reply(&requester, message) {
                        self.write_fallback(&request_id, &data).await;
                    }
                    return;
                }
                if !self
                    .supervisor
                    .resolve(&request_id, result.map_err(NodeError::from))
                {
                    tracing::debug!(%request_id, "Discarding result of cancelled job");
                }
            }
        }
    }

    async fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::State(state) => {
                tracing::info!(%state, "Relay state changed");
            }
            RelayEvent::Message(message) => self.on_message(message, Origin::Relay).await,
            RelayEvent::Exhausted => {
                tracing::error!("Relay unavailable, no further reconnects");
                self.relay_exhausted = true;
                let failed = self.supervisor.fail_all_remote("relay unavailable");
                if failed > 0 {
                    tracing::warn!(failed, "Rejected remote jobs");
                }
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Signal { machine_id, signal } => {
                let message = Message::Rtc { user: None, signal };
                if !self.relay_to_machine(&machine_id, message) {
                    tracing::debug!(%machine_id, "Signal dropped, no relay route");
                }
            }
            PeerEvent::Connected { machine_id } => {
                if self.registry.set_peer(&machine_id, true).is_none() {
                    tracing::warn!(%machine_id, "Peer channel for unknown resource");
                }
            }
            PeerEvent::Disconnected { machine_id } => {
                if self.registry.set_peer(&machine_id, false).is_none() {
                    self.forget(&machine_id);
                }
            }
            PeerEvent::Message {
                machine_id,
                message,
            } => self.on_message(message, Origin::Peer { machine_id }).await,
            PeerEvent::Undelivered {
                machine_id,
                message,
            } => self.on_undelivered(&machine_id, message).await,
        }
    }

    /// The peer channel closed under a queued send: retry through the relay.
    async fn on_undelivered(&mut self, machine_id: &str, message: Message) {
        let kind = message.kind();
        let request_id = message.request_id().map(str::to_string);
        let data = match &message {
            Message::Result { data, .. } => Some(data.clone()),
            _ => None,
        };
        if self.relay_to_machine(machine_id, message) {
            return;
        }
        match (kind, request_id, data) {
            (MessageKind::Result, Some(request_id), Some(data)) => {
                self.write_fallback(&request_id, &data).await;
            }
            (MessageKind::Request, Some(request_id), _) => {
                self.supervisor.resolve(
                    &request_id,
                    Err(NodeError::Undeliverable(format!("no route to {machine_id}"))),
                );
            }
            (kind, request_id, _) => {
                tracing::debug!(%machine_id, %kind, ?request_id, "Message dropped, no route");
            }
        }
    }

    async fn on_message(&mut self, message: Message, origin: Origin) {
        match message {
            Message::Connected { resource } => self.on_discovered(resource, true).await,
            Message::Resources { resources } => {
                for resource in resources {
                    self.on_discovered(resource, false).await;
                }
            }
            Message::Disconnected { connection_id } => {
                let Some(machine_id) = self.registry.signaling_lost(&connection_id) else {
                    tracing::warn!(%connection_id, "Disconnect for unknown connection");
                    return;
                };
                if self.registry.get(&machine_id).is_none() {
                    self.forget(&machine_id);
                }
            }
            Message::Request {
                request_id,
                user,
                job,
            } => self.on_request(request_id, user, job, origin),
            Message::Result {
                request_id, data, ..
            } => {
                if !self.receiving.insert(MessageKind::Result, &request_id) {
                    tracing::debug!(%request_id, "Duplicate result ignored");
                    return;
                }
                if !self.supervisor.resolve(&request_id, Ok(data)) {
                    tracing::debug!(%request_id, "Result for unknown job");
                }
            }
            Message::Dynamics {
                request_id, data, ..
            } => {
                self.supervisor.progress(&request_id, data);
            }
            Message::Terminate { request_id, .. } => {
                if self.serving.remove(&request_id).is_some() {
                    tracing::info!(target: "gridlet::job", %request_id, "Remote caller cancelled job");
                    self.runner.cancel(&request_id).await;
                } else {
                    tracing::debug!(%request_id, "Terminate for unknown job");
                }
            }
            Message::Rtc { user, signal } => self.on_rtc(user, signal, origin).await,
        }
    }

    async fn on_discovered(&mut self, resource: ResourceDescriptor, active: bool) {
        let machine_id = resource.machine_id.clone();
        if self.registry.discover(resource, active) == Discovery::Added
            && active
            && let Some(peer) = self.peer(&machine_id)
            && let Err(e) = peer.connect()
        {
            tracing::warn!(%machine_id, error = %e, "Failed to start peer negotiation");
        }
    }

    /// Drop all state for a resource that left.
    fn forget(&mut self, machine_id: &str) {
        if let Some(peer) = self.peers.remove(machine_id)
            && let Err(e) = peer.close()
        {
            tracing::debug!(%machine_id, error = %e, "Peer transport not closed");
        }
        let failed = self.supervisor.fail_remote(machine_id, "resource disconnected");
        if failed > 0 {
            tracing::warn!(%machine_id, failed, "Rejected jobs on departed resource");
        }
    }

    fn on_request(
        &mut self,
        request_id: String,
        user: Option<String>,
        mut job: JobRequest,
        origin: Origin,
    ) {
        if let Err(e) = check_file_id("request_id", &request_id) {
            tracing::warn!(error = %e, ?origin, "Remote request refused");
            return;
        }
        if !self.receiving.insert(MessageKind::Request, &request_id) {
            tracing::debug!(%request_id, "Duplicate request ignored");
            return;
        }
        let requester = match origin {
            Origin::Relay => {
                let Some(connection_id) = user else {
                    tracing::warn!(%request_id, "Relayed request without sender");
                    return;
                };
                Requester {
                    machine_id: self.registry.machine_for(&connection_id).map(str::to_string),
                    connection_id: Some(connection_id),
                }
            }
            Origin::Peer { machine_id } => Requester {
                machine_id: Some(machine_id),
                connection_id: None,
            },
        };
        tracing::info!(
            target: "gridlet::job",
            %request_id,
            requester = ?requester.machine_id.as_ref().or(requester.connection_id.as_ref()),
            mode = %job.mode(),
            "Accepted remote job"
        );
        job.request_id = request_id.clone();
        self.serving.insert(request_id, requester);
        self.spawn_serving(job);
    }

    async fn on_rtc(&mut self, user: Option<String>, signal: RtcSignal, origin: Origin) {
        if origin != Origin::Relay {
            tracing::warn!(?origin, "Signaling over a peer channel ignored");
            return;
        }
        let Some(machine_id) = user
            .as_deref()
            .and_then(|c| self.registry.machine_for(c))
            .map(str::to_string)
        else {
            tracing::warn!(connection_id = ?user, "Signal from unknown connection");
            return;
        };
        let Some(peer) = self.peer(&machine_id) else {
            tracing::debug!(%machine_id, "Peer transport disabled, signal ignored");
            return;
        };
        if let Err(e) = peer.signal(signal) {
            tracing::warn!(%machine_id, error = %e, "Failed to pass signal to peer transport");
        }
    }

    /// Peer transport for `machine_id`, started on first use.
    fn peer(&mut self, machine_id: &str) -> Option<PeerHandle> {
        let connector = self.connector.clone()?;
        let handle = self
            .peers
            .entry(machine_id.to_string())
            .or_insert_with(|| {
                PeerTransport::spawn(
                    machine_id,
                    connector,
                    &self.peer_config,
                    self.peer_tx.clone(),
                    self.cancel.child_token(),
                )
            });
        Some(handle.clone())
    }

    fn send_to_machine(&self, machine_id: &str, message: Message) -> bool {
        match self.registry.route(machine_id) {
            Some(Route::Peer { .. }) => match self.peers.get(machine_id) {
                Some(peer) => match peer.send(message.clone()) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!(%machine_id, error = %e, "Peer queue unavailable, using relay");
                        self.relay_to_machine(machine_id, message)
                    }
                },
                None => self.relay_to_machine(machine_id, message),
            },
            Some(Route::Relay { connection_id }) => self.send_relay(message.with_user(connection_id)),
            Some(Route::Local) | None => false,
        }
    }

    /// Reply to a remote caller, preferring its open peer channel.
    fn reply(&self, requester: &Requester, message: Message) -> bool {
        if let Some(machine_id) = &requester.machine_id
            && let Some(peer) = self.peers.get(machine_id)
            && peer.is_connected()
            && peer.send(message.clone()).is_ok()
        {
            return true;
        }
        let connection_id = requester
            .machine_id
            .as_deref()
            .and_then(|m| self.registry.get(m))
            .and_then(Resource::connection_id)
            .or(requester.connection_id.as_deref());
        match connection_id {
            Some(connection_id) => self.send_relay(message.with_user(connection_id)),
            None => false,
        }
    }

    fn relay_to_machine(&self, machine_id: &str, message: Message) -> bool {
        match self.registry.get(machine_id).and_then(Resource::connection_id) {
            Some(connection_id) => self.send_relay(message.with_user(connection_id)),
            None => false,
        }
    }

    fn send_relay(&self, message: Message) -> bool {
        let Some(relay) = &self.relay else {
            return false;
        };
        if self.relay_exhausted {
            return false;
        }
        match relay.send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Relay send failed");
                false
            }
        }
    }

    async fn write_fallback(&self, request_id: &str, data: &Value) {
        if let Err(e) = check_file_id("request_id", request_id) {
            tracing::error!(error = %e, "Result undeliverable and not written");
            return;
        }
        let path = self.output_dir.join(format!("{request_id}.result"));
        let written = match serde_json::to_vec(data) {
            Ok(bytes) => tokio::fs::write(&path, bytes).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match written {
            Ok(()) => tracing::warn!(
                %request_id,
                path = %path.display(),
                "Result undeliverable, written to fallback file"
            ),
            Err(error) => tracing::error!(%request_id, %error, "Result undeliverable and not written"),
        }
    }
}

async fn next_relay_event(rx: &mut Option<mpsc::Receiver<RelayEvent>>) -> Option<RelayEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
