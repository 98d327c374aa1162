//! Direct data channel to one remote resource.
//!
//! Each remote gets its own [`PeerTransport`] task. Signaling (offer, answer,
//! ICE candidates) never goes over the channel itself: the transport emits
//! [`PeerEvent::Signal`] and the node relays it. Remote candidates that arrive
//! before negotiation completes are held in an [`IceQueue`] and applied once
//! the connection is stable and ICE is not yet connected.
//!
//! Once the data channel opens, messages are carried as envelopes encoded
//! with a much larger frame limit than the relay's.

#[cfg(test)]
pub(crate) mod mock;
pub mod rtc;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::envelope::{
    DEFAULT_STALE_AFTER, Envelope, EnvelopeCodec, EnvelopeError, Reassembler, Reassembly,
};
use crate::message::{IceCandidate, Message, RtcSignal, SdpType, SessionDescription};

pub const DEFAULT_FRAME_LIMIT: usize = 256 * 1024;
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 64 * 1024;

const COMMAND_BUFFER: usize = 64;
const CONNECTION_EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("unsupported session description type {0:?}")]
    UnsupportedSdp(SdpType),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("failed to encode envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("peer transport closed")]
    Closed,
    #[error("peer transport is busy")]
    Busy,
}

/// Notifications from a live peer connection to its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    LocalCandidate(IceCandidate),
    GatheringStateChanged,
    SignalingStable,
    ChannelOpen,
    ChannelClosed,
    Message(String),
    IceFailed,
}

/// One negotiated connection with a single data channel.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open the outbound data channel and produce a local offer.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a remote offer and produce the answer. The remote opens the
    /// data channel.
    async fn accept_offer(&self, offer: SessionDescription)
    -> Result<SessionDescription, PeerError>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Negotiation finished: signaling is stable and a remote description
    /// has been applied.
    fn signaling_stable(&self) -> bool;

    fn ice_connected(&self) -> bool;

    async fn send(&self, text: String) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates connections that report to `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(
        &self,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// Remote ICE candidates waiting for negotiation to finish.
#[derive(Debug, Default)]
pub struct IceQueue {
    pending: VecDeque<IceCandidate>,
}

impl IceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply queued candidates if the connection can take them. Each
    /// candidate is handed to the connection once; a rejected one is logged
    /// and not retried.
    pub async fn flush(&mut self, conn: &dyn PeerConnection) -> usize {
        if self.pending.is_empty() || !conn.signaling_stable() || conn.ice_connected() {
            return 0;
        }
        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            match conn.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(error = %e, "Remote ICE candidate rejected"),
            }
        }
        applied
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

/// Output of a peer transport, tagged with the remote machine id.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Signaling payload to relay to the remote.
    Signal { machine_id: String, signal: RtcSignal },
    Connected { machine_id: String },
    Disconnected { machine_id: String },
    Message { machine_id: String, message: Message },
    /// A send was requested while the channel was not open, or the channel
    /// failed while sending it.
    Undelivered { machine_id: String, message: Message },
}

#[derive(Debug)]
enum PeerCommand {
    Connect,
    Signal(RtcSignal),
    Send(Message),
    Close,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub frame_limit: usize,
    pub compression_threshold: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            frame_limit: DEFAULT_FRAME_LIMIT,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

/// Node-side handle to a peer transport task.
#[derive(Clone)]
pub struct PeerHandle {
    machine_id: String,
    tx: mpsc::Sender<PeerCommand>,
    state: watch::Receiver<PeerState>,
}

impl PeerHandle {
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    // Commands never wait for queue space: the transport itself waits on
    // the node's event queue, so a blocking send here could deadlock.

    /// Start negotiation as the offering side.
    pub fn connect(&self) -> Result<(), PeerError> {
        self.command(PeerCommand::Connect)
    }

    pub fn signal(&self, signal: RtcSignal) -> Result<(), PeerError> {
        self.command(PeerCommand::Signal(signal))
    }

    /// Queue `message` for the channel. [`PeerError::Busy`] means the
    /// transport is backed up and the caller should route it elsewhere.
    pub fn send(&self, message: Message) -> Result<(), PeerError> {
        self.command(PeerCommand::Send(message))
    }

    pub fn close(&self) -> Result<(), PeerError> {
        self.command(PeerCommand::Close)
    }

    fn command(&self, cmd: PeerCommand) -> Result<(), PeerError> {
        self.tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::Busy,
            mpsc::error::TrySendError::Closed(_) => PeerError::Closed,
        })
    }
}

pub struct PeerTransport {
    machine_id: String,
    connector: Arc<dyn PeerConnector>,
    codec: EnvelopeCodec,
    reassembler: Reassembler,
    ice: IceQueue,
    conn: Option<Arc<dyn PeerConnection>>,
    conn_events: Option<mpsc::Receiver<ConnectionEvent>>,
    state: watch::Sender<PeerState>,
    events: mpsc::Sender<PeerEvent>,
}

impl PeerTransport {
    /// Spawn the transport task for `machine_id`.
    pub fn spawn(
        machine_id: impl Into<String>,
        connector: Arc<dyn PeerConnector>,
        config: &PeerConfig,
        events: mpsc::Sender<PeerEvent>,
        cancel: CancellationToken,
    ) -> PeerHandle {
        let machine_id = machine_id.into();
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state) = watch::channel(PeerState::Disconnected);
        let transport = Self {
            machine_id: machine_id.clone(),
            connector,
            codec: EnvelopeCodec::new(config.frame_limit, config.compression_threshold),
            reassembler: Reassembler::new(),
            ice: IceQueue::new(),
            conn: None,
            conn_events: None,
            state: state_tx,
            events,
        };
        tokio::spawn(transport.run(commands, cancel));
        PeerHandle {
            machine_id,
            tx,
            state,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<PeerCommand>, cancel: CancellationToken) {
        let mut evict = tokio::time::interval(DEFAULT_STALE_AFTER);
        evict.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(PeerCommand::Close) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                event = next_event(&mut self.conn_events) => match event {
                    Some(event) => self.on_connection_event(event).await,
                    None => self.conn_events = None,
                },
                _ = evict.tick() => {
                    self.reassembler.evict_stale(DEFAULT_STALE_AFTER);
                }
            }
        }

        self.teardown().await;
        tracing::debug!(machine_id = %self.machine_id, "Peer transport stopped");
    }

    async fn on_command(&mut self, cmd: PeerCommand) {
        let result = match cmd {
            PeerCommand::Connect => self.offer().await,
            PeerCommand::Signal(signal) => self.on_signal(signal).await,
            PeerCommand::Send(message) => self.send(message).await,
            PeerCommand::Close => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(machine_id = %self.machine_id, error = %e, "Peer transport error");
        }
    }

    async fn connection(&mut self) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if let Some(conn) = &self.conn {
            return Ok(conn.clone());
        }
        let (tx, rx) = mpsc::channel(CONNECTION_EVENT_BUFFER);
        let conn = self.connector.open(tx).await?;
        self.conn = Some(conn.clone());
        self.conn_events = Some(rx);
        self.set_state(PeerState::Connecting);
        Ok(conn)
    }

    async fn offer(&mut self) -> Result<(), PeerError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = self.connection().await?;
        let offer = conn.create_offer().await?;
        tracing::debug!(machine_id = %self.machine_id, "Sending offer");
        self.emit_signal(RtcSignal::Offer(offer)).await;
        Ok(())
    }

    async fn on_signal(&mut self, signal: RtcSignal) -> Result<(), PeerError> {
        match signal {
            RtcSignal::Offer(offer) => {
                if self.conn.is_some() {
                    tracing::debug!(machine_id = %self.machine_id, "Offer for existing connection, restarting");
                    self.teardown().await;
                }
                let conn = self.connection().await?;
                let answer = conn.accept_offer(offer).await?;
                self.flush_ice().await;
                self.emit_signal(RtcSignal::Answer(answer)).await;
            }
            RtcSignal::Answer(answer) => {
                let Some(conn) = self.conn.clone() else {
                    tracing::warn!(machine_id = %self.machine_id, "Answer without pending offer");
                    return Ok(());
                };
                conn.accept_answer(answer).await?;
                self.flush_ice().await;
            }
            RtcSignal::IceCandidate(candidate) => {
                self.ice.push(candidate);
                self.flush_ice().await;
            }
        }
        Ok(())
    }

    async fn flush_ice(&mut self) {
        let Some(conn) = self.conn.clone() else {
            return;
        };
        let applied = self.ice.flush(conn.as_ref()).await;
        if applied > 0 {
            tracing::trace!(machine_id = %self.machine_id, applied, "Applied queued ICE candidates");
        }
    }

    async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        let conn = match &self.conn {
            Some(conn) if *self.state.borrow() == PeerState::Connected => conn.clone(),
            _ => {
                let _ = self
                    .events
                    .send(PeerEvent::Undelivered {
                        machine_id: self.machine_id.clone(),
                        message,
                    })
                    .await;
                return Ok(());
            }
        };
        let (header, body) = message.clone().into_parts()?;
        let frames = self
            .codec
            .encode(header, body)?
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        for frame in frames {
            if let Err(e) = conn.send(frame).await {
                tracing::warn!(machine_id = %self.machine_id, error = %e, "Peer send failed, dropping channel");
                self.emit(PeerEvent::Undelivered {
                    machine_id: self.machine_id.clone(),
                    message,
                })
                .await;
                self.teardown().await;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                self.emit_signal(RtcSignal::IceCandidate(candidate)).await;
            }
            ConnectionEvent::GatheringStateChanged | ConnectionEvent::SignalingStable => {
                self.flush_ice().await;
            }
            ConnectionEvent::ChannelOpen => {
                tracing::info!(machine_id = %self.machine_id, "Peer channel open");
                self.set_state(PeerState::Connected);
                self.emit(PeerEvent::Connected {
                    machine_id: self.machine_id.clone(),
                })
                .await;
            }
            ConnectionEvent::ChannelClosed => {
                tracing::info!(machine_id = %self.machine_id, "Peer channel closed");
                self.teardown().await;
            }
            ConnectionEvent::IceFailed => {
                tracing::warn!(machine_id = %self.machine_id, "ICE failed");
                self.teardown().await;
            }
            ConnectionEvent::Message(text) => self.on_text(&text).await,
        }
    }

    async fn on_text(&mut self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(machine_id = %self.machine_id, error = %e, "Dropping malformed peer frame");
                return;
            }
        };
        match self.reassembler.push(envelope) {
            Reassembly::Complete(decoded) => match Message::from_decoded(decoded) {
                Ok(message) => {
                    self.emit(PeerEvent::Message {
                        machine_id: self.machine_id.clone(),
                        message,
                    })
                    .await;
                }
                Err(e) => tracing::warn!(machine_id = %self.machine_id, error = %e, "Dropping invalid peer message"),
            },
            Reassembly::Pending | Reassembly::Duplicate => {}
            Reassembly::Invalid(e) => {
                tracing::warn!(machine_id = %self.machine_id, error = %e, "Dropping invalid peer envelope");
            }
        }
    }

    /// Close the current connection, if any, and report the channel lost.
    async fn teardown(&mut self) {
        let was_connected = *self.state.borrow() == PeerState::Connected;
        self.conn_events = None;
        self.ice = IceQueue::new();
        if let Some(conn) = self.conn.take()
            && let Err(e) = conn.close().await
        {
            tracing::debug!(machine_id = %self.machine_id, error = %e, "Peer close failed");
        }
        self.set_state(PeerState::Disconnected);
        if was_connected {
            self.emit(PeerEvent::Disconnected {
                machine_id: self.machine_id.clone(),
            })
            .await;
        }
    }

    fn set_state(&self, state: PeerState) {
        self.state.send_replace(state);
    }

    async fn emit_signal(&self, signal: RtcSignal) {
        self.emit(PeerEvent::Signal {
            machine_id: self.machine_id.clone(),
            signal,
        })
        .await;
    }

    async fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event).await;
    }
}

async fn next_event(rx: &mut Option<mpsc::Receiver<ConnectionEvent>>) -> Option<ConnectionEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockConnection, MockConnector, sdp};
    use super::*;
    use crate::envelope::EnvelopeHeader;
    use crate::message::MessageKind;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn start() -> (Arc<MockConnector>, PeerHandle, mpsc::Receiver<PeerEvent>) {
        let connector = Arc::new(MockConnector::default());
        let (tx, rx) = mpsc::channel(64);
        let handle = PeerTransport::spawn(
            "m1",
            connector.clone(),
            &PeerConfig::default(),
            tx,
            CancellationToken::new(),
        );
        (connector, handle, rx)
    }

    #[tokio::test]
    async fn ice_queue_waits_for_stable_signaling() {
        let conn = MockConnection::default();
        let mut queue = IceQueue::new();
        queue.push(candidate(1));

        assert_eq!(queue.flush(&conn).await, 0);
        assert_eq!(queue.len(), 1);

        conn.stable.store(true, Ordering::SeqCst);
        conn.ice_connected.store(true, Ordering::SeqCst);
        assert_eq!(queue.flush(&conn).await, 0);

        conn.ice_connected.store(false, Ordering::SeqCst);
        assert_eq!(queue.flush(&conn).await, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn early_candidate_is_applied_exactly_once() {
        let (connector, handle, mut events) = start();

        handle
            .signal(RtcSignal::IceCandidate(candidate(1)))
            .unwrap();
        handle
            .signal(RtcSignal::Offer(sdp(SdpType::Offer, "v=0 remote")))
            .unwrap();

        match events.recv().await.unwrap() {
            PeerEvent::Signal {
                machine_id,
                signal: RtcSignal::Answer(answer),
            } => {
                assert_eq!(machine_id, "m1");
                assert_eq!(answer.sdp, "v=0 answer");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(*connector.conn.applied.lock().unwrap(), vec![candidate(1)]);

        // later gathering changes must not replay it
        connector.inject(ConnectionEvent::GatheringStateChanged).await;
        connector.inject(ConnectionEvent::ChannelOpen).await;
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Connected {
                machine_id: "m1".to_string()
            }
        );
        assert_eq!(connector.conn.applied.lock().unwrap().len(), 1);
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn offer_and_local_candidates_are_relayed() {
        let (connector, handle, mut events) = start();

        handle.connect().unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            PeerEvent::Signal {
                signal: RtcSignal::Offer(_),
                ..
            }
        ));

        connector
            .inject(ConnectionEvent::LocalCandidate(candidate(4)))
            .await;
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Signal {
                machine_id: "m1".to_string(),
                signal: RtcSignal::IceCandidate(candidate(4)),
            }
        );
    }

    #[tokio::test]
    async fn sends_only_over_open_channel() {
        let (connector, handle, mut events) = start();
        let message = Message::Result {
            request_id: "r1".to_string(),
            user: None,
            data: json!({"ok": true}),
        };

        handle.send(message.clone()).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Undelivered {
                machine_id: "m1".to_string(),
                message: message.clone(),
            }
        );

        handle.connect().unwrap();
        events.recv().await.unwrap();
        connector.inject(ConnectionEvent::ChannelOpen).await;
        events.recv().await.unwrap();

        handle.send(message).unwrap();
        handle.close().unwrap();
        events.recv().await.unwrap();

        let sent = connector.conn.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let envelope: Envelope = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(envelope.kind, MessageKind::Result);
        assert_eq!(envelope.data, json!({"ok": true}));
        assert!(connector.conn.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn inbound_frames_become_messages_and_close_disconnects() {
        let (connector, handle, mut events) = start();
        handle.connect().unwrap();
        events.recv().await.unwrap();
        connector.inject(ConnectionEvent::ChannelOpen).await;
        events.recv().await.unwrap();

        let codec = EnvelopeCodec::new(12, 1024);
        let header = EnvelopeHeader {
            request_id: Some("r9".to_string()),
            ..EnvelopeHeader::new(MessageKind::Dynamics)
        };
        connector
            .inject(ConnectionEvent::Message("garbage".to_string()))
            .await;
        for envelope in codec.encode(header, json!({"t": 3, "x": [1, 2]})).unwrap() {
            connector
                .inject(ConnectionEvent::Message(
                    serde_json::to_string(&envelope).unwrap(),
                ))
                .await;
        }

        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Message {
                machine_id: "m1".to_string(),
                message: Message::Dynamics {
                    request_id: "r9".to_string(),
                    user: None,
                    data: json!({"t": 3, "x": [1, 2]}),
                },
            }
        );

        connector.inject(ConnectionEvent::ChannelClosed).await;
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Disconnected {
                machine_id: "m1".to_string()
            }
        );
        assert_eq!(handle.state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn failed_send_reports_message_and_drops_channel() {
        let (connector, handle, mut events) = start();
        handle.connect().unwrap();
        events.recv().await.unwrap();
        connector.inject(ConnectionEvent::ChannelOpen).await;
        events.recv().await.unwrap();

        connector.conn.fail_sends.store(true, Ordering::SeqCst);
        let message = Message::Result {
            request_id: "r2".to_string(),
            user: None,
            data: json!([1, 2, 3]),
        };
        handle.send(message.clone()).unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Undelivered {
                machine_id: "m1".to_string(),
                message,
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Disconnected {
                machine_id: "m1".to_string()
            }
        );
        assert_eq!(handle.state(), PeerState::Disconnected);
        assert!(connector.conn.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn full_command_queue_does_not_block() {
        let (tx, commands) = mpsc::channel(1);
        let (_state_tx, state) = watch::channel(PeerState::Connected);
        let handle = PeerHandle {
            machine_id: "m1".to_string(),
            tx,
            state,
        };
        let message = Message::Result {
            request_id: "r3".to_string(),
            user: None,
            data: json!(null),
        };

        handle.send(message.clone()).unwrap();
        assert!(matches!(handle.send(message.clone()), Err(PeerError::Busy)));

        drop(commands);
        assert!(matches!(handle.send(message), Err(PeerError::Closed)));
    }
}
