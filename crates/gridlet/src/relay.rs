//! Persistent websocket connection to the relay.
//!
//! State machine: `Disconnected → Connecting → Connected`. A session that
//! reached `Connected` and then drops is retried immediately. A connect
//! attempt that fails is retried with exponential backoff only while
//! `connect_retries` allows (default: never), after which the client stops
//! and reports [`RelayEvent::Exhausted`].
//!
//! Outbound messages are encoded with the relay's frame limit and
//! compression threshold. Inbound frames are reassembled and forwarded as
//! typed [`Message`]s; malformed frames are logged and dropped.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::envelope::{
    DEFAULT_STALE_AFTER, Envelope, EnvelopeCodec, EnvelopeError, Reassembler, Reassembly,
};
use crate::message::{Message, ResourceDescriptor};

pub const DEFAULT_FRAME_LIMIT: usize = 30 * 1024;
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 10 * 1024;

const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Connected,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum RelayEvent {
    State(RelayState),
    Message(Message),
    /// Connect retries exhausted; the client has stopped.
    Exhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay url is invalid: {0}")]
    InvalidUrl(String),
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("failed to encode envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("relay is {0}")]
    Unavailable(RelayState),
    #[error("relay closed the connection")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub url: String,
    pub token: Option<String>,
    pub local: ResourceDescriptor,
    pub frame_limit: usize,
    pub compression_threshold: usize,
    pub connect_retries: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub stale_after: Duration,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>, local: ResourceDescriptor) -> Self {
        Self {
            url: url.into(),
            token: None,
            local,
            frame_limit: DEFAULT_FRAME_LIMIT,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            connect_retries: 0,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Relay URL with the credential token and local descriptor as query
    /// parameters.
    pub fn connect_url(&self) -> Result<String, RelayError> {
        let local = &self.local;
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(token) = &self.token {
            params.push(("authorization", token.clone()));
        }
        params.extend([
            ("machine_id", local.machine_id.clone()),
            ("type", local.kind.clone()),
            ("name", local.name.clone()),
            ("capacity", local.capacity.to_string()),
            ("cost", local.cost.to_string()),
            ("time", local.time_estimate.to_string()),
            ("frameworks", local.frameworks.join(",")),
        ]);
        reqwest::Url::parse_with_params(&self.url, params)
            .map(String::from)
            .map_err(|e| RelayError::InvalidUrl(e.to_string()))
    }
}

/// Sending side of the relay, shared by the node.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<Message>,
    state: watch::Receiver<RelayState>,
}

impl RelayHandle {
    /// Handle not backed by a connection. The caller drives the state and
    /// receives what would have been sent.
    pub fn detached() -> (Self, mpsc::Receiver<Message>, watch::Sender<RelayState>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (state_tx, state) = watch::channel(RelayState::Disconnected);
        (Self { tx, state }, rx, state_tx)
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Queue a message without waiting. Messages queued while reconnecting
    /// are sent once connected; a disconnected relay refuses them.
    pub fn send(&self, msg: Message) -> Result<(), RelayError> {
        let state = self.state();
        if state == RelayState::Disconnected {
            return Err(RelayError::Unavailable(state));
        }
        self.tx.try_send(msg).map_err(|e| {
            tracing::warn!(kind = %e.into_inner().kind(), "Relay outbound queue full");
            RelayError::Unavailable(state)
        })
    }
}

/// Start the relay client. Events are delivered on `events` until `cancel`
/// fires or connect retries run out.
pub fn spawn(
    config: RelayConfig,
    events: mpsc::Sender<RelayEvent>,
    cancel: CancellationToken,
) -> (RelayHandle, tokio::task::JoinHandle<()>) {
    let (tx, outbound) = mpsc::channel(OUTBOUND_BUFFER);
    let (state_tx, state) = watch::channel(RelayState::Disconnected);
    let client = RelayClient {
        codec: EnvelopeCodec::new(config.frame_limit, config.compression_threshold),
        config,
        events,
        outbound,
        state: state_tx,
        cancel,
    };
    let task = tokio::spawn(client.run());
    (RelayHandle { tx, state }, task)
}

enum SessionEnd {
    Shutdown,
    Lost(RelayError),
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct RelayClient {
    config: RelayConfig,
    codec: EnvelopeCodec,
    events: mpsc::Sender<RelayEvent>,
    outbound: mpsc::Receiver<Message>,
    state: watch::Sender<RelayState>,
    cancel: CancellationToken,
}

impl RelayClient {
    async fn set_state(&self, state: RelayState) {
        if *self.state.borrow() == state {
            return;
        }
        tracing::debug!(%state, "Relay state changed");
        self.state.send_replace(state);
        let _ = self.events.send(RelayEvent::State(state)).await;
    }

    async fn run(mut self) {
        let mut failures = 0u32;
        let mut delay = self.config.backoff;

        loop {
            self.set_state(RelayState::Connecting).await;
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(ws) => {
                    failures = 0;
                    delay = self.config.backoff;
                    self.set_state(RelayState::Connected).await;
                    tracing::info!(url = %self.config.url, "Relay connected");

                    let end = self.session(ws).await;
                    self.set_state(RelayState::Disconnected).await;
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(e) => {
                            tracing::warn!(error = %e, "Relay connection lost, reconnecting");
                        }
                    }
                }
                Err(e) => {
                    self.set_state(RelayState::Disconnected).await;
                    if failures >= self.config.connect_retries {
                        tracing::error!(error = %e, attempts = failures + 1, "Relay connect failed");
                        let _ = self.events.send(RelayEvent::Exhausted).await;
                        return;
                    }
                    failures += 1;
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Relay connect failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.config.max_backoff);
                }
            }
        }

        self.set_state(RelayState::Disconnected).await;
        tracing::info!("Relay client stopped");
    }

    async fn connect(&self) -> Result<WsStream, RelayError> {
        let url = self.config.connect_url()?;
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        Ok(ws)
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let mut reassembler = Reassembler::new();
        let mut evict = tokio::time::interval(self.config.stale_after);
        evict.tick().await;

        let announce = Message::Connected {
            resource: self.config.local.clone(),
        };
        if let Err(e) = self.send_frames(&mut sink, announce).await {
            return SessionEnd::Lost(e);
        }

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }

                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.on_text(text.as_str(), &mut reassembler).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return SessionEnd::Lost(RelayError::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.into()),
                },

                out = self.outbound.recv() => match out {
                    Some(msg) => match self.send_frames(&mut sink, msg).await {
                        Ok(()) => {}
                        Err(RelayError::Ws(e)) => return SessionEnd::Lost(e.into()),
                        Err(e) => tracing::warn!(error = %e, "Dropping unencodable message"),
                    },
                    None => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                },

                _ = evict.tick() => {
                    let dropped = reassembler.evict_stale(self.config.stale_after);
                    if dropped > 0 {
                        tracing::warn!(dropped, "Evicted incomplete relay messages");
                    }
                }
            }
        }
    }

    async fn send_frames<S>(&self, sink: &mut S, msg: Message) -> Result<(), RelayError>
    where
        S: futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let kind = msg.kind();
        let (header, body) = msg.into_parts()?;
        let envelopes = self.codec.encode(header, body)?;
        tracing::trace!(%kind, frames = envelopes.len(), "Sending to relay");
        for envelope in envelopes {
            let text = serde_json::to_string(&envelope)?;
            sink.send(WsMessage::Text(text.into())).await?;
        }
        Ok(())
    }

    async fn on_text(&self, text: &str, reassembler: &mut Reassembler) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed relay frame");
                return;
            }
        };
        match reassembler.push(envelope) {
            Reassembly::Complete(decoded) => match Message::from_decoded(decoded) {
                Ok(msg) => {
                    let _ = self.events.send(RelayEvent::Message(msg)).await;
                }
                Err(e) => tracing::warn!(error = %e, "Dropping invalid relay message"),
            },
            Reassembly::Pending => {}
            Reassembly::Duplicate => tracing::debug!("Duplicate relay part ignored"),
            Reassembly::Invalid(e) => tracing::warn!(error = %e, "Dropping invalid relay envelope"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeHeader;
    use crate::message::MessageKind;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    fn local() -> ResourceDescriptor {
        ResourceDescriptor {
            machine_id: "abc123".to_string(),
            connection_id: None,
            kind: "node".to_string(),
            name: "lab box".to_string(),
            capacity: 4,
            cost: 0.0,
            time_estimate: 1.0,
            frameworks: vec!["js".to_string(), "py".to_string()],
        }
    }

    #[test]
    fn connect_url_carries_token_and_descriptor() {
        let mut config = RelayConfig::new("wss://relay.example.com/", local());
        config.token = Some("s3cret".to_string());

        let url = reqwest::Url::parse(&config.connect_url().unwrap()).unwrap();
        let query: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();

        assert_eq!(query["authorization"], "s3cret");
        assert_eq!(query["machine_id"], "abc123");
        assert_eq!(query["name"], "lab box");
        assert_eq!(query["frameworks"], "js,py");
        assert_eq!(query["capacity"], "4");
    }

    #[test]
    fn detached_handle_refuses_while_disconnected() {
        let (handle, mut rx, state) = RelayHandle::detached();
        let msg = Message::Terminate {
            request_id: "r".to_string(),
            user: Some("c".to_string()),
        };

        assert!(matches!(
            handle.send(msg.clone()),
            Err(RelayError::Unavailable(RelayState::Disconnected))
        ));

        state.send_replace(RelayState::Connected);
        handle.send(msg.clone()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), msg);
    }

    async fn next_message(events: &mut mpsc::Receiver<RelayEvent>) -> Message {
        loop {
            match events.recv().await {
                Some(RelayEvent::Message(msg)) => return msg,
                Some(_) => continue,
                None => panic!("relay events closed"),
            }
        }
    }

    #[tokio::test]
    async fn announces_relays_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());

        let (events_tx, mut events) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn(RelayConfig::new(url, local()), events_tx, cancel.clone());

        // first session: receive announcement, push a chunked result, then drop
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let announce = ws.next().await.unwrap().unwrap();
        let envelope: Envelope = serde_json::from_str(announce.to_text().unwrap()).unwrap();
        assert_eq!(envelope.kind, MessageKind::Connected);

        let codec = EnvelopeCodec::new(16, 1024);
        let header = EnvelopeHeader {
            request_id: Some("r1".to_string()),
            user: Some("conn-9".to_string()),
            ..EnvelopeHeader::new(MessageKind::Result)
        };
        let mut frames = codec
            .encode(header, json!({"values": [1, 2, 3, 4, 5, 6, 7, 8]}))
            .unwrap();
        frames.reverse();
        ws.send(WsMessage::Text("not json".into())).await.unwrap();
        for frame in frames {
            ws.send(WsMessage::Text(serde_json::to_string(&frame).unwrap().into()))
                .await
                .unwrap();
        }

        match next_message(&mut events).await {
            Message::Result {
                request_id,
                user,
                data,
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(user.as_deref(), Some("conn-9"));
                assert_eq!(data["values"][7], json!(8));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(handle.state(), RelayState::Connected);
        handle
            .send(Message::Terminate {
                request_id: "r2".to_string(),
                user: Some("conn-9".to_string()),
            })
            .unwrap();
        let frame = ws.next().await.unwrap().unwrap();
        let sent: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(sent["type"], "terminate");
        assert_eq!(sent["request_id"], "r2");

        drop(ws);

        // the client comes back on its own after a session drop
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let announce = ws.next().await.unwrap().unwrap();
        assert!(announce.to_text().unwrap().contains("\"connected\""));

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(handle.state(), RelayState::Disconnected);
    }

    #[tokio::test]
    async fn failed_first_connect_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        drop(listener);

        let (events_tx, mut events) = mpsc::channel(64);
        let (_handle, task) = spawn(
            RelayConfig::new(url, local()),
            events_tx,
            CancellationToken::new(),
        );

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(event, RelayEvent::Exhausted);
            seen.push(event);
            if done {
                break;
            }
        }
        task.await.unwrap();

        assert!(matches!(seen[0], RelayEvent::State(RelayState::Connecting)));
        assert!(matches!(seen[1], RelayEvent::State(RelayState::Disconnected)));
        assert!(matches!(seen[2], RelayEvent::Exhausted));
    }
}
