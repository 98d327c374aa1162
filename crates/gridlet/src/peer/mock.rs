//! In-memory [`PeerConnector`] for transport and node tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ConnectionEvent, PeerConnection, PeerConnector, PeerError};
use crate::message::{IceCandidate, SdpType, SessionDescription};

pub(crate) fn sdp(kind: SdpType, sdp: &str) -> SessionDescription {
    SessionDescription {
        kind,
        sdp: sdp.to_string(),
    }
}

#[derive(Default)]
pub(crate) struct MockConnection {
    pub stable: AtomicBool,
    pub ice_connected: AtomicBool,
    pub applied: Mutex<Vec<IceCandidate>>,
    pub sent: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    /// Make every `send` fail as if the channel broke.
    pub fail_sends: AtomicBool,
    /// Make every `send` hang, as on a congested channel.
    pub stall_sends: AtomicBool,
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(sdp(SdpType::Offer, "v=0 offer"))
    }

    async fn accept_offer(
        &self,
        _offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.stable.store(true, Ordering::SeqCst);
        Ok(sdp(SdpType::Answer, "v=0 answer"))
    }

    async fn accept_answer(&self, _answer: SessionDescription) -> Result<(), PeerError> {
        self.stable.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    fn signaling_stable(&self) -> bool {
        self.stable.load(Ordering::SeqCst)
    }

    fn ice_connected(&self) -> bool {
        self.ice_connected.load(Ordering::SeqCst)
    }

    async fn send(&self, text: String) -> Result<(), PeerError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(PeerError::ChannelNotOpen);
        }
        if self.stall_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one shared [`MockConnection`] and keeps the event sender of the
/// latest one opened.
#[derive(Default)]
pub(crate) struct MockConnector {
    pub conn: Arc<MockConnection>,
    events: Mutex<Option<mpsc::Sender<ConnectionEvent>>>,
}

impl MockConnector {
    pub async fn inject(&self, event: ConnectionEvent) {
        let tx = self.events.lock().unwrap().clone().unwrap();
        tx.send(event).await.unwrap();
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn open(
        &self,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        *self.events.lock().unwrap() = Some(events);
        Ok(self.conn.clone())
    }
}
