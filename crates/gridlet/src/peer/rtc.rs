//! [`PeerConnection`] over webrtc-rs with a single text data channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{ConnectionEvent, PeerConnection, PeerConnector, PeerError};
use crate::message::{IceCandidate, SdpType, SessionDescription};

const CHANNEL_LABEL: &str = "gridlet";

pub fn default_ice_servers() -> Vec<String> {
    std::iter::once("stun:stun.l.google.com:19302".to_string())
        .chain((1..=4).map(|n| format!("stun:stun{n}.l.google.com:19302")))
        .collect()
}

pub struct RtcConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, PeerError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn open(
        &self,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let conn = Arc::new(RtcConnection {
            pc,
            channel: Arc::new(Mutex::new(None)),
            remote_set: AtomicBool::new(false),
            events,
        });
        conn.install_handlers();
        Ok(conn)
    }
}

pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    remote_set: AtomicBool,
    events: mpsc::Sender<ConnectionEvent>,
}

impl RtcConnection {
    fn install_handlers(&self) {
        let tx = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            forward(&tx, ConnectionEvent::LocalCandidate(from_init(init))).await;
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to serialize ICE candidate"),
                    }
                })
            }));

        let tx = self.events.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |_state: RTCIceGathererState| {
                let tx = tx.clone();
                Box::pin(async move {
                    forward(&tx, ConnectionEvent::GatheringStateChanged).await;
                })
            }));

        let tx = self.events.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                let tx = tx.clone();
                Box::pin(async move {
                    if state == RTCSignalingState::Stable {
                        forward(&tx, ConnectionEvent::SignalingStable).await;
                    }
                })
            }));

        let tx = self.events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    tracing::debug!(%state, "ICE connection state changed");
                    if state == RTCIceConnectionState::Failed {
                        forward(&tx, ConnectionEvent::IceFailed).await;
                    }
                })
            }));

        // passive side: the remote opens the channel
        let tx = self.events.clone();
        let slot = self.channel.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let tx = tx.clone();
                let slot = slot.clone();
                Box::pin(async move {
                    tracing::debug!(label = %dc.label(), "Remote data channel");
                    wire_channel(&dc, tx);
                    if let Ok(mut slot) = slot.lock() {
                        *slot = Some(dc);
                    }
                })
            }));
    }

    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().ok().and_then(|slot| slot.clone())
    }

    async fn set_remote(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Pass a callback event to the transport; it may already be gone.
async fn forward(tx: &mpsc::Sender<ConnectionEvent>, event: ConnectionEvent) {
    if let Err(mpsc::error::SendError(event)) = tx.send(event).await {
        tracing::debug!(?event, "Peer transport gone, dropping connection event");
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: mpsc::Sender<ConnectionEvent>) {
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            forward(&tx, ConnectionEvent::ChannelOpen).await;
        })
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            forward(&tx, ConnectionEvent::ChannelClosed).await;
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = events.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    forward(&tx, ConnectionEvent::Message(text)).await;
                }
                Err(_) => tracing::warn!("Dropping non-UTF-8 data channel message"),
            }
        })
    }));
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    Ok(match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        other => return Err(PeerError::UnsupportedSdp(other)),
    })
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        _ => SdpType::Rollback,
    };
    if kind == SdpType::Rollback {
        return Err(PeerError::UnsupportedSdp(kind));
    }
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let dc = self.pc.create_data_channel(CHANNEL_LABEL, None).await?;
        wire_channel(&dc, self.events.clone());
        if let Ok(mut slot) = self.channel.lock() {
            *slot = Some(dc);
        }

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        from_rtc(offer)
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.set_remote(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        from_rtc(answer)
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        self.set_remote(answer).await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc.add_ice_candidate(to_init(candidate)).await?;
        Ok(())
    }

    fn signaling_stable(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
            && self.pc.signaling_state() == RTCSignalingState::Stable
    }

    fn ice_connected(&self) -> bool {
        matches!(
            self.pc.ice_connection_state(),
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
        )
    }

    async fn send(&self, text: String) -> Result<(), PeerError> {
        let dc = self.channel().ok_or(PeerError::ChannelNotOpen)?;
        dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }
}
