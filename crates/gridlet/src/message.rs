//! Typed wire messages carried by the relay and peer transports.
//!
//! Every message travels inside one or more [`Envelope`](crate::envelope::Envelope)s.
//! The envelope header carries the routing fields (`type`, `request_id`,
//! `user`, `connection_id`); the body is the message payload (`data`).
//!
//! `user` is the remote connection id: on outbound messages it names the
//! destination, on inbound relay messages the relay rewrites it to the sender.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::envelope::{DecodedMessage, EnvelopeHeader};
use crate::job::JobRequest;

/// Value of the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Connected,
    Disconnected,
    Resources,
    Request,
    Result,
    Dynamics,
    Terminate,
    Rtc,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Resources => "resources",
            Self::Request => "request",
            Self::Result => "result",
            Self::Dynamics => "dynamics",
            Self::Terminate => "terminate",
            Self::Rtc => "rtc",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of a compute resource as announced on the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(rename = "type", default = "default_resource_kind")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default)]
    pub cost: f64,
    #[serde(rename = "time", alias = "time_estimate", default)]
    pub time_estimate: f64,
    #[serde(default, deserialize_with = "deserialize_frameworks")]
    pub frameworks: Vec<String>,
}

fn default_resource_kind() -> String {
    "node".to_string()
}

/// Accepts `["js","py"]` as well as the comma-joined `"js,py"` form.
fn deserialize_frameworks<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Frameworks {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Option::<Frameworks>::deserialize(deserializer)? {
        Some(Frameworks::List(list)) => list,
        Some(Frameworks::Joined(joined)) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Peer negotiation payload. Always relayed, never sent on the peer channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RtcSignal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("{kind} message missing {field}")]
    MissingField {
        kind: MessageKind,
        field: &'static str,
    },
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

/// A fully reassembled wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A resource joined the relay (or, sent by us, local presence).
    Connected { resource: ResourceDescriptor },
    Disconnected { connection_id: String },
    /// Full known-set broadcast from the relay.
    Resources { resources: Vec<ResourceDescriptor> },
    Request {
        request_id: String,
        user: Option<String>,
        job: JobRequest,
    },
    Result {
        request_id: String,
        user: Option<String>,
        data: Value,
    },
    Dynamics {
        request_id: String,
        user: Option<String>,
        data: Value,
    },
    Terminate {
        request_id: String,
        user: Option<String>,
    },
    Rtc {
        user: Option<String>,
        signal: RtcSignal,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Connected { .. } => MessageKind::Connected,
            Self::Disconnected { .. } => MessageKind::Disconnected,
            Self::Resources { .. } => MessageKind::Resources,
            Self::Request { .. } => MessageKind::Request,
            Self::Result { .. } => MessageKind::Result,
            Self::Dynamics { .. } => MessageKind::Dynamics,
            Self::Terminate { .. } => MessageKind::Terminate,
            Self::Rtc { .. } => MessageKind::Rtc,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Request { request_id, .. }
            | Self::Result { request_id, .. }
            | Self::Dynamics { request_id, .. }
            | Self::Terminate { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Remote connection id this message came from or is addressed to.
    pub fn user(&self) -> Option<&str> {
        match self {
            Self::Request { user, .. }
            | Self::Result { user, .. }
            | Self::Dynamics { user, .. }
            | Self::Terminate { user, .. }
            | Self::Rtc { user, .. } => user.as_deref(),
            _ => None,
        }
    }

    /// Address the message to a remote connection.
    pub fn with_user(mut self, connection_id: impl Into<String>) -> Self {
        let connection_id = Some(connection_id.into());
        match &mut self {
            Self::Request { user, .. }
            | Self::Result { user, .. }
            | Self::Dynamics { user, .. }
            | Self::Terminate { user, .. }
            | Self::Rtc { user, .. } => *user = connection_id,
            _ => {}
        }
        self
    }

    /// Split into envelope header and body for encoding.
    pub fn into_parts(self) -> Result<(EnvelopeHeader, Value), serde_json::Error> {
        let kind = self.kind();
        let (request_id, user, connection_id, body) = match self {
            Self::Connected { resource } => {
                let connection_id = resource.connection_id.clone();
                (None, None, connection_id, serde_json::to_value(resource)?)
            }
            Self::Disconnected { connection_id } => (None, None, Some(connection_id), Value::Null),
            Self::Resources { resources } => (None, None, None, serde_json::to_value(resources)?),
            Self::Request {
                request_id,
                user,
                job,
            } => (Some(request_id), user, None, serde_json::to_value(job)?),
            Self::Result {
                request_id,
                user,
                data,
            }
            | Self::Dynamics {
                request_id,
                user,
                data,
            } => (Some(request_id), user, None, data),
            Self::Terminate { request_id, user } => (Some(request_id), user, None, Value::Null),
            Self::Rtc { user, signal } => (None, user, None, serde_json::to_value(signal)?),
        };

        Ok((
            EnvelopeHeader {
                kind,
                request_id,
                user,
                connection_id,
            },
            body,
        ))
    }

    /// Build a typed message from a reassembled envelope.
    pub fn from_decoded(decoded: DecodedMessage) -> Result<Self, MessageError> {
        let DecodedMessage { header, body } = decoded;
        let kind = header.kind;
        let payload = |source| MessageError::Payload { kind, source };
        let request_id = || {
            header
                .request_id
                .clone()
                .ok_or(MessageError::MissingField {
                    kind,
                    field: "request_id",
                })
        };

        Ok(match kind {
            MessageKind::Connected => {
                let mut resource: ResourceDescriptor =
                    serde_json::from_value(body).map_err(payload)?;
                if resource.connection_id.is_none() {
                    resource.connection_id = header.connection_id.clone();
                }
                Self::Connected { resource }
            }
            MessageKind::Disconnected => Self::Disconnected {
                connection_id: header
                    .connection_id
                    .clone()
                    .ok_or(MessageError::MissingField {
                        kind,
                        field: "connection_id",
                    })?,
            },
            MessageKind::Resources => Self::Resources {
                resources: serde_json::from_value(body).map_err(payload)?,
            },
            MessageKind::Request => {
                let request_id = request_id()?;
                let mut job: JobRequest = serde_json::from_value(body).map_err(payload)?;
                if job.request_id.is_empty() {
                    job.request_id = request_id.clone();
                }
                Self::Request {
                    request_id,
                    user: header.user.clone(),
                    job,
                }
            }
            MessageKind::Result => Self::Result {
                request_id: request_id()?,
                user: header.user.clone(),
                data: body,
            },
            MessageKind::Dynamics => Self::Dynamics {
                request_id: request_id()?,
                user: header.user.clone(),
                data: body,
            },
            MessageKind::Terminate => Self::Terminate {
                request_id: request_id()?,
                user: header.user.clone(),
            },
            MessageKind::Rtc => Self::Rtc {
                user: header.user.clone(),
                signal: serde_json::from_value(body).map_err(payload)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_accepts_joined_frameworks() {
        let desc: ResourceDescriptor = serde_json::from_value(json!({
            "machine_id": "abc123",
            "type": "node",
            "name": "lab",
            "capacity": 4,
            "cost": 0,
            "time": 100,
            "frameworks": "js,py"
        }))
        .unwrap();

        assert_eq!(desc.frameworks, vec!["js", "py"]);
        assert_eq!(desc.time_estimate, 100.0);
        assert!(desc.connection_id.is_none());
    }

    #[test]
    fn descriptor_accepts_framework_list() {
        let desc: ResourceDescriptor = serde_json::from_value(json!({
            "machine_id": "abc123",
            "connection_id": "conn-1",
            "frameworks": ["R"]
        }))
        .unwrap();

        assert_eq!(desc.frameworks, vec!["R"]);
        assert_eq!(desc.kind, "node");
        assert_eq!(desc.connection_id.as_deref(), Some("conn-1"));
    }

    #[test]
    fn rtc_signal_uses_browser_shape() {
        let signal = RtcSignal::IceCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });
        insta::assert_json_snapshot!(signal, @r#"
        {
          "type": "ice_candidate",
          "data": {
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
          }
        }
        "#);
    }

    #[test]
    fn rtc_signal_parses_offer() {
        let signal: RtcSignal = serde_json::from_value(json!({
            "type": "offer",
            "data": {"type": "offer", "sdp": "v=0"}
        }))
        .unwrap();

        assert_eq!(
            signal,
            RtcSignal::Offer(SessionDescription {
                kind: SdpType::Offer,
                sdp: "v=0".to_string()
            })
        );
    }

    #[test]
    fn request_takes_request_id_from_header() {
        let decoded = DecodedMessage {
            header: EnvelopeHeader {
                kind: MessageKind::Request,
                request_id: Some("req-1".to_string()),
                user: Some("conn-2".to_string()),
                connection_id: None,
            },
            body: json!({"framework": "py", "sources": [], "fixed_params": {}}),
        };

        match Message::from_decoded(decoded).unwrap() {
            Message::Request {
                request_id,
                user,
                job,
            } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(job.request_id, "req-1");
                assert_eq!(user.as_deref(), Some("conn-2"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn result_without_request_id_is_rejected() {
        let decoded = DecodedMessage {
            header: EnvelopeHeader {
                kind: MessageKind::Result,
                request_id: None,
                user: None,
                connection_id: None,
            },
            body: json!([1, 2]),
        };

        assert!(matches!(
            Message::from_decoded(decoded),
            Err(MessageError::MissingField {
                field: "request_id",
                ..
            })
        ));
    }

    #[test]
    fn with_user_addresses_routable_messages() {
        let msg = Message::Terminate {
            request_id: "r".to_string(),
            user: None,
        }
        .with_user("conn-7");
        assert_eq!(msg.user(), Some("conn-7"));

        let (header, body) = msg.into_parts().unwrap();
        assert_eq!(header.kind, MessageKind::Terminate);
        assert_eq!(header.user.as_deref(), Some("conn-7"));
        assert_eq!(body, Value::Null);
    }
}
