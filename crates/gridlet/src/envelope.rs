//! Size-bounded wire envelopes.
//!
//! A logical message is serialized to JSON text, gzip+base64 compressed when
//! the text exceeds the compression threshold, and split into `part`/`parts`
//! envelopes sharing a `request_id` when the representation still exceeds the
//! frame limit. [`Reassembler`] buffers parts per message until all of them
//! have arrived; an incomplete set never resolves.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::MessageKind;

/// Partial part sets older than this are dropped by periodic eviction.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// How `data` is represented in an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// `data` is the body itself.
    #[default]
    None,
    /// `data` is (a slice of) the body's JSON text.
    Json,
    /// `data` is (a slice of) base64 of the gzipped JSON text.
    Gzip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<u32>,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn header(&self) -> EnvelopeHeader {
        EnvelopeHeader {
            kind: self.kind,
            request_id: self.request_id.clone(),
            user: self.user.clone(),
            connection_id: self.connection_id.clone(),
        }
    }

    fn is_chunk(&self) -> bool {
        self.part.is_some() || self.parts.is_some()
    }
}

/// Routing fields shared by every envelope of one logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub kind: MessageKind,
    pub request_id: Option<String>,
    pub user: Option<String>,
    pub connection_id: Option<String>,
}

impl EnvelopeHeader {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            request_id: None,
            user: None,
            connection_id: None,
        }
    }
}

/// A reassembled logical message.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub header: EnvelopeHeader,
    pub body: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("frame limit must be greater than zero")]
    ZeroFrameLimit,
    #[error("failed to serialize body: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("gzip failed: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("chunked envelope without request_id")]
    MissingRequestId,
    #[error("part {part} out of range for {parts} parts")]
    PartOutOfRange { part: u32, parts: u32 },
    #[error("parts disagree on count or compression")]
    InconsistentParts,
    #[error("expected {expected} parts, got {got}")]
    MissingParts { expected: u32, got: usize },
    #[error("{0:?} payload must be a string")]
    NotText(Compression),
    #[error("no envelopes to decode")]
    Empty,
}

/// Encoder with a fixed frame limit and compression threshold.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    pub frame_limit: usize,
    pub compression_threshold: usize,
}

impl EnvelopeCodec {
    pub fn new(frame_limit: usize, compression_threshold: usize) -> Self {
        Self {
            frame_limit,
            compression_threshold,
        }
    }

    /// Encode `body` into one or more envelopes.
    ///
    /// Chunked messages without a `request_id` get a fresh one so that the
    /// receiver can group their parts.
    pub fn encode(
        &self,
        header: EnvelopeHeader,
        body: Value,
    ) -> Result<Vec<Envelope>, EnvelopeError> {
        if self.frame_limit == 0 {
            return Err(EnvelopeError::ZeroFrameLimit);
        }

        let text = serde_json::to_string(&body)?;
        let (compression, repr) = if text.len() > self.compression_threshold {
            (Compression::Gzip, gzip_base64(&text)?)
        } else {
            (Compression::None, text)
        };

        let single = |compression, data| Envelope {
            kind: header.kind,
            request_id: header.request_id.clone(),
            user: header.user.clone(),
            connection_id: header.connection_id.clone(),
            part: None,
            parts: None,
            compression,
            data,
        };

        if repr.len() <= self.frame_limit {
            let envelope = match compression {
                Compression::None => single(Compression::None, body),
                other => single(other, Value::String(repr)),
            };
            return Ok(vec![envelope]);
        }

        let compression = match compression {
            Compression::None => Compression::Json,
            other => other,
        };
        let request_id = header
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let chunks = split_chunks(&repr, self.frame_limit);
        let parts = chunks.len() as u32;

        tracing::trace!(
            kind = %header.kind,
            request_id = %request_id,
            size_bytes = repr.len(),
            parts,
            "Chunking envelope"
        );

        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| Envelope {
                kind: header.kind,
                request_id: Some(request_id.clone()),
                user: header.user.clone(),
                connection_id: header.connection_id.clone(),
                part: Some(i as u32),
                parts: Some(parts),
                compression,
                data: Value::String(chunk.to_string()),
            })
            .collect())
    }
}

/// Decode a complete envelope set. Parts may be given in any order.
pub fn decode(envelopes: &[Envelope]) -> Result<DecodedMessage, EnvelopeError> {
    let first = envelopes.first().ok_or(EnvelopeError::Empty)?;
    let header = first.header();

    if envelopes.len() == 1 && !first.is_chunk() {
        let body = match first.compression {
            Compression::None => first.data.clone(),
            compression => {
                let text = first.data.as_str().ok_or(EnvelopeError::NotText(compression))?;
                decode_text(compression, text)?
            }
        };
        return Ok(DecodedMessage { header, body });
    }

    let parts = first.parts.ok_or(EnvelopeError::InconsistentParts)?;
    let mut ordered: BTreeMap<u32, &str> = BTreeMap::new();
    for envelope in envelopes {
        if envelope.parts != Some(parts) || envelope.compression != first.compression {
            return Err(EnvelopeError::InconsistentParts);
        }
        let part = envelope.part.ok_or(EnvelopeError::InconsistentParts)?;
        if part >= parts {
            return Err(EnvelopeError::PartOutOfRange { part, parts });
        }
        let text = envelope
            .data
            .as_str()
            .ok_or(EnvelopeError::NotText(envelope.compression))?;
        if ordered.insert(part, text).is_some() {
            return Err(EnvelopeError::InconsistentParts);
        }
    }
    if ordered.len() != parts as usize {
        return Err(EnvelopeError::MissingParts {
            expected: parts,
            got: ordered.len(),
        });
    }

    let joined: String = ordered.into_values().collect();
    let body = match first.compression {
        Compression::None => serde_json::from_str(&joined)?,
        compression => decode_text(compression, &joined)?,
    };
    Ok(DecodedMessage { header, body })
}

fn decode_text(compression: Compression, text: &str) -> Result<Value, EnvelopeError> {
    match compression {
        Compression::Gzip => {
            let raw = BASE64.decode(text)?;
            let mut json = String::new();
            GzDecoder::new(raw.as_slice())
                .read_to_string(&mut json)
                .map_err(EnvelopeError::Gzip)?;
            Ok(serde_json::from_str(&json)?)
        }
        Compression::Json | Compression::None => Ok(serde_json::from_str(text)?),
    }
}

fn gzip_base64(text: &str) -> Result<String, EnvelopeError> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(EnvelopeError::Gzip)?;
    let compressed = encoder.finish().map_err(EnvelopeError::Gzip)?;
    Ok(BASE64.encode(compressed))
}

/// Split on char boundaries into slices of at most `limit` bytes.
fn split_chunks(text: &str, limit: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = limit.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            // limit is narrower than the next char
            end = rest
                .char_indices()
                .nth(1)
                .map_or(rest.len(), |(i, _)| i);
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// Result of feeding one envelope to a [`Reassembler`].
#[derive(Debug)]
pub enum Reassembly {
    /// More parts are needed.
    Pending,
    Complete(DecodedMessage),
    /// This part index was already buffered.
    Duplicate,
    Invalid(EnvelopeError),
}

struct Partial {
    parts: u32,
    started: Instant,
    chunks: BTreeMap<u32, Envelope>,
}

/// Per-connection buffer of incomplete part sets, keyed by message kind and
/// `request_id` (a job's `dynamics` and `result` share its id).
#[derive(Default)]
pub struct Reassembler {
    partials: HashMap<(MessageKind, String), Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope) -> Reassembly {
        if !envelope.is_chunk() {
            return match decode(std::slice::from_ref(&envelope)) {
                Ok(decoded) => Reassembly::Complete(decoded),
                Err(e) => Reassembly::Invalid(e),
            };
        }

        let (Some(part), Some(parts)) = (envelope.part, envelope.parts) else {
            return Reassembly::Invalid(EnvelopeError::InconsistentParts);
        };
        let Some(request_id) = envelope.request_id.clone() else {
            return Reassembly::Invalid(EnvelopeError::MissingRequestId);
        };
        if part >= parts {
            return Reassembly::Invalid(EnvelopeError::PartOutOfRange { part, parts });
        }

        let key = (envelope.kind, request_id);
        let partial = self.partials.entry(key.clone()).or_insert_with(|| Partial {
            parts,
            started: Instant::now(),
            chunks: BTreeMap::new(),
        });

        if partial.parts != parts {
            self.partials.remove(&key);
            return Reassembly::Invalid(EnvelopeError::InconsistentParts);
        }
        if partial.chunks.contains_key(&part) {
            return Reassembly::Duplicate;
        }
        partial.chunks.insert(part, envelope);
        if partial.chunks.len() < parts as usize {
            return Reassembly::Pending;
        }

        let Some(partial) = self.partials.remove(&key) else {
            return Reassembly::Pending;
        };
        let envelopes: Vec<Envelope> = partial.chunks.into_values().collect();
        match decode(&envelopes) {
            Ok(decoded) => Reassembly::Complete(decoded),
            Err(e) => Reassembly::Invalid(e),
        }
    }

    /// Drop part sets that have been incomplete for at least `max_age`.
    /// Returns how many were dropped.
    pub fn evict_stale(&mut self, max_age: Duration) -> usize {
        let before = self.partials.len();
        self.partials
            .retain(|_, partial| partial.started.elapsed() < max_age);
        before - self.partials.len()
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header(kind: MessageKind, request_id: &str) -> EnvelopeHeader {
        EnvelopeHeader {
            request_id: Some(request_id.to_string()),
            ..EnvelopeHeader::new(kind)
        }
    }

    /// A JSON string value whose serialized form is exactly `len` bytes.
    fn body_of_len(len: usize) -> Value {
        Value::String("a".repeat(len - 2))
    }

    #[test]
    fn body_at_frame_limit_is_single_envelope() {
        let codec = EnvelopeCodec::new(64, 1024);
        let body = body_of_len(64);

        let envelopes = codec
            .encode(header(MessageKind::Result, "r1"), body.clone())
            .unwrap();

        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].parts, None);
        assert_eq!(envelopes[0].compression, Compression::None);
        assert_eq!(decode(&envelopes).unwrap().body, body);
    }

    #[test]
    fn body_one_past_frame_limit_is_chunked() {
        let codec = EnvelopeCodec::new(64, 1024);
        let body = body_of_len(65);

        let envelopes = codec
            .encode(header(MessageKind::Result, "r1"), body.clone())
            .unwrap();

        assert_eq!(envelopes.len(), 2);
        assert!(envelopes.iter().all(|e| e.parts == Some(2)));
        assert!(envelopes.iter().all(|e| e.compression == Compression::Json));
        assert_eq!(decode(&envelopes).unwrap().body, body);
    }

    #[test]
    fn parts_reassemble_in_any_arrival_order() {
        let codec = EnvelopeCodec::new(10, 1024);
        let body = body_of_len(30);
        let envelopes = codec
            .encode(header(MessageKind::Request, "r2"), body.clone())
            .unwrap();
        assert_eq!(envelopes.len(), 3);

        let mut reassembler = Reassembler::new();
        assert!(matches!(
            reassembler.push(envelopes[2].clone()),
            Reassembly::Pending
        ));
        assert!(matches!(
            reassembler.push(envelopes[0].clone()),
            Reassembly::Pending
        ));
        match reassembler.push(envelopes[1].clone()) {
            Reassembly::Complete(decoded) => {
                assert_eq!(decoded.body, body);
                assert_eq!(decoded.header.request_id.as_deref(), Some("r2"));
            }
            other => panic!("expected complete, got {other:?}"),
        }
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn large_body_is_gzipped() {
        let codec = EnvelopeCodec::new(1024, 64);
        let body = json!({"series": vec![1.5; 500]});

        let envelopes = codec
            .encode(header(MessageKind::Result, "r3"), body.clone())
            .unwrap();

        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].compression, Compression::Gzip);
        assert!(envelopes[0].data.is_string());
        assert_eq!(decode(&envelopes).unwrap().body, body);
    }

    #[test]
    fn gzipped_body_over_limit_is_chunked() {
        let codec = EnvelopeCodec::new(16, 8);
        let body = json!((0..200).map(|i| i * 7919 % 1013).collect::<Vec<_>>());

        let envelopes = codec
            .encode(header(MessageKind::Result, "r4"), body.clone())
            .unwrap();

        assert!(envelopes.len() > 1);
        assert!(envelopes.iter().all(|e| e.compression == Compression::Gzip));
        let mut reversed = envelopes.clone();
        reversed.reverse();
        assert_eq!(decode(&reversed).unwrap().body, body);
    }

    #[test]
    fn chunks_respect_char_boundaries() {
        let codec = EnvelopeCodec::new(5, 1024);
        let body = json!("héllo wörld ✓");

        let envelopes = codec
            .encode(header(MessageKind::Dynamics, "r5"), body.clone())
            .unwrap();

        assert!(
            envelopes
                .iter()
                .all(|e| e.data.as_str().unwrap().len() <= 5)
        );
        assert_eq!(decode(&envelopes).unwrap().body, body);
    }

    #[test]
    fn chunked_message_without_request_id_gets_one() {
        let codec = EnvelopeCodec::new(8, 1024);
        let envelopes = codec
            .encode(EnvelopeHeader::new(MessageKind::Resources), body_of_len(20))
            .unwrap();

        let id = envelopes[0].request_id.clone();
        assert!(id.is_some());
        assert!(envelopes.iter().all(|e| e.request_id == id));
    }

    #[test]
    fn zero_frame_limit_is_rejected() {
        let codec = EnvelopeCodec::new(0, 1024);
        assert!(matches!(
            codec.encode(header(MessageKind::Result, "r"), json!(1)),
            Err(EnvelopeError::ZeroFrameLimit)
        ));
    }

    #[test]
    fn repeated_part_is_duplicate() {
        let codec = EnvelopeCodec::new(10, 1024);
        let envelopes = codec
            .encode(header(MessageKind::Result, "r6"), body_of_len(25))
            .unwrap();

        let mut reassembler = Reassembler::new();
        assert!(matches!(
            reassembler.push(envelopes[0].clone()),
            Reassembly::Pending
        ));
        assert!(matches!(
            reassembler.push(envelopes[0].clone()),
            Reassembly::Duplicate
        ));
    }

    #[test]
    fn missing_parts_never_resolve_until_evicted() {
        let codec = EnvelopeCodec::new(10, 1024);
        let envelopes = codec
            .encode(header(MessageKind::Result, "r7"), body_of_len(25))
            .unwrap();

        let mut reassembler = Reassembler::new();
        for envelope in &envelopes[..envelopes.len() - 1] {
            assert!(matches!(
                reassembler.push(envelope.clone()),
                Reassembly::Pending
            ));
        }
        assert_eq!(reassembler.evict_stale(DEFAULT_STALE_AFTER), 0);
        assert_eq!(reassembler.pending(), 1);
        assert_eq!(reassembler.evict_stale(Duration::ZERO), 1);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn disagreeing_part_counts_are_invalid() {
        let mut first = Envelope {
            kind: MessageKind::Result,
            request_id: Some("r8".to_string()),
            user: None,
            connection_id: None,
            part: Some(0),
            parts: Some(3),
            compression: Compression::Json,
            data: json!("[1,"),
        };
        let mut reassembler = Reassembler::new();
        assert!(matches!(
            reassembler.push(first.clone()),
            Reassembly::Pending
        ));

        first.part = Some(1);
        first.parts = Some(2);
        assert!(matches!(
            reassembler.push(first),
            Reassembly::Invalid(EnvelopeError::InconsistentParts)
        ));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"bogus","compression":"none","data":{}}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn chunk_wire_format() {
        let codec = EnvelopeCodec::new(4, 1024);
        let envelopes = codec
            .encode(
                EnvelopeHeader {
                    user: Some("conn-1".to_string()),
                    ..header(MessageKind::Result, "req-1")
                },
                json!([1, 2]),
            )
            .unwrap();
        insta::assert_json_snapshot!(envelopes, @r#"
        [
          {
            "type": "result",
            "request_id": "req-1",
            "user": "conn-1",
            "part": 0,
            "parts": 2,
            "compression": "json",
            "data": "[1,2"
          },
          {
            "type": "result",
            "request_id": "req-1",
            "user": "conn-1",
            "part": 1,
            "parts": 2,
            "compression": "json",
            "data": "]"
          }
        ]
        "#);
    }
}
