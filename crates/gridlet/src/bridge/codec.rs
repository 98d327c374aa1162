//! Newline-delimited JSON codec for worker pipes.
//!
//! Wraps `LinesCodec`, so partial reads are buffered until a newline arrives
//! regardless of how the OS chunks the byte stream. Lines that are empty or
//! not valid JSON for `T` are logged and skipped; a worker printing stray
//! text to stdout must not take the job down.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Upper bound for a single line from a worker.
pub const MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;

pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            _phantom: PhantomData,
        }
    }
}

fn lines_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

fn parse_line<T: DeserializeOwned>(line: &str) -> Option<T> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::warn!(error = %e, line_len = trimmed.len(), "Skipping malformed worker line");
            None
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode(src).map_err(lines_error)? {
            if let Some(item) = parse_line(&line) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode_eof(src).map_err(lines_error)? {
            if let Some(item) = parse_line(&line) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        self.inner.encode(json, dst).map_err(lines_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{WorkerRequest, WorkerResponse};
    use crate::job::JobRequest;
    use serde_json::json;

    #[test]
    fn encoded_request_is_one_line() {
        let mut codec = JsonLinesCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();

        let req = WorkerRequest::Job {
            request: JobRequest::new("r1", "py").into(),
        };
        codec.encode(req, &mut buf).unwrap();

        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(buf.last(), Some(&b'\n'));
    }

    #[test]
    fn partial_line_is_held_until_newline() {
        let mut codec = JsonLinesCodec::<WorkerResponse>::new();
        let mut buf = BytesMut::from(&br#"{"type":"dynamics","da"#[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ta\":1}\n{\"type\":\"result\",");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WorkerResponse::Dynamics { data: json!(1) })
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"data\":[]}\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WorkerResponse::Result { data: json!([]) })
        );
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let mut codec = JsonLinesCodec::<WorkerResponse>::new();
        let mut buf = BytesMut::from(
            &b"loading model...\n\n{\"type\":\"result\",\"data\":{}}\n"[..],
        );

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WorkerResponse::Result { data: json!({}) })
        );
    }

    #[test]
    fn trailing_line_without_newline_decodes_at_eof() {
        let mut codec = JsonLinesCodec::<WorkerResponse>::new();
        let mut buf = BytesMut::from(&br#"{"type":"result","data":2}"#[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some(WorkerResponse::Result { data: json!(2) })
        );
    }
}
