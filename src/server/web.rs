//! gRPC-Web translation.
//!
//! Browsers cannot speak native gRPC: request and response bodies travel
//! over HTTP/1.1, trailers are folded into the body as a `0x80`-tagged
//! frame, and in the `grpc-web-text` flavor the whole body is base64.
//! [`WebAdapter`] translates between that representation and the
//! frame-level events the [`ServerRpc`](crate::server::ServerRpc) machine
//! speaks.

use std::{error::Error, fmt};

use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use http::{header::CONNECTION, HeaderMap};

use crate::metadata::ContentType;

/// Trailer frames are tagged by the high bit of the flag byte.
const TRAILER_FLAG: u8 = 0x80;

/// A duplex translator for one gRPC-Web request.
#[derive(Debug)]
pub struct WebAdapter {
    text: bool,
    /// Undecoded base64 tail, waiting for a multiple-of-4 boundary.
    decode_buf: Vec<u8>,
    /// In text mode the response is accumulated and encoded as one base64
    /// unit together with the trailer frame.
    response_buf: BytesMut,
    close_connection: bool,
}

/// Error raised when a text-mode body is not valid base64.
#[derive(Debug)]
pub struct InvalidBase64;

impl fmt::Display for InvalidBase64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request body is not valid base64")
    }
}

impl Error for InvalidBase64 {}

impl WebAdapter {
    /// Create an adapter for the request's content-type family, or `None`
    /// when the request is native gRPC and needs no translation.
    pub fn new(content_type: ContentType, request_headers: &HeaderMap) -> Option<WebAdapter> {
        let text = match content_type {
            ContentType::Grpc => return None,
            ContentType::GrpcWeb => false,
            ContentType::GrpcWebText => true,
        };

        let close_connection = request_headers
            .get(CONNECTION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"))
            });

        Some(WebAdapter {
            text,
            decode_buf: Vec::new(),
            response_buf: BytesMut::new(),
            close_connection,
        })
    }

    /// Whether the response must carry `connection: close`.
    pub fn connection_close(&self) -> bool {
        self.close_connection
    }

    /// Translate a chunk of the request body into DATA bytes.
    ///
    /// In text mode, base64 input is buffered until a multiple-of-4
    /// boundary and decoded from there; the undecodable tail waits for the
    /// next chunk.
    pub fn decode_request_data(&mut self, chunk: &[u8]) -> Result<Bytes, InvalidBase64> {
        if !self.text {
            return Ok(Bytes::copy_from_slice(chunk));
        }

        self.decode_buf.extend_from_slice(chunk);
        let decodable = self.decode_buf.len() - self.decode_buf.len() % 4;
        if decodable == 0 {
            return Ok(Bytes::new());
        }

        let tail = self.decode_buf.split_off(decodable);
        let ready = std::mem::replace(&mut self.decode_buf, tail);

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&ready)
            .map_err(|_| InvalidBase64)?;
        Ok(Bytes::from(decoded))
    }

    /// The request body ended. Fails when undecoded base64 remains.
    pub fn finish_request(&mut self) -> Result<(), InvalidBase64> {
        if self.text && !self.decode_buf.is_empty() {
            return Err(InvalidBase64);
        }
        Ok(())
    }

    /// Translate response DATA bytes.
    ///
    /// Binary mode passes them through; text mode accumulates them so the
    /// body and trailer frame are encoded as one base64 unit.
    pub fn encode_response_data(&mut self, data: &[u8]) -> Bytes {
        if !self.text {
            return Bytes::copy_from_slice(data);
        }
        self.response_buf.put_slice(data);
        Bytes::new()
    }

    /// Fold the trailers into the response body as a trailer frame, ending
    /// the translation.
    ///
    /// The frame is `0x80`, a big-endian length, then CRLF-terminated
    /// `name: value` lines. In text mode the accumulated body plus the frame
    /// come back as one base64 buffer.
    pub fn encode_trailers(&mut self, trailers: &HeaderMap) -> Bytes {
        let frame = trailer_frame(trailers);

        if !self.text {
            return frame;
        }

        self.response_buf.put(frame);
        let body = std::mem::take(&mut self.response_buf);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&body[..]);
        Bytes::from(encoded)
    }
}

fn trailer_frame(trailers: &HeaderMap) -> Bytes {
    let mut lines = BytesMut::new();
    for (name, value) in trailers {
        lines.put_slice(name.as_str().as_bytes());
        lines.put_slice(b": ");
        lines.put_slice(value.as_bytes());
        lines.put_slice(b"\r\n");
    }

    let mut frame = BytesMut::with_capacity(5 + lines.len());
    frame.put_u8(TRAILER_FLAG);
    frame.put_u32(lines.len() as u32);
    frame.put(lines);
    frame.freeze()
}
