//! gRPC header vocabulary shared by the client and server state machines.

use base64::Engine as _;
use http::{header::HeaderName, HeaderMap, HeaderValue};

/// `grpc-status`, carried in trailers (or a trailers-only header block).
pub const GRPC_STATUS_HEADER: &str = "grpc-status";

/// `grpc-message`, the percent-encoded status message.
pub const GRPC_MESSAGE_HEADER: &str = "grpc-message";

/// `grpc-status-details-bin`, base64-encoded opaque status details.
pub const GRPC_STATUS_DETAILS_HEADER: &str = "grpc-status-details-bin";

/// `grpc-encoding`, the compression algorithm applied to messages.
pub const GRPC_ENCODING_HEADER: &str = "grpc-encoding";

/// `grpc-accept-encoding`, the compression algorithms a peer will decode.
pub const GRPC_ACCEPT_ENCODING_HEADER: &str = "grpc-accept-encoding";

/// `grpc-timeout`, the wire-format RPC deadline.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// The canonical gRPC content type.
pub const GRPC_CONTENT_TYPE: HeaderValue = HeaderValue::from_static("application/grpc");

/// The `te` value every gRPC request must carry; proxies that strip it are
/// detected by its absence on the server side.
pub const TE_TRAILERS: HeaderValue = HeaderValue::from_static("trailers");

/// `user-agent` sent when the caller does not supply one.
pub const DEFAULT_USER_AGENT: &str = concat!("grpc-rust-grpcore/", env!("CARGO_PKG_VERSION"));

/// The content-type families this engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// `application/grpc`, optionally `+proto` or `+json`.
    Grpc,
    /// `application/grpc-web`, optionally `+proto`.
    GrpcWeb,
    /// `application/grpc-web-text`, optionally `+proto`.
    GrpcWebText,
}

impl ContentType {
    /// Parse a `content-type` header value into its gRPC family.
    ///
    /// Returns `None` for anything that is not a gRPC content type; the
    /// server responds `415` in that case.
    pub fn parse(value: &HeaderValue) -> Option<ContentType> {
        let value = value.to_str().ok()?;

        // The subtype suffix (`+proto`, `+json`) does not change the family.
        let (base, _subtype) = match value.split_once('+') {
            Some((base, subtype)) => (base, Some(subtype)),
            None => (value, None),
        };

        match base {
            "application/grpc" => Some(ContentType::Grpc),
            "application/grpc-web" => Some(ContentType::GrpcWeb),
            "application/grpc-web-text" => Some(ContentType::GrpcWebText),
            _ => None,
        }
    }

    /// The canonical response `content-type` for this family.
    pub fn to_header_value(self) -> HeaderValue {
        match self {
            ContentType::Grpc => GRPC_CONTENT_TYPE,
            ContentType::GrpcWeb => HeaderValue::from_static("application/grpc-web"),
            ContentType::GrpcWebText => HeaderValue::from_static("application/grpc-web-text"),
        }
    }
}

/// Whether a response `content-type` is acceptable on the client side.
///
/// The client only requires the `application/grpc` prefix; servers are
/// allowed to answer with any subtype of the family they were addressed in.
pub(crate) fn is_grpc_response_content_type(value: &HeaderValue) -> bool {
    value
        .as_bytes()
        .starts_with(GRPC_CONTENT_TYPE.as_bytes())
}

/// Headers the engine owns; user metadata may not override them.
pub(crate) fn is_reserved_header(name: &str) -> bool {
    matches!(
        name,
        GRPC_STATUS_HEADER
            | GRPC_MESSAGE_HEADER
            | GRPC_STATUS_DETAILS_HEADER
            | GRPC_ENCODING_HEADER
            | GRPC_ACCEPT_ENCODING_HEADER
            | GRPC_TIMEOUT_HEADER
            | "content-type"
            | "te"
            | "user-agent"
    )
}

/// Copy user metadata into an outgoing header block, skipping reserved names.
///
/// `http::HeaderName` is always lowercase, so normalization is inherent; this
/// only filters names the engine itself owns.
pub(crate) fn merge_user_metadata(target: &mut HeaderMap, metadata: &HeaderMap) {
    let mut last_name: Option<HeaderName> = None;
    for (name, value) in metadata {
        if is_reserved_header(name.as_str()) {
            continue;
        }
        // `HeaderMap` iteration repeats values of a multi-valued header with
        // the same name; use append so none are dropped.
        if last_name.as_ref() == Some(name) {
            target.append(name.clone(), value.clone());
        } else {
            target.insert(name.clone(), value.clone());
            last_name = Some(name.clone());
        }
    }
}

pub(crate) fn base64_encode(value: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(value)
}

pub(crate) fn base64_decode(value: &[u8]) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(value).ok()
}
