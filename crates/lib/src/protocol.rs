//! Tunnel wire protocol shared by the gateway and the client.
//!
//! Every WebSocket text frame carries exactly one JSON message tagged by `"type"`.
//! Bodies and chunks travel as base64 because the frames are textual.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Protocol version reported by the health endpoint.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest slice of body bytes carried by one `response-chunk` (500 KiB).
pub const CHUNK_SIZE: usize = 500 * 1024;

/// Hard per-message ceiling of the transport (1 MiB). `CHUNK_SIZE` stays well below it
/// after base64 expansion.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Largest inbound request body the gateway forwards (8 MiB). Larger uploads are refused
/// with 413 before anything is sent to the client.
pub const MAX_REQUEST_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Ceiling the client applies to gateway-to-client messages (16 MiB). A `request` carrying
/// a [`MAX_REQUEST_BODY_SIZE`] body in base64 plus its headers stays below it.
pub const MAX_REQUEST_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Header the client sends on the upgrade request to identify itself.
pub const CLIENT_MARKER_HEADER: &str = "x-backhaul-client";

/// Value of [`CLIENT_MARKER_HEADER`].
pub const CLIENT_MARKER: &str = "backhaul";

/// Close code sent to a connection that was replaced by a newer one for the same tunnel.
pub const CLOSE_SUPERSEDED: u16 = 4000;

/// Ordered header list; repeated names (e.g. `set-cookie`) are kept as separate entries.
pub type Headers = Vec<(String, String)>;

/// One protocol message. Wire form: `{ "type": "response-chunk", "id": "...", "chunk": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Gateway → client: perform this request against the local target.
    Request {
        id: String,
        method: String,
        url: String,
        #[serde(default)]
        headers: Headers,
        /// Base64 body; absent when the inbound request had no body.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    /// Client → gateway: status and headers of the downstream response.
    ResponseStart {
        id: String,
        status: u16,
        #[serde(default)]
        headers: Headers,
    },
    /// Client → gateway: next slice of the response body (base64).
    ResponseChunk { id: String, chunk: String },
    /// Client → gateway: body finished.
    ResponseEnd { id: String },
    /// Client → gateway: the exchange failed; no `response-end` follows.
    ResponseError { id: String, error: String },
}

/// Response of `POST /api/tunnels`: the allocated name, its public URL and the URL to dial.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub name: String,
    pub url: String,
    pub connect_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid base64 payload: {0}")]
    Encoding(#[from] base64::DecodeError),
}

impl Message {
    /// Correlation id of the exchange this message belongs to.
    pub fn id(&self) -> &str {
        match self {
            Message::Request { id, .. }
            | Message::ResponseStart { id, .. }
            | Message::ResponseChunk { id, .. }
            | Message::ResponseEnd { id }
            | Message::ResponseError { id, .. } => id,
        }
    }

    /// Parse one text frame. Unknown `type` values and missing fields are rejected.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> String {
        // Serializing a plain enum of strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Build a `response-chunk` carrying `bytes`.
    pub fn chunk(id: impl Into<String>, bytes: &[u8]) -> Self {
        Message::ResponseChunk {
            id: id.into(),
            chunk: encode(bytes),
        }
    }

    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Message::ResponseError {
            id: id.into(),
            error: error.into(),
        }
    }
}

/// Base64-encode a binary payload.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Exact inverse of [`encode`]; empty input decodes to an empty buffer.
pub fn decode(text: &str) -> Result<Vec<u8>, ProtocolError> {
    Ok(STANDARD.decode(text)?)
}

/// Split `data` into ordered slices of at most `size` bytes. Empty input yields no slices.
pub fn chunk(data: &[u8], size: usize) -> Vec<&[u8]> {
    data.chunks(size.max(1)).collect()
}

/// Concatenate slices in emission order.
pub fn combine<T: AsRef<[u8]>>(parts: &[T]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.as_ref().len()).sum();
    let mut out = Vec::with_capacity(len);
    for part in parts {
        out.extend_from_slice(part.as_ref());
    }
    out
}

/// Hop-by-hop headers are meaningful for a single connection only and are never forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
    const HOP: [&str; 8] = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Request headers that are recomputed by whoever sends the request onward: hop-by-hop
/// headers plus `host` and `content-length`. Response headers only drop hop-by-hop ones.
pub fn is_request_only(name: &str) -> bool {
    is_hop_by_hop(name)
        || name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("content-length")
}
