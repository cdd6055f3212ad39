//! The WebSocket opening handshake (RFC 6455 §4).

use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};

use crate::proto::h1::parse::{header_contains_token, single_value, RequestHead};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Checks the upgrade request and returns the client key to accept.
pub(crate) fn validate(head: &RequestHead) -> Result<String, &'static str> {
    if head.method != http::Method::GET {
        return Err("websocket upgrade requires GET");
    }
    if !header_contains_token(&head.headers, "sec-websocket-version", "13") {
        return Err("unsupported websocket version");
    }
    let key = single_value(&head.headers, "sec-websocket-key")
        .ok_or("missing sec-websocket-key")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|_| "sec-websocket-key is not base64")?;
    if decoded.len() != 16 {
        return Err("sec-websocket-key must encode 16 bytes");
    }
    String::from_utf8(key.to_vec()).map_err(|_| "sec-websocket-key is not ascii")
}

/// `base64(SHA1(key + GUID))`.
pub(crate) fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID);
    base64::engine::general_purpose::STANDARD.encode(sha1.finalize())
}

/// Serializes the `101 Switching Protocols` answer.
pub(crate) fn encode_accept(key: &str, dst: &mut BytesMut) {
    dst.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    dst.extend_from_slice(b"upgrade: websocket\r\n");
    dst.extend_from_slice(b"connection: Upgrade\r\n");
    dst.extend_from_slice(b"sec-websocket-accept: ");
    dst.extend_from_slice(accept_key(key).as_bytes());
    dst.extend_from_slice(b"\r\n\r\n");
}
