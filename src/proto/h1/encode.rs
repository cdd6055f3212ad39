//! HTTP/1.x response serialization.

use bytes::BytesMut;
use http::header::{CONNECTION, CONTENT_LENGTH, DATE, SERVER, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};

use super::date;
use super::parse::head_capacity;
use crate::proto::Protocol;

const SERVER_NAME: &[u8] = b"weft";

/// Serializes a response head plus body into the write buffer.
///
/// Framing headers are computed here: `Content-Length` always reflects the
/// entity (even for HEAD, whose body is suppressed), a `Date` and `Server`
/// are added when the handler didn't set them, and `Connection` advertises
/// the keep-alive decision.
pub(crate) fn encode_response(
    version: Protocol,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    method: &Method,
    keep_alive: bool,
    dst: &mut BytesMut,
) {
    dst.reserve(head_capacity(headers.len()) + body.len());

    match version {
        Protocol::Http10 => dst.extend_from_slice(b"HTTP/1.0 "),
        _ => dst.extend_from_slice(b"HTTP/1.1 "),
    }
    dst.extend_from_slice(status.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        // framing is ours to decide
        if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING || *name == CONNECTION {
            continue;
        }
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    if !headers.contains_key(DATE) {
        dst.extend_from_slice(b"date: ");
        date::extend(dst);
        dst.extend_from_slice(b"\r\n");
    }
    if !headers.contains_key(SERVER) {
        dst.extend_from_slice(b"server: ");
        dst.extend_from_slice(SERVER_NAME);
        dst.extend_from_slice(b"\r\n");
    }

    if can_have_body(method, status) {
        dst.extend_from_slice(b"content-length: ");
        let mut fmt = itoa::Buffer::new();
        dst.extend_from_slice(fmt.format(body.len()).as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    dst.extend_from_slice(if keep_alive {
        b"connection: keep-alive\r\n"
    } else {
        b"connection: close\r\n"
    });
    dst.extend_from_slice(b"\r\n");

    if *method != Method::HEAD && can_have_body(method, status) {
        dst.extend_from_slice(body);
    }
}

/// Writes an interim `100 Continue` before the body is read.
pub(crate) fn encode_continue(dst: &mut BytesMut) {
    dst.extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
}

fn can_have_body(method: &Method, status: StatusCode) -> bool {
    if *method == Method::CONNECT && status.is_success() {
        return false;
    }
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}
