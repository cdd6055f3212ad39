//! The request passed to handlers.

use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;

use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::proto::Protocol;
use crate::router::PathParams;

/// An HTTP request, fully read off the wire.
///
/// The body is buffered in its entirety before the handler runs. A `Request`
/// is immutable once delivered; the one mutation the engine performs is
/// filling in the matched route's path parameters before dispatch.
pub struct Request {
    method: Method,
    target: String,
    path_end: usize,
    query: Vec<(String, String)>,
    version: Protocol,
    headers: HeaderMap,
    body: Bytes,
    path_params: PathParams,
    remote_addr: SocketAddr,
    json: OnceLock<serde_json::Result<serde_json::Value>>,
}

impl Request {
    /// Assembles a request from parsed parts.
    ///
    /// `target` is the request-target as received, undecoded. Used by the
    /// protocol engines and by HTTP/3 transport adapters feeding requests
    /// into the dispatcher.
    pub fn new(
        method: Method,
        target: impl Into<String>,
        version: Protocol,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: SocketAddr,
    ) -> Request {
        let target = target.into();
        let path_end = target.find('?').unwrap_or(target.len());
        let query = parse_query(&target[(path_end + 1).min(target.len())..]);
        Request {
            method,
            target,
            path_end,
            query,
            version,
            headers,
            body,
            path_params: PathParams::default(),
            remote_addr,
            json: OnceLock::new(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The undecoded path component of the request-target.
    pub fn path(&self) -> &str {
        &self.target[..self.path_end]
    }

    /// The full request-target as received.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Percent-decoded query pairs, in wire order. Duplicates are kept.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// First query value with the given name, if any.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn version(&self) -> Protocol {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value as a string, if present and visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Parameters captured by the matched route template.
    pub fn path_params(&self) -> &PathParams {
        &self.path_params
    }

    /// A single captured path parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The body decoded as JSON, parsed once and memoized.
    ///
    /// A malformed body is a value here, not a panic; repeated calls return
    /// the same result without re-parsing.
    pub fn json(&self) -> Result<&serde_json::Value, &serde_json::Error> {
        self.json
            .get_or_init(|| serde_json::from_slice(&self.body))
            .as_ref()
    }

    pub(crate) fn set_path_params(&mut self, params: PathParams) {
        self.path_params = params;
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Decodes one percent-encoded component. Returns `None` on a truncated or
/// non-hex escape.
pub(crate) fn percent_decode(raw: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter().copied();
    while let Some(b) = iter.next() {
        if b == b'%' {
            let hi = hex_digit(iter.next()?)?;
            let lo = hex_digit(iter.next()?)?;
            out.push(hi << 4 | lo);
        } else {
            out.push(b);
        }
    }
    Some(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Splits a raw query string into decoded (name, value) pairs, preserving
/// order and duplicates. `+` decodes to a space; undecodable pairs are
/// dropped rather than failing the request.
fn parse_query(raw: &str) -> Vec<(String, String)> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (name, value) = match pair.split_once('=') {
                Some((n, v)) => (n, v),
                None => (pair, ""),
            };
            Some((decode_component(name)?, decode_component(value)?))
        })
        .collect()
}

fn decode_component(raw: &str) -> Option<String> {
    let plus_mapped: Vec<u8> = raw
        .bytes()
        .map(|b| if b == b'+' { b' ' } else { b })
        .collect();
    String::from_utf8(percent_decode(&plus_mapped)?).ok()
}
