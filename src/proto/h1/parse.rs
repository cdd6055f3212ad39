//! Incremental HTTP/1.x request-head parsing.
//!
//! Operates on the connection's growing read buffer. Each call either
//! consumes one complete head, reports that more bytes are needed, or fails
//! with the parse error the driver converts into a 4xx response.

use bytes::BytesMut;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};

use crate::error::Parse;
use crate::proto::Protocol;

pub(crate) const MAX_HEADERS: usize = 100;
/// Request-target cap.
pub(crate) const MAX_TARGET_LEN: usize = 8 * 1024;
/// Cap on a single header line (name + value).
pub(crate) const MAX_HEADER_LINE: usize = 8 * 1024;
/// Cap on the entire head block.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

const AVERAGE_HEADER_SIZE: usize = 30;

/// A parsed request line plus header block.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) version: Protocol,
    pub(crate) headers: HeaderMap,
}

/// `Ok(None)` means the buffer does not yet hold a complete head.
pub(crate) type ParseResult = Result<Option<RequestHead>, Parse>;

pub(crate) fn parse_head(buf: &mut BytesMut) -> ParseResult {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut headers_indices = [HeaderIndices {
        name: (0, 0),
        value: (0, 0),
    }; MAX_HEADERS];

    let (len, method, target, version, headers_len) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        tracing::trace!(buf_len = buf.len(), "parse_head");
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf)? {
            httparse::Status::Complete(len) => {
                if len > MAX_HEAD_SIZE {
                    return Err(Parse::HeadTooLarge);
                }
                let method = Method::from_bytes(
                    req.method.expect("method filled on Complete").as_bytes(),
                )?;
                let target = req.path.expect("path filled on Complete");
                if target.len() > MAX_TARGET_LEN {
                    return Err(Parse::UriTooLong);
                }
                let version = match req.version.expect("version filled on Complete") {
                    0 => Protocol::Http10,
                    1 => Protocol::Http11,
                    _ => return Err(Parse::Version),
                };
                record_header_indices(buf, req.headers, &mut headers_indices)?;
                (
                    len,
                    method,
                    target.to_owned(),
                    version,
                    req.headers.len(),
                )
            }
            httparse::Status::Partial => {
                return if buf.len() > MAX_HEAD_SIZE {
                    Err(Parse::HeadTooLarge)
                } else {
                    Ok(None)
                };
            }
        }
    };

    let slice = buf.split_to(len).freeze();
    let mut headers = HeaderMap::with_capacity(headers_len);
    for indices in &headers_indices[..headers_len] {
        let name = HeaderName::from_bytes(&slice[indices.name.0..indices.name.1])?;
        let value = HeaderValue::from_maybe_shared(slice.slice(indices.value.0..indices.value.1))?;
        headers.append(name, value);
    }

    tracing::trace!(%method, target = %target, head_len = len, "parsed request head");
    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

#[derive(Clone, Copy)]
struct HeaderIndices {
    name: (usize, usize),
    value: (usize, usize),
}

fn record_header_indices(
    bytes: &[u8],
    headers: &[httparse::Header<'_>],
    indices: &mut [HeaderIndices],
) -> Result<(), Parse> {
    let bytes_ptr = bytes.as_ptr() as usize;
    for (header, indices) in headers.iter().zip(indices.iter_mut()) {
        if header.name.len() + header.value.len() > MAX_HEADER_LINE {
            return Err(Parse::HeadTooLarge);
        }
        let name_start = header.name.as_ptr() as usize - bytes_ptr;
        indices.name = (name_start, name_start + header.name.len());
        let value_start = header.value.as_ptr() as usize - bytes_ptr;
        indices.value = (value_start, value_start + header.value.len());
    }
    Ok(())
}

/// Approximate capacity to reserve when serializing a head with `n` headers.
pub(crate) fn head_capacity(n: usize) -> usize {
    30 + n * AVERAGE_HEADER_SIZE
}

/// Reads a single header value as bytes, for headers that do not repeat.
pub(crate) fn single_value<'m>(headers: &'m HeaderMap, name: &str) -> Option<&'m [u8]> {
    let mut iter = headers.get_all(name).iter();
    let value = iter.next()?;
    if iter.next().is_some() {
        return None;
    }
    Some(value.as_bytes())
}

/// True when any comma-separated element of the named header equals `token`,
/// ASCII case-insensitively. `Connection` and friends use this form.
pub(crate) fn header_contains_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| {
                v.split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    })
}
