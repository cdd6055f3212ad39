//! The response returned by handlers.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use serde::Serialize;

use crate::handler::HandlerError;

/// An HTTP response under construction.
///
/// Mutable until the handler returns it; the engine then computes framing
/// headers (`Content-Length`, `Date`, `Connection`) during serialization.
#[derive(Debug, Default)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    push_promises: Vec<PushPromise>,
}

/// A resource to push ahead of the response on HTTP/2.
///
/// Ignored on other protocols and when the client has disabled push.
#[derive(Clone, Debug)]
pub struct PushPromise {
    pub path: String,
    pub as_type: String,
}

impl Response {
    pub fn new(status: StatusCode) -> Response {
        Response {
            status,
            ..Response::default()
        }
    }

    /// A `200 OK` response with a `text/plain` body.
    pub fn text(body: impl Into<Bytes>) -> Response {
        let mut res = Response::new(StatusCode::OK);
        res.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        res.body = body.into();
        res
    }

    /// A `200 OK` response with a serialized JSON body.
    pub fn json<T: Serialize>(value: &T) -> Result<Response, HandlerError> {
        let body = serde_json::to_vec(value).map_err(HandlerError::new)?;
        let mut res = Response::new(StatusCode::OK);
        res.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        res.body = Bytes::from(body);
        Ok(res)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Response {
        self.status = status;
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Appends a header, keeping any existing values for the same name.
    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) -> &mut Response {
        self.headers.append(name, value);
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) -> &mut Response {
        self.body = body.into();
        self
    }

    /// Consuming variant of [`set_body`](Self::set_body) for builder-style use.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Response {
        self.body = body.into();
        self
    }

    /// Queues a server push of `path` ahead of this response's headers.
    pub fn push(&mut self, path: impl Into<String>, as_type: impl Into<String>) -> &mut Response {
        self.push_promises.push(PushPromise {
            path: path.into(),
            as_type: as_type.into(),
        });
        self
    }

    pub fn push_promises(&self) -> &[PushPromise] {
        &self.push_promises
    }

    pub(crate) fn take_push_promises(&mut self) -> Vec<PushPromise> {
        std::mem::take(&mut self.push_promises)
    }

    pub(crate) fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }
}
