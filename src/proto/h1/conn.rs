//! The per-connection HTTP/1.x driver.
//!
//! Pumps bytes into the head parser, assembles the body, dispatches, writes
//! the serialized response, and loops while keep-alive holds. Protocol
//! switches (WebSocket, h2c, prior-knowledge HTTP/2) exit the loop by handing
//! the transport to the other engine.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use http::header::HeaderMap;
use http::{Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use super::{decode, encode, parse};
use crate::buffer::PooledBuf;
use crate::dispatch::error_response;
use crate::error::{Error, Parse, Result};
use crate::proto::h2::{self, Http2Conn};
use crate::proto::ws;
use crate::proto::{Io, Protocol};
use crate::request::Request;
use crate::server::ConnShared;

pub(crate) struct Http1Conn<T> {
    io: T,
    read_buf: PooledBuf,
    write_buf: PooledBuf,
    remote_addr: SocketAddr,
    shared: Arc<ConnShared>,
    shutdown: watch::Receiver<bool>,
}

enum HeadRead {
    Head(parse::RequestHead),
    H2Preface,
    Eof,
}

impl<T: Io> Http1Conn<T> {
    pub(crate) fn new(
        io: T,
        read_buf: PooledBuf,
        write_buf: PooledBuf,
        remote_addr: SocketAddr,
        shared: Arc<ConnShared>,
        shutdown: watch::Receiver<bool>,
    ) -> Http1Conn<T> {
        Http1Conn {
            io,
            read_buf,
            write_buf,
            remote_addr,
            shared,
            shutdown,
        }
    }

    pub(crate) async fn serve(mut self) -> Result<()> {
        loop {
            // Idle phase: wait for the first byte of the next request, or
            // close quietly when the keep-alive window passes in silence.
            if self.read_buf.is_empty() {
                let idle_deadline = Instant::now() + self.shared.config.keep_alive_timeout;
                tokio::select! {
                    read = timeout_at(idle_deadline, self.io.read_buf(&mut *self.read_buf)) => {
                        match read {
                            Ok(Ok(0)) => return Ok(()),
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => return Err(Error::new_io(e)),
                            Err(_) => {
                                tracing::trace!("keep-alive window elapsed, closing");
                                return Ok(());
                            }
                        }
                    }
                    _ = self.shutdown.changed() => return Ok(()),
                }
            }

            let deadline = Instant::now() + self.shared.config.request_timeout;
            let head = match self.read_head(deadline).await {
                Ok(HeadRead::Head(head)) => head,
                Ok(HeadRead::Eof) => return Ok(()),
                Ok(HeadRead::H2Preface) => {
                    tracing::debug!("HTTP/2 preface on cleartext connection");
                    return Http2Conn::new(
                        self.io,
                        self.read_buf,
                        self.write_buf,
                        self.remote_addr,
                        self.shared,
                        self.shutdown,
                    )
                    .serve(None)
                    .await;
                }
                Err(e) => return self.fail(e).await,
            };

            if parse::header_contains_token(&head.headers, "expect", "100-continue")
                && head.version == Protocol::Http11
            {
                encode::encode_continue(&mut self.write_buf);
                self.flush().await?;
            }

            let body = match self.read_body(&head.headers, deadline).await {
                Ok(body) => body,
                Err(e) => return self.fail(e).await,
            };

            if is_upgrade_to(&head.headers, "websocket") && self.has_websocket_route(&head) {
                return self.upgrade_websocket(head).await;
            }
            if is_upgrade_to(&head.headers, "h2c") && head.headers.contains_key("http2-settings") {
                return self.upgrade_h2c(head, body).await;
            }

            let version = head.version;
            let method = head.method.clone();
            let draining = *self.shutdown.borrow();
            let keep_alive = !draining && wants_keep_alive(version, &head.headers);

            let request = Request::new(
                head.method,
                head.target,
                version,
                head.headers,
                body,
                self.remote_addr,
            );
            let response = self.shared.dispatcher.dispatch(request).await;
            let (status, headers, body) = response.into_parts();

            encode::encode_response(
                version,
                status,
                &headers,
                &body,
                &method,
                keep_alive,
                &mut self.write_buf,
            );
            self.flush().await?;

            if !keep_alive {
                let _ = self.io.shutdown().await;
                return Ok(());
            }
        }
    }

    /// Reads until a full head is parsed, the bytes turn out to be the
    /// HTTP/2 preface (prior-knowledge cleartext), or a clean EOF lands
    /// between requests.
    async fn read_head(&mut self, deadline: Instant) -> Result<HeadRead> {
        loop {
            // A client leading with the connection preface never was an
            // HTTP/1.x peer; defer parsing while the bytes still agree.
            let prefix = h2::PREFACE_HEAD.len().min(self.read_buf.len());
            if prefix > 0 && self.read_buf[..prefix] == h2::PREFACE_HEAD[..prefix] {
                if prefix == h2::PREFACE_HEAD.len() {
                    return Ok(HeadRead::H2Preface);
                }
            } else if let Some(head) = parse::parse_head(&mut self.read_buf)? {
                return Ok(HeadRead::Head(head));
            }
            match timeout_at(deadline, self.io.read_buf(&mut *self.read_buf)).await {
                Ok(Ok(0)) => {
                    return if self.read_buf.is_empty() {
                        Ok(HeadRead::Eof)
                    } else {
                        Err(Error::new_incomplete())
                    };
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(Error::new_io(e)),
                Err(_) => return Err(Error::new_request_timeout()),
            }
        }
    }

    async fn read_body(&mut self, headers: &HeaderMap, deadline: Instant) -> Result<Bytes> {
        match decode::body_len(headers)? {
            decode::BodyLen::Empty => Ok(Bytes::new()),
            decode::BodyLen::Length(n) => {
                if n > self.shared.config.max_body_size {
                    return Err(Error::new_parse(Parse::BodyTooLarge));
                }
                while (self.read_buf.len() as u64) < n {
                    match timeout_at(deadline, self.io.read_buf(&mut *self.read_buf)).await {
                        Ok(Ok(0)) => return Err(Error::new_incomplete()),
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => return Err(Error::new_io(e)),
                        Err(_) => return Err(Error::new_request_timeout()),
                    }
                }
                Ok(self.read_buf.split_to(n as usize).freeze())
            }
            decode::BodyLen::Chunked => {
                let mut decoder =
                    decode::ChunkedDecoder::new(self.shared.config.max_body_size);
                loop {
                    if let Some(body) = decoder.decode(&mut self.read_buf)? {
                        return Ok(body);
                    }
                    match timeout_at(deadline, self.io.read_buf(&mut *self.read_buf)).await {
                        Ok(Ok(0)) => return Err(Error::new_incomplete()),
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => return Err(Error::new_io(e)),
                        Err(_) => return Err(Error::new_request_timeout()),
                    }
                }
            }
        }
    }

    fn has_websocket_route(&self, head: &parse::RequestHead) -> bool {
        let path_end = head.target.find('?').unwrap_or(head.target.len());
        self.shared
            .dispatcher
            .router()
            .match_websocket(&head.target[..path_end])
            .is_some()
    }

    async fn upgrade_websocket(mut self, head: parse::RequestHead) -> Result<()> {
        let path_end = head.target.find('?').unwrap_or(head.target.len());
        let (handler, params) = match self
            .shared
            .dispatcher
            .router()
            .match_websocket(&head.target[..path_end])
        {
            Some(found) => found,
            None => return self.reject(StatusCode::NOT_FOUND, "not found").await,
        };

        let key = match ws::handshake::validate(&head) {
            Ok(key) => key,
            Err(reason) => return self.reject(StatusCode::BAD_REQUEST, reason).await,
        };

        ws::handshake::encode_accept(&key, &mut self.write_buf);
        self.flush().await?;
        tracing::debug!(target = %head.target, "switched connection to websocket");

        let socket = ws::WebSocketConnection::new(
            crate::proto::BoxIo::new(self.io),
            self.read_buf,
            self.write_buf,
            head.target,
            head.headers,
            params,
            self.shared.config.max_ws_message_size,
        );
        handler.call(socket).await;
        Ok(())
    }

    async fn upgrade_h2c(mut self, head: parse::RequestHead, body: Bytes) -> Result<()> {
        let settings_payload = parse::single_value(&head.headers, "http2-settings")
            .and_then(|raw| {
                base64::engine::general_purpose::URL_SAFE_NO_PAD
                    .decode(raw)
                    .ok()
            });
        let settings_payload = match settings_payload {
            Some(payload) => payload,
            None => {
                return self
                    .reject(StatusCode::BAD_REQUEST, "invalid http2-settings")
                    .await;
            }
        };

        self.write_buf.extend_from_slice(
            b"HTTP/1.1 101 Switching Protocols\r\nconnection: Upgrade\r\nupgrade: h2c\r\n\r\n",
        );
        self.flush().await?;
        tracing::debug!("switched connection to h2c");

        let request = Request::new(
            head.method,
            head.target,
            Protocol::Http2,
            head.headers,
            body,
            self.remote_addr,
        );
        Http2Conn::new(
            self.io,
            self.read_buf,
            self.write_buf,
            self.remote_addr,
            self.shared,
            self.shutdown,
        )
        .serve(Some(h2::Upgrade {
            request,
            settings_payload,
        }))
        .await
    }

    /// Converts an error into its wire response, closes, and swallows what
    /// was handled. Parse errors answer 4xx; timeouts answer 408; transport
    /// errors have no response path left.
    async fn fail(mut self, err: Error) -> Result<()> {
        match err.response_status() {
            Some(status) => {
                tracing::debug!(error = %err, %status, "rejecting request");
                let reason = err.to_string();
                self.reject(status, &reason).await
            }
            None => Err(err),
        }
    }

    async fn reject(&mut self, status: StatusCode, reason: &str) -> Result<()> {
        let (status, headers, body) = error_response(status, reason, &HeaderMap::new()).into_parts();
        encode::encode_response(
            Protocol::Http11,
            status,
            &headers,
            &body,
            &Method::GET,
            false,
            &mut self.write_buf,
        );
        self.flush().await?;
        let _ = self.io.shutdown().await;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            let n = self
                .io
                .write(&self.write_buf)
                .await
                .map_err(Error::new_io)?;
            if n == 0 {
                return Err(Error::new_io(std::io::ErrorKind::WriteZero.into()));
            }
            let _ = self.write_buf.split_to(n);
        }
        self.io.flush().await.map_err(Error::new_io)
    }
}

fn is_upgrade_to(headers: &HeaderMap, protocol: &str) -> bool {
    parse::header_contains_token(headers, "connection", "upgrade")
        && parse::header_contains_token(headers, "upgrade", protocol)
}

fn wants_keep_alive(version: Protocol, headers: &HeaderMap) -> bool {
    if parse::header_contains_token(headers, "connection", "close") {
        return false;
    }
    version.keep_alive_by_default()
        || parse::header_contains_token(headers, "connection", "keep-alive")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                http::header::HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        assert!(wants_keep_alive(Protocol::Http11, &HeaderMap::new()));
        assert!(!wants_keep_alive(Protocol::Http10, &HeaderMap::new()));
        assert!(wants_keep_alive(
            Protocol::Http10,
            &headers(&[("connection", "keep-alive")])
        ));
        assert!(!wants_keep_alive(
            Protocol::Http11,
            &headers(&[("connection", "close")])
        ));
    }

    #[test]
    fn upgrade_requires_connection_token() {
        assert!(is_upgrade_to(
            &headers(&[("connection", "Upgrade"), ("upgrade", "websocket")]),
            "websocket"
        ));
        assert!(!is_upgrade_to(&headers(&[("upgrade", "websocket")]), "websocket"));
        assert!(!is_upgrade_to(
            &headers(&[("connection", "Upgrade"), ("upgrade", "h2c")]),
            "websocket"
        ));
    }
}
