//! The upgraded WebSocket connection handed to a handler.

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use super::frame::{self, FrameError, OpCode};
use crate::buffer::PooledBuf;
use crate::error::{Error, Result};
use crate::proto::BoxIo;
use crate::router::PathParams;

/// How long to wait for the peer's Close after ours before dropping the
/// socket.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// A complete WebSocket message, reassembled from its fragments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(bytes) => bytes,
        }
    }
}

/// A WebSocket connection, owned by its handler until the handler returns.
///
/// `recv` reassembles fragmented messages and answers control frames on its
/// own: pings are ponged, a peer Close is mirrored. Once a Close has been
/// exchanged in either direction `recv` yields `None`.
pub struct WebSocketConnection {
    io: BoxIo,
    read_buf: PooledBuf,
    write_buf: PooledBuf,
    path: String,
    headers: HeaderMap,
    params: PathParams,
    closed: bool,
    close_sent: bool,
    fragments: Option<(OpCode, BytesMut)>,
    max_message_size: usize,
}

impl WebSocketConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        io: BoxIo,
        read_buf: PooledBuf,
        write_buf: PooledBuf,
        path: String,
        headers: HeaderMap,
        params: PathParams,
        max_message_size: usize,
    ) -> WebSocketConnection {
        WebSocketConnection {
            io,
            read_buf,
            write_buf,
            path,
            headers,
            params,
            closed: false,
            close_sent: false,
            fragments: None,
            max_message_size,
        }
    }

    /// The request-target of the upgrade request.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Headers of the upgrade request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Route parameters captured by the WebSocket route template.
    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// True once a Close frame has been sent or received.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Receives the next complete message; `None` after the close handshake.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if self.closed {
                return Ok(None);
            }

            let parsed = frame::parse(&mut self.read_buf, self.max_message_size);
            let frame = match parsed {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    let n = self
                        .io
                        .read_buf(&mut *self.read_buf)
                        .await
                        .map_err(Error::new_io)?;
                    if n == 0 {
                        tracing::debug!("websocket peer closed without close frame");
                        self.closed = true;
                        return Ok(None);
                    }
                    continue;
                }
                Err(err) => {
                    self.fail(err.close_code()).await;
                    return Err(Error::new_protocol(frame_error_text(&err)));
                }
            };

            match frame.opcode {
                OpCode::Ping => {
                    frame::encode(OpCode::Pong, true, &frame.payload, &mut self.write_buf);
                    self.flush().await?;
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    let code = match frame.payload.len() {
                        0 => None,
                        1 => {
                            self.fail(frame::CLOSE_PROTOCOL_ERROR).await;
                            return Err(Error::new_protocol("close frame with 1-byte payload"));
                        }
                        _ => Some(u16::from_be_bytes([frame.payload[0], frame.payload[1]])),
                    };
                    if !self.close_sent {
                        let reply = code.filter(|c| close_code_is_valid(*c)).unwrap_or(frame::CLOSE_NORMAL);
                        frame::encode_close(reply, "", &mut self.write_buf);
                        let _ = self.flush().await;
                        self.close_sent = true;
                    }
                    self.closed = true;
                    let _ = self.io.shutdown().await;
                    return Ok(None);
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragments.is_some() {
                        self.fail(frame::CLOSE_PROTOCOL_ERROR).await;
                        return Err(Error::new_protocol("data frame inside fragmented message"));
                    }
                    if frame.fin {
                        return self.complete(frame.opcode, frame.payload).await.map(Some);
                    }
                    let mut assembly = BytesMut::with_capacity(frame.payload.len());
                    assembly.extend_from_slice(&frame.payload);
                    self.fragments = Some((frame.opcode, assembly));
                }
                OpCode::Continuation => {
                    let (opcode, mut assembly) = match self.fragments.take() {
                        Some(pending) => pending,
                        None => {
                            self.fail(frame::CLOSE_PROTOCOL_ERROR).await;
                            return Err(Error::new_protocol("continuation without a message"));
                        }
                    };
                    if assembly.len() + frame.payload.len() > self.max_message_size {
                        self.fail(frame::CLOSE_TOO_BIG).await;
                        return Err(Error::new_protocol("fragmented message too large"));
                    }
                    assembly.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return self.complete(opcode, assembly.freeze()).await.map(Some);
                    }
                    self.fragments = Some((opcode, assembly));
                }
            }
        }
    }

    /// UTF-8 validation happens here, on the complete message only.
    async fn complete(&mut self, opcode: OpCode, payload: Bytes) -> Result<Message> {
        match opcode {
            OpCode::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => Ok(Message::Text(text)),
                Err(_) => {
                    self.fail(frame::CLOSE_INVALID_DATA).await;
                    Err(Error::new_protocol("text message is not valid utf-8"))
                }
            },
            OpCode::Binary => Ok(Message::Binary(payload)),
            _ => unreachable!("only data opcodes complete messages"),
        }
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        match message {
            Message::Text(text) => self.send_text(text).await,
            Message::Binary(bytes) => self.send_binary(bytes).await,
        }
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_data(OpCode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&mut self, payload: &[u8]) -> Result<()> {
        self.send_data(OpCode::Binary, payload).await
    }

    pub async fn send_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.send_data(OpCode::Ping, payload).await
    }

    async fn send_data(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::new_protocol("connection already closed"));
        }
        frame::encode(opcode, true, payload, &mut self.write_buf);
        self.flush().await
    }

    /// Initiates the close handshake, then waits up to two seconds for the
    /// peer's answering Close (or EOF) before tearing the socket down.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        frame::encode_close(code, reason, &mut self.write_buf);
        self.flush().await?;
        self.close_sent = true;
        self.closed = true;

        let drain = async {
            loop {
                match frame::parse(&mut self.read_buf, self.max_message_size) {
                    Ok(Some(frame)) if frame.opcode == OpCode::Close => break,
                    Ok(Some(_)) => continue,
                    Ok(None) => {
                        match self.io.read_buf(&mut *self.read_buf).await {
                            Ok(0) => break,
                            Ok(_) => continue,
                            Err(_) => break,
                        }
                    }
                    Err(_) => break,
                }
            }
        };
        if timeout(CLOSE_GRACE, drain).await.is_err() {
            tracing::trace!("websocket close grace elapsed");
        }
        let _ = self.io.shutdown().await;
        Ok(())
    }

    /// Best-effort close after a protocol violation.
    async fn fail(&mut self, code: u16) {
        if !self.close_sent {
            frame::encode_close(code, "", &mut self.write_buf);
            let _ = self.flush().await;
            self.close_sent = true;
        }
        self.closed = true;
        let _ = self.io.shutdown().await;
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

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("path", &self.path)
            .field("closed", &self.closed)
            .finish()
    }
}

fn close_code_is_valid(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

fn frame_error_text(err: &FrameError) -> String {
    match err {
        FrameError::Protocol(reason) => (*reason).to_owned(),
        FrameError::TooBig => "message exceeds size limit".to_owned(),
    }
}
