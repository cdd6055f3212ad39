//! The per-connection HTTP/2 driver: frame demux, stream multiplexing, and
//! response egress under flow control.
//!
//! One task owns the socket. Each complete request is dispatched on its own
//! spawned task; finished responses come back over a channel and are framed
//! here, so streams interleave on the wire in completion order while frames
//! within a stream stay ordered.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use super::frame::{
    self, FrameHead, Kind, Reason, Settings, DEFAULT_HEADER_TABLE_SIZE,
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, FLAG_ACK, FLAG_END_HEADERS,
    FLAG_END_STREAM, FLAG_PADDED, FLAG_PRIORITY, FRAME_HEADER_LEN,
};
use super::hpack;
use super::flow::FlowControl;
use super::streams::{Outgoing, Stream, StreamRequest, StreamState, StreamStore};
use crate::buffer::PooledBuf;
use crate::error::{Error, Result};
use crate::proto::h1::date;
use crate::proto::{Io, Protocol};
use crate::request::Request;
use crate::response::Response;
use crate::server::ConnShared;

const LOCAL_MAX_FRAME: u32 = DEFAULT_MAX_FRAME_SIZE;
const LOCAL_MAX_STREAMS: usize = 100;
const LOCAL_MAX_HEADER_LIST: u32 = 64 * 1024;
const LOCAL_INITIAL_WINDOW: u32 = DEFAULT_INITIAL_WINDOW_SIZE;

/// State carried over from an `Upgrade: h2c` request: the request itself
/// (served as stream 1) and the decoded `HTTP2-Settings` payload.
pub(crate) struct Upgrade {
    pub(crate) request: Request,
    pub(crate) settings_payload: Vec<u8>,
}

enum Event {
    Response { id: u32, response: Response },
}

#[derive(Debug)]
enum H2Error {
    Conn(Reason),
    Stream(u32, Reason),
}

pub(crate) struct Http2Conn<T> {
    io: T,
    read_buf: PooledBuf,
    write_buf: PooledBuf,
    remote_addr: SocketAddr,
    shared: Arc<ConnShared>,
    shutdown: watch::Receiver<bool>,
}

impl<T: Io> Http2Conn<T> {
    pub(crate) fn new(
        io: T,
        read_buf: PooledBuf,
        write_buf: PooledBuf,
        remote_addr: SocketAddr,
        shared: Arc<ConnShared>,
        shutdown: watch::Receiver<bool>,
    ) -> Http2Conn<T> {
        Http2Conn {
            io,
            read_buf,
            write_buf,
            remote_addr,
            shared,
            shutdown,
        }
    }

    pub(crate) async fn serve(mut self, upgrade: Option<Upgrade>) -> Result<()> {
        while self.read_buf.len() < frame::PREFACE.len() {
            let n = self
                .io
                .read_buf(&mut *self.read_buf)
                .await
                .map_err(Error::new_io)?;
            if n == 0 {
                return Err(Error::new_incomplete());
            }
        }
        if &self.read_buf[..frame::PREFACE.len()] != frame::PREFACE {
            return Err(Error::new_protocol("bad connection preface"));
        }
        let _ = self.read_buf.split_to(frame::PREFACE.len());

        let (events_tx, mut events) = mpsc::channel(32);
        let mut mux = Mux::new(Arc::clone(&self.shared), self.remote_addr, events_tx);

        if let Some(upgrade) = upgrade {
            match Settings::parse(&upgrade.settings_payload) {
                // applied as if received in a SETTINGS frame, but not ACKed
                Ok(settings) => mux.apply_remote_settings(settings, &mut self.write_buf),
                Err(_) => return Err(Error::new_protocol("bad http2-settings payload")),
            }
            mux.start_upgraded_stream(upgrade.request);
        }

        Settings {
            max_concurrent_streams: Some(LOCAL_MAX_STREAMS as u32),
            max_header_list_size: Some(LOCAL_MAX_HEADER_LIST),
            ..Settings::default()
        }
        .encode(&mut self.write_buf);
        self.flush().await?;

        loop {
            if let Err(reason) = self.process_buffered(&mut mux) {
                return self.bail(&mut mux, reason).await;
            }
            self.flush().await?;
            if mux.done() {
                tracing::debug!("http2 connection drained");
                mux.streams.abort_all();
                let _ = self.io.shutdown().await;
                return Ok(());
            }

            tokio::select! {
                read = self.io.read_buf(&mut *self.read_buf) => match read {
                    Ok(0) => {
                        mux.streams.abort_all();
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        mux.streams.abort_all();
                        return Err(Error::new_io(e));
                    }
                },
                Some(event) = events.recv() => {
                    let Event::Response { id, response } = event;
                    mux.write_response(id, response, &mut self.write_buf);
                    self.flush().await?;
                }
                _ = self.shutdown.changed(), if !mux.draining => {
                    mux.begin_drain(&mut self.write_buf);
                    self.flush().await?;
                }
            }
        }
    }

    /// Extracts and processes every complete frame sitting in the read
    /// buffer. Stream errors are answered inline; only connection errors
    /// propagate.
    fn process_buffered(&mut self, mux: &mut Mux) -> std::result::Result<(), Reason> {
        loop {
            if self.read_buf.len() < FRAME_HEADER_LEN {
                return Ok(());
            }
            let head = frame::parse_head(&self.read_buf[..FRAME_HEADER_LEN]);
            if head.len > LOCAL_MAX_FRAME {
                return Err(Reason::FRAME_SIZE_ERROR);
            }
            if self.read_buf.len() < FRAME_HEADER_LEN + head.len as usize {
                return Ok(());
            }
            let _ = self.read_buf.split_to(FRAME_HEADER_LEN);
            let payload = self.read_buf.split_to(head.len as usize).freeze();

            match mux.process_frame(head, payload, &mut self.write_buf) {
                Ok(()) => {}
                Err(H2Error::Stream(id, reason)) => {
                    tracing::debug!(stream = id, error = reason.description(), "resetting stream");
                    mux.streams.remove(id);
                    frame::encode_reset(id, reason, &mut self.write_buf);
                }
                Err(H2Error::Conn(reason)) => return Err(reason),
            }
        }
    }

    async fn bail(&mut self, mux: &mut Mux, reason: Reason) -> Result<()> {
        tracing::debug!(error = reason.description(), "http2 connection error");
        frame::encode_goaway(mux.streams.last_client_id, reason, &mut self.write_buf);
        let _ = self.flush().await;
        mux.streams.abort_all();
        let _ = self.io.shutdown().await;
        Err(Error::new_protocol(reason.description()))
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

/// A header block spread across HEADERS + CONTINUATION frames.
struct HeaderAssembly {
    stream_id: u32,
    end_stream: bool,
    fragment: BytesMut,
}

struct Mux {
    shared: Arc<ConnShared>,
    remote_addr: SocketAddr,
    events_tx: mpsc::Sender<Event>,
    decoder: hpack::Decoder,
    encoder: hpack::Encoder,
    conn_send: FlowControl,
    conn_recv: FlowControl,
    streams: StreamStore,
    remote_initial_window: u32,
    remote_max_frame: u32,
    push_enabled: bool,
    pending_headers: Option<HeaderAssembly>,
    accepting: bool,
    draining: bool,
    peer_goaway: bool,
}

impl Mux {
    fn new(shared: Arc<ConnShared>, remote_addr: SocketAddr, events_tx: mpsc::Sender<Event>) -> Mux {
        Mux {
            shared,
            remote_addr,
            events_tx,
            decoder: hpack::Decoder::new(
                DEFAULT_HEADER_TABLE_SIZE as usize,
                Some(LOCAL_MAX_HEADER_LIST as usize),
            ),
            encoder: hpack::Encoder::new(DEFAULT_HEADER_TABLE_SIZE as usize),
            conn_send: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE),
            conn_recv: FlowControl::new(LOCAL_INITIAL_WINDOW),
            streams: StreamStore::new(),
            remote_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
            remote_max_frame: DEFAULT_MAX_FRAME_SIZE,
            push_enabled: true,
            pending_headers: None,
            accepting: true,
            draining: false,
            peer_goaway: false,
        }
    }

    fn done(&self) -> bool {
        (self.draining || self.peer_goaway) && self.streams.is_empty()
    }

    fn begin_drain(&mut self, out: &mut BytesMut) {
        if !self.draining {
            tracing::debug!("sending GOAWAY, draining http2 connection");
            self.draining = true;
            self.accepting = false;
            frame::encode_goaway(self.streams.last_client_id, Reason::NO_ERROR, out);
        }
    }

    fn process_frame(
        &mut self,
        head: FrameHead,
        payload: Bytes,
        out: &mut BytesMut,
    ) -> std::result::Result<(), H2Error> {
        tracing::trace!(kind = ?head.kind, stream = head.stream_id, len = head.len, "frame");

        // While a header block is open, only its continuations may arrive.
        if let Some(assembly) = &self.pending_headers {
            if head.kind != Kind::Continuation || head.stream_id != assembly.stream_id {
                return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
            }
        }

        match head.kind {
            Kind::Data => self.on_data(head, payload, out),
            Kind::Headers => self.on_headers(head, payload, out),
            Kind::Continuation => self.on_continuation(head, payload, out),
            Kind::Priority => {
                if head.stream_id == 0 {
                    return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
                }
                if head.len != 5 {
                    return Err(H2Error::Stream(head.stream_id, Reason::FRAME_SIZE_ERROR));
                }
                // recorded nowhere; priority is only a hint
                Ok(())
            }
            Kind::Reset => self.on_reset(head, payload),
            Kind::Settings => self.on_settings(head, payload, out),
            Kind::PushPromise => Err(H2Error::Conn(Reason::PROTOCOL_ERROR)),
            Kind::Ping => self.on_ping(head, payload, out),
            Kind::Goaway => {
                self.accepting = false;
                self.peer_goaway = true;
                Ok(())
            }
            Kind::WindowUpdate => self.on_window_update(head, payload, out),
            Kind::Unknown(_) => Ok(()),
        }
    }

    fn on_data(
        &mut self,
        head: FrameHead,
        payload: Bytes,
        out: &mut BytesMut,
    ) -> std::result::Result<(), H2Error> {
        let id = head.stream_id;
        if id == 0 {
            return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
        }

        // Padding counts against both windows.
        self.conn_recv.recv_data(head.len).map_err(H2Error::Conn)?;
        if self.conn_recv.available() < LOCAL_INITIAL_WINDOW / 2 {
            let inc = LOCAL_INITIAL_WINDOW - self.conn_recv.available();
            let _ = self.conn_recv.grant(inc);
            frame::encode_window_update(0, inc, out);
        }

        let data = strip_padding(&head, payload, false)?;

        let max_body = self.shared.config.max_body_size;
        let stream = match self.streams.get_mut(id) {
            Some(stream) => stream,
            None => {
                if self.streams.is_idle(id) {
                    return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
                }
                return Err(H2Error::Stream(id, Reason::STREAM_CLOSED));
            }
        };
        if stream.state != StreamState::Open {
            return Err(H2Error::Stream(id, Reason::STREAM_CLOSED));
        }
        stream
            .recv_flow
            .recv_data(head.len)
            .map_err(|reason| H2Error::Stream(id, reason))?;

        let end_stream = head.flag(FLAG_END_STREAM);
        if !end_stream && stream.recv_flow.available() < LOCAL_INITIAL_WINDOW / 2 {
            let inc = LOCAL_INITIAL_WINDOW - stream.recv_flow.available();
            let _ = stream.recv_flow.grant(inc);
            frame::encode_window_update(id, inc, out);
        }

        if (stream.body.len() + data.len()) as u64 > max_body {
            return Err(H2Error::Stream(id, Reason::ENHANCE_YOUR_CALM));
        }
        stream.body.extend_from_slice(&data);

        if end_stream {
            stream.state = StreamState::HalfClosedRemote;
            let request = stream.request.take();
            let body = std::mem::take(&mut stream.body).freeze();
            match request {
                Some(request) => self.spawn_handler(id, request, body),
                None => return Err(H2Error::Stream(id, Reason::PROTOCOL_ERROR)),
            }
        }
        Ok(())
    }

    fn on_headers(
        &mut self,
        head: FrameHead,
        payload: Bytes,
        out: &mut BytesMut,
    ) -> std::result::Result<(), H2Error> {
        let id = head.stream_id;
        if id == 0 || id % 2 == 0 {
            return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
        }
        let fragment = strip_padding(&head, payload, head.flag(FLAG_PRIORITY))?;
        let end_stream = head.flag(FLAG_END_STREAM);

        if head.flag(FLAG_END_HEADERS) {
            self.complete_headers(id, end_stream, &fragment, out)
        } else {
            let mut assembly = BytesMut::with_capacity(fragment.len());
            assembly.extend_from_slice(&fragment);
            self.pending_headers = Some(HeaderAssembly {
                stream_id: id,
                end_stream,
                fragment: assembly,
            });
            Ok(())
        }
    }

    fn on_continuation(
        &mut self,
        head: FrameHead,
        payload: Bytes,
        out: &mut BytesMut,
    ) -> std::result::Result<(), H2Error> {
        let mut assembly = match self.pending_headers.take() {
            Some(assembly) => assembly,
            None => return Err(H2Error::Conn(Reason::PROTOCOL_ERROR)),
        };
        assembly.fragment.extend_from_slice(&payload);
        if assembly.fragment.len() > LOCAL_MAX_HEADER_LIST as usize * 2 {
            return Err(H2Error::Conn(Reason::COMPRESSION_ERROR));
        }
        if head.flag(FLAG_END_HEADERS) {
            let fragment = assembly.fragment.freeze();
            self.complete_headers(assembly.stream_id, assembly.end_stream, &fragment, out)
        } else {
            self.pending_headers = Some(assembly);
            Ok(())
        }
    }

    fn complete_headers(
        &mut self,
        id: u32,
        end_stream: bool,
        fragment: &[u8],
        _out: &mut BytesMut,
    ) -> std::result::Result<(), H2Error> {
        // The decoder must see every block, refused streams included, or the
        // dynamic tables desynchronize.
        let fields = self.decoder.decode(fragment).map_err(H2Error::Conn)?;

        if self.streams.contains(id) {
            // Trailing HEADERS close the request side; their fields are
            // accepted and dropped.
            if !end_stream {
                return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
            }
            let stream = self.streams.get_mut(id).expect("checked contains");
            if stream.state != StreamState::Open {
                return Err(H2Error::Stream(id, Reason::STREAM_CLOSED));
            }
            stream.state = StreamState::HalfClosedRemote;
            let request = stream.request.take();
            let body = std::mem::take(&mut stream.body).freeze();
            match request {
                Some(request) => self.spawn_handler(id, request, body),
                None => return Err(H2Error::Stream(id, Reason::PROTOCOL_ERROR)),
            }
            return Ok(());
        }

        if id <= self.streams.last_client_id {
            // a closed stream id cannot be reopened
            return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
        }
        if !self.accepting {
            return Err(H2Error::Stream(id, Reason::REFUSED_STREAM));
        }
        if self.streams.len() >= LOCAL_MAX_STREAMS {
            return Err(H2Error::Stream(id, Reason::REFUSED_STREAM));
        }

        let request = build_request(fields).map_err(|reason| H2Error::Stream(id, reason))?;

        let state = if end_stream {
            StreamState::HalfClosedRemote
        } else {
            StreamState::Open
        };
        self.streams.insert(
            id,
            Stream::new(state, self.remote_initial_window, LOCAL_INITIAL_WINDOW),
        );
        tracing::trace!(stream = id, target = %request.target, "stream opened");

        if end_stream {
            self.spawn_handler(id, request, Bytes::new());
        } else if let Some(stream) = self.streams.get_mut(id) {
            stream.request = Some(request);
        }
        Ok(())
    }

    fn on_reset(&mut self, head: FrameHead, payload: Bytes) -> std::result::Result<(), H2Error> {
        if head.stream_id == 0 {
            return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
        }
        if head.len != 4 {
            return Err(H2Error::Conn(Reason::FRAME_SIZE_ERROR));
        }
        if self.streams.is_idle(head.stream_id) {
            return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
        }
        let reason = Reason(u32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]));
        tracing::debug!(stream = head.stream_id, error = reason.description(), "stream reset by peer");
        self.streams.remove(head.stream_id);
        Ok(())
    }

    fn on_settings(
        &mut self,
        head: FrameHead,
        payload: Bytes,
        out: &mut BytesMut,
    ) -> std::result::Result<(), H2Error> {
        if head.stream_id != 0 {
            return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
        }
        if head.flag(FLAG_ACK) {
            if head.len != 0 {
                return Err(H2Error::Conn(Reason::FRAME_SIZE_ERROR));
            }
            return Ok(());
        }
        let settings = Settings::parse(&payload).map_err(H2Error::Conn)?;
        self.apply_remote_settings(settings, out);
        Settings::encode_ack(out);
        Ok(())
    }

    fn apply_remote_settings(&mut self, settings: Settings, out: &mut BytesMut) {
        if let Some(size) = settings.header_table_size {
            let budget = (size as usize).min(DEFAULT_HEADER_TABLE_SIZE as usize);
            self.encoder.set_max_table_size(budget);
        }
        if let Some(enabled) = settings.enable_push {
            self.push_enabled = enabled;
        }
        if let Some(size) = settings.max_frame_size {
            self.remote_max_frame = size;
        }
        if let Some(window) = settings.initial_window_size {
            let delta = window as i64 - self.remote_initial_window as i64;
            self.remote_initial_window = window;
            self.streams.adjust_send_windows(delta);
            self.pump_all(out);
        }
    }

    fn on_ping(
        &mut self,
        head: FrameHead,
        payload: Bytes,
        out: &mut BytesMut,
    ) -> std::result::Result<(), H2Error> {
        if head.stream_id != 0 {
            return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
        }
        if head.len != 8 {
            return Err(H2Error::Conn(Reason::FRAME_SIZE_ERROR));
        }
        if !head.flag(FLAG_ACK) {
            frame::encode_ping(&payload, true, out);
        }
        Ok(())
    }

    fn on_window_update(
        &mut self,
        head: FrameHead,
        payload: Bytes,
        out: &mut BytesMut,
    ) -> std::result::Result<(), H2Error> {
        if head.len != 4 {
            return Err(H2Error::Conn(Reason::FRAME_SIZE_ERROR));
        }
        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
        if head.stream_id == 0 {
            if increment == 0 {
                return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
            }
            self.conn_send.grant(increment).map_err(H2Error::Conn)?;
            self.pump_all(out);
            return Ok(());
        }
        if increment == 0 {
            return Err(H2Error::Stream(head.stream_id, Reason::PROTOCOL_ERROR));
        }
        if let Some(stream) = self.streams.get_mut(head.stream_id) {
            stream
                .send_flow
                .grant(increment)
                .map_err(|reason| H2Error::Stream(head.stream_id, reason))?;
            self.pump_stream(head.stream_id, out);
        }
        // updates for reaped streams are dropped
        Ok(())
    }

    fn start_upgraded_stream(&mut self, request: Request) {
        self.streams.insert(
            1,
            Stream::new(
                StreamState::HalfClosedRemote,
                self.remote_initial_window,
                LOCAL_INITIAL_WINDOW,
            ),
        );
        let id = 1;
        let is_head = *request.method() == Method::HEAD;
        let tx = self.events_tx.clone();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let response = shared.dispatcher.dispatch(request).await;
            let _ = tx.send(Event::Response { id, response }).await;
        });
        if let Some(stream) = self.streams.get_mut(id) {
            stream.is_head = is_head;
            stream.task = Some(handle.abort_handle());
        }
    }

    fn spawn_handler(&mut self, id: u32, head: StreamRequest, body: Bytes) {
        let authority = head.authority.clone();
        let is_head = head.method == Method::HEAD;
        let mut headers = head.headers;
        if let Some(authority) = &head.authority {
            if !headers.contains_key(HOST) {
                if let Ok(value) = HeaderValue::from_str(authority) {
                    headers.insert(HOST, value);
                }
            }
        }
        let request = Request::new(
            head.method,
            head.target,
            Protocol::Http2,
            headers,
            body,
            self.remote_addr,
        );
        let tx = self.events_tx.clone();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let response = shared.dispatcher.dispatch(request).await;
            let _ = tx.send(Event::Response { id, response }).await;
        });
        if let Some(stream) = self.streams.get_mut(id) {
            stream.authority = authority;
            stream.is_head = is_head;
            stream.task = Some(handle.abort_handle());
        }
    }

    /// Frames a finished response: optional PUSH_PROMISEs first, then
    /// HEADERS, then DATA as the windows allow.
    fn write_response(&mut self, id: u32, mut response: Response, out: &mut BytesMut) {
        let is_head = match self.streams.get_mut(id) {
            Some(stream) => stream.is_head,
            // reset while the handler was running
            None => return,
        };

        let promises = response.take_push_promises();
        if !promises.is_empty() && self.push_enabled && id % 2 == 1 && !self.draining {
            for promise in promises {
                self.write_push_promise(id, &promise.path, &promise.as_type, out);
            }
        }

        let (status, headers, body) = response.into_parts();
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(headers.len() + 3);
        fields.push((b":status".to_vec(), status.as_str().as_bytes().to_vec()));
        for (name, value) in &headers {
            if is_connection_header(name) {
                continue;
            }
            fields.push((name.as_str().as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        if !headers.contains_key(http::header::DATE) {
            let mut rendered = BytesMut::new();
            date::extend(&mut rendered);
            fields.push((b"date".to_vec(), rendered.to_vec()));
        }
        // A HEAD answer advertises the entity's length without sending it.
        if !headers.contains_key(CONTENT_LENGTH) && response_may_have_body(status) {
            let mut fmt = itoa::Buffer::new();
            fields.push((
                b"content-length".to_vec(),
                fmt.format(body.len()).as_bytes().to_vec(),
            ));
        }

        let mut block = BytesMut::new();
        self.encoder.encode(&fields, &mut block);
        let end_stream = body.is_empty() || is_head;
        self.write_header_block(id, Kind::Headers, None, &block, end_stream, out);

        if end_stream {
            self.finish_stream(id);
        } else {
            if let Some(stream) = self.streams.get_mut(id) {
                stream.state = match stream.state {
                    StreamState::HalfClosedRemote => StreamState::HalfClosedRemote,
                    _ => StreamState::HalfClosedLocal,
                };
                stream.outgoing = Some(Outgoing { body, sent: 0 });
            }
            self.pump_stream(id, out);
        }
    }

    fn write_push_promise(&mut self, parent: u32, path: &str, as_type: &str, out: &mut BytesMut) {
        let promised = self.streams.reserve_push_id();
        let authority = self
            .streams
            .get_mut(parent)
            .and_then(|stream| stream.authority.clone());

        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b":method".to_vec(), b"GET".to_vec()),
            (b":path".to_vec(), path.as_bytes().to_vec()),
            (b":scheme".to_vec(), b"http".to_vec()),
        ];
        if let Some(authority) = &authority {
            fields.push((b":authority".to_vec(), authority.as_bytes().to_vec()));
        }
        fields.push((b"x-pushed-as".to_vec(), as_type.as_bytes().to_vec()));

        let mut block = BytesMut::new();
        self.encoder.encode(&fields, &mut block);
        self.write_header_block(parent, Kind::PushPromise, Some(promised), &block, false, out);

        self.streams.insert(
            promised,
            Stream::new(
                StreamState::ReservedLocal,
                self.remote_initial_window,
                LOCAL_INITIAL_WINDOW,
            ),
        );
        tracing::debug!(parent, promised, path, "push promised");

        let mut headers = HeaderMap::new();
        if let Some(authority) = &authority {
            if let Ok(value) = HeaderValue::from_str(authority) {
                headers.insert(HOST, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(as_type) {
            headers.insert(
                HeaderName::from_static("x-pushed-as"),
                value,
            );
        }
        let request = Request::new(
            Method::GET,
            path.to_owned(),
            Protocol::Http2,
            headers,
            Bytes::new(),
            self.remote_addr,
        );
        let tx = self.events_tx.clone();
        let shared = Arc::clone(&self.shared);
        let id = promised;
        let handle = tokio::spawn(async move {
            let response = shared.dispatcher.dispatch(request).await;
            let _ = tx.send(Event::Response { id, response }).await;
        });
        if let Some(stream) = self.streams.get_mut(promised) {
            stream.task = Some(handle.abort_handle());
        }
    }

    /// Writes a header block as one HEADERS/PUSH_PROMISE frame plus
    /// CONTINUATIONs when it exceeds the peer's frame size.
    fn write_header_block(
        &mut self,
        stream_id: u32,
        kind: Kind,
        promised: Option<u32>,
        block: &[u8],
        end_stream: bool,
        out: &mut BytesMut,
    ) {
        let promised_len = if promised.is_some() { 4 } else { 0 };
        let max = self.remote_max_frame as usize - promised_len;
        let first_len = block.len().min(max);
        let one_frame = first_len == block.len();

        let mut flags = 0u8;
        if one_frame {
            flags |= FLAG_END_HEADERS;
        }
        if end_stream && kind == Kind::Headers {
            flags |= FLAG_END_STREAM;
        }
        frame::encode_head(kind, flags, stream_id, first_len + promised_len, out);
        if let Some(promised) = promised {
            out.extend_from_slice(&(promised & 0x7FFF_FFFF).to_be_bytes());
        }
        out.extend_from_slice(&block[..first_len]);

        let mut sent = first_len;
        while sent < block.len() {
            let chunk = (block.len() - sent).min(self.remote_max_frame as usize);
            let last = sent + chunk == block.len();
            frame::encode_head(
                Kind::Continuation,
                if last { FLAG_END_HEADERS } else { 0 },
                stream_id,
                chunk,
                out,
            );
            out.extend_from_slice(&block[sent..sent + chunk]);
            sent += chunk;
        }
    }

    fn pump_all(&mut self, out: &mut BytesMut) {
        for id in self.streams.ids() {
            self.pump_stream(id, out);
        }
    }

    /// Writes as much queued DATA as the stream and connection windows
    /// permit, splitting frames at the peer's frame-size limit.
    fn pump_stream(&mut self, id: u32, out: &mut BytesMut) {
        loop {
            let conn_avail = self.conn_send.available() as usize;
            let max_frame = self.remote_max_frame as usize;

            let (written, end) = {
                let stream = match self.streams.get_mut(id) {
                    Some(stream) => stream,
                    None => return,
                };
                let outgoing = match &mut stream.outgoing {
                    Some(outgoing) => outgoing,
                    None => return,
                };
                let remaining = outgoing.body.len() - outgoing.sent;
                let n = remaining
                    .min(conn_avail)
                    .min(stream.send_flow.available() as usize)
                    .min(max_frame);
                if n == 0 {
                    return;
                }
                let end = n == remaining;
                frame::encode_head(
                    Kind::Data,
                    if end { FLAG_END_STREAM } else { 0 },
                    id,
                    n,
                    out,
                );
                out.extend_from_slice(&outgoing.body[outgoing.sent..outgoing.sent + n]);
                outgoing.sent += n;
                stream.send_flow.take(n as u32);
                (n, end)
            };
            self.conn_send.take(written as u32);

            if end {
                self.finish_stream(id);
                return;
            }
        }
    }

    fn finish_stream(&mut self, id: u32) {
        tracing::trace!(stream = id, "response complete");
        self.streams.remove(id);
    }
}

/// Statuses whose responses carry no entity never get a `content-length`.
fn response_may_have_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Connection-specific headers never appear in HTTP/2 responses.
fn is_connection_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

/// Strips the padding (and, for HEADERS, the priority block) from a frame
/// payload.
fn strip_padding(
    head: &FrameHead,
    payload: Bytes,
    priority: bool,
) -> std::result::Result<Bytes, H2Error> {
    let mut data = payload;
    let pad = if head.flag(FLAG_PADDED) {
        if data.is_empty() {
            return Err(H2Error::Conn(Reason::FRAME_SIZE_ERROR));
        }
        let pad = data[0] as usize;
        data.advance(1);
        pad
    } else {
        0
    };
    if priority {
        if data.len() < 5 {
            return Err(H2Error::Conn(Reason::FRAME_SIZE_ERROR));
        }
        data.advance(5);
    }
    if pad > data.len() {
        return Err(H2Error::Conn(Reason::PROTOCOL_ERROR));
    }
    data.truncate(data.len() - pad);
    Ok(data)
}

/// Assembles the pseudo-header fields and regular headers of a request
/// block. Pseudo-headers must precede regular fields; `:method` and `:path`
/// are required.
fn build_request(
    fields: Vec<(Vec<u8>, Vec<u8>)>,
) -> std::result::Result<StreamRequest, Reason> {
    let mut method = None;
    let mut path = None;
    let mut authority = None;
    let mut scheme = false;
    let mut headers = HeaderMap::new();
    let mut saw_regular = false;

    for (name, value) in fields {
        if name.first() == Some(&b':') {
            if saw_regular {
                return Err(Reason::PROTOCOL_ERROR);
            }
            match name.as_slice() {
                b":method" if method.is_none() => {
                    method = Some(Method::from_bytes(&value).map_err(|_| Reason::PROTOCOL_ERROR)?);
                }
                b":path" if path.is_none() && !value.is_empty() => {
                    path = Some(
                        String::from_utf8(value).map_err(|_| Reason::PROTOCOL_ERROR)?,
                    );
                }
                b":authority" if authority.is_none() => {
                    authority =
                        Some(String::from_utf8(value).map_err(|_| Reason::PROTOCOL_ERROR)?);
                }
                b":scheme" if !scheme => scheme = true,
                _ => return Err(Reason::PROTOCOL_ERROR),
            }
        } else {
            saw_regular = true;
            if name.as_slice() == b"connection" || name.as_slice() == b"transfer-encoding" {
                return Err(Reason::PROTOCOL_ERROR);
            }
            let name = HeaderName::from_bytes(&name).map_err(|_| Reason::PROTOCOL_ERROR)?;
            let value = HeaderValue::from_bytes(&value).map_err(|_| Reason::PROTOCOL_ERROR)?;
            headers.append(name, value);
        }
    }

    Ok(StreamRequest {
        method: method.ok_or(Reason::PROTOCOL_ERROR)?,
        target: path.ok_or(Reason::PROTOCOL_ERROR)?,
        authority,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
        pairs
            .iter()
            .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn builds_request_from_pseudo_headers() {
        let request = build_request(fields(&[
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/a?b=1"),
            (":authority", "example.com"),
            ("accept", "*/*"),
        ]))
        .unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.target, "/a?b=1");
        assert_eq!(request.authority.as_deref(), Some("example.com"));
        assert_eq!(request.headers.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn pseudo_after_regular_rejected() {
        let err = build_request(fields(&[
            (":method", "GET"),
            ("accept", "*/*"),
            (":path", "/"),
        ]))
        .unwrap_err();
        assert_eq!(err, Reason::PROTOCOL_ERROR);
    }

    #[test]
    fn missing_path_rejected() {
        assert!(build_request(fields(&[(":method", "GET")])).is_err());
    }

    #[test]
    fn duplicate_method_rejected() {
        assert!(build_request(fields(&[
            (":method", "GET"),
            (":method", "POST"),
            (":path", "/"),
        ]))
        .is_err());
    }

    #[test]
    fn status_in_request_rejected() {
        assert!(build_request(fields(&[
            (":status", "200"),
            (":method", "GET"),
            (":path", "/"),
        ]))
        .is_err());
    }

    #[test]
    fn connection_header_rejected() {
        assert!(build_request(fields(&[
            (":method", "GET"),
            (":path", "/"),
            ("connection", "keep-alive"),
        ]))
        .is_err());
    }

    #[test]
    fn padding_is_stripped() {
        let head = FrameHead {
            len: 7,
            kind: Kind::Data,
            flags: FLAG_PADDED,
            stream_id: 1,
        };
        // pad_len(1) + "data" + 2 pad bytes
        let payload = Bytes::from_static(&[2, b'd', b'a', b't', b'a', 0, 0]);
        let data = strip_padding(&head, payload, false).unwrap();
        assert_eq!(&data[..], b"data");
    }

    #[test]
    fn padding_beyond_payload_rejected() {
        let head = FrameHead {
            len: 3,
            kind: Kind::Data,
            flags: FLAG_PADDED,
            stream_id: 1,
        };
        let payload = Bytes::from_static(&[9, b'x', b'y']);
        assert!(strip_padding(&head, payload, false).is_err());
    }
}
