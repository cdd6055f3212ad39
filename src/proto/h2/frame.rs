//! HTTP/2 frame layer (RFC 7540 §4, §6).

use bytes::{BufMut, BytesMut};

/// The client connection preface.
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
/// Enough of the preface to tell it apart from an HTTP/1.x request line.
pub(crate) const PREFACE_HEAD: &[u8] = b"PRI * HTTP/2.0";

pub(crate) const FRAME_HEADER_LEN: usize = 9;

pub(crate) const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;
pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub(crate) const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;
pub(crate) const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

// Frame flags. END_STREAM and ACK share a bit; which applies follows from
// the frame kind.
pub(crate) const FLAG_END_STREAM: u8 = 0x1;
pub(crate) const FLAG_ACK: u8 = 0x1;
pub(crate) const FLAG_END_HEADERS: u8 = 0x4;
pub(crate) const FLAG_PADDED: u8 = 0x8;
pub(crate) const FLAG_PRIORITY: u8 = 0x20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Kind {
    Data,
    Headers,
    Priority,
    Reset,
    Settings,
    PushPromise,
    Ping,
    Goaway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl Kind {
    fn from_byte(byte: u8) -> Kind {
        match byte {
            0 => Kind::Data,
            1 => Kind::Headers,
            2 => Kind::Priority,
            3 => Kind::Reset,
            4 => Kind::Settings,
            5 => Kind::PushPromise,
            6 => Kind::Ping,
            7 => Kind::Goaway,
            8 => Kind::WindowUpdate,
            9 => Kind::Continuation,
            other => Kind::Unknown(other),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Kind::Data => 0,
            Kind::Headers => 1,
            Kind::Priority => 2,
            Kind::Reset => 3,
            Kind::Settings => 4,
            Kind::PushPromise => 5,
            Kind::Ping => 6,
            Kind::Goaway => 7,
            Kind::WindowUpdate => 8,
            Kind::Continuation => 9,
            Kind::Unknown(other) => other,
        }
    }
}

/// An HTTP/2 error code (RFC 7540 §7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Reason(pub(crate) u32);

impl Reason {
    pub(crate) const NO_ERROR: Reason = Reason(0x0);
    pub(crate) const PROTOCOL_ERROR: Reason = Reason(0x1);
    pub(crate) const INTERNAL_ERROR: Reason = Reason(0x2);
    pub(crate) const FLOW_CONTROL_ERROR: Reason = Reason(0x3);
    pub(crate) const STREAM_CLOSED: Reason = Reason(0x5);
    pub(crate) const FRAME_SIZE_ERROR: Reason = Reason(0x6);
    pub(crate) const REFUSED_STREAM: Reason = Reason(0x7);
    pub(crate) const CANCEL: Reason = Reason(0x8);
    pub(crate) const COMPRESSION_ERROR: Reason = Reason(0x9);
    pub(crate) const ENHANCE_YOUR_CALM: Reason = Reason(0xB);

    pub(crate) fn description(&self) -> &'static str {
        match self.0 {
            0x0 => "no error",
            0x1 => "protocol error",
            0x2 => "internal error",
            0x3 => "flow control error",
            0x5 => "stream closed",
            0x6 => "frame size error",
            0x7 => "refused stream",
            0x8 => "cancelled",
            0x9 => "compression error",
            0xB => "enhance your calm",
            _ => "unknown error code",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameHead {
    pub(crate) len: u32,
    pub(crate) kind: Kind,
    pub(crate) flags: u8,
    pub(crate) stream_id: u32,
}

impl FrameHead {
    pub(crate) fn flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Parses the fixed 9-byte frame header. The reserved bit of the stream id
/// is masked off, as the RFC requires receivers to ignore it.
pub(crate) fn parse_head(raw: &[u8]) -> FrameHead {
    debug_assert!(raw.len() >= FRAME_HEADER_LEN);
    let len = u32::from_be_bytes([0, raw[0], raw[1], raw[2]]);
    let kind = Kind::from_byte(raw[3]);
    let flags = raw[4];
    let stream_id = u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]) & 0x7FFF_FFFF;
    FrameHead {
        len,
        kind,
        flags,
        stream_id,
    }
}

pub(crate) fn encode_head(kind: Kind, flags: u8, stream_id: u32, len: usize, dst: &mut BytesMut) {
    debug_assert!(len <= MAX_ALLOWED_FRAME_SIZE as usize);
    let len = len as u32;
    dst.reserve(FRAME_HEADER_LEN + len as usize);
    dst.put_u8((len >> 16) as u8);
    dst.put_u8((len >> 8) as u8);
    dst.put_u8(len as u8);
    dst.put_u8(kind.to_byte());
    dst.put_u8(flags);
    dst.put_u32(stream_id & 0x7FFF_FFFF);
}

pub(crate) fn encode_reset(stream_id: u32, reason: Reason, dst: &mut BytesMut) {
    encode_head(Kind::Reset, 0, stream_id, 4, dst);
    dst.put_u32(reason.0);
}

pub(crate) fn encode_goaway(last_stream_id: u32, reason: Reason, dst: &mut BytesMut) {
    encode_head(Kind::Goaway, 0, 0, 8, dst);
    dst.put_u32(last_stream_id & 0x7FFF_FFFF);
    dst.put_u32(reason.0);
}

pub(crate) fn encode_ping(payload: &[u8], ack: bool, dst: &mut BytesMut) {
    debug_assert_eq!(payload.len(), 8);
    encode_head(Kind::Ping, if ack { FLAG_ACK } else { 0 }, 0, 8, dst);
    dst.extend_from_slice(payload);
}

pub(crate) fn encode_window_update(stream_id: u32, increment: u32, dst: &mut BytesMut) {
    encode_head(Kind::WindowUpdate, 0, stream_id, 4, dst);
    dst.put_u32(increment & 0x7FFF_FFFF);
}

/// The subset of SETTINGS parameters the engine reads and writes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct Settings {
    pub(crate) header_table_size: Option<u32>,
    pub(crate) enable_push: Option<bool>,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: Option<u32>,
    pub(crate) max_frame_size: Option<u32>,
    pub(crate) max_header_list_size: Option<u32>,
}

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

impl Settings {
    /// Parses a SETTINGS payload; unknown identifiers are ignored.
    pub(crate) fn parse(payload: &[u8]) -> Result<Settings, Reason> {
        if payload.len() % 6 != 0 {
            return Err(Reason::FRAME_SIZE_ERROR);
        }
        let mut settings = Settings::default();
        for raw in payload.chunks(6) {
            let id = u16::from_be_bytes([raw[0], raw[1]]);
            let value = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]);
            match id {
                SETTINGS_HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                SETTINGS_ENABLE_PUSH => match value {
                    0 => settings.enable_push = Some(false),
                    1 => settings.enable_push = Some(true),
                    _ => return Err(Reason::PROTOCOL_ERROR),
                },
                SETTINGS_MAX_CONCURRENT_STREAMS => {
                    settings.max_concurrent_streams = Some(value)
                }
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(Reason::FLOW_CONTROL_ERROR);
                    }
                    settings.initial_window_size = Some(value);
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&value) {
                        return Err(Reason::PROTOCOL_ERROR);
                    }
                    settings.max_frame_size = Some(value);
                }
                SETTINGS_MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                _ => tracing::trace!(id, value, "ignoring unknown setting"),
            }
        }
        Ok(settings)
    }

    /// Writes a complete SETTINGS frame carrying the set parameters.
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let mut payload = BytesMut::new();
        let mut put = |id: u16, value: u32| {
            payload.put_u16(id);
            payload.put_u32(value);
        };
        if let Some(v) = self.header_table_size {
            put(SETTINGS_HEADER_TABLE_SIZE, v);
        }
        if let Some(v) = self.enable_push {
            put(SETTINGS_ENABLE_PUSH, v as u32);
        }
        if let Some(v) = self.max_concurrent_streams {
            put(SETTINGS_MAX_CONCURRENT_STREAMS, v);
        }
        if let Some(v) = self.initial_window_size {
            put(SETTINGS_INITIAL_WINDOW_SIZE, v);
        }
        if let Some(v) = self.max_frame_size {
            put(SETTINGS_MAX_FRAME_SIZE, v);
        }
        if let Some(v) = self.max_header_list_size {
            put(SETTINGS_MAX_HEADER_LIST_SIZE, v);
        }
        encode_head(Kind::Settings, 0, 0, payload.len(), dst);
        dst.extend_from_slice(&payload);
    }

    pub(crate) fn encode_ack(dst: &mut BytesMut) {
        encode_head(Kind::Settings, FLAG_ACK, 0, 0, dst);
    }
}
