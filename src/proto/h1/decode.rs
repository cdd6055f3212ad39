//! Request-body decoding.
//!
//! `body_len` picks the framing from the head per RFC 7230 §3.3.3; the
//! chunked decoder then runs as a byte-at-a-time state machine over the
//! connection's read buffer, accumulating the de-chunked body.

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::HeaderMap;

use crate::error::Parse;

#[derive(Debug, PartialEq)]
pub(crate) enum BodyLen {
    Empty,
    Length(u64),
    Chunked,
}

/// Determines request-body framing from the header block.
///
/// A request carrying both `Transfer-Encoding: chunked` and
/// `Content-Length`, a non-chunked final transfer coding, or conflicting
/// lengths is malformed and answered 400.
pub(crate) fn body_len(headers: &HeaderMap) -> Result<BodyLen, Parse> {
    let te_chunked = {
        let mut values = headers.get_all(TRANSFER_ENCODING).iter().peekable();
        if values.peek().is_none() {
            false
        } else {
            let last_coding = values
                .flat_map(|v| v.to_str().ok().into_iter().flat_map(|v| v.split(',')))
                .map(str::trim)
                .last();
            match last_coding {
                Some(coding) if coding.eq_ignore_ascii_case("chunked") => true,
                _ => return Err(Parse::TransferEncoding),
            }
        }
    };

    let content_length = {
        let mut length: Option<u64> = None;
        for value in headers.get_all(CONTENT_LENGTH) {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or(Parse::ContentLength)?;
            match length {
                Some(existing) if existing != parsed => return Err(Parse::ContentLength),
                _ => length = Some(parsed),
            }
        }
        length
    };

    match (te_chunked, content_length) {
        (true, Some(_)) => Err(Parse::TransferEncoding),
        (true, None) => Ok(BodyLen::Chunked),
        (false, Some(0)) | (false, None) => Ok(BodyLen::Empty),
        (false, Some(n)) => Ok(BodyLen::Length(n)),
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    End,
}

/// Cap on chunk-extension bytes across the whole body.
const EXTENSIONS_LIMIT: u64 = 16 * 1024;
/// Cap on trailer bytes; trailers are consumed and discarded.
const TRAILER_LIMIT: u64 = 16 * 1024;

#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkedState,
    chunk_len: u64,
    extensions_cnt: u64,
    trailer_cnt: u64,
    trailer_seen: bool,
    body: BytesMut,
    max_body: u64,
}

impl ChunkedDecoder {
    pub(crate) fn new(max_body: u64) -> ChunkedDecoder {
        ChunkedDecoder {
            state: ChunkedState::Size,
            chunk_len: 0,
            extensions_cnt: 0,
            trailer_cnt: 0,
            trailer_seen: false,
            body: BytesMut::new(),
            max_body,
        }
    }

    /// Consumes whatever it can from `buf`. Returns the complete body once
    /// the terminating chunk and trailers have been read, `None` while more
    /// bytes are needed.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Parse> {
        loop {
            if self.state == ChunkedState::End {
                tracing::trace!(body_len = self.body.len(), "end of chunked");
                return Ok(Some(std::mem::take(&mut self.body).freeze()));
            }
            if self.state == ChunkedState::Body {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = std::cmp::min(self.chunk_len, buf.len() as u64) as usize;
                if self.body.len() as u64 + take as u64 > self.max_body {
                    return Err(Parse::BodyTooLarge);
                }
                self.body.extend_from_slice(&buf.split_to(take));
                self.chunk_len -= take as u64;
                if self.chunk_len == 0 {
                    self.state = ChunkedState::BodyCr;
                }
                continue;
            }

            let byte = match buf.first() {
                Some(&b) => b,
                None => return Ok(None),
            };
            let _ = buf.split_to(1);
            self.state = self.step(byte)?;
        }
    }

    fn step(&mut self, byte: u8) -> Result<ChunkedState, Parse> {
        use self::ChunkedState::*;
        match self.state {
            Size => match byte {
                b'0'..=b'9' => self.accumulate(byte - b'0'),
                b'a'..=b'f' => self.accumulate(byte - b'a' + 10),
                b'A'..=b'F' => self.accumulate(byte - b'A' + 10),
                b'\t' | b' ' => Ok(SizeLws),
                b';' => Ok(Extension),
                b'\r' => Ok(SizeLf),
                _ => Err(Parse::Header),
            },
            SizeLws => match byte {
                b'\t' | b' ' => Ok(SizeLws),
                b';' => Ok(Extension),
                b'\r' => Ok(SizeLf),
                _ => Err(Parse::Header),
            },
            Extension => {
                // a CR inside an extension is not allowed to smuggle data
                self.extensions_cnt += 1;
                if self.extensions_cnt > EXTENSIONS_LIMIT {
                    return Err(Parse::Header);
                }
                match byte {
                    b'\r' => Ok(SizeLf),
                    b'\n' => Err(Parse::Header),
                    _ => Ok(Extension),
                }
            }
            SizeLf => match byte {
                b'\n' if self.chunk_len > 0 => Ok(Body),
                b'\n' => Ok(Trailer),
                _ => Err(Parse::Header),
            },
            Body => unreachable!("body bytes are bulk-copied"),
            BodyCr => match byte {
                b'\r' => Ok(BodyLf),
                _ => Err(Parse::Header),
            },
            BodyLf => match byte {
                b'\n' => Ok(Size),
                _ => Err(Parse::Header),
            },
            Trailer => {
                self.trailer_cnt += 1;
                if self.trailer_cnt > TRAILER_LIMIT {
                    return Err(Parse::Header);
                }
                match byte {
                    b'\r' => Ok(TrailerLf),
                    _ => {
                        // a non-empty trailer line; discard it
                        self.trailer_seen = true;
                        Ok(Trailer)
                    }
                }
            }
            TrailerLf => match byte {
                b'\n' if self.trailer_seen => {
                    self.trailer_seen = false;
                    Ok(Trailer)
                }
                b'\n' => Ok(End),
                _ => Err(Parse::Header),
            },
            End => Ok(End),
        }
    }

    fn accumulate(&mut self, digit: u8) -> Result<ChunkedState, Parse> {
        self.chunk_len = self
            .chunk_len
            .checked_mul(16)
            .and_then(|len| len.checked_add(digit as u64))
            .ok_or(Parse::ContentLength)?;
        Ok(ChunkedState::Size)
    }
}
