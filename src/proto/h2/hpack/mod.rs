//! HPACK header compression (RFC 7541).
//!
//! One decoder and one encoder per connection, each owning its direction's
//! dynamic table. All five representations are handled; the encoder indexes
//! aggressively except for fields that must never be indexed.

use bytes::BytesMut;

pub(crate) mod huffman;
pub(crate) mod table;

use super::frame::Reason;
use table::{lookup, DynamicTable, STATIC_TABLE, STATIC_TABLE_LEN};

const ENTRY_OVERHEAD: usize = 32;

/// Integer cap while decoding; anything bigger is malformed in practice.
const INT_LIMIT: u64 = 1 << 32;

fn decode_int(src: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<u64, Reason> {
    let mask = (1u16 << prefix_bits) as u64 - 1;
    let first = *src.get(*pos).ok_or(Reason::COMPRESSION_ERROR)? as u64 & mask;
    *pos += 1;
    if first < mask {
        return Ok(first);
    }
    let mut value = mask;
    let mut shift = 0u32;
    loop {
        let byte = *src.get(*pos).ok_or(Reason::COMPRESSION_ERROR)?;
        *pos += 1;
        value += ((byte & 0x7F) as u64) << shift;
        if value > INT_LIMIT {
            return Err(Reason::COMPRESSION_ERROR);
        }
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(Reason::COMPRESSION_ERROR);
        }
    }
}

fn encode_int(value: u64, prefix_bits: u8, flags: u8, dst: &mut BytesMut) {
    let mask = (1u16 << prefix_bits) as u64 - 1;
    if value < mask {
        dst.extend_from_slice(&[flags | value as u8]);
        return;
    }
    dst.extend_from_slice(&[flags | mask as u8]);
    let mut rest = value - mask;
    while rest >= 128 {
        dst.extend_from_slice(&[(rest % 128) as u8 | 0x80]);
        rest /= 128;
    }
    dst.extend_from_slice(&[rest as u8]);
}

fn decode_string(src: &[u8], pos: &mut usize) -> Result<Vec<u8>, Reason> {
    let huffman_coded = src.get(*pos).ok_or(Reason::COMPRESSION_ERROR)? & 0x80 != 0;
    let len = decode_int(src, pos, 7)? as usize;
    let raw = src
        .get(*pos..*pos + len)
        .ok_or(Reason::COMPRESSION_ERROR)?;
    *pos += len;
    if huffman_coded {
        huffman::decode(raw)
    } else {
        Ok(raw.to_vec())
    }
}

fn encode_string(raw: &[u8], dst: &mut BytesMut) {
    let coded_len = huffman::encoded_len(raw);
    if coded_len < raw.len() {
        encode_int(coded_len as u64, 7, 0x80, dst);
        let mut coded = Vec::with_capacity(coded_len);
        huffman::encode(raw, &mut coded);
        dst.extend_from_slice(&coded);
    } else {
        encode_int(raw.len() as u64, 7, 0, dst);
        dst.extend_from_slice(raw);
    }
}

pub(crate) struct Decoder {
    table: DynamicTable,
    /// The table budget we advertised; size updates may not exceed it.
    max_size_limit: usize,
    max_header_list_size: Option<usize>,
}

impl Decoder {
    pub(crate) fn new(max_table_size: usize, max_header_list_size: Option<usize>) -> Decoder {
        Decoder {
            table: DynamicTable::new(max_table_size),
            max_size_limit: max_table_size,
            max_header_list_size,
        }
    }

    /// Decodes one complete header block.
    pub(crate) fn decode(&mut self, src: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Reason> {
        let mut pos = 0;
        let mut fields = Vec::new();
        let mut list_size = 0usize;

        while pos < src.len() {
            let first = src[pos];
            let (name, value) = if first & 0x80 != 0 {
                // indexed field
                let index = decode_int(src, &mut pos, 7)? as usize;
                let (name, value) =
                    lookup(index, &self.table).ok_or(Reason::COMPRESSION_ERROR)?;
                (name.to_vec(), value.to_vec())
            } else if first & 0xC0 == 0x40 {
                // literal with incremental indexing
                let (name, value) = self.decode_literal(src, &mut pos, 6)?;
                self.table.insert(name.clone(), value.clone());
                (name, value)
            } else if first & 0xE0 == 0x20 {
                // dynamic table size update
                let size = decode_int(src, &mut pos, 5)? as usize;
                if size > self.max_size_limit {
                    return Err(Reason::COMPRESSION_ERROR);
                }
                self.table.set_max_size(size);
                continue;
            } else {
                // literal without indexing (0x00) or never indexed (0x10)
                let (name, value) = self.decode_literal(src, &mut pos, 4)?;
                (name, value)
            };

            list_size += name.len() + value.len() + ENTRY_OVERHEAD;
            if let Some(limit) = self.max_header_list_size {
                if list_size > limit {
                    tracing::debug!(list_size, limit, "header list over advertised bound");
                    return Err(Reason::COMPRESSION_ERROR);
                }
            }
            fields.push((name, value));
        }
        Ok(fields)
    }

    fn decode_literal(
        &mut self,
        src: &[u8],
        pos: &mut usize,
        prefix_bits: u8,
    ) -> Result<(Vec<u8>, Vec<u8>), Reason> {
        let name_index = decode_int(src, pos, prefix_bits)? as usize;
        let name = if name_index == 0 {
            decode_string(src, pos)?
        } else {
            lookup(name_index, &self.table)
                .ok_or(Reason::COMPRESSION_ERROR)?
                .0
                .to_vec()
        };
        let value = decode_string(src, pos)?;
        Ok((name, value))
    }
}

pub(crate) struct Encoder {
    table: DynamicTable,
    pending_size_update: Option<usize>,
}

impl Encoder {
    pub(crate) fn new(max_table_size: usize) -> Encoder {
        Encoder {
            table: DynamicTable::new(max_table_size),
            pending_size_update: None,
        }
    }

    /// Applies the peer's new table budget; the shrink is announced at the
    /// head of the next encoded block, as the RFC requires.
    pub(crate) fn set_max_table_size(&mut self, size: usize) {
        if size != self.table.max_size() {
            self.table.set_max_size(size);
            self.pending_size_update = Some(size);
        }
    }

    pub(crate) fn encode(&mut self, fields: &[(Vec<u8>, Vec<u8>)], dst: &mut BytesMut) {
        if let Some(size) = self.pending_size_update.take() {
            encode_int(size as u64, 5, 0x20, dst);
        }
        for (name, value) in fields {
            self.encode_field(name, value, dst);
        }
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], dst: &mut BytesMut) {
        if never_index(name) {
            let name_index = self.find_name(name).unwrap_or(0);
            encode_int(name_index as u64, 4, 0x10, dst);
            if name_index == 0 {
                encode_string(name, dst);
            }
            encode_string(value, dst);
            return;
        }

        if let Some(index) = self.find_field(name, value) {
            encode_int(index as u64, 7, 0x80, dst);
            return;
        }

        let name_index = self.find_name(name).unwrap_or(0);
        encode_int(name_index as u64, 6, 0x40, dst);
        if name_index == 0 {
            encode_string(name, dst);
        }
        encode_string(value, dst);
        self.table.insert(name.to_vec(), value.to_vec());
    }

    /// Wire index of an exact match, static table first.
    fn find_field(&self, name: &[u8], value: &[u8]) -> Option<usize> {
        STATIC_TABLE
            .iter()
            .position(|(n, v)| n.as_bytes() == name && v.as_bytes() == value)
            .map(|i| i + 1)
            .or_else(|| {
                self.table
                    .find(name, value)
                    .map(|i| STATIC_TABLE_LEN + i + 1)
            })
    }

    fn find_name(&self, name: &[u8]) -> Option<usize> {
        STATIC_TABLE
            .iter()
            .position(|(n, _)| n.as_bytes() == name)
            .map(|i| i + 1)
            .or_else(|| {
                self.table
                    .find_name(name)
                    .map(|i| STATIC_TABLE_LEN + i + 1)
            })
    }
}

fn never_index(name: &[u8]) -> bool {
    name == b"authorization" || name == b"proxy-authorization" || name == b"set-cookie"
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

    fn roundtrip(pairs: &[(&str, &str)]) {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, None);
        let list = fields(pairs);
        let mut block = BytesMut::new();
        encoder.encode(&list, &mut block);
        assert_eq!(decoder.decode(&block).unwrap(), list);
    }

    #[test]
    fn roundtrip_request_fields() {
        roundtrip(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/users/42?watch=1"),
            (":authority", "api.example.com"),
            ("user-agent", "weft-test/1.0"),
            ("accept", "application/json"),
        ]);
    }

    #[test]
    fn roundtrip_binary_values() {
        let list = vec![(b"x-bin".to_vec(), vec![0u8, 1, 2, 250, 255])];
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, None);
        let mut block = BytesMut::new();
        encoder.encode(&list, &mut block);
        assert_eq!(decoder.decode(&block).unwrap(), list);
    }

    #[test]
    fn repeated_blocks_share_dynamic_state() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, None);
        let list = fields(&[(":status", "200"), ("x-request-id", "abc-123")]);

        let mut first = BytesMut::new();
        encoder.encode(&list, &mut first);
        let mut second = BytesMut::new();
        encoder.encode(&list, &mut second);

        // the second block hits the dynamic table and shrinks
        assert!(second.len() < first.len());
        assert_eq!(decoder.decode(&first).unwrap(), list);
        assert_eq!(decoder.decode(&second).unwrap(), list);
    }

    #[test]
    fn table_size_schedule_roundtrips() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, None);
        let list = fields(&[("x-alpha", "1"), ("x-beta", "2")]);

        let mut block = BytesMut::new();
        encoder.encode(&list, &mut block);
        assert_eq!(decoder.decode(&block).unwrap(), list);

        encoder.set_max_table_size(64);
        let mut shrunk = BytesMut::new();
        encoder.encode(&list, &mut shrunk);
        // announced at the head of the block
        assert_eq!(shrunk[0] & 0xE0, 0x20);
        assert_eq!(decoder.decode(&shrunk).unwrap(), list);

        encoder.set_max_table_size(4096);
        let mut grown = BytesMut::new();
        encoder.encode(&list, &mut grown);
        assert_eq!(decoder.decode(&grown).unwrap(), list);
    }

    #[test]
    fn never_indexed_authorization() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, None);
        let list = fields(&[("authorization", "Bearer s3cr3t")]);
        let mut block = BytesMut::new();
        encoder.encode(&list, &mut block);
        assert_eq!(block[0] & 0xF0, 0x10);
        assert_eq!(decoder.decode(&block).unwrap(), list);
        // a second block must not find it indexed
        let mut again = BytesMut::new();
        encoder.encode(&list, &mut again);
        assert_eq!(again[0] & 0xF0, 0x10);
    }

    #[test]
    fn decodes_rfc_c_2_1_literal_with_indexing() {
        // RFC 7541 C.2.1
        let block: &[u8] = &[
            0x40, 0x0a, 0x63, 0x75, 0x73, 0x74, 0x6f, 0x6d, 0x2d, 0x6b, 0x65, 0x79, 0x0d, 0x63,
            0x75, 0x73, 0x74, 0x6f, 0x6d, 0x2d, 0x68, 0x65, 0x61, 0x64, 0x65, 0x72,
        ];
        let mut decoder = Decoder::new(4096, None);
        let fields = decoder.decode(block).unwrap();
        assert_eq!(
            fields,
            vec![(b"custom-key".to_vec(), b"custom-header".to_vec())]
        );
    }

    #[test]
    fn decodes_rfc_c_2_4_indexed() {
        // RFC 7541 C.2.4: index 2 = :method GET
        let mut decoder = Decoder::new(4096, None);
        let fields = decoder.decode(&[0x82]).unwrap();
        assert_eq!(fields, vec![(b":method".to_vec(), b"GET".to_vec())]);
    }

    #[test]
    fn rejects_unknown_index() {
        let mut decoder = Decoder::new(4096, None);
        assert!(decoder.decode(&[0xFF, 0x80, 0x7F]).is_err());
    }

    #[test]
    fn rejects_truncated_string() {
        let mut decoder = Decoder::new(4096, None);
        assert!(decoder.decode(&[0x40, 0x0a, 0x63]).is_err());
    }

    #[test]
    fn rejects_size_update_beyond_limit() {
        let mut decoder = Decoder::new(4096, None);
        let mut block = BytesMut::new();
        encode_int(8192, 5, 0x20, &mut block);
        assert!(decoder.decode(&block).is_err());
    }

    #[test]
    fn bounds_header_list() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, Some(48));
        let list = fields(&[("x-long-header-name", "with a fairly long value here")]);
        let mut block = BytesMut::new();
        encoder.encode(&list, &mut block);
        assert!(decoder.decode(&block).is_err());
    }

    #[test]
    fn integer_primitives() {
        // RFC 7541 C.1
        let mut dst = BytesMut::new();
        encode_int(10, 5, 0, &mut dst);
        assert_eq!(&dst[..], &[0x0a]);

        let mut dst = BytesMut::new();
        encode_int(1337, 5, 0, &mut dst);
        assert_eq!(&dst[..], &[0x1f, 0x9a, 0x0a]);

        let mut pos = 0;
        assert_eq!(decode_int(&[0x1f, 0x9a, 0x0a], &mut pos, 5).unwrap(), 1337);
        assert_eq!(pos, 3);
    }
}
