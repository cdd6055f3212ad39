//! HPACK indexing tables (RFC 7541 §2.3).

use std::collections::VecDeque;

/// The static table, Appendix A. Index 0 is unused on the wire; entry `i`
/// lives at `STATIC_TABLE[i - 1]`.
pub(crate) const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

pub(crate) const STATIC_TABLE_LEN: usize = STATIC_TABLE.len();

/// Per-RFC overhead added to each entry's size.
const ENTRY_OVERHEAD: usize = 32;

fn entry_size(name: &[u8], value: &[u8]) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

/// One direction's dynamic table. Newest entries sit at the front; eviction
/// happens from the back whenever the size budget shrinks or an insert
/// overflows it.
#[derive(Debug)]
pub(crate) struct DynamicTable {
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub(crate) fn new(max_size: usize) -> DynamicTable {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    pub(crate) fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    /// `index` is zero-based into the dynamic section (wire index minus the
    /// static table length minus one).
    pub(crate) fn get(&self, index: usize) -> Option<(&[u8], &[u8])> {
        self.entries
            .get(index)
            .map(|(name, value)| (name.as_slice(), value.as_slice()))
    }

    pub(crate) fn insert(&mut self, name: Vec<u8>, value: Vec<u8>) {
        let size = entry_size(&name, &value);
        // An entry larger than the whole table empties it and is dropped.
        if size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.size += size;
        self.entries.push_front((name, value));
        self.evict();
    }

    /// Zero-based position of an exact (name, value) match.
    pub(crate) fn find(&self, name: &[u8], value: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, v)| n == name && v == value)
    }

    /// Zero-based position of a name match.
    pub(crate) fn find_name(&self, name: &[u8]) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            let (name, value) = self
                .entries
                .pop_back()
                .expect("non-zero size implies entries");
            self.size -= entry_size(&name, &value);
        }
    }
}

/// Resolves a wire index (1-based) across the static and dynamic tables.
pub(crate) fn lookup<'t>(index: usize, dynamic: &'t DynamicTable) -> Option<(&'t [u8], &'t [u8])> {
    if index == 0 {
        return None;
    }
    if index <= STATIC_TABLE_LEN {
        let (name, value) = STATIC_TABLE[index - 1];
        return Some((name.as_bytes(), value.as_bytes()));
    }
    dynamic.get(index - STATIC_TABLE_LEN - 1)
}
