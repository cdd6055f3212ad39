use std::cell::RefCell;
use std::time::{Duration, Instant, SystemTime};

use bytes::BytesMut;

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

/// Appends the current `Date` header value, re-rendered at most once per
/// second per thread.
pub(crate) fn extend(dst: &mut BytesMut) {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        dst.extend_from_slice(&cache.bytes);
    })
}

struct CachedDate {
    bytes: [u8; DATE_VALUE_LENGTH],
    rendered_at: Option<Instant>,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate {
    bytes: [0; DATE_VALUE_LENGTH],
    rendered_at: None,
}));

impl CachedDate {
    fn check(&mut self) {
        let stale = match self.rendered_at {
            Some(at) => at.elapsed() >= Duration::from_secs(1),
            None => true,
        };
        if stale {
            let formatted = httpdate::fmt_http_date(SystemTime::now());
            debug_assert_eq!(formatted.len(), DATE_VALUE_LENGTH);
            self.bytes.copy_from_slice(formatted.as_bytes());
            self.rendered_at = Some(Instant::now());
        }
    }
}
