//! Per-connection stream bookkeeping.
//!
//! Streams live in a map keyed by their wire id. A closed stream is removed
//! at once; a later frame that names it is rejected with `STREAM_CLOSED`
//! instead of consulting tombstones.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method};
use tokio::task::AbortHandle;

use super::flow::FlowControl;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum StreamState {
    Open,
    HalfClosedRemote,
    HalfClosedLocal,
    ReservedLocal,
}

/// The request head assembled from a HEADERS block.
#[derive(Debug)]
pub(crate) struct StreamRequest {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) authority: Option<String>,
    pub(crate) headers: HeaderMap,
}

/// A response body waiting on flow-control window.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub(crate) body: Bytes,
    pub(crate) sent: usize,
}

#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) state: StreamState,
    pub(crate) send_flow: FlowControl,
    pub(crate) recv_flow: FlowControl,
    pub(crate) request: Option<StreamRequest>,
    /// Kept past dispatch so pushed requests inherit the authority.
    pub(crate) authority: Option<String>,
    /// HEAD responses advertise the entity length but carry no DATA.
    pub(crate) is_head: bool,
    pub(crate) body: BytesMut,
    pub(crate) outgoing: Option<Outgoing>,
    pub(crate) task: Option<AbortHandle>,
}

impl Stream {
    pub(crate) fn new(state: StreamState, send_window: u32, recv_window: u32) -> Stream {
        Stream {
            state,
            send_flow: FlowControl::new(send_window),
            recv_flow: FlowControl::new(recv_window),
            request: None,
            authority: None,
            is_head: false,
            body: BytesMut::new(),
            outgoing: None,
            task: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct StreamStore {
    streams: HashMap<u32, Stream>,
    /// Highest client-initiated stream id seen.
    pub(crate) last_client_id: u32,
    /// Next server-initiated (push) stream id.
    next_push_id: u32,
}

impl StreamStore {
    pub(crate) fn new() -> StreamStore {
        StreamStore {
            streams: HashMap::new(),
            last_client_id: 0,
            next_push_id: 2,
        }
    }

    pub(crate) fn insert(&mut self, id: u32, stream: Stream) {
        if id % 2 == 1 && id > self.last_client_id {
            self.last_client_id = id;
        }
        self.streams.insert(id, stream);
    }

    pub(crate) fn reserve_push_id(&mut self) -> u32 {
        let id = self.next_push_id;
        self.next_push_id += 2;
        id
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.streams.contains_key(&id)
    }

    /// Whether a client stream id refers to something never opened.
    pub(crate) fn is_idle(&self, id: u32) -> bool {
        id > self.last_client_id && !self.streams.contains_key(&id)
    }

    /// Removes a stream, aborting its handler if one is still running.
    pub(crate) fn remove(&mut self, id: u32) -> Option<Stream> {
        let stream = self.streams.remove(&id);
        if let Some(stream) = &stream {
            if let Some(task) = &stream.task {
                task.abort();
            }
        }
        stream
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub(crate) fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn abort_all(&mut self) {
        for stream in self.streams.values() {
            if let Some(task) = &stream.task {
                task.abort();
            }
        }
        self.streams.clear();
    }

    pub(crate) fn adjust_send_windows(&mut self, delta: i64) {
        for stream in self.streams.values_mut() {
            stream.send_flow.adjust(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::DEFAULT_INITIAL_WINDOW_SIZE;

    fn stream() -> Stream {
        Stream::new(
            StreamState::Open,
            DEFAULT_INITIAL_WINDOW_SIZE,
            DEFAULT_INITIAL_WINDOW_SIZE,
        )
    }

    #[test]
    fn tracks_highest_client_id() {
        let mut store = StreamStore::new();
        store.insert(1, stream());
        store.insert(5, stream());
        assert_eq!(store.last_client_id, 5);
        assert!(store.is_idle(7));
        assert!(!store.is_idle(3)); // lower ids are closed, not idle
    }

    #[test]
    fn push_ids_are_even_and_increasing() {
        let mut store = StreamStore::new();
        assert_eq!(store.reserve_push_id(), 2);
        assert_eq!(store.reserve_push_id(), 4);
    }

    #[test]
    fn settings_delta_applies_to_all() {
        let mut store = StreamStore::new();
        store.insert(1, stream());
        store.insert(3, stream());
        store.adjust_send_windows(-65_535);
        assert_eq!(store.get_mut(1).unwrap().send_flow.available(), 0);
        assert_eq!(store.get_mut(3).unwrap().send_flow.available(), 0);
    }
}
