//! HTTP/2 framing, header compression, and stream multiplexing.

pub(crate) mod conn;
pub(crate) mod flow;
pub(crate) mod frame;
pub(crate) mod hpack;
pub(crate) mod streams;

pub(crate) use conn::{Http2Conn, Upgrade};
pub(crate) use frame::PREFACE_HEAD;
