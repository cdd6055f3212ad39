//! WebSocket transport layered on an upgraded HTTP/1.1 connection.

pub(crate) mod conn;
pub(crate) mod frame;
pub(crate) mod handshake;

pub use conn::{Message, WebSocketConnection};
