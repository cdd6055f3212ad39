#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # weft
//!
//! A multi-protocol HTTP server engine: one listener speaking HTTP/1.1 and
//! HTTP/2 (with HPACK, flow control, and server push), WebSocket upgrades on
//! HTTP/1.1 connections, and a path-template router dispatching every request
//! through a middleware chain to plain async handlers.
//!
//! ```no_run
//! use weft::{Response, Router, Server};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> weft::Result<()> {
//!     let mut router = Router::new();
//!     router.get("/hello", |_req| async { Ok(Response::text("hi")) })?;
//!     router.get("/users/{id:int}", |req: weft::Request| async move {
//!         let id = req.param("id").unwrap_or("0").to_owned();
//!         Ok(Response::text(id))
//!     })?;
//!     Server::new(router).port(8080).run().await
//! }
//! ```
//!
//! The engine owns the wire: parsing, routing, connection lifecycle,
//! timeouts, and graceful shutdown. Handlers see a fully buffered
//! [`Request`] and return a [`Response`]; errors flow through a registry of
//! typed error handlers before falling back to a 500.
//!
//! TLS termination (with ALPN selecting `h2`) is behind the `tls` feature.
//! HTTP/3 enters through the [`Http3Transport`] trait; no QUIC stack ships
//! in this crate.

#[doc(no_inline)]
pub use http::{header, HeaderMap, Method, StatusCode};

pub use crate::dispatch::{middleware_fn, Dispatcher, FnMiddleware, Middleware, Next};
pub use crate::error::{Error, Result};
pub use crate::handler::{Handler, HandlerError, HandlerResult, MessageError, WsHandler};
pub use crate::proto::h3::Http3Transport;
pub use crate::proto::ws::{Message, WebSocketConnection};
pub use crate::proto::Protocol;
pub use crate::request::Request;
pub use crate::response::{PushPromise, Response};
pub use crate::router::{PathParams, Router};
pub use crate::server::{BoundServer, Server, ShutdownHandle};

mod buffer;
mod dispatch;
mod error;
mod handler;
mod proto;
mod request;
mod response;
mod router;
mod server;
