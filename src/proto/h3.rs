//! Pluggable HTTP/3 transport.
//!
//! The engine does not ship a QUIC stack. An adapter that owns one can feed
//! decoded requests into the same dispatcher the TCP listeners use: the run
//! loop hands it the UDP port and a [`Dispatcher`] handle when an adapter is
//! installed, and otherwise never binds the port.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::dispatch::Dispatcher;
use crate::error::Result;

/// A transport that terminates HTTP/3 and drives the dispatcher.
///
/// Implementations build a [`crate::Request`] (with
/// [`crate::Protocol::Http3`]) per decoded request, await
/// [`Dispatcher::dispatch`], and frame the returned response themselves.
pub trait Http3Transport: Send + Sync + 'static {
    /// Serves on the given UDP port until the server shuts down; resolving
    /// early tears the whole server down.
    fn serve(&self, port: u16, dispatcher: Arc<Dispatcher>) -> BoxFuture<'static, Result<()>>;
}
