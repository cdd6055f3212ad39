//! Handler and middleware ABI.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;

use futures_util::future::BoxFuture;

use crate::proto::ws::WebSocketConnection;
use crate::request::Request;
use crate::response::Response;

/// What a handler produces: a response, or an error routed through the
/// registered error handlers.
pub type HandlerResult = Result<Response, HandlerError>;

/// An error escaping user handler code.
///
/// Carries the underlying error for the error-handler registry to downcast
/// against. Any `std` error converts with `?`.
pub struct HandlerError {
    type_id: std::any::TypeId,
    cause: Box<dyn StdError + Send + Sync>,
}

/// The error type behind [`HandlerError::message`].
#[derive(Debug)]
pub struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for MessageError {}

impl HandlerError {
    pub fn new<E: StdError + Send + Sync + 'static>(cause: E) -> HandlerError {
        HandlerError {
            type_id: std::any::TypeId::of::<E>(),
            cause: Box::new(cause),
        }
    }

    /// An error from a plain message.
    pub fn message(msg: impl Into<String>) -> HandlerError {
        HandlerError::new(MessageError(msg.into()))
    }

    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.cause.is::<E>()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.cause.downcast_ref::<E>()
    }

    pub fn cause(&self) -> &(dyn StdError + Send + Sync) {
        &*self.cause
    }

    pub(crate) fn cause_type_id(&self) -> std::any::TypeId {
        self.type_id
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerError").field(&self.cause).finish()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.cause, f)
    }
}

impl<E> From<E> for HandlerError
where
    E: StdError + Send + Sync + 'static,
{
    fn from(err: E) -> HandlerError {
        HandlerError::new(err)
    }
}

/// An async function from [`Request`] to [`Response`].
///
/// Implemented for any `Fn(Request) -> impl Future<Output = HandlerResult>`,
/// so plain async functions register directly.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self)(req))
    }
}

/// An async function owning an upgraded WebSocket connection until it
/// returns.
pub trait WsHandler: Send + Sync + 'static {
    fn call(&self, socket: WebSocketConnection) -> BoxFuture<'static, ()>;
}

impl<F, Fut> WsHandler for F
where
    F: Fn(WebSocketConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, socket: WebSocketConnection) -> BoxFuture<'static, ()> {
        Box::pin((self)(socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Quota;

    impl fmt::Display for Quota {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("quota exceeded")
        }
    }

    impl StdError for Quota {}

    #[test]
    fn downcast_roundtrip() {
        let err = HandlerError::new(Quota);
        assert!(err.is::<Quota>());
        assert!(err.downcast_ref::<Quota>().is_some());
        assert!(!err.is::<std::io::Error>());
    }

    #[test]
    fn question_mark_converts() {
        fn f() -> HandlerResult {
            let _n: i32 = "nope".parse()?;
            Ok(Response::text("ok"))
        }
        let err = f().unwrap_err();
        assert!(err.is::<std::num::ParseIntError>());
    }
}
