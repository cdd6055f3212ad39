//! Request dispatch: routing, the middleware chain, and error recovery.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::header::{HeaderValue, ACCEPT, ALLOW, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};

use crate::handler::{Handler, HandlerError, HandlerResult};
use crate::request::Request;
use crate::response::Response;
use crate::router::{Endpoint, RouteMatch, Router};

/// A layer wrapped around every handler.
///
/// Middleware run outside-in in registration order; one may short-circuit by
/// returning without calling [`Next::run`]. Implement the trait directly, or
/// wrap a closure with [`middleware_fn`].
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, HandlerResult>;
}

/// Adapts a boxing closure into a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> FnMiddleware<F>
where
    F: for<'a> Fn(Request, Next<'a>) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
{
    FnMiddleware(f)
}

/// See [`middleware_fn`].
pub struct FnMiddleware<F>(F);

impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(Request, Next<'a>) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, HandlerResult> {
        (self.0)(req, next)
    }
}

impl<F> fmt::Debug for FnMiddleware<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnMiddleware")
    }
}

/// The remainder of the middleware chain, ending at the route handler.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Handler,
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("layers", &self.rest.len()).finish()
    }
}

impl<'a> Next<'a> {
    pub async fn run(self, req: Request) -> HandlerResult {
        match self.rest.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    rest,
                    endpoint: self.endpoint,
                };
                first.handle(req, next).await
            }
            None => {
                // A panicking handler is an error like any other; it must
                // not take the connection down.
                match std::panic::AssertUnwindSafe(self.endpoint.call(req))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => Err(HandlerError::message(panic_message(&panic))),
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_owned()
    }
}

type ErrorHook = Arc<dyn Fn(&Request, &HandlerError) -> Response + Send + Sync>;

/// Error handlers, looked up most-specific-first:
/// (route, type) → (route, any) → (global, type) → (global, any).
#[derive(Default)]
pub(crate) struct ErrorHandlers {
    by_route_and_type: HashMap<(Arc<str>, TypeId), ErrorHook>,
    by_route: HashMap<Arc<str>, ErrorHook>,
    by_type: HashMap<TypeId, ErrorHook>,
    fallback: Option<ErrorHook>,
}

impl ErrorHandlers {
    pub(crate) fn insert(
        &mut self,
        template: Option<&str>,
        type_id: Option<TypeId>,
        hook: ErrorHook,
    ) {
        match (template, type_id) {
            (Some(t), Some(id)) => {
                self.by_route_and_type.insert((Arc::from(t), id), hook);
            }
            (Some(t), None) => {
                self.by_route.insert(Arc::from(t), hook);
            }
            (None, Some(id)) => {
                self.by_type.insert(id, hook);
            }
            (None, None) => self.fallback = Some(hook),
        }
    }

    fn resolve(&self, template: Option<&Arc<str>>, err: &HandlerError) -> Option<&ErrorHook> {
        let type_id = err.cause_type_id();
        if let Some(template) = template {
            if let Some(hook) = self
                .by_route_and_type
                .get(&(Arc::clone(template), type_id))
            {
                return Some(hook);
            }
            if let Some(hook) = self.by_route.get(template) {
                return Some(hook);
            }
        }
        if let Some(hook) = self.by_type.get(&type_id) {
            return Some(hook);
        }
        self.fallback.as_ref()
    }
}

/// Routes a request and runs it through the middleware chain.
///
/// Shared by every connection; also the entry point an HTTP/3 transport
/// adapter feeds decoded requests into.
pub struct Dispatcher {
    router: Router,
    middlewares: Arc<[Arc<dyn Middleware>]>,
    error_handlers: ErrorHandlers,
}

impl Dispatcher {
    pub(crate) fn new(
        router: Router,
        middlewares: Vec<Arc<dyn Middleware>>,
        error_handlers: ErrorHandlers,
    ) -> Dispatcher {
        Dispatcher {
            router,
            middlewares: middlewares.into(),
            error_handlers,
        }
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    /// Produces the response for a request. Routing failures and handler
    /// errors are converted here; callers always get a writable response.
    pub async fn dispatch(&self, mut req: Request) -> Response {
        let (leaf, params) = match self.router.match_route(req.method(), req.path()) {
            RouteMatch::Found { leaf, params } => (leaf, params),
            RouteMatch::MethodNotAllowed(allowed) => {
                tracing::debug!(method = %req.method(), path = %req.path(), "method not allowed");
                let mut res =
                    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed", req.headers());
                let list = allowed
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                if let Ok(value) = HeaderValue::from_str(&list) {
                    res.headers_mut().insert(ALLOW, value);
                }
                return res;
            }
            RouteMatch::NotFound => {
                tracing::debug!(method = %req.method(), path = %req.path(), "no route matched");
                return error_response(StatusCode::NOT_FOUND, "not found", req.headers());
            }
        };

        let handler = match &leaf.endpoint {
            Endpoint::Http(handler) => Arc::clone(handler),
            Endpoint::Ws(_) => {
                // Reachable only without an Upgrade header; the connection
                // driver intercepts real upgrade requests earlier.
                return error_response(
                    StatusCode::UPGRADE_REQUIRED,
                    "websocket endpoint requires upgrade",
                    req.headers(),
                );
            }
        };

        req.set_path_params(params);
        let accept = req.headers().clone();

        let next = Next {
            rest: &self.middlewares,
            endpoint: &*handler,
        };
        // The full entity is returned even for HEAD; each protocol encoder
        // suppresses the body bytes while advertising their length.
        match next.run(req).await {
            Ok(res) => res,
            Err(err) => self.recover(&leaf.template, &err, &accept),
        }
    }

    fn recover(&self, template: &Arc<str>, err: &HandlerError, accept: &HeaderMap) -> Response {
        // The hooks need a Request to inspect; hand them a minimal view.
        let probe = Request::new(
            Method::GET,
            template.to_string(),
            crate::proto::Protocol::Http11,
            accept.clone(),
            bytes::Bytes::new(),
            std::net::SocketAddr::from(([0, 0, 0, 0], 0)),
        );
        match self.error_handlers.resolve(Some(template), err) {
            Some(hook) => hook(&probe, err),
            None => {
                tracing::warn!(error = %err, route = %template, "handler error, no recovery registered");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error", accept)
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.router)
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

/// Builds the minimal body for an engine-generated error response: JSON when
/// the client accepts it, plain text otherwise.
pub(crate) fn error_response(status: StatusCode, reason: &str, headers: &HeaderMap) -> Response {
    let wants_json = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("application/json") || accept.contains("*/json"))
        .unwrap_or(false);

    let mut res = Response::new(status);
    if wants_json {
        res.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        res.set_body(serde_json::json!({ "error": reason }).to_string());
    } else {
        res.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        res.set_body(reason.to_owned());
    }
    res
}
