//! The server: configuration, binding, the accept loop, and shutdown.

use std::any::TypeId;
use std::error::Error as StdError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::buffer::BufferPool;
use crate::dispatch::{Dispatcher, ErrorHandlers, Middleware};
use crate::error::{Error, Result};
use crate::handler::HandlerError;
use crate::proto::h3::Http3Transport;
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;

pub(crate) mod accept;
pub(crate) mod shutdown;

pub use shutdown::ShutdownHandle;

/// Tunables shared by every connection driver.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) read_buffer_size: usize,
    pub(crate) write_buffer_size: usize,
    pub(crate) max_connections: usize,
    pub(crate) shutdown_grace: Duration,
    pub(crate) max_body_size: u64,
    pub(crate) max_ws_message_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            keep_alive_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            read_buffer_size: 16 * 1024,
            write_buffer_size: 16 * 1024,
            max_connections: 10_000,
            shutdown_grace: Duration::from_secs(30),
            max_body_size: 64 * 1024 * 1024,
            max_ws_message_size: 64 * 1024 * 1024,
        }
    }
}

/// What a connection driver needs from the server.
pub(crate) struct ConnShared {
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) config: Config,
}

/// Builds and runs the server.
///
/// ```no_run
/// # use weft::{Response, Router, Server};
/// # async fn run() -> weft::Result<()> {
/// let mut router = Router::new();
/// router.get("/hello", |_req| async { Ok(Response::text("hi")) })?;
/// Server::new(router).port(8080).run().await
/// # }
/// ```
pub struct Server {
    router: Router,
    middlewares: Vec<Arc<dyn Middleware>>,
    error_handlers: ErrorHandlers,
    host: String,
    port: u16,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::rustls::ServerConfig>,
    http3: Option<(Arc<dyn Http3Transport>, u16)>,
    config: Config,
}

impl Server {
    pub fn new(router: Router) -> Server {
        Server {
            router,
            middlewares: Vec::new(),
            error_handlers: ErrorHandlers::default(),
            host: "127.0.0.1".to_owned(),
            port: 8080,
            #[cfg(feature = "tls")]
            tls: None,
            http3: None,
            config: Config::default(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Server {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Server {
        self.port = port;
        self
    }

    /// Terminates TLS with the given configuration. ALPN is forced to offer
    /// `h2` and `http/1.1`; the negotiated id selects the protocol engine.
    #[cfg(feature = "tls")]
    pub fn tls_context(mut self, mut tls: tokio_rustls::rustls::ServerConfig) -> Server {
        tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        self.tls = Some(tls);
        self
    }

    /// Installs an HTTP/3 transport adapter on the given UDP port. Without
    /// one, the port is never bound.
    pub fn http3(mut self, transport: impl Http3Transport, port: u16) -> Server {
        self.http3 = Some((Arc::new(transport), port));
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Server {
        self.config.keep_alive_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Server {
        self.config.request_timeout = timeout;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Server {
        self.config.read_buffer_size = size;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Server {
        self.config.write_buffer_size = size;
        self
    }

    pub fn max_connections(mut self, limit: usize) -> Server {
        self.config.max_connections = limit;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Server {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn max_body_size(mut self, limit: u64) -> Server {
        self.config.max_body_size = limit;
        self
    }

    pub fn max_ws_message_size(mut self, limit: usize) -> Server {
        self.config.max_ws_message_size = limit;
        self
    }

    /// Appends a middleware; the first registered runs outermost.
    pub fn middleware(mut self, middleware: impl Middleware) -> Server {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Recovers handler errors whose cause is an `E`, on any route.
    pub fn on_error<E, F>(mut self, hook: F) -> Server
    where
        E: StdError + Send + Sync + 'static,
        F: Fn(&Request, &HandlerError) -> Response + Send + Sync + 'static,
    {
        self.error_handlers
            .insert(None, Some(TypeId::of::<E>()), Arc::new(hook));
        self
    }

    /// Recovers handler errors whose cause is an `E`, on one route template.
    pub fn on_error_at<E, F>(mut self, template: &str, hook: F) -> Server
    where
        E: StdError + Send + Sync + 'static,
        F: Fn(&Request, &HandlerError) -> Response + Send + Sync + 'static,
    {
        self.error_handlers
            .insert(Some(template), Some(TypeId::of::<E>()), Arc::new(hook));
        self
    }

    /// Recovers any handler error on one route template.
    pub fn on_any_error_at<F>(mut self, template: &str, hook: F) -> Server
    where
        F: Fn(&Request, &HandlerError) -> Response + Send + Sync + 'static,
    {
        self.error_handlers.insert(Some(template), None, Arc::new(hook));
        self
    }

    /// The global fallback for otherwise-unhandled handler errors.
    pub fn on_any_error<F>(mut self, hook: F) -> Server
    where
        F: Fn(&Request, &HandlerError) -> Response + Send + Sync + 'static,
    {
        self.error_handlers.insert(None, None, Arc::new(hook));
        self
    }

    /// Binds the listener. Fails with a config error for unusable options
    /// and a listen error when the bind itself is refused.
    pub async fn bind(self) -> Result<BoundServer> {
        if self.config.read_buffer_size == 0 || self.config.write_buffer_size == 0 {
            return Err(Error::new_config("buffer sizes must be non-zero"));
        }
        if self.config.max_connections == 0 {
            return Err(Error::new_config("max_connections must be non-zero"));
        }
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| Error::new_config("host is not a valid bind address"))?;

        let listener = TcpListener::bind(addr).await.map_err(Error::new_listen)?;
        let local_addr = listener.local_addr().map_err(Error::new_listen)?;
        tracing::debug!(%local_addr, "listening");

        #[cfg(feature = "tls")]
        let tls = self
            .tls
            .map(|tls| tokio_rustls::TlsAcceptor::from(Arc::new(tls)));

        let dispatcher = Arc::new(Dispatcher::new(
            self.router,
            self.middlewares,
            self.error_handlers,
        ));
        let shared = Arc::new(ConnShared {
            dispatcher,
            config: self.config.clone(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(BoundServer {
            listener,
            local_addr,
            #[cfg(feature = "tls")]
            tls,
            shared,
            http3: self.http3,
            config: self.config,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Binds and serves until shut down through a [`ShutdownHandle`].
    pub async fn run(self) -> Result<()> {
        self.bind().await?.serve().await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// A server bound to its socket, ready to serve.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsAcceptor>,
    shared: Arc<ConnShared>,
    http3: Option<(Arc<dyn Http3Transport>, u16)>,
    config: Config,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BoundServer {
    /// The bound address; useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.shutdown_tx.clone())
    }

    /// Serves until the shutdown handle fires.
    pub async fn serve(self) -> Result<()> {
        let mut rx = self.shutdown_rx.clone();
        self.serve_with_shutdown(async move {
            let _ = rx.changed().await;
        })
        .await
    }

    /// Serves until `signal` resolves, then drains gracefully: the listener
    /// closes, in-flight connections get `shutdown_grace` to finish, and
    /// stragglers are aborted.
    pub async fn serve_with_shutdown(self, signal: impl Future<Output = ()>) -> Result<()> {
        let BoundServer {
            listener,
            local_addr: _,
            #[cfg(feature = "tls")]
            tls,
            shared,
            http3,
            config,
            shutdown_tx,
            shutdown_rx,
        } = self;

        let permits = Arc::new(Semaphore::new(config.max_connections));
        let read_pool = BufferPool::new(config.max_connections, config.read_buffer_size);
        let write_pool = BufferPool::new(config.max_connections, config.write_buffer_size);
        let mut tasks = JoinSet::new();
        let mut signal = std::pin::pin!(signal);

        let mut h3_task = http3.map(|(transport, port)| {
            let dispatcher = Arc::clone(&shared.dispatcher);
            tokio::spawn(transport.serve(port, dispatcher))
        });

        let result = loop {
            // Defer accepting while at the connection limit.
            let permit = tokio::select! {
                _ = &mut signal => break Ok(()),
                permit = Arc::clone(&permits).acquire_owned() => {
                    permit.expect("connection semaphore is never closed")
                }
            };

            tokio::select! {
                _ = &mut signal => break Ok(()),
                res = async { h3_task.as_mut().expect("guarded by condition").await }, if h3_task.is_some() => {
                    h3_task = None;
                    match res {
                        Ok(inner) => break inner,
                        Err(join_err) => break Err(Error::new_accept(join_err)),
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::trace!(%peer, "connection accepted");
                    #[cfg(feature = "tls")]
                    let tls = tls.clone();
                    #[cfg(not(feature = "tls"))]
                    let tls: accept::TlsAcceptor = None;
                    let shared = Arc::clone(&shared);
                    let read_pool = read_pool.clone();
                    let write_pool = write_pool.clone();
                    let shutdown = shutdown_rx.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Err(err) = accept::handle_connection(
                            stream, peer, tls, shared, read_pool, write_pool, shutdown,
                        )
                        .await
                        {
                            tracing::debug!(%peer, error = %err, "connection ended with error");
                        }
                    });
                }
            }
        };

        drop(listener);
        let _ = shutdown_tx.send(true);
        if let Some(h3) = h3_task {
            h3.abort();
        }

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if timeout(config.shutdown_grace, drain).await.is_err() {
            tracing::warn!("shutdown grace elapsed, aborting remaining connections");
            tasks.shutdown().await;
        }
        tracing::debug!("server stopped");
        result
    }
}

impl std::fmt::Debug for BoundServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
