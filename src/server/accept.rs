//! Accepting connections and starting their drivers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::buffer::BufferPool;
use crate::error::Result;
use crate::proto::h1::Http1Conn;
#[cfg(feature = "tls")]
use crate::proto::h2::Http2Conn;

use super::ConnShared;

#[cfg(feature = "tls")]
pub(crate) type TlsAcceptor = Option<tokio_rustls::TlsAcceptor>;
#[cfg(not(feature = "tls"))]
pub(crate) type TlsAcceptor = Option<std::convert::Infallible>;

/// Runs one accepted socket to completion: optional TLS handshake, protocol
/// selection via ALPN, then the matching connection driver. HTTP/1
/// connections may still switch protocol mid-stream (Upgrade, preface).
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: TlsAcceptor,
    shared: Arc<ConnShared>,
    read_pool: BufferPool,
    write_pool: BufferPool,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let read_buf = read_pool.acquire().await;
    let write_buf = write_pool.acquire().await;

    match tls {
        #[cfg(feature = "tls")]
        Some(acceptor) => {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "tls handshake failed");
                    return Err(crate::error::Error::new_accept(e));
                }
            };
            let is_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2");
            tracing::trace!(%peer, h2 = is_h2, "tls connection established");
            if is_h2 {
                Http2Conn::new(tls_stream, read_buf, write_buf, peer, shared, shutdown)
                    .serve(None)
                    .await
            } else {
                Http1Conn::new(tls_stream, read_buf, write_buf, peer, shared, shutdown)
                    .serve()
                    .await
            }
        }
        #[cfg(not(feature = "tls"))]
        Some(_) => unreachable!("tls acceptor without the tls feature"),
        None => {
            Http1Conn::new(stream, read_buf, write_buf, peer, shared, shutdown)
                .serve()
                .await
        }
    }
}
