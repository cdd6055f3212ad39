//! End-to-end tests over real sockets.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use weft::{HandlerError, Request, Response, Router, Server, ShutdownHandle, StatusCode};

async fn start(router: Router) -> (SocketAddr, ShutdownHandle, JoinHandle<weft::Result<()>>) {
    start_with(Server::new(router)).await
}

async fn start_with(server: Server) -> (SocketAddr, ShutdownHandle, JoinHandle<weft::Result<()>>) {
    let _ = pretty_env_logger::try_init();
    let bound = server.port(0).bind().await.expect("bind");
    let addr = bound.local_addr();
    let handle = bound.shutdown_handle();
    let join = tokio::spawn(bound.serve());
    (addr, handle, join)
}

fn demo_router() -> Router {
    let mut router = Router::new();
    router
        .get("/hello", |_req| async { Ok(Response::text("hi")) })
        .unwrap();
    router
        .get("/users/{id:int}", |req: Request| async move {
            let id = req.param("id").expect("route captures id").to_owned();
            Ok(Response::text(id))
        })
        .unwrap();
    router
        .post("/echo", |req: Request| async move {
            Ok(Response::text(req.body().clone()))
        })
        .unwrap();
    router
        .get("/status", |_req| async {
            #[derive(serde::Serialize)]
            struct Status {
                ok: bool,
                version: u32,
            }
            Response::json(&Status { ok: true, version: 2 })
        })
        .unwrap();
    router
        .post("/sum", |req: Request| async move {
            let value = req.json().map_err(|e| weft::HandlerError::message(e.to_string()))?;
            let total: i64 = value["terms"]
                .as_array()
                .map(|terms| terms.iter().filter_map(|t| t.as_i64()).sum())
                .unwrap_or(0);
            Ok(Response::text(total.to_string()))
        })
        .unwrap();
    router
}

/// Writes a raw request and reads one full response (headers plus
/// content-length body).
async fn roundtrip(stream: &mut TcpStream, raw: &[u8]) -> String {
    stream.write_all(raw).await.expect("write request");
    read_response(stream).await
}

async fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let header_end = loop {
        if let Some(pos) = find_blank_line(&buf) {
            break pos;
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.expect("read response");
        assert!(n > 0, "eof before response head: {:?}", String::from_utf8_lossy(&buf));
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);

    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.expect("read body");
        assert!(n > 0, "eof before body complete");
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&buf[..body_start + content_length]).to_string()
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[tokio::test]
async fn get_literal_route() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let res = roundtrip(&mut stream, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.contains("content-length: 2\r\n"), "{res}");
    assert!(res.ends_with("\r\n\r\nhi"), "{res}");

    // the socket stays open for the next request
    let res = roundtrip(&mut stream, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(res.ends_with("hi"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn path_params_reach_handler() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(&mut stream, b"GET /users/42 HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.ends_with("42"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn method_mismatch_is_405_with_allow() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(&mut stream, b"POST /hello HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{res}");
    assert!(res.contains("allow: GET, HEAD\r\n"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn missing_route_is_404() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(&mut stream, b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn error_body_is_json_when_accepted() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(
        &mut stream,
        b"GET /missing HTTP/1.1\r\nHost: x\r\nAccept: application/json\r\n\r\n",
    )
    .await;
    assert!(res.contains("content-type: application/json"), "{res}");
    assert!(res.ends_with(r#"{"error":"not found"}"#), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn json_response_route() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(&mut stream, b"GET /status HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(res.contains("content-type: application/json\r\n"), "{res}");
    assert!(res.ends_with(r#"{"ok":true,"version":2}"#), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn json_request_body_accessor() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let body = br#"{"terms": [1, 2, 3, 4]}"#;
    let raw = format!(
        "POST /sum HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut request = raw.into_bytes();
    request.extend_from_slice(body);
    let res = roundtrip(&mut stream, &request).await;
    assert!(res.ends_with("10"), "{res}");

    // malformed JSON is a handler error, not a crash
    let raw = b"POST /sum HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\n{oops";
    let res = roundtrip(&mut stream, raw).await;
    assert!(res.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn chunked_post_echo() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    )
    .await;
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.ends_with("hello"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn content_length_post_echo() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nabcd",
    )
    .await;
    assert!(res.ends_with("abcd"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn chunked_with_content_length_is_rejected() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    )
    .await;
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn malformed_request_line_is_400() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(&mut stream, b"GET\t/ HTTP/1.1\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{res}");
    // and the connection closes
    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).await.unwrap();
    assert_eq!(n, 0);
    shutdown.shutdown();
}

#[tokio::test]
async fn connection_close_is_honored() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(
        &mut stream,
        b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(res.contains("connection: close\r\n"), "{res}");
    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).await.unwrap();
    assert_eq!(n, 0, "socket should close after the response");
    shutdown.shutdown();
}

#[tokio::test]
async fn http10_closes_by_default() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(&mut stream, b"GET /hello HTTP/1.0\r\nHost: x\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.0 200 OK\r\n"), "{res}");
    assert!(res.contains("connection: close\r\n"), "{res}");
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).await.unwrap(), 0);
    shutdown.shutdown();
}

#[tokio::test]
async fn head_has_length_but_no_body() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"HEAD /hello HTTP/1.1\r\nHost: x\r\n\r\nGET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    // HEAD advertises the body's length without sending it; the following
    // pipelined GET must come back intact right after the blank line.
    let mut all = Vec::new();
    while !String::from_utf8_lossy(&all).contains("\r\n\r\nhi") {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        all.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8_lossy(&all);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert_eq!(text.matches("content-length: 2").count(), 2, "{text}");
    assert!(text.ends_with("\r\n\r\nhi"), "{text}");
    shutdown.shutdown();
}

#[tokio::test]
async fn pipelined_requests_answered_in_order() {
    let mut router = Router::new();
    router
        .get("/slow", |_req| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Response::text("slow"))
        })
        .unwrap();
    router
        .get("/fast", |_req| async { Ok(Response::text("fast")) })
        .unwrap();
    let (addr, shutdown, _join) = start(router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\nGET /fast HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let first = read_response(&mut stream).await;
    let second = read_response(&mut stream).await;
    assert!(first.ends_with("slow"), "{first}");
    assert!(second.ends_with("fast"), "{second}");
    shutdown.shutdown();
}

#[tokio::test]
async fn expect_continue_interim_response() {
    let (addr, shutdown, _join) = start(demo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\n")
        .await
        .unwrap();

    let mut interim = [0u8; 25];
    stream.read_exact(&mut interim).await.unwrap();
    assert_eq!(&interim[..], b"HTTP/1.1 100 Continue\r\n\r\n");

    stream.write_all(b"ok").await.unwrap();
    let res = read_response(&mut stream).await;
    assert!(res.ends_with("ok"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn handler_error_becomes_500() {
    let mut router = Router::new();
    router
        .get("/boom", |_req| async {
            Err::<Response, _>(HandlerError::message("nope"))
        })
        .unwrap();
    let (addr, shutdown, _join) = start(router).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(&mut stream, b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn typed_error_handler_recovers() {
    let mut router = Router::new();
    router
        .get("/io", |_req| async {
            Err::<Response, _>(HandlerError::new(std::io::Error::other("backend down")))
        })
        .unwrap();
    let server = Server::new(router).on_error::<std::io::Error, _>(|_req, _err| {
        Response::new(StatusCode::BAD_GATEWAY)
    });
    let (addr, shutdown, _join) = start_with(server).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(&mut stream, b"GET /io HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn graceful_shutdown_is_idempotent() {
    let (addr, shutdown, join) = start(demo_router()).await;

    // an in-flight connection finishes its response
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(&mut stream, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(res.ends_with("hi"), "{res}");

    shutdown.shutdown();
    shutdown.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .expect("server exits after shutdown")
        .expect("serve task not cancelled");
    assert!(result.is_ok());
}

#[tokio::test]
async fn draining_response_advertises_close() {
    let mut router = Router::new();
    router
        .get("/slow", |_req| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Response::text("done"))
        })
        .unwrap();
    let (addr, shutdown, join) = start(router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.shutdown();

    let res = read_response(&mut stream).await;
    assert!(res.ends_with("done"), "{res}");
    assert!(res.contains("connection: close\r\n"), "{res}");
    let _ = join.await;
}

#[tokio::test]
async fn keep_alive_timeout_closes_idle_socket() {
    let router = demo_router();
    let server = Server::new(router).keep_alive_timeout(Duration::from_millis(100));
    let (addr, shutdown, _join) = start_with(server).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // silence: the server closes without writing anything
    let mut buf = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
        .await
        .expect("server closes idle connection")
        .unwrap();
    assert_eq!(n, 0);
    shutdown.shutdown();
}

#[tokio::test]
async fn oversize_body_is_413() {
    let server = Server::new(demo_router()).max_body_size(8);
    let (addr, shutdown, _join) = start_with(server).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let res = roundtrip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 64\r\n\r\n",
    )
    .await;
    assert!(res.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{res}");
    shutdown.shutdown();
}

#[tokio::test]
async fn bind_conflict_maps_to_exit_code_1() {
    let bound = Server::new(Router::new()).port(0).bind().await.unwrap();
    let addr = bound.local_addr();

    let err = Server::new(Router::new())
        .host(addr.ip().to_string())
        .port(addr.port())
        .bind()
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn bad_host_maps_to_exit_code_2() {
    let err = Server::new(Router::new())
        .host("not a host")
        .bind()
        .await
        .unwrap_err();
    assert!(err.is_config());
    assert_eq!(err.exit_code(), 2);
}
