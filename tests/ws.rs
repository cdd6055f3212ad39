//! WebSocket upgrade and framing, driven with raw bytes.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use weft::{Response, Router, Server, ShutdownHandle, WebSocketConnection};

async fn start(router: Router) -> (SocketAddr, ShutdownHandle) {
    let bound = Server::new(router).port(0).bind().await.expect("bind");
    let addr = bound.local_addr();
    let handle = bound.shutdown_handle();
    tokio::spawn(bound.serve());
    (addr, handle)
}

fn echo_router() -> Router {
    let mut router = Router::new();
    router
        .websocket("/ws", |mut socket: WebSocketConnection| async move {
            while let Ok(Some(message)) = socket.recv().await {
                if socket.send(&message).await.is_err() {
                    break;
                }
            }
        })
        .unwrap();
    router
        .get("/plain", |_req| async { Ok(Response::text("http")) })
        .unwrap();
    router
}

const UPGRADE: &[u8] = b"GET /ws HTTP/1.1\r\n\
Host: x\r\n\
Connection: Upgrade\r\n\
Upgrade: websocket\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

async fn upgraded(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(UPGRADE).await.unwrap();

    let mut buf = Vec::new();
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let mut chunk = [0u8; 512];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "eof during handshake");
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&buf);
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(
        head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"),
        "{head}"
    );
    stream
}

fn masked_frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
    let mask = [0x37u8, 0xfa, 0x21, 0x3d];
    let mut raw = vec![(fin as u8) << 7 | opcode];
    match payload.len() {
        n if n < 126 => raw.push(0x80 | n as u8),
        n if n <= u16::MAX as usize => {
            raw.push(0x80 | 126);
            raw.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            raw.push(0x80 | 127);
            raw.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    raw.extend_from_slice(&mask);
    raw.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    raw
}

/// Reads one unmasked server frame: (opcode, fin, payload).
async fn read_frame(stream: &mut TcpStream) -> (u8, bool, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1] & 0x80, 0, "server frames must not be masked");
    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).await.unwrap();
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (head[0] & 0x0F, head[0] & 0x80 != 0, payload)
}

#[tokio::test]
async fn text_echo() {
    let (addr, shutdown) = start(echo_router()).await;
    let mut stream = upgraded(addr).await;

    stream.write_all(&masked_frame(0x1, true, b"ping")).await.unwrap();
    let (opcode, fin, payload) = read_frame(&mut stream).await;
    assert_eq!(opcode, 0x1);
    assert!(fin);
    assert_eq!(payload, b"ping");
    shutdown.shutdown();
}

#[tokio::test]
async fn close_handshake_mirrors_code() {
    let (addr, shutdown) = start(echo_router()).await;
    let mut stream = upgraded(addr).await;

    let mut close_payload = 1000u16.to_be_bytes().to_vec();
    close_payload.extend_from_slice(b"done");
    stream
        .write_all(&masked_frame(0x8, true, &close_payload))
        .await
        .unwrap();

    let (opcode, _fin, payload) = read_frame(&mut stream).await;
    assert_eq!(opcode, 0x8);
    assert_eq!(&payload[..2], &1000u16.to_be_bytes());

    // TCP closes promptly after the close exchange
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
        .await
        .expect("server closes within the grace period")
        .unwrap();
    assert_eq!(n, 0);
    shutdown.shutdown();
}

#[tokio::test]
async fn fragmented_message_reassembles() {
    let (addr, shutdown) = start(echo_router()).await;
    let mut stream = upgraded(addr).await;

    stream.write_all(&masked_frame(0x1, false, b"hel")).await.unwrap();
    stream.write_all(&masked_frame(0x0, false, b"lo ")).await.unwrap();
    stream.write_all(&masked_frame(0x0, true, b"world")).await.unwrap();

    let (opcode, fin, payload) = read_frame(&mut stream).await;
    assert_eq!(opcode, 0x1);
    assert!(fin);
    assert_eq!(payload, b"hello world");
    shutdown.shutdown();
}

#[tokio::test]
async fn ping_interleaves_between_fragments() {
    let (addr, shutdown) = start(echo_router()).await;
    let mut stream = upgraded(addr).await;

    stream.write_all(&masked_frame(0x1, false, b"ha")).await.unwrap();
    stream.write_all(&masked_frame(0x9, true, b"beat")).await.unwrap();
    stream.write_all(&masked_frame(0x0, true, b"lf")).await.unwrap();

    // the pong answers first, then the reassembled echo
    let (opcode, _fin, payload) = read_frame(&mut stream).await;
    assert_eq!(opcode, 0xA);
    assert_eq!(payload, b"beat");

    let (opcode, _fin, payload) = read_frame(&mut stream).await;
    assert_eq!(opcode, 0x1);
    assert_eq!(payload, b"half");
    shutdown.shutdown();
}

#[tokio::test]
async fn binary_echo() {
    let (addr, shutdown) = start(echo_router()).await;
    let mut stream = upgraded(addr).await;

    let payload: Vec<u8> = (0..=255u8).collect();
    stream.write_all(&masked_frame(0x2, true, &payload)).await.unwrap();
    let (opcode, _fin, echoed) = read_frame(&mut stream).await;
    assert_eq!(opcode, 0x2);
    assert_eq!(echoed, payload);
    shutdown.shutdown();
}

#[tokio::test]
async fn upgrade_to_unknown_path_is_404() {
    let (addr, shutdown) = start(echo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /nope HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .await
        .unwrap();
    let mut buf = Vec::new();
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let mut chunk = [0u8; 512];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "eof before response");
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&buf);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "{head}");
    shutdown.shutdown();
}

#[tokio::test]
async fn upgrade_without_key_is_400() {
    let (addr, shutdown) = start(echo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let head = String::from_utf8_lossy(&buf);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{head}");
    shutdown.shutdown();
}

#[tokio::test]
async fn plain_request_on_ws_route_is_426() {
    let (addr, shutdown) = start(echo_router()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let head = String::from_utf8_lossy(&buf);
    assert!(head.starts_with("HTTP/1.1 426 Upgrade Required\r\n"), "{head}");
    shutdown.shutdown();
}
