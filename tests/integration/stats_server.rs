//! Stats endpoint integration tests
//!
//! The server is bound to an ephemeral port and queried with raw HTTP
//! requests over a real TCP socket. HTTP/1.1 requests carry
//! `Connection: close` so the response can be read to end of stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::Harness;

async fn start(h: &Harness) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();

    let server = h.stack.stats_server();
    tokio::spawn(async move { server.serve(listener).await });
    local
}

async fn request(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_plain_path_serves_report() {
    let mut h = Harness::new();
    let (_, _conn) = h.connect("10.0.0.2:40000", "93.184.216.34:80");
    let addr = start(&h).await;

    let response = request(
        addr,
        "GET /stats/session/plain HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.to_ascii_lowercase().contains("content-type: text/plain"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    assert!(body.contains("tcp|"));
    assert!(body.contains("10.0.0.2:40000|"));
    assert!(body.starts_with("Active sessions 1\n"));
    assert!(body.contains("Recently completed sessions 0\n"));
}

#[tokio::test]
async fn test_other_paths_not_found() {
    let h = Harness::new();
    let addr = start(&h).await;

    let response = request(addr, "GET /stats HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.ends_with("404 page not found\n"));
}

#[tokio::test]
async fn test_wrong_method_rejected() {
    let h = Harness::new();
    let addr = start(&h).await;

    let response = request(
        addr,
        "POST /stats/session/plain HTTP/1.1\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
    ).await;
    assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
}

#[tokio::test]
async fn test_head_has_no_body() {
    let h = Harness::new();
    let addr = start(&h).await;

    let response = request(
        addr,
        "HEAD /stats/session/plain HTTP/1.1\r\nConnection: close\r\n\r\n",
    ).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("\r\n\r\n"));
}

#[tokio::test]
async fn test_bare_lf_request_answered() {
    let mut h = Harness::new();
    let (_, _conn) = h.connect("10.0.0.2:40000", "93.184.216.34:80");
    let addr = start(&h).await;

    let response = request(addr, "GET /stats/session/plain HTTP/1.0\n\n").await;
    assert!(response.starts_with("HTTP/1."));
    assert!(response.contains(" 200 OK\r\n"));
    assert!(response.contains("10.0.0.2:40000|"));
}

#[tokio::test]
async fn test_query_string_ignored() {
    let h = Harness::new();
    let addr = start(&h).await;

    let response = request(
        addr,
        "GET /stats/session/plain?refresh=1 HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn test_disabled_server_returns_immediately() {
    let h = Harness::new();
    let server = h.stack.stats_server();

    tokio::time::timeout(Duration::from_secs(1), server.run())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_serving() {
    let h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let server = Arc::new(h.stack.stats_server());
    let task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };
    tokio::task::yield_now().await;

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
