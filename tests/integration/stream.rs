//! Stream connection integration tests
//!
//! # Test Categories
//!
//! 1. **Data Path**: writes reach the client, received bytes reach readers
//! 2. **Backpressure**: send window, pending queue and receive window
//! 3. **Teardown**: close, abort, peer close, reset and stall detection
//! 4. **Accept**: duplicate identities and handler rejection

use std::net::SocketAddrV4;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tunbridge::addr::packet::{build_ipv4_tcp, TcpFlags};
use tunbridge::{ConnError, EngineError, MemoryEngine, Phase, Protocol, Stack, StreamConnection};

use super::{addr, Harness, NullDatagrams};

const CLIENT: &str = "10.0.0.2:40000";
const SERVER: &str = "93.184.216.34:80";

// ============================================================================
// Data Path Tests
// ============================================================================

#[tokio::test]
async fn test_write_reaches_client_and_counts_upload() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect(CLIENT, SERVER);

    let data = vec![0x5a; 1000];
    assert_eq!(conn.write(&data).unwrap(), 1000);

    let written = h.engine.take_written(handle);
    assert_eq!(written.len(), 1000);
    assert!(written.iter().all(|b| *b == 0x5a));

    let session = h.stack.recorder().get(conn.session_id()).unwrap();
    assert_eq!(session.upload(), 1000);
    assert_eq!(session.download(), 0);
}

#[tokio::test]
async fn test_received_bytes_reach_reader() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect(CLIENT, SERVER);

    h.engine.deliver(handle, Bytes::from_static(b"GET / HTTP/1.1\r\n"));
    h.stack.pump();

    let mut buf = [0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\n");
    assert_eq!(h.engine.recved(handle), n);

    let session = h.stack.recorder().get(conn.session_id()).unwrap();
    assert_eq!(session.download(), n as u64);
}

#[tokio::test]
async fn test_endpoints_follow_client_perspective() {
    let mut h = Harness::new();
    let (_, conn) = h.connect(CLIENT, SERVER);

    assert_eq!(conn.local_endpoint().socket_addr(), addr(CLIENT));
    assert_eq!(conn.remote_endpoint().socket_addr(), addr(SERVER));
    assert_eq!(conn.protocol(), Protocol::Tcp);
    assert_eq!(conn.phase(), Phase::Established);
    assert!(h.stack.stream(&conn.id()).is_some());
}

#[tokio::test]
async fn test_input_packets_drive_connection() {
    let mut h = Harness::new();
    let client: SocketAddrV4 = CLIENT.parse().unwrap();
    let server: SocketAddrV4 = SERVER.parse().unwrap();

    h.stack
        .input(build_ipv4_tcp(client, server, TcpFlags::syn(), &[]))
        .unwrap();
    let conn = h.conns.try_recv().unwrap();

    h.stack
        .input(build_ipv4_tcp(client, server, TcpFlags::ack(), b"ping"))
        .unwrap();
    let fin = TcpFlags {
        fin: true,
        ack: true,
        ..TcpFlags::default()
    };
    h.stack.input(build_ipv4_tcp(client, server, fin, &[])).unwrap();

    let mut buf = [0u8; 16];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_async_io_traits() {
    let mut h = Harness::new();
    let (handle, mut conn) = h.connect(CLIENT, SERVER);

    h.engine.deliver(handle, Bytes::from_static(b"abc"));
    h.engine.peer_close(handle);
    h.stack.pump();

    let mut received = Vec::new();
    conn.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"abc");

    conn.write_all(b"reply").await.unwrap();
    conn.flush().await.unwrap();
    conn.shutdown().await.unwrap();

    assert_eq!(&h.engine.take_written(handle)[..], b"reply");
    assert!(h.engine.is_closed(handle));
}

// ============================================================================
// Backpressure Tests
// ============================================================================

#[tokio::test]
async fn test_send_window_drains_on_ack() {
    let engine = MemoryEngine::with_send_window(100);
    let mut h = Harness::with(engine, Harness::quiet_config());
    let (handle, conn) = h.connect(CLIENT, SERVER);

    assert_eq!(conn.write(&[1u8; 300]).unwrap(), 300);
    assert_eq!(h.engine.take_written(handle).len(), 100);

    assert_eq!(h.engine.ack(handle, 100), 100);
    h.stack.pump();
    assert_eq!(h.engine.take_written(handle).len(), 100);

    let session = h.stack.recorder().get(conn.session_id()).unwrap();
    assert_eq!(session.upload(), 200);
}

#[tokio::test]
async fn test_pending_queue_bounded() {
    let mut config = Harness::quiet_config();
    config.tcp.max_pending_write = 50;
    let mut h = Harness::with(MemoryEngine::with_send_window(0), config);
    let (_, conn) = h.connect(CLIENT, SERVER);

    assert_eq!(conn.write(&[1u8; 100]).unwrap(), 50);
    assert_eq!(conn.write(&[1u8; 100]).unwrap(), 0);
}

#[tokio::test]
async fn test_write_all_waits_for_room() {
    let mut config = Harness::quiet_config();
    config.tcp.max_pending_write = 10;
    let engine = MemoryEngine::with_send_window(10);
    engine.set_auto_ack(true);
    let mut h = Harness::with(engine, config);
    let (handle, conn) = h.connect(CLIENT, SERVER);

    conn.write_all(&[9u8; 30]).await.unwrap();
    assert_eq!(h.engine.take_written(handle).len(), 30);
}

#[tokio::test]
async fn test_receive_window_deferred_until_read() {
    let mut config = Harness::quiet_config();
    config.tcp.recv_buffer = 4;
    let mut h = Harness::with(MemoryEngine::new(), config);
    let (handle, conn) = h.connect(CLIENT, SERVER);

    h.engine.deliver(handle, Bytes::from_static(b"0123456789"));
    h.stack.pump();
    assert_eq!(h.engine.recved(handle), 4);

    let mut buf = [0u8; 8];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 8);
    assert_eq!(h.engine.recved(handle), 10);
}

#[tokio::test]
async fn test_transient_write_failure_retried() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect(CLIENT, SERVER);

    h.engine.fail_writes(EngineError::OutOfMemory);
    assert_eq!(conn.write(b"later").unwrap(), 5);
    assert_eq!(conn.phase(), Phase::Established);
    assert!(h.engine.take_written(handle).is_empty());
}

#[tokio::test]
async fn test_engine_write_failure_aborts() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect(CLIENT, SERVER);

    h.engine.fail_writes(EngineError::NotConnected);
    assert_eq!(conn.write(b"doomed").unwrap(), 6);

    assert_eq!(conn.phase(), Phase::Aborted);
    assert!(h.engine.is_aborted(handle));
    let mut buf = [0u8; 8];
    assert!(matches!(
        conn.read(&mut buf).await,
        Err(ConnError::Engine(EngineError::NotConnected))
    ));
}

// ============================================================================
// Teardown Tests
// ============================================================================

#[tokio::test]
async fn test_close_removes_registry_entry() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect(CLIENT, SERVER);

    conn.close().unwrap();
    conn.close().unwrap();

    assert_eq!(conn.phase(), Phase::Closed);
    assert!(h.engine.is_closed(handle));
    assert_eq!(h.stack.stream_count(), 0);
    assert!(matches!(
        conn.write(b"x"),
        Err(ConnError::NotWritable {
            phase: Phase::Closed
        })
    ));

    let mut buf = [0u8; 8];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_close_unblocks_reader() {
    let mut h = Harness::new();
    let (_, conn) = h.connect(CLIENT, SERVER);

    let reader = conn.clone();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        reader.read(&mut buf).await
    });
    tokio::task::yield_now().await;

    conn.close().unwrap();
    assert_eq!(task.await.unwrap().unwrap(), 0);
}

#[tokio::test]
async fn test_abort_unblocks_reader_once() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect(CLIENT, SERVER);

    let reader = conn.clone();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        reader.read(&mut buf).await
    });
    tokio::task::yield_now().await;

    conn.abort();
    conn.abort();

    assert!(matches!(task.await.unwrap(), Err(ConnError::Aborted)));
    assert!(h.engine.is_aborted(handle));
    assert_eq!(h.stack.stream_count(), 0);
    assert_eq!(h.stack.recorder().completed_count(), 1);
    assert!(conn.close().is_ok());
}

#[tokio::test]
async fn test_peer_close_drains_then_eof() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect(CLIENT, SERVER);

    h.engine.deliver(handle, Bytes::from_static(b"last words"));
    h.engine.peer_close(handle);
    h.stack.pump();

    let mut buf = [0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"last words");
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);

    // Half-closed: the proxy can still answer
    assert_eq!(conn.write(b"bye").unwrap(), 3);
    assert_eq!(&h.engine.take_written(handle)[..], b"bye");
}

#[tokio::test]
async fn test_reset_reports_error() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect(CLIENT, SERVER);

    h.engine.deliver(handle, Bytes::from_static(b"partial"));
    h.engine.reset(handle);
    h.stack.pump();

    let mut buf = [0u8; 64];
    assert!(matches!(conn.read(&mut buf).await, Err(ConnError::Reset)));
    assert_eq!(conn.phase(), Phase::Aborted);
    assert_eq!(h.stack.stream_count(), 0);
    assert!(!h.engine.is_aborted(handle));
}

#[tokio::test(start_paused = true)]
async fn test_close_waits_for_pending_output() {
    let mut config = Harness::quiet_config();
    config.stack.timer_interval_ms = 10;
    config.stack.poll_interval_ticks = 1;
    let mut h = Harness::with(MemoryEngine::with_send_window(0), config);
    let (handle, conn) = h.connect(CLIENT, SERVER);

    assert_eq!(conn.write(b"tail").unwrap(), 4);
    conn.close().unwrap();
    assert_eq!(conn.phase(), Phase::Closing);
    assert!(!h.engine.is_closed(handle));

    h.engine.set_send_window(handle, 64);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(&h.engine.take_written(handle)[..], b"tail");
    assert!(h.engine.is_closed(handle));
    assert_eq!(conn.phase(), Phase::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_writer_aborted() {
    let mut config = Harness::quiet_config();
    config.stack.timer_interval_ms = 10;
    config.stack.poll_interval_ticks = 1;
    config.tcp.max_stalled_polls = 3;
    let mut h = Harness::with(MemoryEngine::with_send_window(0), config);
    let (handle, conn) = h.connect(CLIENT, SERVER);

    assert_eq!(conn.write(b"stuck").unwrap(), 5);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut buf = [0u8; 8];
    assert!(matches!(conn.read(&mut buf).await, Err(ConnError::StalledWriter)));
    assert!(h.engine.is_aborted(handle));
    assert_eq!(h.stack.stream_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_read_timeout() {
    let mut config = Harness::quiet_config();
    config.tcp.read_timeout_ms = 100;
    let mut h = Harness::with(MemoryEngine::new(), config);
    let (_, conn) = h.connect(CLIENT, SERVER);

    let mut buf = [0u8; 8];
    assert!(matches!(conn.read(&mut buf).await, Err(ConnError::TimedOut)));
    assert_eq!(conn.phase(), Phase::Established);
}

// ============================================================================
// Accept Tests
// ============================================================================

#[tokio::test]
async fn test_duplicate_accept_keeps_existing() {
    let mut h = Harness::new();
    let (first, conn) = h.connect(CLIENT, SERVER);

    let second = h.engine.open_stream(addr(CLIENT), addr(SERVER));
    h.stack.pump();

    assert!(h.conns.try_recv().is_err());
    assert!(h.engine.is_aborted(second));
    assert!(!h.engine.is_aborted(first));
    assert_eq!(h.stack.stream_count(), 1);
    assert_eq!(h.stack.stats().streams_rejected, 1);
    assert_eq!(conn.phase(), Phase::Established);
    assert_eq!(h.stack.recorder().active_count(), 1);
}

#[tokio::test]
async fn test_identity_reusable_after_close() {
    let mut h = Harness::new();
    let (_, conn) = h.connect(CLIENT, SERVER);
    conn.abort();

    let (second, conn) = h.connect(CLIENT, SERVER);
    assert_eq!(conn.handle(), second);
    assert_eq!(h.stack.stream_count(), 1);
}

#[tokio::test]
async fn test_handler_error_aborts_connection() {
    let engine = MemoryEngine::new();
    let stack = Stack::builder(engine.clone())
        .config(Harness::quiet_config())
        .stream_handler(|_conn: StreamConnection| -> anyhow::Result<()> {
            anyhow::bail!("no upstream")
        })
        .datagram_handler(NullDatagrams)
        .build()
        .unwrap();

    let handle = engine.open_stream(addr(CLIENT), addr(SERVER));
    stack.pump();

    assert!(engine.is_aborted(handle));
    assert_eq!(stack.stream_count(), 0);
    assert_eq!(stack.recorder().completed_count(), 1);
}

#[tokio::test]
async fn test_concurrent_writers_serialized() {
    let mut h = Harness::new();
    let mut conns = Vec::new();
    for port in 0..8u16 {
        let src = format!("10.0.0.2:{}", 41000 + port);
        conns.push(h.connect(&src, SERVER));
    }

    let tasks: Vec<_> = conns
        .iter()
        .map(|(_, conn)| {
            let conn = conn.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    conn.write_all(&[3u8; 10]).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    for (handle, conn) in &conns {
        assert_eq!(h.engine.take_written(*handle).len(), 1000);
        let session = h.stack.recorder().get(conn.session_id()).unwrap();
        assert_eq!(session.upload(), 1000);
    }
}
