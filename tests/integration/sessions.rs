//! Session accounting integration tests
//!
//! # Test Categories
//!
//! 1. **Lifecycle**: one session per connection, finalized exactly once
//! 2. **History**: completed history bounded and ordered
//! 3. **Report**: the plain-text tables for live traffic

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tunbridge::config::Config;
use tunbridge::{MemoryEngine, Protocol, Stack, StreamConnection};

use super::{addr, Harness, NullDatagrams};

const SERVER: &str = "93.184.216.34:443";

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_session_follows_connection() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect("10.0.0.2:40000", SERVER);

    let sessions = h.stack.sessions();
    assert_eq!(sessions.active.len(), 1);
    assert!(sessions.completed.is_empty());
    let live = &sessions.active[0];
    assert_eq!(live.id, conn.session_id());
    assert_eq!(live.protocol, Protocol::Tcp);
    assert_eq!(live.local, addr("10.0.0.2:40000"));
    assert_eq!(live.remote, addr(SERVER));
    assert!(live.active);

    h.engine.deliver(handle, Bytes::from_static(b"hello"));
    h.stack.pump();
    let mut buf = [0u8; 16];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 5);
    conn.write(b"world!").unwrap();
    conn.close().unwrap();

    let sessions = h.stack.sessions();
    assert!(sessions.active.is_empty());
    assert_eq!(sessions.completed.len(), 1);
    let done = &sessions.completed[0];
    assert_eq!(done.upload, 6);
    assert_eq!(done.download, 5);
    assert!(!done.active);
}

#[tokio::test]
async fn test_download_counts_bytes_read() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect("10.0.0.2:40000", SERVER);
    let session = h.stack.recorder().get(conn.session_id()).unwrap();

    h.engine.deliver(handle, Bytes::from_static(b"0123456789"));
    h.stack.pump();
    assert_eq!(session.download(), 0);

    let mut buf = [0u8; 4];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 4);
    assert_eq!(session.download(), 4);

    // The six unread bytes are discarded, not counted
    conn.abort();
    let done = &h.stack.sessions().completed[0];
    assert_eq!(done.download, 4);
}

#[tokio::test]
async fn test_completed_duration_frozen() {
    let mut h = Harness::new();
    let (_, conn) = h.connect("10.0.0.2:40000", SERVER);
    conn.abort();

    let first = h.stack.sessions().completed[0].duration;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let second = h.stack.sessions().completed[0].duration;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_concurrent_counters_monotonic() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect("10.0.0.2:40000", SERVER);
    let recorder = h.stack.recorder();
    let session = recorder.get(conn.session_id()).unwrap();

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move {
                for _ in 0..250 {
                    conn.write_all(&[0u8; 4]).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    let sampler = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            let mut last = 0;
            for _ in 0..500 {
                let now = session.upload();
                assert!(now >= last);
                last = now;
                tokio::task::yield_now().await;
            }
        })
    };

    for writer in writers {
        writer.await.unwrap();
    }
    sampler.await.unwrap();

    assert_eq!(session.upload(), 4000);
    assert_eq!(h.engine.take_written(handle).len(), 4000);
}

// ============================================================================
// History Tests
// ============================================================================

#[tokio::test]
async fn test_history_keeps_most_recent() {
    let mut h = Harness::new();
    let mut ids = Vec::new();

    for port in 0..60u16 {
        let src = format!("10.0.0.2:{}", 30000 + port);
        let (_, conn) = h.connect(&src, SERVER);
        ids.push(conn.session_id());
        conn.abort();
    }

    let completed = h.stack.sessions().completed;
    assert_eq!(completed.len(), 50);
    assert_eq!(completed[0].id, ids[10]);
    assert_eq!(completed[49].id, ids[59]);
}

#[tokio::test]
async fn test_history_cap_configurable() {
    let mut config = Harness::quiet_config();
    config.stats.max_completed = 3;
    let mut h = Harness::with(MemoryEngine::new(), config);

    for port in 0..5u16 {
        let src = format!("10.0.0.2:{}", 30000 + port);
        h.connect(&src, SERVER).1.abort();
    }

    assert_eq!(h.stack.recorder().max_completed(), 3);
    assert_eq!(h.stack.recorder().completed_count(), 3);
}

// ============================================================================
// Report Tests
// ============================================================================

#[tokio::test]
async fn test_report_shows_process_and_bytes() {
    let engine = MemoryEngine::new();
    let (tx, mut conns) = mpsc::unbounded_channel();
    let mut config = Config::default();
    config.stack.timer_interval_ms = 3_600_000;

    let stack = Stack::builder(engine.clone())
        .config(config)
        .stream_handler(move |conn: StreamConnection| -> anyhow::Result<()> {
            tx.send(conn)?;
            Ok(())
        })
        .datagram_handler(NullDatagrams)
        .process_resolver(|local: std::net::SocketAddr, _remote: std::net::SocketAddr| {
            (local.port() == 40000).then(|| "curl".to_string())
        })
        .build()
        .unwrap();

    let handle = engine.open_stream(addr("10.0.0.2:40000"), addr(SERVER));
    stack.pump();
    let conn = conns.try_recv().unwrap();
    assert_eq!(conn.write(&vec![1u8; 54_919]).unwrap(), 54_919);
    engine.deliver(handle, Bytes::from(vec![2u8; 1500]));
    stack.pump();
    let mut buf = vec![0u8; 4096];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 1500);

    let report = stack.report();
    let mut lines = report.lines();
    assert_eq!(lines.next(), Some("Active sessions 1"));
    assert!(lines.next().unwrap().contains("Process Name|"));
    let row = lines.next().unwrap();
    assert!(row.contains("curl|"));
    assert!(row.contains("tcp|"));
    assert!(row.contains("10.0.0.2:40000|"));
    assert!(row.contains("54,919|"));
    assert!(row.contains("1,500|"));
    assert!(report.contains("\n\n\nRecently completed sessions 0\n"));
}

#[tokio::test]
async fn test_report_moves_rows_on_completion() {
    let mut h = Harness::new();
    let (_, conn) = h.connect("10.0.0.2:40000", SERVER);
    conn.abort();

    let report = h.stack.report();
    assert!(report.starts_with("Active sessions 0\n"));
    assert!(report.contains("Recently completed sessions 1\n"));
    assert!(report.trim_end().ends_with('|'));
}
