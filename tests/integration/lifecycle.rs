//! Stack lifecycle integration tests
//!
//! # Test Categories
//!
//! 1. **Timers**: scheduler ticks, restart, fatal faults
//! 2. **Shutdown**: explicit shutdown and dropped stacks
//! 3. **Output**: engine packets forwarded to the output channel

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tunbridge::addr::packet::inspect;
use tunbridge::{
    ConfigError, ConnError, EngineError, MemoryEngine, Phase, Protocol, Stack, StackError,
    StackState, StreamConnection,
};

use super::{addr, Harness, NullDatagrams};

const CLIENT: &str = "10.0.0.2:40000";
const SERVER: &str = "93.184.216.34:80";

fn ticking_config() -> tunbridge::Config {
    let mut config = Harness::quiet_config();
    config.stack.timer_interval_ms = 10;
    config.stack.poll_interval_ticks = 1;
    config
}

// ============================================================================
// Timer Tests
// ============================================================================

#[tokio::test]
async fn test_restart_timeouts_reaches_engine() {
    let h = Harness::new();

    h.stack.restart_timeouts();
    h.stack.restart_timeouts();
    assert_eq!(h.engine.timer_restarts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_timer_error_ignored() {
    let h = Harness::with(MemoryEngine::new(), ticking_config());

    h.engine.fail_timers(EngineError::Other("clock skew".into()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.stack.state(), StackState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_timer_fault_fails_stack() {
    let mut h = Harness::with(MemoryEngine::new(), ticking_config());
    let (handle, conn) = h.connect(CLIENT, SERVER);
    let mut state = h.stack.subscribe();

    h.engine
        .fail_timers(EngineError::Fatal("pcb list corrupt".into()));
    state.changed().await.unwrap();

    match h.stack.state() {
        StackState::Failed(reason) => assert!(reason.contains("pcb list corrupt")),
        other => panic!("Expected Failed state, got {:?}", other),
    }
    assert_eq!(conn.phase(), Phase::Aborted);
    assert!(h.engine.is_aborted(handle));
    assert_eq!(h.stack.stream_count(), 0);

    let mut buf = [0u8; 8];
    assert!(matches!(conn.read(&mut buf).await, Err(ConnError::Aborted)));
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_tears_everything_down() {
    let mut h = Harness::new();
    let (handle, conn) = h.connect(CLIENT, SERVER);
    h.engine
        .deliver_datagram(addr("10.0.0.2:53000"), addr("8.8.8.8:53"), Bytes::from_static(b"q"));
    h.stack.pump();
    let (flow, _) = h.flows.try_recv().unwrap();

    let reader = conn.clone();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        reader.read(&mut buf).await
    });
    tokio::task::yield_now().await;

    h.stack.shutdown();
    h.stack.shutdown();

    assert!(matches!(task.await.unwrap(), Err(ConnError::Aborted)));
    assert!(h.engine.is_aborted(handle));
    assert!(flow.is_closed());
    assert_eq!(h.stack.stream_count(), 0);
    assert_eq!(h.stack.flow_count(), 0);
    assert_eq!(h.stack.recorder().active_count(), 0);
    assert_eq!(h.stack.state(), StackState::Stopped);

    // New connections are refused
    let late = h.engine.open_stream(addr("10.0.0.3:1"), addr(SERVER));
    h.stack.pump();
    assert!(h.conns.try_recv().is_err());
    assert!(h.engine.is_aborted(late));
    assert!(matches!(
        h.stack.input(Bytes::from_static(b"\x45")),
        Err(StackError::Connection(ConnError::StackClosed))
    ));
}

#[tokio::test]
async fn test_dropped_stack_closes_connections() {
    let mut h = Harness::new();
    let (_, conn) = h.connect(CLIENT, SERVER);
    h.engine
        .deliver_datagram(addr("10.0.0.2:53000"), addr("8.8.8.8:53"), Bytes::from_static(b"q"));
    h.stack.pump();
    let (flow, _) = h.flows.try_recv().unwrap();

    let Harness { stack, .. } = h;
    drop(stack);

    assert!(matches!(conn.write(b"x"), Err(ConnError::StackClosed)));
    assert!(matches!(
        flow.write_from(b"x", addr("8.8.8.8:53")),
        Err(ConnError::StackClosed)
    ));
    conn.abort();
    assert_eq!(conn.phase(), Phase::Aborted);
}

#[tokio::test]
async fn test_builder_errors_are_values() {
    let engine = MemoryEngine::new();
    engine.fail_bind(EngineError::Routing("tun0 missing".into()));

    let err = Stack::builder(engine.clone())
        .stream_handler(|_conn: StreamConnection| -> anyhow::Result<()> { Ok(()) })
        .datagram_handler(NullDatagrams)
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, ConfigError::Bind(_)));
    assert!(!engine.is_bound());

    let err = Stack::builder(engine)
        .stream_handler(|_conn: StreamConnection| -> anyhow::Result<()> { Ok(()) })
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, ConfigError::MissingHandler("datagram")));
}

// ============================================================================
// Output Tests
// ============================================================================

#[tokio::test]
async fn test_output_packets_forwarded() {
    let engine = MemoryEngine::new();
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let (conn_tx, mut conns) = mpsc::unbounded_channel();

    let stack = Stack::builder(engine.clone())
        .config(Harness::quiet_config())
        .stream_handler(move |conn: StreamConnection| -> anyhow::Result<()> {
            conn_tx.send(conn)?;
            Ok(())
        })
        .datagram_handler(NullDatagrams)
        .output(out_tx)
        .build()
        .unwrap();

    engine.open_stream(addr(CLIENT), addr(SERVER));
    stack.pump();
    let conn = conns.try_recv().unwrap();
    conn.write(b"HTTP/1.1 200 OK\r\n").unwrap();

    let packet = out_rx.try_recv().unwrap();
    let info = inspect(&packet).unwrap();
    assert_eq!(info.protocol, Protocol::Tcp);
    assert_eq!(info.src, addr(SERVER));
    assert_eq!(info.dst, addr(CLIENT));
    assert_eq!(info.payload(&packet), b"HTTP/1.1 200 OK\r\n");
    assert_eq!(stack.stats().output_packets, 1);
}

#[tokio::test]
async fn test_full_output_channel_drops() {
    let engine = MemoryEngine::new();
    let (out_tx, _out_rx) = mpsc::channel(1);
    let (conn_tx, mut conns) = mpsc::unbounded_channel();

    let stack = Stack::builder(engine.clone())
        .config(Harness::quiet_config())
        .stream_handler(move |conn: StreamConnection| -> anyhow::Result<()> {
            conn_tx.send(conn)?;
            Ok(())
        })
        .datagram_handler(NullDatagrams)
        .output(out_tx)
        .build()
        .unwrap();

    engine.open_stream(addr(CLIENT), addr(SERVER));
    stack.pump();
    let conn = conns.try_recv().unwrap();
    conn.write(b"one").unwrap();
    conn.write(b"two").unwrap();

    let stats = stack.stats();
    assert_eq!(stats.output_packets, 1);
    assert_eq!(stats.output_dropped, 1);
}
