//! In-memory packet engine
//!
//! `MemoryEngine` emulates the peer-facing side of a user-space TCP/IP stack
//! without touching a TUN device. It is deterministic: nothing happens until
//! the stack drains its event queue, and every client action is an explicit
//! call on a clone of the engine:
//!
//! ```text
//!   test / embedder                      Stack
//!   ───────────────                      ─────
//!   engine.open_stream(src, dst) ──┐
//!   engine.deliver(h, b"...")    ──┤ queued events
//!   engine.ack(h, n)             ──┘
//!                                        stack.pump()   ──► adapters
//!   engine.take_written(h)  ◄── tcp_write/tcp_output ◄──── conn.write()
//! ```
//!
//! Raw IPv4/IPv6 packets handed to [`PacketEngine::input`] are parsed with
//! [`crate::addr::packet::inspect`]: a SYN opens a stream, TCP payload is
//! delivered to the matching stream, FIN and RST close it, and UDP becomes a
//! datagram event. Sequence numbers are not interpreted. Packets with a valid
//! IP header that carry anything else (ICMP, fragments, extension headers)
//! are accepted and counted in [`MemoryEngine::ignored_inputs`]; only a
//! broken IP header is refused.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::trace;

use super::{ConnHandle, EngineEvent, PacketEngine, Teardown};
use crate::addr::packet::{self, TcpFlags};
use crate::addr::Protocol;
use crate::error::EngineError;

/// Default per-connection send window
pub const DEFAULT_SEND_WINDOW: usize = 64 * 1024;

/// A datagram sent through [`PacketEngine::udp_send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    /// Address the reply claims to come from
    pub from: SocketAddr,
    /// Client the reply is addressed to
    pub to: SocketAddr,
    /// Payload
    pub data: Bytes,
}

#[derive(Debug)]
struct MemoryConn {
    src: SocketAddr,
    dst: SocketAddr,
    send_window: usize,
    unsent: BytesMut,
    in_flight: usize,
    delivered: BytesMut,
    recved: usize,
    poll_interval: u8,
    ticks: u8,
    closed: bool,
}

impl MemoryConn {
    fn new(src: SocketAddr, dst: SocketAddr, send_window: usize) -> Self {
        Self {
            src,
            dst,
            send_window,
            unsent: BytesMut::new(),
            in_flight: 0,
            delivered: BytesMut::new(),
            recved: 0,
            poll_interval: 0,
            ticks: 0,
            closed: false,
        }
    }
}

#[derive(Debug)]
struct MemoryState {
    next_handle: u64,
    conns: HashMap<ConnHandle, MemoryConn>,
    by_tuple: HashMap<(SocketAddr, SocketAddr), ConnHandle>,
    events: VecDeque<EngineEvent>,
    datagrams: Vec<SentDatagram>,
    aborted: Vec<ConnHandle>,
    bound: bool,
    bind_error: Option<EngineError>,
    timer_error: Option<EngineError>,
    write_error: Option<EngineError>,
    close_error: Option<(EngineError, usize)>,
    send_window: usize,
    auto_ack: bool,
    timer_restarts: usize,
    ignored_inputs: usize,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            next_handle: 1,
            conns: HashMap::new(),
            by_tuple: HashMap::new(),
            events: VecDeque::new(),
            datagrams: Vec::new(),
            aborted: Vec::new(),
            bound: false,
            bind_error: None,
            timer_error: None,
            write_error: None,
            close_error: None,
            send_window: DEFAULT_SEND_WINDOW,
            auto_ack: false,
            timer_restarts: 0,
            ignored_inputs: 0,
        }
    }
}

impl MemoryState {
    fn open(&mut self, src: SocketAddr, dst: SocketAddr) -> ConnHandle {
        let handle = ConnHandle(self.next_handle);
        self.next_handle += 1;
        self.conns
            .insert(handle, MemoryConn::new(src, dst, self.send_window));
        self.by_tuple.insert((src, dst), handle);
        self.events
            .push_back(EngineEvent::Accepted { handle, src, dst });
        handle
    }

    fn release(&mut self, handle: ConnHandle) -> Option<MemoryConn> {
        let conn = self.conns.remove(&handle)?;
        if self.by_tuple.get(&(conn.src, conn.dst)) == Some(&handle) {
            self.by_tuple.remove(&(conn.src, conn.dst));
        }
        Some(conn)
    }

    fn conn_mut(&mut self, handle: ConnHandle) -> Result<&mut MemoryConn, EngineError> {
        self.conns
            .get_mut(&handle)
            .ok_or(EngineError::InvalidHandle(handle))
    }
}

/// Deterministic in-memory [`PacketEngine`]
///
/// Cloning yields another handle to the same engine; one clone is boxed into
/// the stack, the others act as the client side.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryEngine {
    /// Create an engine with the default send window
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine whose new connections start with `window` bytes of
    /// send buffer
    #[must_use]
    pub fn with_send_window(window: usize) -> Self {
        let engine = Self::default();
        engine.state.lock().send_window = window;
        engine
    }

    /// Acknowledge every `tcp_output` immediately (emits `Sent`)
    pub fn set_auto_ack(&self, enabled: bool) {
        self.state.lock().auto_ack = enabled;
    }

    /// Override the send window of one connection
    pub fn set_send_window(&self, handle: ConnHandle, window: usize) {
        if let Some(conn) = self.state.lock().conns.get_mut(&handle) {
            conn.send_window = window;
        }
    }

    /// Make the next `bind` fail
    pub fn fail_bind(&self, error: EngineError) {
        self.state.lock().bind_error = Some(error);
    }

    /// Make every subsequent `check_timeouts` fail
    pub fn fail_timers(&self, error: EngineError) {
        self.state.lock().timer_error = Some(error);
    }

    /// Make every subsequent `tcp_write` fail
    pub fn fail_writes(&self, error: EngineError) {
        self.state.lock().write_error = Some(error);
    }

    /// Make the next `times` calls to `tcp_close` fail
    pub fn fail_close(&self, error: EngineError, times: usize) {
        self.state.lock().close_error = Some((error, times));
    }

    /// Client opens a stream connection
    pub fn open_stream(&self, src: SocketAddr, dst: SocketAddr) -> ConnHandle {
        self.state.lock().open(src, dst)
    }

    /// Client sends payload on a stream
    pub fn deliver(&self, handle: ConnHandle, data: impl Into<Bytes>) {
        self.state.lock().events.push_back(EngineEvent::Received {
            handle,
            data: data.into(),
        });
    }

    /// Client half-closes a stream (FIN)
    pub fn peer_close(&self, handle: ConnHandle) {
        self.state
            .lock()
            .events
            .push_back(EngineEvent::PeerClosed { handle });
    }

    /// Client resets a stream (RST); the engine releases it immediately
    pub fn reset(&self, handle: ConnHandle) {
        let mut state = self.state.lock();
        state.release(handle);
        state.events.push_back(EngineEvent::Errored {
            handle,
            reason: Teardown::Reset,
        });
    }

    /// Client sends a datagram
    pub fn deliver_datagram(&self, src: SocketAddr, dst: SocketAddr, data: impl Into<Bytes>) {
        self.state.lock().events.push_back(EngineEvent::Datagram {
            src,
            dst,
            data: data.into(),
        });
    }

    /// Client acknowledges up to `len` in-flight bytes; returns the count
    /// actually acknowledged
    pub fn ack(&self, handle: ConnHandle, len: usize) -> usize {
        let mut state = self.state.lock();
        let Some(conn) = state.conns.get_mut(&handle) else {
            return 0;
        };
        let len = len.min(conn.in_flight);
        if len == 0 {
            return 0;
        }
        conn.in_flight -= len;
        conn.send_window += len;
        state.events.push_back(EngineEvent::Sent { handle, len });
        len
    }

    /// Drain the bytes that reached the client so far
    #[must_use]
    pub fn take_written(&self, handle: ConnHandle) -> Bytes {
        self.state
            .lock()
            .conns
            .get_mut(&handle)
            .map(|conn| conn.delivered.split().freeze())
            .unwrap_or_default()
    }

    /// Total bytes the stack reported as consumed through `tcp_recved`
    #[must_use]
    pub fn recved(&self, handle: ConnHandle) -> usize {
        self.state
            .lock()
            .conns
            .get(&handle)
            .map_or(0, |conn| conn.recved)
    }

    /// Bytes written by the stack but not yet acknowledged by the client
    #[must_use]
    pub fn in_flight(&self, handle: ConnHandle) -> usize {
        self.state
            .lock()
            .conns
            .get(&handle)
            .map_or(0, |conn| conn.in_flight)
    }

    /// Poll interval registered for a connection
    #[must_use]
    pub fn poll_interval(&self, handle: ConnHandle) -> Option<u8> {
        self.state
            .lock()
            .conns
            .get(&handle)
            .map(|conn| conn.poll_interval)
    }

    /// True once the stack closed the connection gracefully
    #[must_use]
    pub fn is_closed(&self, handle: ConnHandle) -> bool {
        self.state
            .lock()
            .conns
            .get(&handle)
            .is_some_and(|conn| conn.closed)
    }

    /// True once the stack aborted the connection
    #[must_use]
    pub fn is_aborted(&self, handle: ConnHandle) -> bool {
        self.state.lock().aborted.contains(&handle)
    }

    /// Datagrams sent by the stack so far
    #[must_use]
    pub fn sent_datagrams(&self) -> Vec<SentDatagram> {
        self.state.lock().datagrams.clone()
    }

    /// True after a successful `bind`
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.state.lock().bound
    }

    /// Number of `restart_timeouts` calls
    #[must_use]
    pub fn timer_restarts(&self) -> usize {
        self.state.lock().timer_restarts
    }

    /// Input packets accepted but not turned into events
    #[must_use]
    pub fn ignored_inputs(&self) -> usize {
        self.state.lock().ignored_inputs
    }

    /// Number of events not yet drained
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.state.lock().events.len()
    }

    fn input_packet(state: &mut MemoryState, packet: &[u8]) -> Result<(), EngineError> {
        packet::check_ip_header(packet).map_err(|e| EngineError::Other(e.to_string()))?;
        let info = match packet::inspect(packet) {
            Ok(info) => info,
            Err(e) => {
                trace!("Ignoring input packet: {}", e);
                state.ignored_inputs += 1;
                return Ok(());
            }
        };
        let payload = Bytes::copy_from_slice(info.payload(packet));

        match info.protocol {
            Protocol::Udp => {
                state.events.push_back(EngineEvent::Datagram {
                    src: info.src,
                    dst: info.dst,
                    data: payload,
                });
            }
            Protocol::Tcp => {
                if info.flags.is_connection_request() {
                    state.open(info.src, info.dst);
                    return Ok(());
                }

                let Some(&handle) = state.by_tuple.get(&(info.src, info.dst)) else {
                    trace!("Segment for unknown connection {} -> {}", info.src, info.dst);
                    return Ok(());
                };

                if info.flags.rst {
                    state.release(handle);
                    state.events.push_back(EngineEvent::Errored {
                        handle,
                        reason: Teardown::Reset,
                    });
                    return Ok(());
                }
                if !payload.is_empty() {
                    state.events.push_back(EngineEvent::Received {
                        handle,
                        data: payload,
                    });
                }
                if info.flags.fin {
                    state.events.push_back(EngineEvent::PeerClosed { handle });
                }
            }
        }
        Ok(())
    }
}

fn reply_segment(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Option<Bytes> {
    match (src, dst) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
            Some(packet::build_ipv4_tcp(src, dst, TcpFlags::ack(), payload))
        }
        _ => None,
    }
}

impl PacketEngine for MemoryEngine {
    fn bind(&mut self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if let Some(err) = state.bind_error.take() {
            return Err(err);
        }
        state.bound = true;
        Ok(())
    }

    fn input(&mut self, packet: Bytes) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        Self::input_packet(&mut state, &packet)
    }

    fn check_timeouts(&mut self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.timer_error {
            return Err(err.clone());
        }

        let mut due = Vec::new();
        for (handle, conn) in &mut state.conns {
            if conn.closed || conn.poll_interval == 0 {
                continue;
            }
            conn.ticks += 1;
            if conn.ticks >= conn.poll_interval {
                conn.ticks = 0;
                due.push(*handle);
            }
        }
        due.sort();
        state
            .events
            .extend(due.into_iter().map(|handle| EngineEvent::Poll { handle }));
        Ok(())
    }

    fn restart_timeouts(&mut self) {
        let mut state = self.state.lock();
        state.timer_restarts += 1;
        for conn in state.conns.values_mut() {
            conn.ticks = 0;
        }
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.state.lock().events.pop_front()
    }

    fn tcp_set_poll_interval(&mut self, handle: ConnHandle, ticks: u8) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let conn = state.conn_mut(handle)?;
        conn.poll_interval = ticks;
        conn.ticks = 0;
        Ok(())
    }

    fn tcp_sndbuf(&self, handle: ConnHandle) -> usize {
        self.state
            .lock()
            .conns
            .get(&handle)
            .filter(|conn| !conn.closed)
            .map_or(0, |conn| conn.send_window)
    }

    fn tcp_write(&mut self, handle: ConnHandle, data: &[u8]) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.write_error {
            return Err(err.clone());
        }
        let conn = state.conn_mut(handle)?;
        if conn.closed {
            return Err(EngineError::NotConnected);
        }
        if data.len() > conn.send_window {
            return Err(EngineError::OutOfMemory);
        }
        conn.send_window -= data.len();
        conn.unsent.extend_from_slice(data);
        Ok(())
    }

    fn tcp_output(&mut self, handle: ConnHandle) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let auto_ack = state.auto_ack;
        let conn = state.conn_mut(handle)?;
        if conn.unsent.is_empty() {
            return Ok(());
        }

        let chunk = conn.unsent.split().freeze();
        let len = chunk.len();
        conn.delivered.extend_from_slice(&chunk);
        conn.in_flight += len;
        let segment = reply_segment(conn.dst, conn.src, &chunk);
        if auto_ack {
            conn.in_flight -= len;
            conn.send_window += len;
        }

        if let Some(segment) = segment {
            state.events.push_back(EngineEvent::Output(segment));
        }
        if auto_ack {
            state.events.push_back(EngineEvent::Sent { handle, len });
        }
        Ok(())
    }

    fn tcp_recved(&mut self, handle: ConnHandle, len: usize) {
        if let Some(conn) = self.state.lock().conns.get_mut(&handle) {
            conn.recved += len;
        }
    }

    fn tcp_close(&mut self, handle: ConnHandle) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if let Some((err, remaining)) = state.close_error.take() {
            if remaining > 1 {
                state.close_error = Some((err.clone(), remaining - 1));
            }
            return Err(err);
        }
        let conn = state.conn_mut(handle)?;
        conn.closed = true;
        Ok(())
    }

    fn tcp_abort(&mut self, handle: ConnHandle) {
        let mut state = self.state.lock();
        state.release(handle);
        state.aborted.push(handle);
    }

    fn udp_send(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        to: SocketAddr,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.datagrams.push(SentDatagram {
            from,
            to,
            data: Bytes::copy_from_slice(data),
        });
        if let (SocketAddr::V4(from), SocketAddr::V4(to)) = (from, to) {
            state
                .events
                .push_back(EngineEvent::Output(packet::build_ipv4_udp(from, to, data)));
        }
        Ok(())
    }
}
