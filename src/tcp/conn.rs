//! Stream connection adapter
//!
//! `StreamAdapter` is the per-connection state machine the stack drives from
//! engine events; `StreamConnection` is the application's capability on it.
//!
//! # Locking
//!
//! The adapter's state mutex is always taken *after* the Stack Lock. Engine
//! side methods receive `&mut dyn PacketEngine` as proof the Stack Lock is
//! held. Application side methods take only the state mutex, and acquire the
//! Stack Lock (with the state released) when they need the engine:
//!
//! ```text
//!   write():  state{queue} ─► unlock ─► StackLock ─► state{flush} ─► unlock
//!   read():   state{copy out} ─► unlock ─► StackLock ─► tcp_recved (if deferred)
//! ```
//!
//! # Backpressure
//!
//! - Output: `write` queues at most `max_pending_write` bytes; the queue is
//!   handed to the engine as `tcp_sndbuf` allows and drained further on
//!   every `Sent` and `Poll` event.
//! - Input: received bytes are acknowledged (`tcp_recved`) while the buffer
//!   holds at most `recv_buffer` bytes; the rest is acknowledged as the
//!   reader drains it.

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace, warn};

use super::state::{AbortCause, Phase};
use crate::addr::{Endpoint, Protocol, StreamId};
use crate::config::TcpConfig;
use crate::engine::{ConnHandle, PacketEngine, Teardown};
use crate::error::{ConnError, EngineError};
use crate::session::{SessionId, SessionRecorder};
use crate::stack::StackInner;

struct StreamState {
    phase: Phase,
    cause: Option<AbortCause>,
    recv: BytesMut,
    /// Buffered bytes not yet acknowledged to the engine
    unacked: usize,
    peer_closed: bool,
    pending: BytesMut,
    progressed: bool,
    stalled_polls: u32,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            phase: Phase::Accepting,
            cause: None,
            recv: BytesMut::new(),
            unacked: 0,
            peer_closed: false,
            pending: BytesMut::new(),
            progressed: false,
            stalled_polls: 0,
            read_waker: None,
            write_waker: None,
        }
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }

    fn wake_all(&mut self) {
        self.wake_reader();
        self.wake_writer();
    }

    /// Recompute the deferred acknowledgement after the buffer changed;
    /// returns the bytes that may be acknowledged now
    fn settle_window(&mut self, limit: usize, added: usize) -> usize {
        let unacked = self.recv.len().saturating_sub(limit);
        let release = (self.unacked + added).saturating_sub(unacked);
        self.unacked = unacked;
        release
    }

    /// Enter `Aborted`; the engine handle must already be released
    fn fail(&mut self, cause: AbortCause) {
        if self.phase.is_terminal() {
            return;
        }
        self.phase = Phase::Aborted;
        self.cause = Some(cause);
        self.recv.clear();
        self.pending.clear();
        self.unacked = 0;
        self.wake_all();
    }
}

/// Per-connection adapter between engine events and the byte-stream API
pub(crate) struct StreamAdapter {
    id: StreamId,
    handle: ConnHandle,
    session: SessionId,
    limits: TcpConfig,
    state: Mutex<StreamState>,
    finalized: AtomicBool,
    stack: Weak<StackInner>,
    recorder: Arc<SessionRecorder>,
}

impl StreamAdapter {
    pub(crate) fn new(
        id: StreamId,
        handle: ConnHandle,
        session: SessionId,
        limits: TcpConfig,
        stack: Weak<StackInner>,
        recorder: Arc<SessionRecorder>,
    ) -> Self {
        Self {
            id,
            handle,
            session,
            limits,
            state: Mutex::new(StreamState::new()),
            finalized: AtomicBool::new(false),
            stack,
            recorder,
        }
    }

    pub(crate) const fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) const fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub(crate) fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    // ------------------------------------------------------------------
    // Engine side (Stack Lock held)
    // ------------------------------------------------------------------

    /// `Accepting` → `Established`
    pub(crate) fn establish(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Accepting {
            state.phase = Phase::Established;
        }
    }

    pub(crate) fn on_received(&self, engine: &mut dyn PacketEngine, data: Bytes) {
        let len = data.len();
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            drop(state);
            trace!("Dropping {} bytes for finished stream {}", len, self.id);
            engine.tcp_recved(self.handle, len);
            return;
        }

        state.recv.extend_from_slice(&data);
        let ack = state.settle_window(self.limits.recv_buffer, len);
        if ack < len {
            trace!(
                "Stream {} receive buffer full, deferring ack of {} bytes",
                self.id,
                len - ack
            );
        }
        state.wake_reader();
        drop(state);

        if ack > 0 {
            engine.tcp_recved(self.handle, ack);
        }
    }

    pub(crate) fn on_peer_closed(&self) {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return;
        }
        debug!("Stream {} closed by peer", self.id);
        state.peer_closed = true;
        state.wake_reader();
    }

    pub(crate) fn on_sent(&self, engine: &mut dyn PacketEngine, len: usize) {
        trace!("Stream {} acknowledged {} bytes", self.id, len);
        self.with_state(|state| {
            if !state.phase.is_terminal() {
                self.drive(engine, state);
            }
        });
    }

    pub(crate) fn on_poll(&self, engine: &mut dyn PacketEngine) {
        self.with_state(|state| {
            if state.phase.is_terminal() {
                return;
            }
            self.drive(engine, state);
            if state.phase.is_terminal() {
                return;
            }

            if state.pending.is_empty() || state.progressed {
                state.stalled_polls = 0;
            } else {
                state.stalled_polls += 1;
                if state.stalled_polls >= self.limits.max_stalled_polls {
                    warn!(
                        "Stream {} made no output progress in {} polls, aborting",
                        self.id, state.stalled_polls
                    );
                    self.abort_with(engine, state, AbortCause::Stalled);
                }
            }
            state.progressed = false;
        });
    }

    /// The engine already released the handle
    pub(crate) fn on_errored(&self, reason: Teardown) {
        debug!("Stream {} torn down by engine: {:?}", self.id, reason);
        self.with_state(|state| state.fail(reason.into()));
    }

    /// Abort from inside a dispatch or shutdown sweep
    pub(crate) fn abort_locked(&self, engine: &mut dyn PacketEngine, cause: AbortCause) {
        self.with_state(|state| self.abort_with(engine, state, cause));
    }

    /// Run `f` on the state, then finish if it left the adapter terminal
    fn with_state<R>(&self, f: impl FnOnce(&mut StreamState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        let terminal = state.phase.is_terminal();
        drop(state);
        if terminal {
            self.finish();
        }
        result
    }

    fn abort_with(&self, engine: &mut dyn PacketEngine, state: &mut StreamState, cause: AbortCause) {
        if state.phase.is_terminal() {
            return;
        }
        debug!("Aborting stream {}: {:?}", self.id, cause);
        engine.tcp_abort(self.handle);
        state.fail(cause);
    }

    /// Flush pending output, then complete a requested close
    fn drive(&self, engine: &mut dyn PacketEngine, state: &mut StreamState) {
        let result = self
            .flush(engine, state)
            .and_then(|()| self.try_close(engine, state));
        if let Err(e) = result {
            self.abort_with(engine, state, AbortCause::Engine(e));
        }
    }

    fn flush(&self, engine: &mut dyn PacketEngine, state: &mut StreamState) -> Result<(), EngineError> {
        let mut handed = 0usize;
        let mut outcome = Ok(());

        while !state.pending.is_empty() {
            let room = engine.tcp_sndbuf(self.handle);
            if room == 0 {
                break;
            }
            let n = room.min(state.pending.len());
            match engine.tcp_write(self.handle, &state.pending[..n]) {
                Ok(()) => {
                    state.pending.advance(n);
                    handed += n;
                }
                Err(e) if e.is_transient() => {
                    trace!("Stream {} write deferred: {}", self.id, e);
                    break;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if handed > 0 {
            state.progressed = true;
            self.recorder.update(self.session, handed as u64, 0);
            state.wake_writer();
            match engine.tcp_output(self.handle) {
                Err(e) if !e.is_transient() && outcome.is_ok() => outcome = Err(e),
                _ => {}
            }
        }
        outcome
    }

    fn try_close(&self, engine: &mut dyn PacketEngine, state: &mut StreamState) -> Result<(), EngineError> {
        if state.phase != Phase::Closing || !state.pending.is_empty() {
            return Ok(());
        }
        match engine.tcp_close(self.handle) {
            Ok(()) => {
                debug!("Stream {} closed", self.id);
                state.phase = Phase::Closed;
                state.wake_all();
                Ok(())
            }
            Err(e) if e.is_transient() => {
                debug!("Stream {} close deferred: {}", self.id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove from the registries and finalize the session, exactly once
    fn finish(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stack) = self.stack.upgrade() {
            stack.forget_stream(&self.id, self.handle);
        }
        self.recorder.finalize(self.session);
        debug!("Stream {} finished", self.id);
    }

    // ------------------------------------------------------------------
    // Application side
    // ------------------------------------------------------------------

    fn poll_read_inner(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, ConnError>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut state = self.state.lock();
        if !state.recv.is_empty() {
            let n = buf.len().min(state.recv.len());
            buf[..n].copy_from_slice(&state.recv[..n]);
            state.recv.advance(n);
            let release = state.settle_window(self.limits.recv_buffer, 0);
            drop(state);

            self.recorder.update(self.session, 0, n as u64);
            if release > 0 {
                self.release_window(release);
            }
            return Poll::Ready(Ok(n));
        }

        match state.phase {
            Phase::Aborted => Poll::Ready(Err(state
                .cause
                .as_ref()
                .map_or(ConnError::Aborted, AbortCause::to_error))),
            Phase::Closing | Phase::Closed => Poll::Ready(Ok(0)),
            _ if state.peer_closed => Poll::Ready(Ok(0)),
            _ => {
                state.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    /// Acknowledge bytes whose acknowledgement was deferred
    fn release_window(&self, len: usize) {
        let Some(stack) = self.stack.upgrade() else {
            return;
        };
        stack.with_engine(|engine| {
            if !self.state.lock().phase.is_terminal() {
                trace!("Stream {} reopening window by {} bytes", self.id, len);
                engine.tcp_recved(self.handle, len);
            }
        });
    }

    fn enqueue(&self, state: &mut StreamState, data: &[u8]) -> usize {
        let room = self.limits.max_pending_write.saturating_sub(state.pending.len());
        let n = room.min(data.len());
        state.pending.extend_from_slice(&data[..n]);
        n
    }

    fn write(&self, data: &[u8]) -> Result<usize, ConnError> {
        let accepted = {
            let mut state = self.state.lock();
            if !state.phase.is_writable() {
                return Err(ConnError::NotWritable { phase: state.phase });
            }
            self.enqueue(&mut state, data)
        };
        if accepted > 0 {
            self.kick()?;
        }
        Ok(accepted)
    }

    fn poll_write_inner(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<Result<usize, ConnError>> {
        let accepted = {
            let mut state = self.state.lock();
            if !state.phase.is_writable() {
                return Poll::Ready(Err(ConnError::NotWritable { phase: state.phase }));
            }
            if data.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let n = self.enqueue(&mut state, data);
            if n == 0 {
                state.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            n
        };
        Poll::Ready(self.kick().map(|()| accepted))
    }

    fn poll_flush_inner(&self, cx: &mut Context<'_>) -> Poll<Result<(), ConnError>> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Aborted => Poll::Ready(Err(state
                .cause
                .as_ref()
                .map_or(ConnError::Aborted, AbortCause::to_error))),
            _ if state.pending.is_empty() => Poll::Ready(Ok(())),
            _ => {
                state.write_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    /// Take the Stack Lock and push queued output (and a pending close)
    fn kick(&self) -> Result<(), ConnError> {
        let stack = self.stack.upgrade().ok_or(ConnError::StackClosed)?;
        stack.with_engine(|engine| {
            self.with_state(|state| {
                if !state.phase.is_terminal() {
                    self.drive(engine, state);
                }
            });
        });
        Ok(())
    }

    fn close(&self) -> Result<(), ConnError> {
        {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Accepting | Phase::Established => {
                    debug!("Closing stream {}", self.id);
                    state.phase = Phase::Closing;
                    state.wake_reader();
                }
                Phase::Closing | Phase::Closed | Phase::Aborted => return Ok(()),
            }
        }
        self.kick()
    }

    fn abort(&self) {
        match self.stack.upgrade() {
            Some(stack) => {
                stack.with_engine(|engine| self.abort_locked(engine, AbortCause::Local));
            }
            None => self.with_state(|state| state.fail(AbortCause::Local)),
        }
    }
}

/// Application capability on an accepted stream connection
///
/// Cheap to clone; all clones refer to the same connection. Implements
/// `tokio::io::AsyncRead` and `AsyncWrite`, with `poll_shutdown` performing
/// a graceful [`close`](Self::close).
#[derive(Clone)]
pub struct StreamConnection {
    adapter: Arc<StreamAdapter>,
}

impl StreamConnection {
    pub(crate) fn new(adapter: Arc<StreamAdapter>) -> Self {
        Self { adapter }
    }

    /// Read available bytes, waiting until at least one arrives
    ///
    /// Returns `Ok(0)` at end of stream (peer or local close, once the
    /// buffer is drained).
    ///
    /// # Errors
    ///
    /// Returns the abort reason once the connection is aborted, or
    /// `ConnError::TimedOut` if the configured read deadline expires.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        let adapter = &self.adapter;
        let fut = poll_fn(|cx| adapter.poll_read_inner(cx, &mut *buf));
        match adapter.limits.read_timeout() {
            Some(deadline) => tokio::time::timeout(deadline, fut)
                .await
                .map_err(|_| ConnError::TimedOut)?,
            None => fut.await,
        }
    }

    /// Queue bytes for transmission without waiting
    ///
    /// Returns the number of bytes accepted, which is 0 when the pending
    /// queue is full.
    ///
    /// # Errors
    ///
    /// Returns `ConnError::NotWritable` unless the connection is established.
    pub fn write(&self, data: &[u8]) -> Result<usize, ConnError> {
        self.adapter.write(data)
    }

    /// Queue all of `data`, waiting for room as needed
    ///
    /// # Errors
    ///
    /// Fails as soon as the connection stops being writable.
    pub async fn write_all(&self, data: &[u8]) -> Result<(), ConnError> {
        let mut offset = 0;
        while offset < data.len() {
            let rest = &data[offset..];
            offset += poll_fn(|cx| self.adapter.poll_write_inner(cx, rest)).await?;
        }
        Ok(())
    }

    /// Graceful close: flush pending output, then close the engine side
    ///
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `ConnError::StackClosed` if the stack is gone.
    pub fn close(&self) -> Result<(), ConnError> {
        self.adapter.close()
    }

    /// Immediate teardown; idempotent
    pub fn abort(&self) {
        self.adapter.abort();
    }

    /// Client side of the connection
    #[must_use]
    pub fn local_endpoint(&self) -> Endpoint {
        self.adapter.id.local_endpoint()
    }

    /// Destination the client dialled
    #[must_use]
    pub fn remote_endpoint(&self) -> Endpoint {
        self.adapter.id.remote_endpoint()
    }

    /// Always `Protocol::Tcp`
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.adapter.phase()
    }

    /// Connection identity
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.adapter.id()
    }

    /// Engine handle
    #[must_use]
    pub fn handle(&self) -> ConnHandle {
        self.adapter.handle()
    }

    /// Session tracking this connection
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.adapter.session
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.adapter.id)
            .field("handle", &self.adapter.handle)
            .field("phase", &self.phase())
            .finish()
    }
}

impl AsyncRead for StreamConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let dst = buf.initialize_unfilled();
        match self.adapter.poll_read_inner(cx, dst) {
            Poll::Ready(Ok(n)) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for StreamConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.adapter.poll_write_inner(cx, buf).map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.adapter.poll_flush_inner(cx).map_err(Into::into)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.adapter.close().map_err(Into::into))
    }
}
