//! Datagram (UDP) flows
//!
//! A flow is keyed by the client's source endpoint only; every destination
//! that client talks to shares the flow, and each inbound datagram carries
//! its own destination to the handler. Flows have no close handshake: they
//! end on an explicit [`DatagramFlow::close`] or when the idle sweep reclaims
//! them.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::addr::{Endpoint, FlowId, Protocol};
use crate::error::ConnError;
use crate::session::{SessionId, SessionRecorder};
use crate::stack::StackInner;
use crate::tcp::Phase;

struct FlowInner {
    id: FlowId,
    destination: SocketAddr,
    session: SessionId,
    closed: AtomicBool,
    last_active: Mutex<Instant>,
    stack: Weak<StackInner>,
    recorder: Arc<SessionRecorder>,
}

/// Application capability on a datagram flow
///
/// Cheap to clone; all clones refer to the same flow.
#[derive(Clone)]
pub struct DatagramFlow {
    inner: Arc<FlowInner>,
}

impl DatagramFlow {
    pub(crate) fn new(
        id: FlowId,
        destination: SocketAddr,
        session: SessionId,
        stack: Weak<StackInner>,
        recorder: Arc<SessionRecorder>,
    ) -> Self {
        Self {
            inner: Arc::new(FlowInner {
                id,
                destination,
                session,
                closed: AtomicBool::new(false),
                last_active: Mutex::new(Instant::now()),
                stack,
                recorder,
            }),
        }
    }

    /// Send a reply to the client, appearing to come from `from`
    ///
    /// # Errors
    ///
    /// Returns `ConnError::NotWritable` once the flow is closed, or the
    /// engine's error if the datagram cannot be sent.
    pub fn write_from(&self, data: &[u8], from: SocketAddr) -> Result<usize, ConnError> {
        if self.is_closed() {
            return Err(ConnError::NotWritable {
                phase: Phase::Closed,
            });
        }
        let stack = self.inner.stack.upgrade().ok_or(ConnError::StackClosed)?;
        let to = self.inner.id.source;
        stack.with_engine(|engine| engine.udp_send(data, from, to))?;

        trace!("Flow {} sent {} bytes from {}", self.inner.id, data.len(), from);
        self.inner
            .recorder
            .update(self.inner.session, data.len() as u64, 0);
        self.touch();
        Ok(data.len())
    }

    /// Remove the flow and finalize its session; idempotent
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stack) = self.inner.stack.upgrade() {
            stack.forget_flow(&self.inner.id, self.inner.session);
        }
        self.inner.recorder.finalize(self.inner.session);
        debug!("Flow {} closed", self.inner.id);
    }

    /// True after `close`
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Client endpoint the flow is keyed by
    #[must_use]
    pub fn source(&self) -> Endpoint {
        Endpoint::new(Protocol::Udp, self.inner.id.source)
    }

    /// Destination of the datagram that created the flow
    #[must_use]
    pub fn destination(&self) -> Endpoint {
        Endpoint::new(Protocol::Udp, self.inner.destination)
    }

    /// Flow identity
    #[must_use]
    pub fn id(&self) -> FlowId {
        self.inner.id
    }

    /// Session tracking this flow
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.inner.session
    }

    /// Time since the last datagram in either direction
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.inner.last_active.lock().elapsed()
    }

    pub(crate) fn touch(&self) {
        *self.inner.last_active.lock() = Instant::now();
    }

    /// Account an inbound datagram delivered to the application
    pub(crate) fn record_inbound(&self, len: usize) {
        self.inner.recorder.update(self.inner.session, 0, len as u64);
        self.touch();
    }
}

impl fmt::Debug for DatagramFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramFlow")
            .field("id", &self.inner.id)
            .field("destination", &self.inner.destination)
            .field("closed", &self.is_closed())
            .finish()
    }
}
