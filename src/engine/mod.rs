//! Packet engine integration surface
//!
//! The packet engine is a single-threaded, non-reentrant user-space TCP/IP
//! processor. Instead of invoking callbacks from inside its own entry points,
//! an engine queues [`EngineEvent`]s which the stack drains with
//! [`PacketEngine::poll_event`] while it still holds the Stack Lock:
//!
//! ```text
//!   caller ──lock──► engine.input / check_timeouts / tcp_write ...
//!                      │
//!                      ▼ queued events
//!                   poll_event() ──► adapters (state mutex only)
//!   caller ◄─unlock── deferred handler calls run here
//! ```
//!
//! Every method on the trait is only ever called with the Stack Lock held;
//! implementations need no internal synchronization of their own.

pub mod memory;

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::EngineError;

pub use memory::MemoryEngine;

/// Engine-side opaque connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnHandle(pub u64);

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reason an engine tore a connection down on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    /// The peer sent a reset
    Reset,
    /// The engine aborted the connection (retransmission limit, memory)
    Aborted,
}

/// Events queued by the engine for the stack to dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A new inbound stream connection from `src` to `dst`
    Accepted {
        /// New connection handle
        handle: ConnHandle,
        /// TUN-side client address
        src: SocketAddr,
        /// Address the client dialled
        dst: SocketAddr,
    },
    /// In-order payload bytes for a stream
    Received {
        /// Connection handle
        handle: ConnHandle,
        /// Payload
        data: Bytes,
    },
    /// The peer finished sending (FIN)
    PeerClosed {
        /// Connection handle
        handle: ConnHandle,
    },
    /// Previously written bytes were acknowledged; send window reopened
    Sent {
        /// Connection handle
        handle: ConnHandle,
        /// Acknowledged byte count
        len: usize,
    },
    /// Periodic liveness probe for a stream
    Poll {
        /// Connection handle
        handle: ConnHandle,
    },
    /// The engine released the connection; the handle is already invalid
    Errored {
        /// Connection handle
        handle: ConnHandle,
        /// Why it was released
        reason: Teardown,
    },
    /// An inbound datagram
    Datagram {
        /// Client source address
        src: SocketAddr,
        /// Destination address
        dst: SocketAddr,
        /// Payload
        data: Bytes,
    },
    /// A packet the engine wants written to the TUN device
    Output(Bytes),
}

impl EngineEvent {
    /// Stream handle the event refers to, if any
    #[must_use]
    pub fn handle(&self) -> Option<ConnHandle> {
        match self {
            Self::Accepted { handle, .. }
            | Self::Received { handle, .. }
            | Self::PeerClosed { handle }
            | Self::Sent { handle, .. }
            | Self::Poll { handle }
            | Self::Errored { handle, .. } => Some(*handle),
            Self::Datagram { .. } | Self::Output(_) => None,
        }
    }
}

/// A callback-driven, non-reentrant packet engine
///
/// All methods are invoked with the Stack Lock held. Implementations must not
/// block and must not call back into the stack; lifecycle notifications go
/// through the event queue instead.
pub trait PacketEngine: Send {
    /// Bind/listen setup, called once by `StackBuilder::build`
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot start accepting connections.
    fn bind(&mut self) -> Result<(), EngineError>;

    /// Feed one raw IP packet read from the TUN device
    ///
    /// # Errors
    ///
    /// Returns an error if the engine refuses the packet.
    fn input(&mut self, packet: Bytes) -> Result<(), EngineError>;

    /// Timer-processing entry point, called on every scheduler tick
    ///
    /// # Errors
    ///
    /// `EngineError::Fatal` stops the stack; anything else is ignored.
    fn check_timeouts(&mut self) -> Result<(), EngineError>;

    /// Re-arm timers after the process resumes from suspension
    fn restart_timeouts(&mut self);

    /// Take the next queued event
    fn poll_event(&mut self) -> Option<EngineEvent>;

    /// Register the poll interval of a connection, in timer ticks
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidHandle` for unknown handles.
    fn tcp_set_poll_interval(&mut self, handle: ConnHandle, ticks: u8) -> Result<(), EngineError>;

    /// Bytes the engine can currently accept for `handle`
    fn tcp_sndbuf(&self, handle: ConnHandle) -> usize;

    /// Queue bytes for transmission
    ///
    /// # Errors
    ///
    /// `EngineError::OutOfMemory` is transient; other errors are fatal to
    /// the connection.
    fn tcp_write(&mut self, handle: ConnHandle, data: &[u8]) -> Result<(), EngineError>;

    /// Push queued bytes onto the wire
    ///
    /// # Errors
    ///
    /// Same classification as [`tcp_write`](Self::tcp_write).
    fn tcp_output(&mut self, handle: ConnHandle) -> Result<(), EngineError>;

    /// Tell the engine `len` received bytes were consumed (reopens the window)
    fn tcp_recved(&mut self, handle: ConnHandle, len: usize);

    /// Graceful close
    ///
    /// # Errors
    ///
    /// `EngineError::OutOfMemory` means retry later.
    fn tcp_close(&mut self, handle: ConnHandle) -> Result<(), EngineError>;

    /// Forceful close; the handle is invalid afterwards
    fn tcp_abort(&mut self, handle: ConnHandle);

    /// Send a datagram reply from `from` to the client at `to`
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot route or allocate the packet.
    fn udp_send(&mut self, data: &[u8], from: SocketAddr, to: SocketAddr)
        -> Result<(), EngineError>;
}
