//! Application-side handlers
//!
//! The stack hands every accepted stream and every new datagram flow to the
//! handlers registered on [`StackBuilder`](crate::stack::StackBuilder). They
//! are invoked after the Stack Lock is released, so they may read, write or
//! close the connection synchronously; long-running work belongs in a
//! spawned task.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::tcp::StreamConnection;
use crate::udp::DatagramFlow;

/// Receives accepted stream connections
pub trait StreamHandler: Send + Sync {
    /// Take ownership of a new connection
    ///
    /// # Errors
    ///
    /// An error aborts the connection.
    fn handle(&self, conn: StreamConnection) -> anyhow::Result<()>;
}

impl<F> StreamHandler for F
where
    F: Fn(StreamConnection) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, conn: StreamConnection) -> anyhow::Result<()> {
        self(conn)
    }
}

/// Receives datagram flows and their payloads
pub trait DatagramHandler: Send + Sync {
    /// A new flow was created by its first datagram to `dst`
    ///
    /// # Errors
    ///
    /// An error closes the flow before any payload is delivered.
    fn connect(&self, flow: &DatagramFlow, dst: SocketAddr) -> anyhow::Result<()>;

    /// A datagram for `dst` arrived on `flow`
    ///
    /// # Errors
    ///
    /// Errors are logged; the flow stays open.
    fn receive_to(&self, flow: &DatagramFlow, data: Bytes, dst: SocketAddr) -> anyhow::Result<()>;
}

/// Best-effort lookup of the process owning a local socket
pub trait ProcessResolver: Send + Sync {
    /// Process name for a connection, if it can be determined
    fn process_name(&self, local: SocketAddr, remote: SocketAddr) -> Option<String>;
}

impl<F> ProcessResolver for F
where
    F: Fn(SocketAddr, SocketAddr) -> Option<String> + Send + Sync,
{
    fn process_name(&self, local: SocketAddr, remote: SocketAddr) -> Option<String> {
        self(local, remote)
    }
}
