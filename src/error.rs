//! Error types for tunbridge
//!
//! This module defines the error hierarchy for the connection adapter layer.
//! Errors are grouped by the subsystem that raises them and carry
//! classification helpers so callers can decide whether to retry, abort a
//! single connection, or stop the whole stack.
//!
//! # Error Categories
//!
//! - **Configuration**: raised at startup, never recoverable
//! - **Engine**: raised by the packet engine; only `Fatal` stops the stack
//! - **Connection**: scoped to one stream or flow
//! - **Address**: malformed endpoints or packets

use std::io;

use thiserror::Error;

use crate::engine::ConnHandle;
use crate::tcp::Phase;

/// Top-level error type for tunbridge
#[derive(Debug, Error)]
pub enum StackError {
    /// Configuration errors (file parsing, validation, missing handlers)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors reported by the packet engine
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Per-connection errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnError),

    /// Address or packet parsing errors
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StackError {
    /// Check if this error is recoverable (the stack keeps serving)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Engine(e) => !e.is_fatal(),
            Self::Connection(_) => true,
            Self::Address(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
///
/// All of these abort initialization; a stack is never started in a
/// half-configured state.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// A required connection handler was not registered
    #[error("No {0} handler registered")]
    MissingHandler(&'static str),

    /// The engine refused the bind/listen setup
    #[error("Failed to bind packet engine: {0}")]
    Bind(String),

    /// The stack was built outside of a tokio runtime
    #[error("A tokio runtime is required to start the timeout scheduler")]
    NoRuntime,

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Errors reported by a [`PacketEngine`](crate::engine::PacketEngine)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine could not allocate memory for the operation
    #[error("engine out of memory")]
    OutOfMemory,

    /// The connection handle is not known to the engine
    #[error("invalid connection handle: {0}")]
    InvalidHandle(ConnHandle),

    /// The engine connection is not in a state that allows the operation
    #[error("engine connection not connected")]
    NotConnected,

    /// No route for an outbound datagram or packet
    #[error("no route: {0}")]
    Routing(String),

    /// Unrecoverable engine-internal fault
    #[error("fatal engine fault: {0}")]
    Fatal(String),

    /// Any other engine error
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Returns true if the engine state is corrupt and the stack must stop
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Returns true if the operation may succeed when retried later
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}

/// Errors scoped to a single stream connection or datagram flow
#[derive(Debug, Error)]
pub enum ConnError {
    /// Write or close issued after the connection stopped accepting data
    #[error("connection not writable (state: {phase})")]
    NotWritable { phase: Phase },

    /// The peer reset the connection
    #[error("connection reset by peer")]
    Reset,

    /// The connection was aborted locally (application or shutdown)
    #[error("connection aborted")]
    Aborted,

    /// Pending output did not drain within the poll budget
    #[error("connection aborted: pending output stalled")]
    StalledWriter,

    /// A read deadline expired
    #[error("read timed out")]
    TimedOut,

    /// The owning stack has been shut down
    #[error("stack closed")]
    StackClosed,

    /// An identity was already registered when a new connection arrived
    #[error("duplicate connection identity: {0}")]
    DuplicateIdentity(String),

    /// The application handler refused the connection
    #[error("handler rejected connection: {0}")]
    HandlerRejected(String),

    /// The engine failed the operation
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl ConnError {
    /// Returns true if the connection was terminated by the peer or a fault
    /// rather than by a local decision
    #[must_use]
    pub const fn is_peer_fault(&self) -> bool {
        matches!(self, Self::Reset | Self::StalledWriter)
    }
}

impl From<ConnError> for io::Error {
    fn from(err: ConnError) -> Self {
        let kind = match &err {
            ConnError::NotWritable { .. } => io::ErrorKind::BrokenPipe,
            ConnError::Reset => io::ErrorKind::ConnectionReset,
            ConnError::Aborted | ConnError::StalledWriter | ConnError::StackClosed => {
                io::ErrorKind::ConnectionAborted
            }
            ConnError::TimedOut => io::ErrorKind::TimedOut,
            ConnError::DuplicateIdentity(_) | ConnError::HandlerRejected(_) => {
                io::ErrorKind::ConnectionRefused
            }
            ConnError::Engine(EngineError::OutOfMemory) => io::ErrorKind::OutOfMemory,
            ConnError::Engine(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Address and packet parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The endpoint string is not a valid `ip:port`
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Protocol name is not `tcp` or `udp`
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// The packet is truncated or its headers are inconsistent
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The packet uses an IP version or transport the bridge does not handle
    #[error("unsupported packet: {0}")]
    Unsupported(String),
}

/// A specialized Result type for stack operations
pub type Result<T> = std::result::Result<T, StackError>;
