//! Stream connection lifecycle
//!
//! ```text
//!   Accepting ──► Established ──► Closing ──► Closed
//!       │              │             │
//!       └──────────────┴─────────────┴──────► Aborted
//! ```

use std::fmt;

use serde::Serialize;

use crate::engine::Teardown;
use crate::error::{ConnError, EngineError};

/// Lifecycle phase of a stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Registered, handler not yet invoked
    Accepting,
    /// Open in both directions
    Established,
    /// Local close requested; pending output is draining
    Closing,
    /// Engine confirmed the close
    Closed,
    /// Torn down without a graceful close
    Aborted,
}

impl Phase {
    /// True for `Closed` and `Aborted`
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }

    /// True if application writes are accepted
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Established)
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepting => "accepting",
            Self::Established => "established",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection ended up `Aborted`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AbortCause {
    /// `abort()` by the application, a handler error or stack shutdown
    Local,
    /// The peer reset the connection
    Reset,
    /// The engine released the connection on its own
    EngineAborted,
    /// Pending output stopped draining
    Stalled,
    /// An engine call failed
    Engine(EngineError),
}

impl AbortCause {
    /// Error reported to readers and writers
    pub(crate) fn to_error(&self) -> ConnError {
        match self {
            Self::Local | Self::EngineAborted => ConnError::Aborted,
            Self::Reset => ConnError::Reset,
            Self::Stalled => ConnError::StalledWriter,
            Self::Engine(e) => ConnError::Engine(e.clone()),
        }
    }
}

impl From<Teardown> for AbortCause {
    fn from(reason: Teardown) -> Self {
        match reason {
            Teardown::Reset => Self::Reset,
            Teardown::Aborted => Self::EngineAborted,
        }
    }
}
