//! Stream (TCP) connections
//!
//! Each connection accepted by the engine gets a [`StreamConnection`]: a
//! byte-stream capability with `read`/`write`/`close` semantics backed by
//! the adapter state machine in [`conn`].

mod conn;
mod state;

pub use conn::StreamConnection;
pub use state::Phase;

pub(crate) use conn::StreamAdapter;
pub(crate) use state::AbortCause;
