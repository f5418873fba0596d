//! Session tracking and reporting
//!
//! Every stream connection and datagram flow owns one session from the
//! moment it is registered until its terminal transition. Byte counters
//! follow the application's point of view:
//!
//! - **upload**: bytes the application wrote into the connection or flow
//! - **download**: bytes the application read (received from the client)

mod recorder;
pub mod report;
pub mod server;

pub use recorder::{
    Session, SessionId, SessionMeta, SessionRecorder, SessionSnapshot, SessionsSnapshot,
    DEFAULT_MAX_COMPLETED,
};
pub use report::render_report;
pub use server::StatsServer;
