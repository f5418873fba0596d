//! tunbridge: connection adapters over a user-space packet engine
//!
//! This crate turns the callback-driven, non-reentrant event stream of an
//! embedded TCP/IP packet processor into concurrent byte-stream and datagram
//! connections, tracks a session per connection, and serves a plain-text
//! session report.
//!
//! # Architecture
//!
//! ```text
//! TUN device ─► Stack::input ─► StackLock{ PacketEngine } ─► events
//!                                                           │
//!                  ┌────────────────────────────────────────┤
//!                  ▼                                        ▼
//!          StreamAdapter (tcp)                      DatagramFlow (udp)
//!                  │                                        │
//!                  ▼                                        ▼
//!          StreamHandler                            DatagramHandler
//!                  │                                        │
//!                  └──────────► SessionRecorder ◄───────────┘
//!                                     │
//!                                     ▼
//!                        GET /stats/session/plain
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::SocketAddr;
//!
//! use bytes::Bytes;
//! use tunbridge::{DatagramFlow, DatagramHandler, MemoryEngine, Stack, StreamConnection};
//!
//! struct Echo;
//!
//! impl DatagramHandler for Echo {
//!     fn connect(&self, _flow: &DatagramFlow, _dst: SocketAddr) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     fn receive_to(&self, flow: &DatagramFlow, data: Bytes, dst: SocketAddr) -> anyhow::Result<()> {
//!         flow.write_from(&data, dst)?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stack = Stack::builder(MemoryEngine::new())
//!     .stream_handler(|conn: StreamConnection| -> anyhow::Result<()> {
//!         tokio::spawn(async move {
//!             let mut buf = [0u8; 4096];
//!             while let Ok(n) = conn.read(&mut buf).await {
//!                 if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
//!                     break;
//!                 }
//!             }
//!             let _ = conn.close();
//!         });
//!         Ok(())
//!     })
//!     .datagram_handler(Echo)
//!     .build()?;
//!
//! println!("{}", stack.report());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`addr`]: Endpoints, connection identities and packet inspection
//! - [`config`]: Configuration types and loading
//! - [`engine`]: Packet engine integration surface and the in-memory engine
//! - [`error`]: Error types
//! - [`handler`]: Application handler traits
//! - [`logging`]: Tracing subscriber setup
//! - [`session`]: Session recorder, report and stats endpoint
//! - [`stack`]: Stack lifecycle, locking and dispatch
//! - [`tcp`]: Stream connections
//! - [`udp`]: Datagram flows

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod addr;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod logging;
pub mod session;
pub mod stack;
pub mod tcp;
pub mod udp;

// Re-export commonly used types at the crate root
pub use addr::{Endpoint, FlowId, Protocol, StreamId};
pub use config::Config;
pub use engine::{ConnHandle, EngineEvent, MemoryEngine, PacketEngine, Teardown};
pub use error::{AddressError, ConfigError, ConnError, EngineError, StackError};
pub use handler::{DatagramHandler, ProcessResolver, StreamHandler};
pub use session::{SessionId, SessionRecorder, SessionsSnapshot, StatsServer};
pub use stack::{Stack, StackBuilder, StackState, StatsSnapshot};
pub use tcp::{Phase, StreamConnection};
pub use udp::DatagramFlow;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
