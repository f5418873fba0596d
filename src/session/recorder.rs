//! Session recorder
//!
//! Tracks one [`Session`] per live connection or flow and keeps a bounded
//! history of the ones that ended.
//!
//! # Thread Safety
//!
//! Active sessions live in a `DashMap` and their byte counters are atomics,
//! so `update` on the data path takes only a shard read lock. The completed
//! history is a `VecDeque` under a `parking_lot::Mutex`, touched once per
//! connection at finalization and once per report.
//!
//! `finalize` holds the history lock across removal from the active map and
//! the push into history, and `snapshot` holds it while copying both lists,
//! so a snapshot never shows a session as both active and completed.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::addr::Protocol;

/// Default number of completed sessions kept
pub const DEFAULT_MAX_COMPLETED: usize = 50;

/// Unique session identifier (monotonically increasing)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Raw id value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Static description of a new session
#[derive(Debug, Clone)]
pub struct SessionMeta {
    /// Owning process name, empty when unknown
    pub process_name: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// TUN-side client address
    pub local: SocketAddr,
    /// Destination address
    pub remote: SocketAddr,
}

/// A live session
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    meta: SessionMeta,
    started_at: Instant,
    upload: AtomicU64,
    download: AtomicU64,
}

impl Session {
    fn new(id: SessionId, meta: SessionMeta) -> Self {
        Self {
            id,
            meta,
            started_at: Instant::now(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        }
    }

    /// Session id
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Bytes written by the application so far
    #[must_use]
    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    /// Bytes read by the application so far
    #[must_use]
    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    fn snapshot(&self, ended_at: Option<Instant>) -> SessionSnapshot {
        let end = ended_at.unwrap_or_else(Instant::now);
        SessionSnapshot {
            id: self.id,
            process_name: self.meta.process_name.clone(),
            protocol: self.meta.protocol,
            local: self.meta.local,
            remote: self.meta.remote,
            started_at: self.started_at,
            duration: end.saturating_duration_since(self.started_at),
            upload: self.upload(),
            download: self.download(),
            active: ended_at.is_none(),
        }
    }
}

/// Point-in-time copy of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session id
    pub id: SessionId,
    /// Owning process name, empty when unknown
    pub process_name: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// TUN-side client address
    pub local: SocketAddr,
    /// Destination address
    pub remote: SocketAddr,
    /// Start instant
    #[serde(skip)]
    pub started_at: Instant,
    /// Time since start (active) or total lifetime (completed)
    pub duration: Duration,
    /// Bytes written by the application
    pub upload: u64,
    /// Bytes read by the application
    pub download: u64,
    /// False once the session has been finalized
    pub active: bool,
}

/// Both session lists, each sorted by start time
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionsSnapshot {
    /// Live sessions
    pub active: Vec<SessionSnapshot>,
    /// Recently completed sessions, oldest first
    pub completed: Vec<SessionSnapshot>,
}

/// Registry of live sessions plus bounded completed history
#[derive(Debug)]
pub struct SessionRecorder {
    next_id: AtomicU64,
    active: DashMap<SessionId, Arc<Session>>,
    completed: Mutex<VecDeque<SessionSnapshot>>,
    max_completed: usize,
}

impl SessionRecorder {
    /// Create a recorder keeping at most `max_completed` finished sessions
    #[must_use]
    pub fn new(max_completed: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active: DashMap::new(),
            completed: Mutex::new(VecDeque::with_capacity(max_completed)),
            max_completed,
        }
    }

    /// Start tracking a session
    pub fn record(&self, meta: SessionMeta) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        trace!(
            "Session {} started: {} {} -> {}",
            id.0,
            meta.protocol,
            meta.local,
            meta.remote
        );
        self.active.insert(id, Arc::new(Session::new(id, meta)));
        id
    }

    /// Add transferred bytes to a live session
    ///
    /// Returns false if the session is no longer active.
    pub fn update(&self, id: SessionId, upload: u64, download: u64) -> bool {
        let Some(session) = self.active.get(&id) else {
            return false;
        };
        if upload > 0 {
            session.upload.fetch_add(upload, Ordering::Relaxed);
        }
        if download > 0 {
            session.download.fetch_add(download, Ordering::Relaxed);
        }
        true
    }

    /// Move a session to completed history
    ///
    /// Returns true only for the call that actually finalized it.
    pub fn finalize(&self, id: SessionId) -> bool {
        let mut completed = self.completed.lock();
        let Some((_, session)) = self.active.remove(&id) else {
            return false;
        };
        let snapshot = session.snapshot(Some(Instant::now()));
        trace!(
            "Session {} completed: up={} down={} in {:?}",
            id.0,
            snapshot.upload,
            snapshot.download,
            snapshot.duration
        );

        completed.push_back(snapshot);
        while completed.len() > self.max_completed {
            let oldest = completed
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| (s.started_at, s.id))
                .map(|(idx, _)| idx);
            match oldest {
                Some(idx) => {
                    completed.remove(idx);
                }
                None => break,
            }
        }
        true
    }

    /// Look up a live session
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.active.get(&id).map(|s| Arc::clone(s.value()))
    }

    /// Number of live sessions
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of sessions in completed history
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.completed.lock().len()
    }

    /// History capacity
    #[must_use]
    pub const fn max_completed(&self) -> usize {
        self.max_completed
    }

    /// Consistent copy of both lists, sorted by start time
    #[must_use]
    pub fn snapshot(&self) -> SessionsSnapshot {
        let history = self.completed.lock();
        let mut active: Vec<SessionSnapshot> = self
            .active
            .iter()
            .map(|entry| entry.value().snapshot(None))
            .collect();
        let mut completed: Vec<SessionSnapshot> = history.iter().cloned().collect();
        drop(history);

        active.sort_by_key(|s| (s.started_at, s.id));
        completed.sort_by_key(|s| (s.started_at, s.id));

        SessionsSnapshot { active, completed }
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMPLETED)
    }
}
