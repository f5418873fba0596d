//! The Stack Lock
//!
//! A single mutex around the packet engine. Holding the guard is the only way
//! to reach `&mut dyn PacketEngine`, so "inside the engine" and "holding the
//! lock" are the same thing by construction.

use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

use crate::engine::PacketEngine;

/// Mutual exclusion for every entry into the packet engine
pub struct StackLock {
    engine: Mutex<Box<dyn PacketEngine>>,
}

impl StackLock {
    /// Wrap an engine
    pub fn new(engine: Box<dyn PacketEngine>) -> Self {
        Self {
            engine: Mutex::new(engine),
        }
    }

    /// Acquire the lock, blocking until the current holder releases it
    pub fn lock(&self) -> EngineGuard<'_> {
        EngineGuard {
            guard: self.engine.lock(),
        }
    }

    /// True if some thread is inside the engine right now
    pub fn is_locked(&self) -> bool {
        self.engine.is_locked()
    }
}

/// Proof that the Stack Lock is held
pub struct EngineGuard<'a> {
    guard: MutexGuard<'a, Box<dyn PacketEngine>>,
}

impl Deref for EngineGuard<'_> {
    type Target = dyn PacketEngine;

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref()
    }
}

impl DerefMut for EngineGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut()
    }
}
