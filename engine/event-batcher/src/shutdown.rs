// Shutdown state for the batch manager

use std::sync::atomic::{AtomicBool, Ordering};

/// Tracks the one-way shutdown lifecycle: requested -> draining -> completed
#[derive(Debug, Default)]
pub struct ShutdownManager {
    shutdown_requested: AtomicBool,
    drain_started: AtomicBool,
    shutdown_completed: AtomicBool,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark shutdown as requested; returns false if it already was
    pub fn initiate_shutdown(&self) -> bool {
        !self.shutdown_requested.swap(true, Ordering::AcqRel)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub fn start_drain(&self) {
        self.drain_started.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.drain_started.load(Ordering::Acquire)
    }

    pub fn complete_shutdown(&self) {
        self.shutdown_completed.store(true, Ordering::Release);
    }

    pub fn is_shutdown_completed(&self) -> bool {
        self.shutdown_completed.load(Ordering::Acquire)
    }
}
