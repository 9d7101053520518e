//! Change-data-capture engine boundary.
//!
//! An engine captures row changes on its own thread and hands them over in
//! batches through a registered [`ChangeHandler`]. Handles passed to the
//! handler borrow engine-owned memory and are only valid during the call, so
//! the handler has to copy what it needs before returning.
//!
//! The consumer side never talks to an engine directly; it only sees the
//! queue the handler feeds. Any engine can be swapped for a test double that
//! calls the handler with synthetic batches.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod replay;

#[cfg(feature = "kafka")]
pub use kafka::KafkaEngine;
pub use replay::ReplayEngine;

/// A change-event handle owned by the engine
pub trait ChangeEvent {
    fn key(&self) -> Result<Option<&[u8]>>;

    /// `None` marks a tombstone
    fn value(&self) -> Result<Option<&[u8]>>;

    /// Logical destination (topic) the event was emitted for
    fn destination(&self) -> Result<Option<&str>>;
}

/// Callback registered with an engine; invoked on the engine's thread
pub trait ChangeHandler: Send + Sync {
    fn handle_batch(&self, records: &[&dyn ChangeEvent]);
}

/// Lifecycle of a change-data-capture engine
pub trait ChangeEngine: Send {
    /// Start capturing on a background thread and deliver batches to `handler`
    fn start(&mut self, handler: Arc<dyn ChangeHandler>) -> Result<()>;

    /// Ask the engine to stop and wait for its thread to exit
    fn stop(&mut self) -> Result<()>;

    /// Whether the engine thread is still capturing
    fn is_running(&self) -> bool;
}

const MIN_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

/// Consecutive-error tracking for engine threads
#[derive(Debug, Default)]
pub struct EngineErrorState {
    consecutive_count: AtomicU32,
}

impl EngineErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful operation, resetting error count
    pub fn record_success(&self) {
        self.consecutive_count.store(0, Ordering::SeqCst);
    }

    /// Record an error, incrementing consecutive count
    pub fn record_error(&self) -> u32 {
        self.consecutive_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_count.load(Ordering::SeqCst)
    }

    /// Calculate backoff duration based on consecutive errors (exponential with cap)
    pub fn calculate_backoff(&self) -> Duration {
        let errors = self.consecutive_errors();
        if errors == 0 {
            return Duration::from_secs(MIN_BACKOFF_SECS);
        }

        // 2^(errors-1) seconds, capped at MAX_BACKOFF_SECS
        let backoff_secs = 2u64
            .saturating_pow(errors.saturating_sub(1))
            .min(MAX_BACKOFF_SECS);
        Duration::from_secs(backoff_secs)
    }
}

/// Sleep for `total` in short slices, returning early once `keep_going` is false
pub(crate) fn interruptible_sleep(total: Duration, keep_going: impl Fn() -> bool) {
    const SLICE: Duration = Duration::from_millis(100);

    let mut remaining = total;
    while !remaining.is_zero() && keep_going() {
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}
