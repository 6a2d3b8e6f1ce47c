//! Process-wide exclusivity and cooperative stop signalling.
//!
//! [`ProcessState`] is built once per process and shared as an `Arc`. The
//! runner takes the processing slot with [`ProcessState::try_acquire`]; the
//! returned [`ProcessingSlot`] gives the slot back when dropped, whichever way
//! the run ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Coarse view of the process state, for front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    /// No job holds the processing slot.
    Idle,
    /// A job is running.
    Processing,
    /// A job is running and a stop has been requested.
    Stopping,
}

impl std::fmt::Display for ProcessPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Processing => write!(f, "processing"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

#[derive(Debug, Default)]
struct Flags {
    processing: AtomicBool,
    stop_requested: AtomicBool,
}

/// The processing slot plus the stop flag.
#[derive(Debug, Clone, Default)]
pub struct ProcessState {
    flags: Arc<Flags>,
}

impl ProcessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a job currently holds the processing slot.
    ///
    /// There is no blocking wait: callers that need to know when a run
    /// ends poll this.
    pub fn is_processing(&self) -> bool {
        self.flags.processing.load(Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flags.stop_requested.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> ProcessPhase {
        match (self.is_processing(), self.is_stop_requested()) {
            (false, _) => ProcessPhase::Idle,
            (true, false) => ProcessPhase::Processing,
            (true, true) => ProcessPhase::Stopping,
        }
    }

    /// Ask the running job to stop at its next step boundary.
    ///
    /// A step already in flight is never interrupted. The request is
    /// cleared when the slot is next acquired or released.
    pub fn stop(&self) {
        self.flags.stop_requested.store(true, Ordering::SeqCst);
        tracing::info!(processing = self.is_processing(), "Stop requested");
    }

    /// Take the processing slot without waiting.
    ///
    /// Returns `None` if another run holds it.
    pub fn try_acquire(&self) -> Option<ProcessingSlot> {
        self.flags
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.flags.stop_requested.store(false, Ordering::SeqCst);
        Some(ProcessingSlot {
            flags: Arc::clone(&self.flags),
        })
    }

    /// A read-only handle on the stop flag for step executors.
    pub fn stop_signal(&self) -> StopSignal {
        StopSignal {
            flags: Arc::clone(&self.flags),
        }
    }
}

/// Exclusive permission to run a job. Released on drop.
#[derive(Debug)]
pub struct ProcessingSlot {
    flags: Arc<Flags>,
}

impl Drop for ProcessingSlot {
    fn drop(&mut self) {
        self.flags.stop_requested.store(false, Ordering::SeqCst);
        self.flags.processing.store(false, Ordering::SeqCst);
        tracing::debug!("Processing slot released");
    }
}

/// Lets an executor check for a pending stop inside a long step.
#[derive(Debug, Clone)]
pub struct StopSignal {
    flags: Arc<Flags>,
}

impl StopSignal {
    pub fn is_stop_requested(&self) -> bool {
        self.flags.stop_requested.load(Ordering::SeqCst)
    }
}
