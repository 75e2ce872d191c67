//! Cancellation and Status Propagation
//!
//! The cancel signal shared between the admission wait loop and running
//! analyses, plus the progress channel handed to the unit of work.
//!
//! Cancellation is cooperative. A run is never torn down from the outside; it
//! polls its [`CancelProbe`] at its own checkpoints and returns early.

use std::sync::Arc;

use insight_core::{EventEmitter, ProgressUpdate};
use tokio_util::sync::CancellationToken;

/// Cancel signal kept inside the admission controller's lock.
///
/// `requested` is the user-visible flag. `generation` increments on every
/// request so a run can tell whether a cancel arrived after it started, even
/// when a later admission grant has already cleared the flag.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CancelState {
    requested: bool,
    generation: u64,
}

impl CancelState {
    /// Raise the flag and start a new generation.
    pub fn request(&mut self) -> u64 {
        self.requested = true;
        self.generation += 1;
        self.generation
    }

    /// Reset the flag as part of an admission grant. Returns true when a stale
    /// flag from an earlier cancel was cleared.
    pub fn clear_for_grant(&mut self) -> bool {
        std::mem::replace(&mut self.requested, false)
    }

    /// Whether a cancel was requested after `generation` was observed.
    pub fn cancelled_since(&self, generation: u64) -> bool {
        self.generation > generation
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Cloneable "has this run been cancelled?" callback.
#[derive(Clone)]
pub struct CancelProbe {
    check: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl std::fmt::Debug for CancelProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelProbe")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelProbe {
    pub fn new(check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            check: Arc::new(check),
        }
    }

    /// A probe that never reports cancellation.
    pub fn never() -> Self {
        Self::new(|| false)
    }

    /// Probe backed by a cancellation token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self::new(move || token.is_cancelled())
    }

    pub fn is_cancelled(&self) -> bool {
        (self.check)()
    }
}

impl From<CancellationToken> for CancelProbe {
    fn from(token: CancellationToken) -> Self {
        Self::from_token(token)
    }
}

/// Forwards progress from a running analysis as `analysis-progress` events.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    emitter: EventEmitter,
    session_id: String,
}

impl ProgressReporter {
    pub fn new(emitter: EventEmitter, session_id: impl Into<String>) -> Self {
        Self {
            emitter,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn report(&self, update: ProgressUpdate) {
        tracing::debug!(
            "[Progress] session={} stage={} {}%",
            self.session_id,
            update.stage,
            update.progress
        );
        self.emitter.emit_progress(&self.session_id, update);
    }

    /// Shorthand for a stage update without step or tool details.
    pub fn stage(&self, stage: &str, progress: u8, message: &str) {
        self.report(ProgressUpdate::new(stage, progress, message));
    }
}
