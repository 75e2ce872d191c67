//! Admission Controller
//!
//! Bounded-concurrency gate in front of every analysis run. A caller either
//! gets a slot immediately or waits in a polling loop that reports its queue
//! position, gives up after a bounded wait, and exits early when a cancel is
//! requested.
//!
//! Admission is capacity-based rather than FIFO: waiters poll independently and
//! the first to see free capacity takes it. The capacity check and the slot
//! registration happen in one critical section, so concurrent callers can
//! never push the active count past the limit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use insight_core::{EventEmitter, QueueStatus, QueueStatusEvent};
use serde::{Deserialize, Serialize};

use crate::models::settings::{effective_max_concurrent, AnalysisConfig};
use crate::services::analysis::cancellation::{CancelProbe, CancelState};
use crate::utils::error::{AppError, AppResult};

// ============================================================================
// Configuration
// ============================================================================

/// Controller-wide settings.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Configured limit; clamped by [`effective_max_concurrent`]
    pub max_concurrent: usize,
    /// How long `request_cancel` waits before force-clearing slots
    pub cancel_wait: Duration,
    pub cancel_check_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::from(&AnalysisConfig::default())
    }
}

impl From<&AnalysisConfig> for AdmissionConfig {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_analysis,
            cancel_wait: config.cancel_wait(),
            cancel_check_interval: config.cancel_check_interval(),
        }
    }
}

/// Per-call settings for [`AdmissionController::enter`].
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub max_wait: Duration,
    pub poll_interval: Duration,
    /// Cadence of repeated `waiting` status events
    pub status_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::from(&AnalysisConfig::default())
    }
}

impl From<&AnalysisConfig> for WaitOptions {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            max_wait: config.queue_max_wait(),
            poll_interval: config.queue_poll_interval(),
            status_interval: config.queue_status_interval(),
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Outcome of a non-blocking admission attempt.
#[derive(Debug)]
pub enum TryEnter {
    Granted(SlotGuard),
    MustWait { active: usize, max: usize },
}

impl TryEnter {
    pub fn is_granted(&self) -> bool {
        matches!(self, TryEnter::Granted(_))
    }

    pub fn into_guard(self) -> Option<SlotGuard> {
        match self {
            TryEnter::Granted(guard) => Some(guard),
            TryEnter::MustWait { .. } => None,
        }
    }
}

/// Answer to "could a new analysis start right now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityCheck {
    pub allowed: bool,
    pub active: usize,
    pub max: usize,
    /// Empty when allowed
    pub message: String,
}

#[derive(Debug)]
struct ActiveSlot {
    token: u64,
    since: Instant,
}

#[derive(Debug)]
struct AdmissionState {
    /// Effective limit, already clamped
    max_concurrent: usize,
    cancel_wait: Duration,
    cancel_check_interval: Duration,
    active: HashMap<String, ActiveSlot>,
    /// Force-cleared slots whose runs have not returned yet, keyed by session.
    /// They no longer count against the limit, but their session stays closed
    /// until the old guard drops.
    draining: HashMap<String, u64>,
    /// Tickets of callers parked in `enter`, oldest first
    waiting: Vec<u64>,
    cancel: CancelState,
    next_token: u64,
}

impl AdmissionState {
    fn new(config: &AdmissionConfig) -> Self {
        Self {
            max_concurrent: effective_max_concurrent(config.max_concurrent),
            cancel_wait: config.cancel_wait,
            cancel_check_interval: config.cancel_check_interval,
            active: HashMap::new(),
            draining: HashMap::new(),
            waiting: Vec::new(),
            cancel: CancelState::default(),
            next_token: 0,
        }
    }

    /// A session holds at most one slot; a second request for a running or
    /// draining session waits until the first one leaves.
    fn has_capacity(&self, session_id: &str) -> bool {
        self.active.len() < self.max_concurrent
            && !self.active.contains_key(session_id)
            && !self.draining.contains_key(session_id)
    }

    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn position(&self, ticket: u64) -> Option<usize> {
        self.waiting.iter().position(|t| *t == ticket).map(|i| i + 1)
    }
}

struct Inner {
    emitter: EventEmitter,
    state: Mutex<AdmissionState>,
}

// ============================================================================
// Controller
// ============================================================================

/// Concurrency-limited admission queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("max_concurrent", &self.max_concurrent())
            .field("active", &self.active_count())
            .finish()
    }
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, emitter: EventEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                emitter,
                state: Mutex::new(AdmissionState::new(&config)),
            }),
        }
    }

    /// Apply new limits to the live controller.
    ///
    /// Running slots are never revoked. Lowering the limit only holds back new
    /// grants until enough runs have left; waiters pick up the new limit on
    /// their next poll.
    pub fn reconfigure(&self, config: &AdmissionConfig) {
        let mut state = self.lock();
        let previous = state.max_concurrent;
        state.max_concurrent = effective_max_concurrent(config.max_concurrent);
        state.cancel_wait = config.cancel_wait;
        state.cancel_check_interval = config.cancel_check_interval;
        if previous != state.max_concurrent {
            tracing::info!(
                "[Admission] Max concurrent analyses changed from {} to {} ({} running)",
                previous,
                state.max_concurrent,
                state.active.len()
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `session_id` as active. Clearing a stale cancel flag is part of
    /// the same transaction.
    fn grant(&self, state: &mut AdmissionState, session_id: &str) -> SlotGuard {
        let token = state.next_token();
        if state.cancel.clear_for_grant() {
            tracing::debug!(
                "[Admission] Cleared stale cancel flag while granting session {}",
                session_id
            );
        }
        state.active.insert(
            session_id.to_string(),
            ActiveSlot {
                token,
                since: Instant::now(),
            },
        );
        SlotGuard {
            controller: self.clone(),
            session_id: session_id.to_string(),
            token,
            generation: state.cancel.generation(),
            released: false,
        }
    }

    /// Non-blocking admission attempt.
    pub fn try_enter(&self, session_id: &str) -> TryEnter {
        let mut state = self.lock();
        let max = state.max_concurrent;
        if state.has_capacity(session_id) {
            let guard = self.grant(&mut state, session_id);
            tracing::debug!(
                "[Admission] Granted session {} ({}/{} running)",
                session_id,
                state.active.len(),
                max
            );
            TryEnter::Granted(guard)
        } else {
            TryEnter::MustWait {
                active: state.active.len(),
                max,
            }
        }
    }

    /// Wait for a slot.
    ///
    /// Grants immediately when capacity is free. Otherwise emits a `waiting`
    /// queue status, then re-checks every `poll_interval`. Each poll checks, in
    /// order: a cancel requested since the wait began, free capacity, and the
    /// wait deadline.
    pub async fn enter(&self, session_id: &str, options: &WaitOptions) -> AppResult<SlotGuard> {
        let started = Instant::now();

        let (ticket, start_generation, position, active, max) = {
            let mut state = self.lock();
            if state.has_capacity(session_id) {
                return Ok(self.grant(&mut state, session_id));
            }
            let ticket = state.next_token();
            state.waiting.push(ticket);
            (
                ticket,
                state.cancel.generation(),
                state.waiting.len(),
                state.active.len(),
                state.max_concurrent,
            )
        };
        let _waiter = WaiterTicket {
            controller: self,
            ticket,
        };

        tracing::info!(
            "[Admission] Session {} waiting for a slot ({}/{} running, position {})",
            session_id,
            active,
            max,
            position
        );
        self.inner.emitter.emit_chat_loading(session_id, true);
        self.emit_status(
            session_id,
            QueueStatus::Waiting,
            format!(
                "Waiting in analysis queue... ({}/{} tasks in progress)",
                active, max
            ),
            Some(position),
            active,
            Duration::ZERO,
        );
        let mut last_status = Instant::now();

        loop {
            tokio::time::sleep(options.poll_interval).await;

            let step = {
                let mut state = self.lock();
                let active = state.active.len();
                if state.cancel.cancelled_since(start_generation) {
                    WaitStep::Cancelled { active }
                } else if state.has_capacity(session_id) {
                    state.waiting.retain(|t| *t != ticket);
                    let guard = self.grant(&mut state, session_id);
                    WaitStep::Granted {
                        guard,
                        active: state.active.len(),
                    }
                } else if started.elapsed() >= options.max_wait {
                    WaitStep::TimedOut { active }
                } else {
                    WaitStep::Waiting {
                        active,
                        max: state.max_concurrent,
                        position: state.position(ticket),
                    }
                }
            };

            let waited = started.elapsed();
            match step {
                WaitStep::Granted { guard, active } => {
                    tracing::info!(
                        "[Admission] Slot available after {:?}, starting session {}",
                        waited,
                        session_id
                    );
                    self.emit_status(
                        session_id,
                        QueueStatus::Starting,
                        "Starting analysis".to_string(),
                        None,
                        active,
                        waited,
                    );
                    return Ok(guard);
                }
                WaitStep::Cancelled { active } => {
                    tracing::info!(
                        "[Admission] Cancel requested while session {} was waiting",
                        session_id
                    );
                    self.inner.emitter.emit_chat_loading(session_id, false);
                    self.emit_status(
                        session_id,
                        QueueStatus::Cancelled,
                        "Analysis cancelled while waiting in queue".to_string(),
                        None,
                        active,
                        waited,
                    );
                    return Err(AppError::AdmissionCancelled);
                }
                WaitStep::TimedOut { active } => {
                    tracing::warn!(
                        "[Admission] Session {} timed out after {:?} waiting for a slot",
                        session_id,
                        waited
                    );
                    self.inner.emitter.emit_chat_loading(session_id, false);
                    self.emit_status(
                        session_id,
                        QueueStatus::Timeout,
                        format!(
                            "Timeout waiting for analysis queue (waited {}s). There are currently {} analysis tasks in progress. Please try again later.",
                            waited.as_secs(),
                            active
                        ),
                        None,
                        active,
                        waited,
                    );
                    return Err(AppError::AdmissionTimeout {
                        waited_secs: waited.as_secs(),
                        active,
                    });
                }
                WaitStep::Waiting {
                    active,
                    max,
                    position,
                } => {
                    if last_status.elapsed() >= options.status_interval {
                        last_status = Instant::now();
                        self.emit_status(
                            session_id,
                            QueueStatus::Waiting,
                            format!(
                                "Waiting in analysis queue... (waited {}s, {}/{} tasks in progress)",
                                waited.as_secs(),
                                active,
                                max
                            ),
                            position,
                            active,
                            waited,
                        );
                    }
                }
            }
        }
    }

    /// Remove `session_id` from the active set regardless of who registered it.
    pub fn leave(&self, session_id: &str) -> bool {
        let mut state = self.lock();
        let drained = state.draining.remove(session_id).is_some();
        let removed = state.active.remove(session_id).is_some() || drained;
        drop(state);
        if removed {
            tracing::debug!("[Admission] Session {} left", session_id);
        }
        removed
    }

    /// Release a slot only if it is still the one identified by `token`.
    fn release_token(&self, session_id: &str, token: u64) {
        let mut state = self.lock();
        let matches = state
            .active
            .get(session_id)
            .is_some_and(|slot| slot.token == token);
        if matches {
            state.active.remove(session_id);
            tracing::debug!(
                "[Admission] Released session {} ({} still running)",
                session_id,
                state.active.len()
            );
        } else if state.draining.get(session_id) == Some(&token) {
            state.draining.remove(session_id);
            tracing::info!(
                "[Admission] Force-cleared run of session {} has returned; session reopened",
                session_id
            );
        }
    }

    /// Ask every running analysis to stop and wait for their slots to drain.
    ///
    /// Slots that are still held after `cancel_wait` are force-cleared: they
    /// stop counting against the limit, but their session is not admitted
    /// again until the stuck run returns. Slots granted after the request are
    /// left alone.
    pub async fn request_cancel(&self) -> AppResult<()> {
        let (targets, cancel_wait, check_interval) = {
            let mut state = self.lock();
            if state.active.is_empty() {
                return Err(AppError::NothingRunning);
            }
            state.cancel.request();
            let targets: Vec<(String, u64)> = state
                .active
                .iter()
                .map(|(session, slot)| (session.clone(), slot.token))
                .collect();
            (targets, state.cancel_wait, state.cancel_check_interval)
        };
        tracing::info!(
            "[Admission] Cancel requested for {} running analysis(es)",
            targets.len()
        );

        let started = Instant::now();
        loop {
            if !self.any_still_held(&targets) {
                tracing::info!("[Admission] Analyses stopped after {:?}", started.elapsed());
                return Ok(());
            }
            if started.elapsed() >= cancel_wait {
                break;
            }
            tokio::time::sleep(check_interval).await;
        }

        let forced: Vec<(String, Duration)> = {
            let mut state = self.lock();
            targets
                .iter()
                .filter_map(|(session, token)| {
                    let held = state
                        .active
                        .get(session)
                        .is_some_and(|slot| slot.token == *token);
                    if held {
                        let slot = state.active.remove(session)?;
                        state.draining.insert(session.clone(), slot.token);
                        Some((session.clone(), slot.since.elapsed()))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (session, held_for) in &forced {
            tracing::warn!(
                "[Admission] Force-cleared session {} after cancel timeout (held for {:?})",
                session,
                held_for
            );
        }
        Ok(())
    }

    fn any_still_held(&self, targets: &[(String, u64)]) -> bool {
        let state = self.lock();
        targets.iter().any(|(session, token)| {
            state
                .active
                .get(session)
                .is_some_and(|slot| slot.token == *token)
        })
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.lock().cancel.is_requested()
    }

    /// Probe reporting any cancel requested from now on.
    pub fn cancel_probe(&self) -> CancelProbe {
        let generation = self.lock().cancel.generation();
        self.probe_since(generation)
    }

    fn probe_since(&self, generation: u64) -> CancelProbe {
        let controller = self.clone();
        CancelProbe::new(move || controller.lock().cancel.cancelled_since(generation))
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn has_active(&self) -> bool {
        !self.lock().active.is_empty()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.lock().active.contains_key(session_id)
    }

    /// Whether a force-cleared run of `session_id` is still executing.
    pub fn is_draining(&self, session_id: &str) -> bool {
        self.lock().draining.contains_key(session_id)
    }

    /// Sessions currently holding a slot, sorted.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self.lock().active.keys().cloned().collect();
        sessions.sort();
        sessions
    }

    /// Effective limit after clamping.
    pub fn max_concurrent(&self) -> usize {
        self.lock().max_concurrent
    }

    pub fn can_admit(&self) -> CapacityCheck {
        let (active, max) = {
            let state = self.lock();
            (state.active.len(), state.max_concurrent)
        };
        if active < max {
            CapacityCheck {
                allowed: true,
                active,
                max,
                message: String::new(),
            }
        } else {
            CapacityCheck {
                allowed: false,
                active,
                max,
                message: format!(
                    "There are currently {} analysis sessions in progress (max concurrent: {}). \
                     Please wait for some analyses to complete before starting a new analysis, \
                     or increase the max concurrent analysis limit in settings.",
                    active, max
                ),
            }
        }
    }

    fn emit_status(
        &self,
        session_id: &str,
        status: QueueStatus,
        message: String,
        position: Option<usize>,
        active_count: usize,
        waited: Duration,
    ) {
        let max_concurrent = self.max_concurrent();
        self.inner.emitter.emit_queue_status(&QueueStatusEvent {
            thread_id: session_id.to_string(),
            status,
            message,
            position,
            active_count,
            max_concurrent,
            waited_secs: waited.as_secs(),
        });
    }
}

enum WaitStep {
    Granted { guard: SlotGuard, active: usize },
    Cancelled { active: usize },
    TimedOut { active: usize },
    Waiting {
        active: usize,
        max: usize,
        position: Option<usize>,
    },
}

/// Removes a waiter from the queue however `enter` exits, including when its
/// future is dropped.
struct WaiterTicket<'a> {
    controller: &'a AdmissionController,
    ticket: u64,
}

impl Drop for WaiterTicket<'_> {
    fn drop(&mut self) {
        let ticket = self.ticket;
        self.controller.lock().waiting.retain(|t| *t != ticket);
    }
}

// ============================================================================
// Slot guard
// ============================================================================

/// Held for the lifetime of one admitted analysis. Dropping it releases the
/// slot, so the release runs on every exit path including unwinding.
#[derive(Debug)]
pub struct SlotGuard {
    controller: AdmissionController,
    session_id: String,
    token: u64,
    generation: u64,
    released: bool,
}

impl SlotGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Probe that reports cancels requested after this slot was granted.
    pub fn cancel_probe(&self) -> CancelProbe {
        self.controller.probe_since(self.generation)
    }

    pub fn is_cancelled(&self) -> bool {
        self.controller.lock().cancel.cancelled_since(self.generation)
    }

    /// Release the slot now instead of at drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.controller.release_token(&self.session_id, self.token);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insight_core::{channels, MemoryEventSink};

    fn controller(max: usize) -> (AdmissionController, Arc<MemoryEventSink>) {
        let sink = Arc::new(MemoryEventSink::new());
        let config = AdmissionConfig {
            max_concurrent: max,
            cancel_wait: Duration::from_millis(300),
            cancel_check_interval: Duration::from_millis(10),
        };
        (
            AdmissionController::new(config, EventEmitter::new(sink.clone())),
            sink,
        )
    }

    fn fast_wait() -> WaitOptions {
        WaitOptions {
            max_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            status_interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_max_concurrent_is_clamped() {
        assert_eq!(controller(0).0.max_concurrent(), 5);
        assert_eq!(controller(3).0.max_concurrent(), 3);
        assert_eq!(controller(50).0.max_concurrent(), 10);
    }

    #[test]
    fn test_try_enter_respects_limit() {
        let (admission, _) = controller(2);
        let a = admission.try_enter("a").into_guard().unwrap();
        let _b = admission.try_enter("b").into_guard().unwrap();

        match admission.try_enter("c") {
            TryEnter::MustWait { active, max } => {
                assert_eq!(active, 2);
                assert_eq!(max, 2);
            }
            TryEnter::Granted(_) => panic!("admitted past the limit"),
        }

        drop(a);
        assert!(admission.try_enter("c").is_granted());
    }

    #[test]
    fn test_same_session_holds_one_slot() {
        let (admission, _) = controller(3);
        let _first = admission.try_enter("a").into_guard().unwrap();
        assert!(!admission.try_enter("a").is_granted());
        assert_eq!(admission.active_count(), 1);
    }

    #[test]
    fn test_guard_release_and_leave() {
        let (admission, _) = controller(2);
        let guard = admission.try_enter("a").into_guard().unwrap();
        assert!(admission.is_active("a"));
        guard.release();
        assert!(!admission.is_active("a"));

        let _guard = admission.try_enter("b").into_guard().unwrap();
        assert!(admission.leave("b"));
        assert!(!admission.leave("b"));
        assert_eq!(admission.active_count(), 0);
    }

    #[test]
    fn test_stale_guard_does_not_release_new_slot() {
        let (admission, _) = controller(2);
        let stale = admission.try_enter("a").into_guard().unwrap();
        admission.leave("a");
        let _fresh = admission.try_enter("a").into_guard().unwrap();

        drop(stale);
        assert!(admission.is_active("a"));
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let (admission, _) = controller(1);
        let cloned = admission.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_enter("a").into_guard().unwrap();
            panic!("analysis blew up");
        }));
        assert!(result.is_err());
        assert_eq!(admission.active_count(), 0);
    }

    #[test]
    fn test_can_admit_message() {
        let (admission, _) = controller(1);
        let check = admission.can_admit();
        assert!(check.allowed);
        assert!(check.message.is_empty());

        let _guard = admission.try_enter("a").into_guard().unwrap();
        let check = admission.can_admit();
        assert!(!check.allowed);
        assert_eq!(check.active, 1);
        assert!(check.message.contains("max concurrent: 1"));
    }

    #[tokio::test]
    async fn test_enter_grants_immediately_without_events() {
        let (admission, sink) = controller(2);
        let guard = admission.enter("a", &fast_wait()).await.unwrap();
        assert_eq!(guard.session_id(), "a");
        assert_eq!(sink.count(channels::QUEUE_STATUS), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enter_waits_then_starts() {
        let (admission, sink) = controller(1);
        let holder = admission.try_enter("a").into_guard().unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.enter("b", &fast_wait()).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(admission.waiting_count(), 1);
        drop(holder);

        let guard = waiter.await.unwrap().unwrap();
        assert_eq!(guard.session_id(), "b");
        assert_eq!(admission.waiting_count(), 0);

        let statuses = sink.payloads(channels::QUEUE_STATUS);
        assert_eq!(statuses.first().unwrap()["status"], "waiting");
        assert_eq!(statuses.first().unwrap()["position"], 1);
        assert_eq!(statuses.last().unwrap()["status"], "starting");
        assert_eq!(sink.payloads(channels::CHAT_LOADING)[0]["loading"], true);
    }

    #[tokio::test]
    async fn test_enter_times_out() {
        let (admission, sink) = controller(1);
        let _holder = admission.try_enter("a").into_guard().unwrap();

        let options = WaitOptions {
            max_wait: Duration::from_millis(60),
            poll_interval: Duration::from_millis(10),
            status_interval: Duration::from_secs(5),
        };
        let err = admission.enter("b", &options).await.unwrap_err();
        assert!(matches!(err, AppError::AdmissionTimeout { active: 1, .. }));
        assert_eq!(admission.waiting_count(), 0);

        let last = sink.payloads(channels::QUEUE_STATUS).pop().unwrap();
        assert_eq!(last["status"], "timeout");
        let loading = sink.payloads(channels::CHAT_LOADING);
        assert_eq!(loading.last().unwrap()["loading"], false);
    }

    #[tokio::test]
    async fn test_waiting_status_repeats() {
        let (admission, sink) = controller(1);
        let _holder = admission.try_enter("a").into_guard().unwrap();

        let options = WaitOptions {
            max_wait: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            status_interval: Duration::from_millis(50),
        };
        let _ = admission.enter("b", &options).await;

        let waiting = sink
            .payloads(channels::QUEUE_STATUS)
            .into_iter()
            .filter(|p| p["status"] == "waiting")
            .count();
        assert!(waiting >= 3, "expected repeated waiting events, got {}", waiting);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_while_waiting() {
        let (admission, sink) = controller(1);
        let holder = admission.try_enter("a").into_guard().unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.enter("b", &fast_wait()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let canceller = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.request_cancel().await })
        };

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::AdmissionCancelled));

        drop(holder);
        canceller.await.unwrap().unwrap();
        assert_eq!(admission.active_count(), 0);
        let last = sink.payloads(channels::QUEUE_STATUS).pop().unwrap();
        assert_eq!(last["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_request_cancel_with_nothing_running() {
        let (admission, _) = controller(2);
        let err = admission.request_cancel().await.unwrap_err();
        assert!(matches!(err, AppError::NothingRunning));
        assert!(!admission.is_cancel_requested());
    }

    #[tokio::test]
    async fn test_request_cancel_force_clears_stuck_slots() {
        let (admission, _) = controller(3);
        let stuck_a = admission.try_enter("a").into_guard().unwrap();
        let stuck_b = admission.try_enter("b").into_guard().unwrap();
        let probe = stuck_a.cancel_probe();

        let started = Instant::now();
        admission.request_cancel().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(admission.active_count(), 0);
        assert!(admission.is_cancel_requested());
        assert!(probe.is_cancelled());
        assert!(stuck_b.is_cancelled());
    }

    #[tokio::test]
    async fn test_force_cleared_session_stays_closed_until_run_returns() {
        let (admission, _) = controller(2);
        let stuck = admission.try_enter("a").into_guard().unwrap();
        admission.request_cancel().await.unwrap();

        assert_eq!(admission.active_count(), 0);
        assert!(admission.is_draining("a"));
        // Other sessions get the freed capacity, the stuck session does not.
        assert!(!admission.try_enter("a").is_granted());
        let other = admission.try_enter("b").into_guard().unwrap();

        drop(stuck);
        assert!(!admission.is_draining("a"));
        let fresh = admission.try_enter("a").into_guard().unwrap();
        assert_eq!(admission.active_sessions(), vec!["a".to_string(), "b".to_string()]);

        drop(other);
        drop(fresh);
        assert_eq!(admission.active_count(), 0);
    }

    #[tokio::test]
    async fn test_waiter_for_draining_session_starts_after_old_run() {
        let (admission, _) = controller(3);
        let stuck = admission.try_enter("a").into_guard().unwrap();
        admission.request_cancel().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.enter("a", &fast_wait()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert!(!admission.is_active("a"));

        drop(stuck);
        let guard = waiter.await.unwrap().unwrap();
        assert!(admission.is_active("a"));
        assert!(!guard.is_cancelled());
    }

    #[test]
    fn test_leave_reopens_draining_session() {
        let (admission, _) = controller(2);
        let guard = admission.try_enter("a").into_guard().unwrap();
        admission.lock().active.remove("a");
        admission.lock().draining.insert("a".to_string(), guard.token);

        assert!(admission.leave("a"));
        assert!(!admission.is_draining("a"));
        assert!(admission.try_enter("a").is_granted());
    }

    #[tokio::test]
    async fn test_reconfigure_applies_to_live_controller() {
        let (admission, sink) = controller(3);
        let shared = admission.clone();
        let _a = admission.try_enter("a").into_guard().unwrap();
        let _b = admission.try_enter("b").into_guard().unwrap();

        admission.reconfigure(&AdmissionConfig {
            max_concurrent: 1,
            cancel_wait: Duration::from_millis(50),
            cancel_check_interval: Duration::from_millis(5),
        });

        // Running slots are kept; new grants wait until the count drops.
        assert_eq!(shared.max_concurrent(), 1);
        assert_eq!(shared.active_count(), 2);
        assert!(!shared.try_enter("c").is_granted());
        assert!(!shared.can_admit().allowed);

        let result = shared
            .enter(
                "c",
                &WaitOptions {
                    max_wait: Duration::from_millis(30),
                    ..fast_wait()
                },
            )
            .await;
        assert!(matches!(result, Err(AppError::AdmissionTimeout { .. })));
        let payload = &sink.payloads(channels::QUEUE_STATUS)[0];
        assert_eq!(payload["maxConcurrent"], 1);

        admission.reconfigure(&AdmissionConfig {
            max_concurrent: 0,
            cancel_wait: Duration::from_millis(50),
            cancel_check_interval: Duration::from_millis(5),
        });
        assert_eq!(shared.max_concurrent(), 5);
        assert!(shared.try_enter("c").is_granted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_cancel_returns_once_runs_stop() {
        let (admission, _) = controller(2);
        let guard = admission.try_enter("a").into_guard().unwrap();
        let probe = guard.cancel_probe();

        let run = tokio::spawn(async move {
            while !probe.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            drop(guard);
        });

        admission.request_cancel().await.unwrap();
        run.await.unwrap();
        assert_eq!(admission.active_count(), 0);
    }

    #[tokio::test]
    async fn test_grant_clears_stale_cancel_flag() {
        let (admission, _) = controller(2);
        let old = admission.try_enter("a").into_guard().unwrap();
        admission.request_cancel().await.unwrap();
        assert!(admission.is_cancel_requested());
        drop(old);

        let fresh = admission.try_enter("b").into_guard().unwrap();
        assert!(!admission.is_cancel_requested());
        assert!(!fresh.is_cancelled());
        assert!(!fresh.cancel_probe().is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_enter_future_leaves_queue() {
        let (admission, _) = controller(1);
        let _holder = admission.try_enter("a").into_guard().unwrap();

        let result = tokio::time::timeout(
            Duration::from_millis(30),
            admission.enter("b", &fast_wait()),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(admission.waiting_count(), 0);
    }
}
