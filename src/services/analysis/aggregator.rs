//! Session Result Aggregator
//!
//! Collects the result items an analysis produces and pushes them to the UI in
//! batches. Each session has a pending batch with a debounce timer: every new
//! item restarts the timer, so a burst of items goes out as one
//! `analysis-result-update` event. Every flushed item is also appended to the
//! session's flushed history, which the orchestrator hands to the result store
//! when the run ends.
//!
//! All per-session state lives behind one private mutex. Events are emitted
//! after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use insight_core::events::ResultBatchEvent;
use insight_core::{
    now_millis, validate_item, DashboardData, ErrorCode, ErrorInfo, EventEmitter, Insight,
    ItemValidation, Metric, ResultItem, ResultItemType,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

// ============================================================================
// State
// ============================================================================

#[derive(Debug)]
struct PendingBatch {
    message_id: String,
    request_id: String,
    items: Vec<ResultItem>,
}

#[derive(Debug)]
struct FlushTimer {
    epoch: u64,
    handle: JoinHandle<()>,
}

impl FlushTimer {
    fn cancel(self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct SessionSlot {
    pending: Option<PendingBatch>,
    flushed: Vec<ResultItem>,
    timer: Option<FlushTimer>,
    /// Number of batches emitted for this session
    sequence: u64,
}

impl SessionSlot {
    /// Nothing queued, armed, or kept for this session.
    fn is_idle(&self) -> bool {
        self.pending.is_none() && self.timer.is_none() && self.flushed.is_empty()
    }

    /// Move the pending batch into the flushed history and build its event.
    fn take_pending(
        &mut self,
        session_id: &str,
        is_complete: bool,
    ) -> Option<ResultBatchEvent> {
        let batch = self.pending.take()?;
        if batch.items.is_empty() {
            return None;
        }
        self.flushed.extend(batch.items.iter().cloned());
        self.sequence += 1;
        Some(ResultBatchEvent {
            session_id: session_id.to_string(),
            message_id: batch.message_id,
            request_id: batch.request_id,
            items: batch.items,
            is_complete,
            sequence: self.sequence,
            timestamp: now_millis(),
        })
    }
}

#[derive(Debug, Default)]
struct AggregatorState {
    flush_delay: Duration,
    sessions: HashMap<String, SessionSlot>,
    next_epoch: u64,
}

struct Inner {
    emitter: EventEmitter,
    state: Mutex<AggregatorState>,
}

// ============================================================================
// Aggregator
// ============================================================================

/// Debounced, per-session batching of result items. Cheap to clone; clones
/// share state.
#[derive(Clone)]
pub struct SessionAggregator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAggregator")
            .field("flush_delay", &self.flush_delay())
            .finish_non_exhaustive()
    }
}

impl SessionAggregator {
    pub fn new(flush_delay: Duration, emitter: EventEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                emitter,
                state: Mutex::new(AggregatorState {
                    flush_delay,
                    ..AggregatorState::default()
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn flush_delay(&self) -> Duration {
        self.lock().flush_delay
    }

    /// Change the debounce window. Timers already armed keep their delay.
    pub fn set_flush_delay(&self, flush_delay: Duration) {
        let mut state = self.lock();
        if state.flush_delay != flush_delay {
            tracing::info!(
                "[Aggregator] Flush delay changed from {:?} to {:?}",
                state.flush_delay,
                flush_delay
            );
            state.flush_delay = flush_delay;
        }
    }

    /// Check an item before it is queued. Never rejects.
    pub fn validate_item(
        &self,
        session_id: &str,
        message_id: &str,
        request_id: &str,
        data: &Value,
    ) -> ItemValidation {
        validate_item(session_id, message_id, request_id, data)
    }

    /// Queue an item for `session_id` and restart the session's debounce
    /// timer. Returns the new item's ID.
    ///
    /// Validation problems are logged and the item is kept. Non-empty message
    /// and request IDs replace the pending batch's IDs.
    pub fn add_item(
        &self,
        session_id: &str,
        message_id: &str,
        request_id: &str,
        item_type: ResultItemType,
        data: Value,
        metadata: HashMap<String, Value>,
    ) -> String {
        let validation = validate_item(session_id, message_id, request_id, &data);
        for warning in &validation.warnings {
            tracing::warn!(
                "[Aggregator] {} (session={}, type={})",
                warning,
                session_id,
                item_type
            );
        }
        for note in &validation.notes {
            tracing::debug!("[Aggregator] {} (session={})", note, session_id);
        }

        let mut state = self.lock();
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        let delay = state.flush_delay;
        let slot = state.sessions.entry(session_id.to_string()).or_default();

        // Allocated under the lock so ID order matches queue order.
        let item = ResultItem::new(item_type, data, metadata);
        let id = item.id.clone();

        let batch = slot.pending.get_or_insert_with(|| PendingBatch {
            message_id: String::new(),
            request_id: String::new(),
            items: Vec::new(),
        });
        if !message_id.is_empty() {
            batch.message_id = message_id.to_string();
        }
        if !request_id.is_empty() {
            batch.request_id = request_id.to_string();
        }
        batch.items.push(item);
        let pending = batch.items.len();

        if let Some(timer) = slot.timer.take() {
            timer.cancel();
        }
        match Handle::try_current() {
            Ok(runtime) => {
                let aggregator = self.clone();
                let session = session_id.to_string();
                let handle = runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    aggregator.flush_from_timer(&session, epoch);
                });
                slot.timer = Some(FlushTimer { epoch, handle });
            }
            Err(_) => {
                tracing::warn!(
                    "[Aggregator] No async runtime, session {} holds {} item(s) until an explicit flush",
                    session_id,
                    pending
                );
            }
        }

        tracing::debug!(
            "[Aggregator] Queued {} {} for session {} ({} pending)",
            item_type,
            id,
            session_id,
            pending
        );
        id
    }

    fn flush_from_timer(&self, session_id: &str, epoch: u64) {
        let event = {
            let mut state = self.lock();
            let Some(slot) = state.sessions.get_mut(session_id) else {
                return;
            };
            // Replaced, flushed, or cleared since this timer was armed.
            if slot.timer.as_ref().map(|t| t.epoch) != Some(epoch) {
                return;
            }
            slot.timer = None;
            slot.take_pending(session_id, false)
        };

        if let Some(event) = event {
            tracing::debug!(
                "[Aggregator] Timer flushed {} item(s) for session {}",
                event.items.len(),
                session_id
            );
            self.inner.emitter.emit_batch(&event);
        }
    }

    /// Flush the pending batch immediately. Returns the flushed items, empty
    /// when nothing was pending.
    pub fn flush_now(&self, session_id: &str, is_complete: bool) -> Vec<ResultItem> {
        let event = {
            let mut state = self.lock();
            match state.sessions.get_mut(session_id) {
                Some(slot) => {
                    if let Some(timer) = slot.timer.take() {
                        timer.cancel();
                    }
                    slot.take_pending(session_id, is_complete)
                }
                None => None,
            }
        };

        match event {
            Some(event) => {
                tracing::debug!(
                    "[Aggregator] Flushed {} item(s) for session {} (complete={}, seq={})",
                    event.items.len(),
                    session_id,
                    is_complete,
                    event.sequence
                );
                self.inner.emitter.emit_batch(&event);
                event.items
            }
            None => {
                tracing::debug!("[Aggregator] Flush skipped, nothing pending for session {}", session_id);
                Vec::new()
            }
        }
    }

    /// Every item flushed for `session_id` since the last
    /// [`clear_flushed_items`](Self::clear_flushed_items), in queue order.
    pub fn get_all_flushed_items(&self, session_id: &str) -> Vec<ResultItem> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|slot| slot.flushed.clone())
            .unwrap_or_default()
    }

    /// Drop the flushed history of `session_id`. A session left with nothing
    /// pending is forgotten entirely, so its batch sequence starts over.
    pub fn clear_flushed_items(&self, session_id: &str) {
        let mut state = self.lock();
        let Some(slot) = state.sessions.get_mut(session_id) else {
            return;
        };
        let dropped = slot.flushed.len();
        slot.flushed = Vec::new();
        let idle = slot.is_idle();
        if idle {
            state.sessions.remove(session_id);
        }
        tracing::debug!(
            "[Aggregator] Cleared {} flushed item(s) for session {}{}",
            dropped,
            session_id,
            if idle { " (released)" } else { "" }
        );
    }

    /// Drop everything held for `session_id` and notify the UI. Other sessions
    /// are untouched.
    pub fn clear(&self, session_id: &str) {
        let removed = self.lock().sessions.remove(session_id);
        if let Some(mut slot) = removed {
            if let Some(timer) = slot.timer.take() {
                timer.cancel();
            }
            tracing::debug!(
                "[Aggregator] Cleared session {} ({} pending, {} flushed)",
                session_id,
                slot.pending.as_ref().map_or(0, |b| b.items.len()),
                slot.flushed.len()
            );
        }
        self.inner.emitter.emit_clear(Some(session_id));
    }

    /// Drop every session's state. Emits a single clear event with no
    /// session ID.
    pub fn clear_all(&self) {
        let drained: Vec<SessionSlot> = self.lock().sessions.drain().map(|(_, slot)| slot).collect();
        let count = drained.len();
        for timer in drained.into_iter().filter_map(|slot| slot.timer) {
            timer.cancel();
        }
        tracing::info!("[Aggregator] Cleared all sessions ({})", count);
        self.inner.emitter.emit_clear(None);
    }

    pub fn pending_count(&self, session_id: &str) -> usize {
        self.lock()
            .sessions
            .get(session_id)
            .and_then(|slot| slot.pending.as_ref())
            .map_or(0, |batch| batch.items.len())
    }

    /// Number of sessions with any state held.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn flushed_count(&self, session_id: &str) -> usize {
        self.lock()
            .sessions
            .get(session_id)
            .map_or(0, |slot| slot.flushed.len())
    }

    // ------------------------------------------------------------------------
    // Typed wrappers
    // ------------------------------------------------------------------------

    pub fn add_echarts(
        &self,
        session_id: &str,
        message_id: &str,
        request_id: &str,
        chart: Value,
    ) -> String {
        let metadata = base_metadata(session_id, message_id);
        self.add_item(session_id, message_id, request_id, ResultItemType::Echarts, chart, metadata)
    }

    pub fn add_image(
        &self,
        session_id: &str,
        message_id: &str,
        request_id: &str,
        image_data: impl Into<String>,
        file_name: Option<&str>,
    ) -> String {
        let metadata = with_file_name(base_metadata(session_id, message_id), file_name);
        self.add_item(
            session_id,
            message_id,
            request_id,
            ResultItemType::Image,
            Value::String(image_data.into()),
            metadata,
        )
    }

    pub fn add_table(
        &self,
        session_id: &str,
        message_id: &str,
        request_id: &str,
        table: Value,
    ) -> String {
        let metadata = base_metadata(session_id, message_id);
        self.add_item(session_id, message_id, request_id, ResultItemType::Table, table, metadata)
    }

    pub fn add_csv(
        &self,
        session_id: &str,
        message_id: &str,
        request_id: &str,
        csv: impl Into<String>,
        file_name: Option<&str>,
    ) -> String {
        let metadata = with_file_name(base_metadata(session_id, message_id), file_name);
        self.add_item(
            session_id,
            message_id,
            request_id,
            ResultItemType::Csv,
            Value::String(csv.into()),
            metadata,
        )
    }

    pub fn add_metric(
        &self,
        session_id: &str,
        message_id: &str,
        request_id: &str,
        metric: &Metric,
    ) -> String {
        let metadata = base_metadata(session_id, message_id);
        self.add_item(
            session_id,
            message_id,
            request_id,
            ResultItemType::Metric,
            to_payload(metric),
            metadata,
        )
    }

    pub fn add_insight(
        &self,
        session_id: &str,
        message_id: &str,
        request_id: &str,
        insight: &Insight,
    ) -> String {
        let metadata = base_metadata(session_id, message_id);
        self.add_item(
            session_id,
            message_id,
            request_id,
            ResultItemType::Insight,
            to_payload(insight),
            metadata,
        )
    }

    pub fn add_file(
        &self,
        session_id: &str,
        message_id: &str,
        request_id: &str,
        file_name: &str,
        file_path: &str,
        file_type: &str,
    ) -> String {
        let data = json!({
            "fileName": file_name,
            "filePath": file_path,
            "fileType": file_type,
        });
        let metadata = with_file_name(base_metadata(session_id, message_id), Some(file_name));
        self.add_item(session_id, message_id, request_id, ResultItemType::File, data, metadata)
    }

    /// Queue every metric, then every insight. Returns the new IDs in order.
    pub fn add_dashboard_data(
        &self,
        session_id: &str,
        message_id: &str,
        request_id: &str,
        dashboard: &DashboardData,
    ) -> Vec<String> {
        let metrics = dashboard
            .metrics
            .iter()
            .map(|m| self.add_metric(session_id, message_id, request_id, m));
        let insights = dashboard
            .insights
            .iter()
            .map(|i| self.add_insight(session_id, message_id, request_id, i));
        metrics.chain(insights).collect()
    }

    // ------------------------------------------------------------------------
    // UI notifications
    // ------------------------------------------------------------------------

    pub fn set_loading(&self, session_id: &str, loading: bool, request_id: &str) {
        self.inner.emitter.emit_loading(session_id, loading, request_id);
    }

    /// Report a generic analysis failure.
    pub fn emit_error(&self, session_id: &str, request_id: &str, error: &str) {
        self.emit_error_with_code(session_id, request_id, ErrorCode::AnalysisError, error);
    }

    /// Report a failure under `code`. The user sees the code's default
    /// message; `error` goes into the details.
    pub fn emit_error_with_code(
        &self,
        session_id: &str,
        request_id: &str,
        code: ErrorCode,
        error: &str,
    ) {
        self.inner
            .emitter
            .emit_error(session_id, request_id, ErrorInfo::new(code, "", error));
    }

    pub fn emit_error_with_details(
        &self,
        session_id: &str,
        request_id: &str,
        code: ErrorCode,
        message: &str,
        details: &str,
    ) {
        self.inner
            .emitter
            .emit_error(session_id, request_id, ErrorInfo::new(code, message, details));
    }

    pub fn emit_timeout(&self, session_id: &str, request_id: &str, elapsed: Duration) {
        self.emit_error_with_details(
            session_id,
            request_id,
            ErrorCode::AnalysisTimeout,
            &format!("Analysis timed out (ran for {}s)", elapsed.as_secs()),
            &format!("Analysis timed out after {:?}", elapsed),
        );
    }

    pub fn emit_cancelled(&self, session_id: &str, request_id: &str) {
        self.inner.emitter.emit_cancelled(session_id, request_id);
    }

    /// Handle bound to one session and message, for the unit of work.
    pub fn emitter_for(&self, session_id: &str, message_id: &str, request_id: &str) -> ResultEmitter {
        ResultEmitter {
            aggregator: self.clone(),
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            request_id: request_id.to_string(),
        }
    }
}

fn base_metadata(session_id: &str, message_id: &str) -> HashMap<String, Value> {
    HashMap::from([
        ("sessionId".to_string(), Value::from(session_id)),
        ("messageId".to_string(), Value::from(message_id)),
        ("timestamp".to_string(), Value::from(now_millis())),
    ])
}

fn with_file_name(
    mut metadata: HashMap<String, Value>,
    file_name: Option<&str>,
) -> HashMap<String, Value> {
    if let Some(name) = file_name.filter(|n| !n.is_empty()) {
        metadata.insert("fileName".to_string(), Value::from(name));
    }
    metadata
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        tracing::warn!("[Aggregator] Failed to serialize item payload: {}", e);
        Value::Null
    })
}

// ============================================================================
// Session-scoped handle
// ============================================================================

/// The aggregator's typed wrappers, pre-bound to one session, message, and
/// request.
#[derive(Debug, Clone)]
pub struct ResultEmitter {
    aggregator: SessionAggregator,
    session_id: String,
    message_id: String,
    request_id: String,
}

impl ResultEmitter {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn add_item(
        &self,
        item_type: ResultItemType,
        data: Value,
        metadata: HashMap<String, Value>,
    ) -> String {
        self.aggregator.add_item(
            &self.session_id,
            &self.message_id,
            &self.request_id,
            item_type,
            data,
            metadata,
        )
    }

    pub fn echarts(&self, chart: Value) -> String {
        self.aggregator
            .add_echarts(&self.session_id, &self.message_id, &self.request_id, chart)
    }

    pub fn image(&self, image_data: impl Into<String>, file_name: Option<&str>) -> String {
        self.aggregator.add_image(
            &self.session_id,
            &self.message_id,
            &self.request_id,
            image_data,
            file_name,
        )
    }

    pub fn table(&self, table: Value) -> String {
        self.aggregator
            .add_table(&self.session_id, &self.message_id, &self.request_id, table)
    }

    pub fn csv(&self, csv: impl Into<String>, file_name: Option<&str>) -> String {
        self.aggregator.add_csv(
            &self.session_id,
            &self.message_id,
            &self.request_id,
            csv,
            file_name,
        )
    }

    pub fn metric(&self, metric: &Metric) -> String {
        self.aggregator
            .add_metric(&self.session_id, &self.message_id, &self.request_id, metric)
    }

    pub fn insight(&self, insight: &Insight) -> String {
        self.aggregator
            .add_insight(&self.session_id, &self.message_id, &self.request_id, insight)
    }

    pub fn file(&self, file_name: &str, file_path: &str, file_type: &str) -> String {
        self.aggregator.add_file(
            &self.session_id,
            &self.message_id,
            &self.request_id,
            file_name,
            file_path,
            file_type,
        )
    }

    pub fn dashboard(&self, dashboard: &DashboardData) -> Vec<String> {
        self.aggregator.add_dashboard_data(
            &self.session_id,
            &self.message_id,
            &self.request_id,
            dashboard,
        )
    }
}
