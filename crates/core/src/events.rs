//! UI Event Contracts
//!
//! Channel names, payload types, and the injectable [`EventSink`] through which
//! the analysis core notifies the UI layer. The core works unchanged when the
//! sink discards everything; production code forwards to the webview bridge and
//! tests record into a [`MemoryEventSink`].

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error_info::{ErrorCode, ErrorInfo};
use crate::result_item::{now_millis, ResultItem};

/// Event channel names consumed by the frontend
pub mod channels {
    /// A batch of result items was flushed
    pub const RESULT_UPDATE: &str = "analysis-result-update";
    /// A session's results were cleared
    pub const RESULT_CLEAR: &str = "analysis-result-clear";
    /// Dashboard loading indicator for a session
    pub const RESULT_LOADING: &str = "analysis-result-loading";
    /// An analysis failed
    pub const ERROR: &str = "analysis-error";
    /// An analysis was cancelled
    pub const CANCELLED: &str = "analysis-cancelled";
    /// Waiting / starting notifications from the admission queue
    pub const QUEUE_STATUS: &str = "analysis-queue-status";
    /// Progress reported by a running analysis
    pub const PROGRESS: &str = "analysis-progress";
    /// An analysis finished and its results were handed to storage
    pub const COMPLETED: &str = "analysis-completed";
    /// Chat panel spinner for a thread
    pub const CHAT_LOADING: &str = "chat-loading";
}

/// Push channel to the UI layer.
pub trait EventSink: Send + Sync {
    fn emit(&self, channel: &str, payload: Value);
}

impl<F> EventSink for F
where
    F: Fn(&str, Value) + Send + Sync,
{
    fn emit(&self, channel: &str, payload: Value) {
        self(channel, payload)
    }
}

/// A recorded emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEvent {
    pub channel: String,
    pub payload: Value,
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _channel: &str, _payload: Value) {}
}

/// Mirrors events into the tracing log at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, channel: &str, payload: Value) {
        tracing::debug!(channel, %payload, "[Event] emit");
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<EmittedEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<EmittedEvent> {
        self.lock().clone()
    }

    /// Payloads emitted on one channel.
    pub fn payloads(&self, channel: &str) -> Vec<Value> {
        self.lock()
            .iter()
            .filter(|e| e.channel == channel)
            .map(|e| e.payload.clone())
            .collect()
    }

    pub fn count(&self, channel: &str) -> usize {
        self.lock().iter().filter(|e| e.channel == channel).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<EmittedEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, channel: &str, payload: Value) {
        self.lock().push(EmittedEvent {
            channel: channel.to_string(),
            payload,
        });
    }
}

/// Forwards events over an unbounded channel, e.g. to a task that relays them
/// to the webview.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<EmittedEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EmittedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, channel: &str, payload: Value) {
        // A closed receiver means the UI went away; the core keeps running.
        let _ = self.tx.send(EmittedEvent {
            channel: channel.to_string(),
            payload,
        });
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Batch of flushed result items (`analysis-result-update`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultBatchEvent {
    pub session_id: String,
    pub message_id: String,
    pub request_id: String,
    pub items: Vec<ResultItem>,
    pub is_complete: bool,
    /// Per-session flush counter, starting at 1
    pub sequence: u64,
    pub timestamp: i64,
}

/// `analysis-result-clear`; `session_id` is `None` when every session was cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultClearEvent {
    pub session_id: Option<String>,
}

/// `analysis-result-loading`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingEvent {
    pub session_id: String,
    pub loading: bool,
    pub request_id: String,
}

/// `chat-loading`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatLoadingEvent {
    pub thread_id: String,
    pub loading: bool,
}

/// Phase reported on `analysis-queue-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    Starting,
    Timeout,
    Cancelled,
}

/// `analysis-queue-status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusEvent {
    pub thread_id: String,
    pub status: QueueStatus,
    pub message: String,
    /// 1-based position among waiting callers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    pub active_count: usize,
    pub max_concurrent: usize,
    pub waited_secs: u64,
}

/// Progress update produced by a running analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub stage: String,
    /// 0 to 100
    pub progress: u8,
    pub message: String,
    #[serde(default)]
    pub step: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
}

impl ProgressUpdate {
    pub fn new(stage: impl Into<String>, progress: u8, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            progress: progress.min(100),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step: u32, total: u32) -> Self {
        self.step = step;
        self.total = total;
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, output: Option<String>) -> Self {
        self.tool_name = Some(name.into());
        self.tool_output = output;
        self
    }
}

/// `analysis-progress`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub thread_id: String,
    #[serde(flatten)]
    pub update: ProgressUpdate,
}

/// `analysis-error`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisErrorEvent {
    pub session_id: String,
    pub thread_id: String,
    pub request_id: String,
    pub code: ErrorCode,
    pub error: String,
    pub message: String,
    pub details: String,
    pub recovery_suggestions: Vec<String>,
    pub timestamp: i64,
}

impl AnalysisErrorEvent {
    pub fn new(session_id: &str, request_id: &str, info: ErrorInfo) -> Self {
        Self {
            session_id: session_id.to_string(),
            thread_id: session_id.to_string(),
            request_id: request_id.to_string(),
            code: info.code,
            error: info.message.clone(),
            message: info.message,
            details: info.details,
            recovery_suggestions: info.recovery_suggestions,
            timestamp: info.timestamp,
        }
    }
}

/// `analysis-cancelled`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledEvent {
    pub session_id: String,
    pub thread_id: String,
    pub request_id: String,
    pub code: ErrorCode,
    pub message: String,
    pub recovery_suggestions: Vec<String>,
    pub timestamp: i64,
}

/// `analysis-completed`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedEvent {
    pub thread_id: String,
    pub user_message_id: String,
    pub request_id: String,
    pub item_count: usize,
}

// ============================================================================
// Emitter
// ============================================================================

/// Typed front for an [`EventSink`].
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(Arc::new(NoopEventSink))
    }
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Serialize and emit an arbitrary payload.
    pub fn emit<T: Serialize>(&self, channel: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.sink.emit(channel, value),
            Err(e) => tracing::warn!("[Event] Failed to serialize payload for {}: {}", channel, e),
        }
    }

    pub fn emit_batch(&self, event: &ResultBatchEvent) {
        self.emit(channels::RESULT_UPDATE, event);
    }

    pub fn emit_clear(&self, session_id: Option<&str>) {
        self.emit(
            channels::RESULT_CLEAR,
            &ResultClearEvent {
                session_id: session_id.map(str::to_string),
            },
        );
    }

    pub fn emit_loading(&self, session_id: &str, loading: bool, request_id: &str) {
        self.emit(
            channels::RESULT_LOADING,
            &LoadingEvent {
                session_id: session_id.to_string(),
                loading,
                request_id: request_id.to_string(),
            },
        );
    }

    pub fn emit_chat_loading(&self, thread_id: &str, loading: bool) {
        self.emit(
            channels::CHAT_LOADING,
            &ChatLoadingEvent {
                thread_id: thread_id.to_string(),
                loading,
            },
        );
    }

    pub fn emit_queue_status(&self, event: &QueueStatusEvent) {
        self.emit(channels::QUEUE_STATUS, event);
    }

    pub fn emit_progress(&self, thread_id: &str, update: ProgressUpdate) {
        self.emit(
            channels::PROGRESS,
            &ProgressEvent {
                thread_id: thread_id.to_string(),
                update,
            },
        );
    }

    pub fn emit_error(&self, session_id: &str, request_id: &str, info: ErrorInfo) {
        tracing::debug!(
            "[Event] analysis error: code={}, suggestions={}",
            info.code,
            info.recovery_suggestions.len()
        );
        self.emit(channels::ERROR, &AnalysisErrorEvent::new(session_id, request_id, info));
    }

    pub fn emit_cancelled(&self, session_id: &str, request_id: &str) {
        let info = ErrorInfo::new(ErrorCode::AnalysisCancelled, "", "");
        self.emit(
            channels::CANCELLED,
            &CancelledEvent {
                session_id: session_id.to_string(),
                thread_id: session_id.to_string(),
                request_id: request_id.to_string(),
                code: info.code,
                message: info.message,
                recovery_suggestions: info.recovery_suggestions,
                timestamp: now_millis(),
            },
        );
    }

    pub fn emit_completed(&self, event: &CompletedEvent) {
        self.emit(channels::COMPLETED, event);
    }
}
