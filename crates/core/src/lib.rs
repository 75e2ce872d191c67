//! Insight Core
//!
//! Result model, UI event contracts, and error codes shared by the Insight
//! Desktop workspace. This crate has no dependency on application-level code
//! (config, storage, the analysis services).
//!
//! ## Module Organization
//!
//! - `error` - Core error types (`CoreError`, `CoreResult`)
//! - `result_item` - Typed result items, monotonic IDs, dashboard payloads
//! - `events` - Event channel names, payloads, and the `EventSink` trait
//! - `error_info` - User-facing error codes with recovery suggestions

pub mod error;
pub mod error_info;
pub mod events;
pub mod result_item;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult};

// ── Result Items ───────────────────────────────────────────────────────
pub use result_item::{
    next_item_id, now_millis, validate_item, DashboardData, Insight, ItemValidation, Metric,
    ResultItem, ResultItemType, ResultSource,
};

// ── Events ─────────────────────────────────────────────────────────────
pub use events::{
    channels, ChannelEventSink, EmittedEvent, EventEmitter, EventSink, MemoryEventSink,
    NoopEventSink, ProgressUpdate, QueueStatus, QueueStatusEvent, TracingEventSink,
};

// ── Error Info ─────────────────────────────────────────────────────────
pub use error_info::{classify_failure, ErrorCode, ErrorInfo};
