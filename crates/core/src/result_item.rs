//! Analysis Result Items
//!
//! The typed unit that producers hand to the session aggregator: one chart,
//! table, image, metric, insight, CSV export or file reference produced by an
//! analysis run. Payloads stay opaque (`serde_json::Value`); the core never
//! interprets chart or table formats.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Kind of a result item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultItemType {
    Echarts,
    Image,
    Table,
    Csv,
    Metric,
    Insight,
    File,
}

impl ResultItemType {
    /// Every item type, in display order.
    pub const ALL: [ResultItemType; 7] = [
        ResultItemType::Echarts,
        ResultItemType::Image,
        ResultItemType::Table,
        ResultItemType::Csv,
        ResultItemType::Metric,
        ResultItemType::Insight,
        ResultItemType::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultItemType::Echarts => "echarts",
            ResultItemType::Image => "image",
            ResultItemType::Table => "table",
            ResultItemType::Csv => "csv",
            ResultItemType::Metric => "metric",
            ResultItemType::Insight => "insight",
            ResultItemType::File => "file",
        }
    }

    /// Parse a wire name such as `"echarts"`. Matching ignores case and
    /// surrounding whitespace.
    pub fn parse(value: &str) -> CoreResult<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| {
                CoreError::parse(format!(
                    "invalid item type: {} (valid types: {})",
                    value,
                    Self::ALL.map(|t| t.as_str()).join(", ")
                ))
            })
    }
}

impl fmt::Display for ResultItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultItemType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Where a result item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    /// Streamed while the analysis is running
    #[default]
    Realtime,
    /// Attached after the analysis completed
    Completed,
    /// Served from a cache
    Cached,
    /// Reloaded from persisted history
    Restored,
}

/// A single analysis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    /// Unique, monotonically increasing identifier (see [`next_item_id`])
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: ResultItemType,
    /// Opaque payload
    pub data: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub source: ResultSource,
}

impl ResultItem {
    /// Create a realtime item with a freshly assigned ID.
    pub fn new(item_type: ResultItemType, data: Value, metadata: HashMap<String, Value>) -> Self {
        Self {
            id: next_item_id(),
            item_type,
            data,
            metadata,
            source: ResultSource::Realtime,
        }
    }

    /// Convenience lookup for a string metadata entry.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

// ============================================================================
// ID generation
// ============================================================================

static LAST_ITEM_TICK: AtomicU64 = AtomicU64::new(0);

/// Allocate the next result item ID.
///
/// IDs are `ri_` followed by a zero-padded microsecond tick. The tick is
/// `max(now, previous + 1)`, so IDs are strictly increasing across threads and
/// sort lexically in allocation order.
pub fn next_item_id() -> String {
    let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
    let previous = LAST_ITEM_TICK
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or_else(|last| last);
    let tick = now.max(previous + 1);
    format!("ri_{:020}", tick)
}

/// Current wall-clock time in milliseconds, as stamped into item metadata.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Dashboard payloads
// ============================================================================

/// Headline number shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub title: String,
    pub value: String,
    #[serde(default)]
    pub change: String,
}

/// Short textual finding shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub text: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
}

/// Metrics and insights produced together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardData {
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub insights: Vec<Insight>,
}

// ============================================================================
// Validation
// ============================================================================

/// Outcome of checking an item before it is queued.
///
/// Validation never rejects an item. Warnings flag suspicious input, notes
/// record optional fields that were left empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemValidation {
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}

impl ItemValidation {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Check the identifiers and payload of an item about to be queued.
pub fn validate_item(
    session_id: &str,
    message_id: &str,
    request_id: &str,
    data: &Value,
) -> ItemValidation {
    let mut result = ItemValidation::default();

    if session_id.is_empty() {
        result.warnings.push("sessionID is empty".to_string());
    }

    match data {
        Value::Null => result.warnings.push("data is null".to_string()),
        Value::String(s) if s.is_empty() => {
            result.warnings.push("data is an empty string".to_string())
        }
        _ => {}
    }

    if message_id.is_empty() {
        result.notes.push("messageID is empty (optional field)".to_string());
    }
    if request_id.is_empty() {
        result.notes.push("requestID is empty (optional field)".to_string());
    }

    result
}
