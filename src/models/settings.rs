//! Settings Models
//!
//! Analysis configuration stored in config.json.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Used when `max_concurrent_analysis` is zero.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;
/// Upper bound applied regardless of configuration.
pub const HARD_MAX_CONCURRENT: usize = 10;

/// Analysis configuration stored in config.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Maximum analyses running at once (0 means the default, capped at 10)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_analysis: usize,
    /// How long a queued analysis waits for a slot before giving up
    #[serde(default = "default_queue_max_wait_secs")]
    pub queue_max_wait_secs: u64,
    /// How often a queued analysis re-checks capacity
    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,
    /// How often a queued analysis re-emits its waiting status
    #[serde(default = "default_queue_status_interval_secs")]
    pub queue_status_interval_secs: u64,
    /// How long a cancel request waits for running analyses to stop
    #[serde(default = "default_cancel_wait_secs")]
    pub cancel_wait_secs: u64,
    #[serde(default = "default_cancel_check_interval_ms")]
    pub cancel_check_interval_ms: u64,
    /// Debounce window for result batches
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_queue_max_wait_secs() -> u64 {
    300
}

fn default_queue_poll_interval_ms() -> u64 {
    500
}

fn default_queue_status_interval_secs() -> u64 {
    5
}

fn default_cancel_wait_secs() -> u64 {
    5
}

fn default_cancel_check_interval_ms() -> u64 {
    100
}

fn default_flush_delay_ms() -> u64 {
    50
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_concurrent_analysis: default_max_concurrent(),
            queue_max_wait_secs: default_queue_max_wait_secs(),
            queue_poll_interval_ms: default_queue_poll_interval_ms(),
            queue_status_interval_secs: default_queue_status_interval_secs(),
            cancel_wait_secs: default_cancel_wait_secs(),
            cancel_check_interval_ms: default_cancel_check_interval_ms(),
            flush_delay_ms: default_flush_delay_ms(),
        }
    }
}

/// Settings update request (partial update)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisConfigUpdate {
    pub max_concurrent_analysis: Option<usize>,
    pub queue_max_wait_secs: Option<u64>,
    pub queue_poll_interval_ms: Option<u64>,
    pub queue_status_interval_secs: Option<u64>,
    pub cancel_wait_secs: Option<u64>,
    pub cancel_check_interval_ms: Option<u64>,
    pub flush_delay_ms: Option<u64>,
}

impl AnalysisConfig {
    /// Apply a partial update to the configuration
    pub fn apply_update(&mut self, update: AnalysisConfigUpdate) {
        if let Some(max) = update.max_concurrent_analysis {
            self.max_concurrent_analysis = max;
        }
        if let Some(secs) = update.queue_max_wait_secs {
            self.queue_max_wait_secs = secs;
        }
        if let Some(ms) = update.queue_poll_interval_ms {
            self.queue_poll_interval_ms = ms;
        }
        if let Some(secs) = update.queue_status_interval_secs {
            self.queue_status_interval_secs = secs;
        }
        if let Some(secs) = update.cancel_wait_secs {
            self.cancel_wait_secs = secs;
        }
        if let Some(ms) = update.cancel_check_interval_ms {
            self.cancel_check_interval_ms = ms;
        }
        if let Some(ms) = update.flush_delay_ms {
            self.flush_delay_ms = ms;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_max_wait_secs == 0 {
            return Err("queue_max_wait_secs must be at least 1 second".to_string());
        }

        if self.queue_poll_interval_ms == 0 || self.queue_poll_interval_ms > 10_000 {
            return Err(format!(
                "Invalid queue_poll_interval_ms: {}. Must be between 1 and 10000",
                self.queue_poll_interval_ms
            ));
        }

        if self.queue_status_interval_secs == 0 {
            return Err("queue_status_interval_secs must be at least 1 second".to_string());
        }

        if self.cancel_check_interval_ms == 0 {
            return Err("cancel_check_interval_ms must be at least 1 millisecond".to_string());
        }

        if self.flush_delay_ms > 5_000 {
            return Err("flush_delay_ms cannot exceed 5000".to_string());
        }

        Ok(())
    }

    /// Concurrency limit actually enforced: 0 becomes the default, anything
    /// above the hard cap is clamped.
    pub fn effective_max_concurrent(&self) -> usize {
        effective_max_concurrent(self.max_concurrent_analysis)
    }

    pub fn queue_max_wait(&self) -> Duration {
        Duration::from_secs(self.queue_max_wait_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn queue_status_interval(&self) -> Duration {
        Duration::from_secs(self.queue_status_interval_secs)
    }

    pub fn cancel_wait(&self) -> Duration {
        Duration::from_secs(self.cancel_wait_secs)
    }

    pub fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_check_interval_ms)
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

/// Clamp a configured concurrency limit into `1..=HARD_MAX_CONCURRENT`.
pub fn effective_max_concurrent(configured: usize) -> usize {
    match configured {
        0 => DEFAULT_MAX_CONCURRENT,
        n => n.min(HARD_MAX_CONCURRENT),
    }
}
