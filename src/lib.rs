//! Insight Desktop - Analysis Backend Library
//!
//! Backend for running data analyses alongside a chat UI. It includes:
//! - Concurrency-limited admission with a cooperative cancel signal
//! - Per-session result aggregation with debounced batch delivery
//! - An orchestrator that runs a pluggable analysis and persists its results
//! - Command handlers, configuration, and storage

pub mod commands;
pub mod models;
pub mod services;
pub mod state;
pub mod storage;
pub mod utils;

pub use commands::{
    // Analysis commands
    can_start_new_analysis, cancel_analysis, clear_session_results, get_active_analysis_count,
    get_session_results, is_cancel_requested, run_analysis, submit_analysis,
    // Settings commands
    get_settings, update_settings,
};
pub use models::response::*;
pub use models::settings::{AnalysisConfig, AnalysisConfigUpdate};
pub use services::analysis::{
    AdmissionConfig, AdmissionController, AnalysisHandle, AnalysisOrchestrator, AnalysisOutput,
    AnalysisReport, AnalysisRequest, AnalysisRunner, CancelProbe, ProgressReporter, ResultEmitter,
    ResultStore, RunContext, RunOutcome, SessionAggregator, WaitOptions,
};
pub use state::AppState;
pub use storage::{ConfigService, JsonResultStore, MemoryResultStore};
pub use utils::error::{AppError, AppResult};
