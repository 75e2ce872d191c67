//! Analysis Services
//!
//! Concurrency-limited admission, per-session result aggregation, and the
//! orchestrator that runs an analysis between them.

pub mod admission;
pub mod aggregator;
pub mod cancellation;
pub mod orchestrator;

pub use admission::{AdmissionConfig, AdmissionController, CapacityCheck, SlotGuard, TryEnter, WaitOptions};
pub use aggregator::{ResultEmitter, SessionAggregator};
pub use cancellation::{CancelProbe, CancelState, ProgressReporter};
pub use orchestrator::{
    AnalysisHandle, AnalysisOrchestrator, AnalysisOutput, AnalysisReport, AnalysisRequest,
    AnalysisRunner, ResultStore, RunContext, RunOutcome,
};
