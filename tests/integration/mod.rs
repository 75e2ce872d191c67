//! Integration Tests Module
//!
//! End-to-end tests for the analysis pipeline: admission under load,
//! result ordering and isolation, panic recovery, cancellation convergence,
//! and the command layer over a file-backed configuration.

// Admission, aggregation and cancellation through the orchestrator
mod analysis_flow_test;

// Command layer over AppState with JSON storage
mod commands_test;
