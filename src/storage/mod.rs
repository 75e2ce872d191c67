//! Storage Layer
//!
//! Handles data persistence: JSON config and persisted analysis results.

pub mod config;
pub mod results;

pub use config::*;
pub use results::*;
