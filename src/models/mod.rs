//! Data Models
//!
//! Contains the data structures shared by commands and services.

pub mod response;
pub mod settings;

pub use response::*;
pub use settings::*;
