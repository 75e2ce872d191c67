//! Commands
//!
//! Entry points the UI layer calls. Each returns a `CommandResponse` so
//! failures reach the frontend as data with an error code.

pub mod analysis;
pub mod settings;

pub use analysis::*;
pub use settings::*;
