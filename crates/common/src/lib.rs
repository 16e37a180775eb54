//! Rewind Common Utilities
//!
//! Shared infrastructure for all Rewind crates:
//! - Error types and result aliases
//! - Media clock and timestamp utilities
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
