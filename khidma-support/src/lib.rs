//! # Khidma Support
//!
//! Shared helpers for the khidma crates:
//! - text rendering for error messages
//! - tracing subscriber setup for binaries and demos

pub mod logging;
pub mod rendering;
