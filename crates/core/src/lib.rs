//! Core utilities for the framepipe workspace.
//!
//! This crate provides foundational types used across the pipeline:
//! - Logging initialization
//! - Frame timing utilities

mod logging;
mod timer;

pub use logging::init_logging;
pub use timer::Timer;
