//! Core utilities shared by the framepace crates.
//!
//! This crate provides:
//! - The application-level error type and result alias
//! - Logging initialization
//! - Frame timing statistics

mod error;
mod logging;
mod timer;

pub use error::{Error, Result};
pub use logging::{init_logging, init_test_logging};
pub use timer::FrameStats;
