//! Error types for the windowing side of the application.

use thiserror::Error;

/// Error raised while setting up the window or its presentation surface.
#[derive(Error, Debug)]
pub enum Error {
    /// Window creation or management errors
    #[error("Window error: {0}")]
    Window(String),

    /// Vulkan surface creation or extension query errors
    #[error("Surface error: {0}")]
    Surface(String),
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;
