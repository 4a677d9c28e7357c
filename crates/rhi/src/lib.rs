//! Vulkan hardware interface.
//!
//! This crate wraps the parts of Vulkan (through `ash`) that a frame lifecycle
//! touches:
//! - Instance, physical device selection and the logical device
//! - Queues and the swapchain
//! - Fingerprint keys for framebuffers and descriptor sets
//!
//! It also defines the [`GpuDevice`] and [`PresentSurface`] seams the renderer
//! is written against. The `headless` feature adds a simulated implementation
//! of both for tests.

mod error;

pub mod descriptor;
pub mod device;
pub mod framebuffer;
pub mod gpu;
#[cfg(any(test, feature = "headless"))]
pub mod headless;
pub mod instance;
pub mod physical_device;
pub mod queue;
pub mod swapchain;

pub use error::{RhiError, RhiResult};
pub use gpu::{GpuDevice, PresentSurface, Submission};
pub use queue::Queue;

// Re-export ash types that users might need
pub use ash::vk;
