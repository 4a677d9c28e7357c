//! Per-frame render context.
//!
//! This crate manages the lifecycle of rendering frames on top of the
//! [`framepace_rhi`] seams:
//! - A ring of [`RenderFrame`]s, one per surface image, that caps the number
//!   of frames in flight
//! - Per-frame pools of command buffers, semaphores and fences, recycled when
//!   a slot comes around again
//! - Per-frame caches of framebuffers and descriptor sets
//! - Swapchain replacement that waits for in-flight work before tearing down
//!   the old ring

pub mod cache;
pub mod command_pool;
pub mod render_context;
pub mod render_frame;
pub mod surface_policy;
pub mod sync;

pub use command_pool::{CommandContext, ResetMode};
pub use render_context::{FrameFactory, RenderContext};
pub use render_frame::{DEFAULT_DESCRIPTOR_CAPACITY, RenderFrame};
pub use surface_policy::{ResizeToDrawable, SurfaceChangePolicy};

/// Timeout for frame fence waits, in nanoseconds. Waits are unbounded.
pub const FENCE_TIMEOUT: u64 = u64::MAX;
