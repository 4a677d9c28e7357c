//! Platform layer for framepace.
//!
//! This crate provides:
//! - Window management via winit
//! - Vulkan surface creation and the instance extensions it needs
//! - Keyboard state for the demo's toggles

mod input;
mod window;

pub use input::{InputState, KeyCode};
pub use window::{Surface, Window};
