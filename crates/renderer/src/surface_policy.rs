//! What to do when the presentation surface goes stale.
//!
//! When acquire or present reports the surface out of date (or suboptimal),
//! the [`RenderContext`](crate::RenderContext) asks its policy for a
//! replacement. A returned surface goes through
//! [`update_swapchain`](crate::RenderContext::update_swapchain); `None` means
//! no usable surface exists right now, for example while the window is
//! minimized.
//!
//! Any `FnMut(&S) -> RhiResult<Option<S>>` closure is a policy:
//!
//! ```
//! use std::sync::Arc;
//! use framepace_renderer::RenderContext;
//! use framepace_rhi::RhiResult;
//! use framepace_rhi::headless::{HeadlessDevice, HeadlessSurface, HeadlessWindow};
//!
//! # fn example() -> Result<(), framepace_rhi::RhiError> {
//! let device = Arc::new(HeadlessDevice::new());
//! let window = Arc::new(HeadlessWindow::new(800, 600));
//! let surface = HeadlessSurface::new(Arc::clone(&device), window, 3);
//!
//! // Rebuild with two images whenever the surface goes stale.
//! let context = RenderContext::new(device, surface)?.with_surface_policy(
//!     |old: &HeadlessSurface| -> RhiResult<Option<HeadlessSurface>> {
//!         Ok(Some(old.with_image_count(2)))
//!     },
//! );
//! # drop(context);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use tracing::debug;

use framepace_rhi::{PresentSurface, RhiResult};

/// Produces a replacement for a stale surface.
pub trait SurfaceChangePolicy<S: PresentSurface> {
    /// Returns a replacement for `stale`, or `None` if none can be made now.
    ///
    /// # Errors
    ///
    /// Errors propagate out of the frame call that detected the stale surface.
    fn on_surface_stale(&mut self, stale: &S) -> RhiResult<Option<S>>;
}

impl<S, F> SurfaceChangePolicy<S> for F
where
    S: PresentSurface,
    F: FnMut(&S) -> RhiResult<Option<S>>,
{
    fn on_surface_stale(&mut self, stale: &S) -> RhiResult<Option<S>> {
        self(stale)
    }
}

/// Recreates the surface at its current drawable size, unless that size has
/// zero area.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResizeToDrawable;

impl<S: PresentSurface> SurfaceChangePolicy<S> for ResizeToDrawable {
    fn on_surface_stale(&mut self, stale: &S) -> RhiResult<Option<S>> {
        let extent = stale.current_extent()?;
        if extent.width == 0 || extent.height == 0 {
            debug!("Drawable area is empty, surface not recreated");
            return Ok(None);
        }
        stale.recreate(extent).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ash::vk;
    use framepace_rhi::headless::{HeadlessDevice, HeadlessSurface, HeadlessWindow};

    fn surface(window: &Arc<HeadlessWindow>) -> HeadlessSurface {
        HeadlessSurface::new(Arc::new(HeadlessDevice::new()), Arc::clone(window), 3)
    }

    #[test]
    fn test_resize_to_drawable_follows_window() {
        let window = Arc::new(HeadlessWindow::new(800, 600));
        let old = surface(&window);
        window.resize(1280, 720);

        let replacement = ResizeToDrawable.on_surface_stale(&old).unwrap().unwrap();

        assert_eq!(
            replacement.extent(),
            vk::Extent2D {
                width: 1280,
                height: 720
            }
        );
        assert_eq!(replacement.image_count(), 3);
    }

    #[test]
    fn test_resize_to_drawable_skips_empty_window() {
        let window = Arc::new(HeadlessWindow::new(800, 600));
        let old = surface(&window);
        window.resize(0, 600);

        assert!(ResizeToDrawable.on_surface_stale(&old).unwrap().is_none());
    }

    #[test]
    fn test_closure_is_a_policy() {
        let window = Arc::new(HeadlessWindow::new(800, 600));
        let old = surface(&window);
        let mut calls = 0;

        let mut policy = |_: &HeadlessSurface| -> RhiResult<Option<HeadlessSurface>> {
            calls += 1;
            Ok(None)
        };
        assert!(policy.on_surface_stale(&old).unwrap().is_none());
        drop(policy);

        assert_eq!(calls, 1);
    }
}
