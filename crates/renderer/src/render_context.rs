//! Frame ring orchestration and safe swapchain replacement.
//!
//! This module provides the [`RenderContext`], which owns the presentation
//! surface and a ring of [`RenderFrame`]s, one per surface image. It drives
//! the frame loop:
//!
//! 1. [`begin_frame`](RenderContext::begin_frame) moves to the next slot,
//!    waits until that slot's previous work has retired, recycles its
//!    resources and acquires a surface image
//! 2. Work is recorded into contexts from the active frame and submitted with
//!    [`submit`](RenderContext::submit), chaining semaphores
//! 3. [`end_frame`](RenderContext::end_frame) presents the image
//!
//! Waiting in `begin_frame` caps the number of frames in flight at the ring
//! size.
//!
//! # Surface replacement
//!
//! [`update_swapchain`](RenderContext::update_swapchain) waits for every slot
//! and the device to go idle, builds a ring sized to the new image count, then
//! tears down the old ring and swaps in the new surface. The same path runs
//! when acquire reports a stale surface, or present reports it stale or
//! resized, and the installed [`SurfaceChangePolicy`] produces a replacement.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use framepace_renderer::RenderContext;
//! use framepace_rhi::headless::{HeadlessDevice, HeadlessSurface, HeadlessWindow};
//! use framepace_rhi::{GpuDevice, vk};
//!
//! # fn example() -> Result<(), framepace_rhi::RhiError> {
//! let device = Arc::new(HeadlessDevice::new());
//! let window = Arc::new(HeadlessWindow::new(1280, 720));
//! let surface = HeadlessSurface::new(Arc::clone(&device), window, 3);
//!
//! let mut context = RenderContext::new(Arc::clone(&device), surface)?;
//! context.prepare()?;
//!
//! for _ in 0..5 {
//!     let acquired = context.begin_frame()?;
//!
//!     let queue = device.graphics_queue();
//!     let ctx = context.request_command_context(queue)?;
//!     ctx.record(|ctx| ctx.draw(3, 1, 0, 0))?;
//!
//!     let rendered = context.submit(queue, &ctx, acquired, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)?;
//!     context.end_frame(rendered)?;
//! }
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info, trace};

use framepace_rhi::{GpuDevice, PresentSurface, Queue, RhiError, RhiResult, Submission};

use crate::FENCE_TIMEOUT;
use crate::command_pool::{CommandContext, CommandPool, ResetMode};
use crate::render_frame::RenderFrame;
use crate::surface_policy::{ResizeToDrawable, SurfaceChangePolicy};
use crate::sync::FencePool;

/// Builds the [`RenderFrame`] for a ring slot.
pub type FrameFactory<D> = Box<dyn Fn(&Arc<D>, usize) -> RhiResult<RenderFrame<D>> + Send>;

/// The slot and surface image of the frame between begin and end.
#[derive(Debug, Clone, Copy)]
struct ActiveFrame {
    slot: usize,
    image_index: u32,
}

/// Owner of the presentation surface and the ring of per-frame resources.
///
/// # Thread Safety
///
/// The context is driven from one thread through `&mut self`. It is `Send`
/// when the device and surface are, so it can be moved to a render thread.
pub struct RenderContext<D: GpuDevice + 'static, S: PresentSurface + 'static> {
    device: Arc<D>,
    // Frames go before the surface so that cached framebuffers are destroyed
    // before the image views they reference.
    frames: Vec<RenderFrame<D>>,
    swapchain: S,
    surface_extent: vk::Extent2D,
    frame_factory: FrameFactory<D>,
    surface_policy: Box<dyn SurfaceChangePolicy<S> + Send>,
    unscoped_pool: CommandPool<D>,
    unscoped_fences: FencePool<D>,
    present_queue: Queue,
    next_frame_index: usize,
    active: Option<ActiveFrame>,
}

impl<D: GpuDevice + 'static, S: PresentSurface + 'static> RenderContext<D, S> {
    /// Takes ownership of `surface` and creates the unscoped command pool.
    ///
    /// The frame ring is not built until [`prepare`](Self::prepare) or
    /// [`prepare_with`](Self::prepare_with). Stale surfaces are handled by
    /// [`ResizeToDrawable`] unless another policy is installed.
    ///
    /// # Errors
    ///
    /// Returns an error if the unscoped command pool cannot be created.
    pub fn new(device: Arc<D>, surface: S) -> RhiResult<Self> {
        let graphics_family = device.graphics_queue().family_index();
        let unscoped_pool =
            CommandPool::new(Arc::clone(&device), graphics_family, ResetMode::ResetPool)?;
        let unscoped_fences = FencePool::new(Arc::clone(&device));
        let present_queue = device.present_queue();
        let surface_extent = surface.extent();

        debug!(
            "Render context created for {}x{} surface with {} images",
            surface_extent.width,
            surface_extent.height,
            surface.image_count()
        );

        Ok(Self {
            device,
            frames: Vec::new(),
            swapchain: surface,
            surface_extent,
            frame_factory: Box::new(default_frame),
            surface_policy: Box::new(ResizeToDrawable),
            unscoped_pool,
            unscoped_fences,
            present_queue,
            next_frame_index: 0,
            active: None,
        })
    }

    /// Replaces the stale-surface policy.
    pub fn with_surface_policy<P>(mut self, policy: P) -> Self
    where
        P: SurfaceChangePolicy<S> + Send + 'static,
    {
        self.surface_policy = Box::new(policy);
        self
    }

    /// Builds the frame ring with default [`RenderFrame`]s.
    ///
    /// # Errors
    ///
    /// See [`prepare_with`](Self::prepare_with).
    pub fn prepare(&mut self) -> RhiResult<()> {
        self.prepare_with(default_frame)
    }

    /// Builds the frame ring with `factory`, one frame per surface image.
    ///
    /// The factory is kept and used again whenever the ring is rebuilt after a
    /// surface change. Calling this on a prepared context waits for idle and
    /// rebuilds the ring from scratch.
    ///
    /// # Errors
    ///
    /// Returns an error if the idle wait fails or the factory fails. A failed
    /// factory leaves the previous ring and factory in place.
    ///
    /// # Panics
    ///
    /// Panics if a frame is active.
    pub fn prepare_with<F>(&mut self, factory: F) -> RhiResult<()>
    where
        F: Fn(&Arc<D>, usize) -> RhiResult<RenderFrame<D>> + Send + 'static,
    {
        assert!(
            self.active.is_none(),
            "RenderContext::prepare called while a frame is active; call end_frame first"
        );

        if !self.frames.is_empty() {
            self.wait_idle()?;
        }

        let factory: FrameFactory<D> = Box::new(factory);
        let frames = build_ring(&self.device, &factory, self.swapchain.image_count())?;
        self.frames = frames;
        self.frame_factory = factory;
        self.next_frame_index = 0;
        Ok(())
    }

    /// Starts a frame and returns the semaphore signaled when the acquired
    /// surface image can be written.
    ///
    /// Blocks until the next slot's previous GPU work has completed.
    ///
    /// If the surface is stale, the surface-change policy runs, and on a
    /// replacement the context rebuilds and retries once on the first slot of
    /// the new ring.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SurfaceOutOfDate`] if no usable surface exists after
    /// the retry, in which case no frame is active and the caller skips the
    /// frame. Device errors propagate.
    ///
    /// # Panics
    ///
    /// Panics if a frame is already active or the ring was never prepared.
    pub fn begin_frame(&mut self) -> RhiResult<vk::Semaphore> {
        assert!(
            self.active.is_none(),
            "RenderContext::begin_frame called while a frame is active; call end_frame first"
        );
        assert!(
            !self.frames.is_empty(),
            "RenderContext::begin_frame called before prepare"
        );

        if let Some(semaphore) = self.try_begin_frame()? {
            return Ok(semaphore);
        }

        debug!("Surface out of date on acquire");
        if !self.handle_surface_changes()? {
            return Err(RhiError::SurfaceOutOfDate);
        }
        self.try_begin_frame()?.ok_or(RhiError::SurfaceOutOfDate)
    }

    /// One acquire attempt on the next slot. `None` means the surface is stale.
    fn try_begin_frame(&mut self) -> RhiResult<Option<vk::Semaphore>> {
        let slot = self.next_frame_index;
        let frame = &mut self.frames[slot];
        frame.reset()?;
        let semaphore = frame.request_semaphore()?;

        let image_index = match self.swapchain.acquire_next_image(semaphore) {
            Ok((image_index, suboptimal)) => {
                if suboptimal {
                    debug!("Acquired image from a suboptimal surface");
                }
                image_index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        self.active = Some(ActiveFrame { slot, image_index });
        self.next_frame_index = (slot + 1) % self.frames.len();
        trace!(slot, image_index, "frame begun");
        Ok(Some(semaphore))
    }

    /// Presents the acquired image once `signal` is signaled and ends the frame.
    ///
    /// An out-of-date result runs the surface-change policy, and a replacement
    /// is swapped in before this returns. A suboptimal result does the same
    /// only when the drawable extent no longer matches
    /// [`surface_extent`](Self::surface_extent). Otherwise it is logged and the
    /// surface kept, since some presentation engines report suboptimal on
    /// every frame (pre-rotation, for example).
    ///
    /// No fence covers the present itself. `signal` should come from
    /// [`submit`](Self::submit) on this frame, so it is recycled only when the
    /// slot comes around again, after the ring's other frames have been
    /// acquired. That relies on the presentation engine having consumed the
    /// wait by then; nothing here enforces it.
    ///
    /// # Errors
    ///
    /// Presentation errors other than a stale surface propagate, as do errors
    /// from the replacement path. The frame is ended either way.
    ///
    /// # Panics
    ///
    /// Panics if no frame is active.
    pub fn end_frame(&mut self, signal: vk::Semaphore) -> RhiResult<()> {
        let Some(active) = self.active.take() else {
            panic!("RenderContext::end_frame called without an active frame");
        };

        match self
            .swapchain
            .present(self.present_queue, active.image_index, signal)
        {
            Ok(false) => {
                trace!(slot = active.slot, "frame presented");
                Ok(())
            }
            Ok(true) => {
                let extent = self.swapchain.current_extent()?;
                if extent == self.surface_extent {
                    debug!("Presented to a suboptimal surface");
                    return Ok(());
                }
                debug!(
                    "Surface suboptimal on present, drawable now {}x{}",
                    extent.width, extent.height
                );
                self.handle_surface_changes()?;
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("Surface out of date on present");
                self.handle_surface_changes()?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Asks the policy for a replacement and swaps it in. Returns whether a
    /// replacement was made.
    fn handle_surface_changes(&mut self) -> RhiResult<bool> {
        match self.surface_policy.on_surface_stale(&self.swapchain)? {
            Some(replacement) => {
                self.update_swapchain(replacement)?;
                Ok(true)
            }
            None => {
                debug!("No replacement surface available");
                Ok(false)
            }
        }
    }

    /// Replaces the surface and rebuilds the frame ring for it.
    ///
    /// All work in flight on every slot, and on the device, completes before
    /// the old ring and surface are dropped. The new ring has one frame per
    /// image of `new_surface` and is built with the stored frame factory.
    ///
    /// # Errors
    ///
    /// Returns an error if the idle wait or the ring rebuild fails. On a failed
    /// rebuild `new_surface` is dropped and the old surface and ring stay in
    /// place, idle.
    ///
    /// # Panics
    ///
    /// Panics if a frame is active.
    pub fn update_swapchain(&mut self, new_surface: S) -> RhiResult<()> {
        assert!(
            self.active.is_none(),
            "RenderContext::update_swapchain called while a frame is active; call end_frame first"
        );

        self.wait_idle()?;

        let frames = build_ring(&self.device, &self.frame_factory, new_surface.image_count())?;
        let old_frames = self.frames.len();

        // Old ring first: its framebuffers reference the old surface's views.
        drop(std::mem::replace(&mut self.frames, frames));
        drop(std::mem::replace(&mut self.swapchain, new_surface));
        self.surface_extent = self.swapchain.extent();
        self.next_frame_index = 0;

        info!(
            "Swapchain replaced: {}x{}, {:?}, {} images (ring {} -> {})",
            self.surface_extent.width,
            self.surface_extent.height,
            self.swapchain.present_mode(),
            self.swapchain.image_count(),
            old_frames,
            self.frames.len()
        );
        Ok(())
    }

    /// Returns a recording context from the active frame for `queue`'s family.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool or buffer cannot be created.
    ///
    /// # Panics
    ///
    /// Panics if no frame is active.
    pub fn request_command_context(&mut self, queue: Queue) -> RhiResult<CommandContext<D>> {
        self.active_frame_mut("request_command_context")
            .request_command_context(queue)
    }

    /// Returns a recording context for one-off work outside the frame loop.
    ///
    /// Contexts come from a graphics-family pool owned by the context, which
    /// is recycled on every [`wait_idle`](Self::wait_idle).
    ///
    /// # Errors
    ///
    /// Returns an error if a buffer cannot be allocated.
    pub fn request_command_context_unscoped(&mut self) -> RhiResult<CommandContext<D>> {
        self.unscoped_pool.request_command_buffer()
    }

    /// Submits unscoped work and blocks until it completes.
    ///
    /// # Errors
    ///
    /// Returns an error if submission or the wait fails.
    ///
    /// # Panics
    ///
    /// Panics if `context` was recorded for a different queue family.
    pub fn submit_unscoped_and_wait(
        &mut self,
        queue: Queue,
        context: &CommandContext<D>,
    ) -> RhiResult<()> {
        check_family("submit_unscoped_and_wait", queue, context);

        let fence = self.unscoped_fences.request_fence()?;
        let buffers = [context.handle()];
        if let Err(e) = self
            .device
            .queue_submit(queue, &Submission::new(&buffers), fence)
        {
            self.unscoped_fences.release_unsubmitted(fence);
            return Err(e);
        }

        self.unscoped_fences.wait(FENCE_TIMEOUT)?;
        self.unscoped_fences.reset()
    }

    /// Returns a semaphore from the active frame, recycled when its slot is
    /// next reset.
    ///
    /// # Panics
    ///
    /// Panics if no frame is active.
    pub fn request_sync_handle(&mut self) -> RhiResult<vk::Semaphore> {
        self.active_frame_mut("request_sync_handle")
            .request_semaphore()
    }

    /// Submits `context` to `queue`, waiting on `wait` at `wait_stage`, and
    /// returns a semaphore signaled when the work completes.
    ///
    /// A null `wait` submits without waiting. The submission also signals a
    /// fence of the active frame, which the next visit of the slot waits on.
    /// That fence does not cover a present waiting on the returned semaphore;
    /// see [`end_frame`](Self::end_frame).
    ///
    /// # Errors
    ///
    /// Returns an error if handle creation or submission fails.
    ///
    /// # Panics
    ///
    /// Panics if no frame is active or `context` was recorded for a different
    /// queue family.
    pub fn submit(
        &mut self,
        queue: Queue,
        context: &CommandContext<D>,
        wait: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
    ) -> RhiResult<vk::Semaphore> {
        check_family("submit", queue, context);

        let frame = self.active_frame_mut("submit");
        let signal = frame.request_semaphore()?;
        let fence = frame.request_fence()?;

        let buffers = [context.handle()];
        let waits = [wait];
        let stages = [wait_stage];
        let signals = [signal];
        let mut submission = Submission::new(&buffers).signal(&signals);
        if wait != vk::Semaphore::null() {
            submission = submission.wait(&waits, &stages);
        }

        self.submit_with_frame_fence(queue, &submission, fence)?;
        Ok(signal)
    }

    /// Submits `context` to `queue` with no semaphores.
    ///
    /// The active frame's next visit still waits for it.
    ///
    /// # Panics
    ///
    /// Panics if no frame is active or `context` was recorded for a different
    /// queue family.
    pub fn submit_standalone(&mut self, queue: Queue, context: &CommandContext<D>) -> RhiResult<()> {
        check_family("submit_standalone", queue, context);

        let fence = self.active_frame_mut("submit_standalone").request_fence()?;
        let buffers = [context.handle()];
        self.submit_with_frame_fence(queue, &Submission::new(&buffers), fence)
    }

    fn submit_with_frame_fence(
        &mut self,
        queue: Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> RhiResult<()> {
        if let Err(e) = self.device.queue_submit(queue, submission, fence) {
            self.active_frame_mut("submit")
                .release_unsubmitted_fence(fence);
            return Err(e);
        }
        Ok(())
    }

    /// Blocks until the current slot's submitted work has completed.
    ///
    /// The current slot is the active one, or the most recently begun one
    /// between frames. Nothing is presented or reset.
    ///
    /// # Errors
    ///
    /// Returns an error if the fence wait fails.
    pub fn wait_frame(&self) -> RhiResult<()> {
        if self.frames.is_empty() {
            return Ok(());
        }
        let slot = match self.active {
            Some(active) => active.slot,
            None => (self.next_frame_index + self.frames.len() - 1) % self.frames.len(),
        };
        self.frames[slot].wait()
    }

    /// Blocks until every slot's work and the whole device are idle, then
    /// recycles the unscoped command pool.
    ///
    /// # Errors
    ///
    /// Returns an error if any wait or the pool reset fails.
    pub fn wait_idle(&mut self) -> RhiResult<()> {
        for frame in &self.frames {
            frame.wait()?;
        }
        self.device.wait_idle()?;
        self.unscoped_pool.reset()
    }

    /// # Panics
    ///
    /// Panics if no frame is active.
    pub fn get_active_frame(&self) -> &RenderFrame<D> {
        let Some(active) = self.active else {
            panic!("RenderContext::get_active_frame called without an active frame");
        };
        &self.frames[active.slot]
    }

    /// # Panics
    ///
    /// Panics if no frame is active.
    pub fn get_active_frame_mut(&mut self) -> &mut RenderFrame<D> {
        self.active_frame_mut("get_active_frame_mut")
    }

    fn active_frame_mut(&mut self, call: &str) -> &mut RenderFrame<D> {
        let Some(active) = self.active else {
            panic!("RenderContext::{call} called without an active frame");
        };
        &mut self.frames[active.slot]
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[inline]
    pub fn swapchain(&self) -> &S {
        &self.swapchain
    }

    /// The extent of the current surface, for viewports and scissors.
    #[inline]
    pub fn surface_extent(&self) -> vk::Extent2D {
        self.surface_extent
    }

    /// Number of frames in the ring; zero before the ring is prepared.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The frame of ring slot `slot`, active or not.
    #[inline]
    pub fn frame(&self, slot: usize) -> Option<&RenderFrame<D>> {
        self.frames.get(slot)
    }

    #[inline]
    pub fn is_frame_active(&self) -> bool {
        self.active.is_some()
    }

    #[inline]
    pub fn active_frame_index(&self) -> Option<usize> {
        self.active.map(|active| active.slot)
    }

    #[inline]
    pub fn active_image_index(&self) -> Option<u32> {
        self.active.map(|active| active.image_index)
    }

    #[inline]
    pub fn present_queue(&self) -> Queue {
        self.present_queue
    }
}

impl<D: GpuDevice + 'static, S: PresentSurface + 'static> Drop for RenderContext<D, S> {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            error!("Failed to wait for idle while dropping render context: {}", e);
        }
        self.frames.clear();
        debug!("Render context destroyed");
    }
}

/// Builds one frame per surface image. Nothing is installed on failure.
fn build_ring<D: GpuDevice>(
    device: &Arc<D>,
    factory: &FrameFactory<D>,
    image_count: u32,
) -> RhiResult<Vec<RenderFrame<D>>> {
    let frames = (0..image_count as usize)
        .map(|slot| factory(device, slot))
        .collect::<RhiResult<Vec<_>>>()?;
    info!("Frame ring built with {} frames", frames.len());
    Ok(frames)
}

fn default_frame<D: GpuDevice>(device: &Arc<D>, slot: usize) -> RhiResult<RenderFrame<D>> {
    Ok(RenderFrame::new(Arc::clone(device), slot))
}

fn check_family<D: GpuDevice>(call: &str, queue: Queue, context: &CommandContext<D>) {
    assert_eq!(
        queue.family_index(),
        context.queue_family_index(),
        "RenderContext::{call}: command context recorded for family {} submitted to a queue of family {}",
        context.queue_family_index(),
        queue.family_index()
    );
}
