//! Per-frame resource set.
//!
//! A [`RenderFrame`] holds everything one slot of the frame ring records and
//! submits with: a command pool per queue family, a semaphore pool, a fence
//! pool, and caches of framebuffers and descriptor sets. It is created when
//! the ring is built, reset at the start of every visit to its slot, and
//! destroyed only with the ring.
//!
//! Construction allocates nothing. Device objects are created on first use and
//! kept for the lifetime of the frame.
//!
//! # Example
//!
//! A custom frame factory for [`RenderContext::prepare_with`](crate::RenderContext::prepare_with):
//!
//! ```
//! use std::sync::Arc;
//! use framepace_renderer::{RenderFrame, ResetMode};
//! use framepace_rhi::headless::HeadlessDevice;
//!
//! use framepace_rhi::RhiResult;
//!
//! let factory = |device: &Arc<HeadlessDevice>, slot: usize| -> RhiResult<RenderFrame<HeadlessDevice>> {
//!     Ok(RenderFrame::new(Arc::clone(device), slot)
//!         .with_reset_mode(ResetMode::ResetIndividually)
//!         .with_descriptor_capacity(64))
//! };
//!
//! let frame = factory(&Arc::new(HeadlessDevice::new()), 1).unwrap();
//! assert_eq!(frame.slot(), 1);
//! assert_eq!(frame.descriptor_capacity(), 64);
//! ```

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace};

use framepace_rhi::descriptor::DescriptorSetKey;
use framepace_rhi::framebuffer::FramebufferKey;
use framepace_rhi::{GpuDevice, Queue, RhiResult};

use crate::FENCE_TIMEOUT;
use crate::cache::FrameCache;
use crate::command_pool::{CommandContext, CommandPool, ResetMode};
use crate::sync::{FencePool, SemaphorePool};

/// Descriptor sets a frame's descriptor pool holds unless configured otherwise.
pub const DEFAULT_DESCRIPTOR_CAPACITY: u32 = 256;

/// Resources owned by one slot of the frame ring.
pub struct RenderFrame<D: GpuDevice> {
    device: Arc<D>,
    slot: usize,
    reset_mode: ResetMode,
    descriptor_capacity: u32,
    command_pools: HashMap<u32, CommandPool<D>>,
    semaphore_pool: SemaphorePool<D>,
    fence_pool: FencePool<D>,
    descriptor_pool: Option<vk::DescriptorPool>,
    descriptor_sets: FrameCache<DescriptorSetKey, vk::DescriptorSet>,
    framebuffers: FrameCache<FramebufferKey, vk::Framebuffer>,
}

impl<D: GpuDevice> RenderFrame<D> {
    /// An empty frame for ring slot `slot`.
    pub fn new(device: Arc<D>, slot: usize) -> Self {
        Self {
            semaphore_pool: SemaphorePool::new(Arc::clone(&device)),
            fence_pool: FencePool::new(Arc::clone(&device)),
            device,
            slot,
            reset_mode: ResetMode::default(),
            descriptor_capacity: DEFAULT_DESCRIPTOR_CAPACITY,
            command_pools: HashMap::new(),
            descriptor_pool: None,
            descriptor_sets: FrameCache::new(),
            framebuffers: FrameCache::new(),
        }
    }

    /// Sets how this frame's command pools are reset. Affects pools created
    /// after the call, so it belongs in the frame factory.
    pub fn with_reset_mode(mut self, reset_mode: ResetMode) -> Self {
        self.reset_mode = reset_mode;
        self
    }

    /// Sets how many descriptor sets the frame's descriptor pool holds.
    ///
    /// # Panics
    ///
    /// Panics if `max_sets` is zero.
    pub fn with_descriptor_capacity(mut self, max_sets: u32) -> Self {
        assert!(max_sets > 0, "RenderFrame::with_descriptor_capacity: capacity must be non-zero");
        self.descriptor_capacity = max_sets;
        self
    }

    /// Blocks until all work submitted with this frame's fences has completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the fence wait fails.
    pub fn wait(&self) -> RhiResult<()> {
        self.fence_pool.wait(FENCE_TIMEOUT)
    }

    /// Prepares the frame for a new visit of its slot.
    ///
    /// Waits for the previous visit's work, then recycles fences, command
    /// buffers and semaphores. Cached framebuffers and descriptor sets are
    /// kept.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting or any device reset fails.
    pub fn reset(&mut self) -> RhiResult<()> {
        self.wait()?;
        self.fence_pool.reset()?;
        for pool in self.command_pools.values_mut() {
            pool.reset()?;
        }
        self.semaphore_pool.reset();
        trace!(slot = self.slot, "frame reset");
        Ok(())
    }

    /// Returns a recording context from this frame's pool for `queue`'s family.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool or buffer cannot be created.
    pub fn request_command_context(&mut self, queue: Queue) -> RhiResult<CommandContext<D>> {
        let family = queue.family_index();
        let pool = match self.command_pools.entry(family) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let pool = CommandPool::new(Arc::clone(&self.device), family, self.reset_mode)?;
                debug!(slot = self.slot, family, "frame command pool created");
                entry.insert(pool)
            }
        };
        pool.request_command_buffer()
    }

    /// Returns a semaphore not handed out since the last reset.
    pub fn request_semaphore(&mut self) -> RhiResult<vk::Semaphore> {
        self.semaphore_pool.request_semaphore()
    }

    /// Returns an unsignaled fence that the next [`reset`](Self::reset) waits on.
    pub fn request_fence(&mut self) -> RhiResult<vk::Fence> {
        self.fence_pool.request_fence()
    }

    /// Takes back a fence from [`request_fence`](Self::request_fence) that was
    /// never submitted.
    pub(crate) fn release_unsubmitted_fence(&mut self, fence: vk::Fence) {
        self.fence_pool.release_unsubmitted(fence);
    }

    /// Returns the cached framebuffer for `key`, creating it on first request.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails. Nothing is cached in that case.
    pub fn request_framebuffer(&mut self, key: &FramebufferKey) -> RhiResult<vk::Framebuffer> {
        let device = &self.device;
        self.framebuffers
            .get_or_try_insert_with(key, || device.create_framebuffer(key))
    }

    /// Returns the cached descriptor set for `key`, allocating and writing it
    /// on first request.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor pool cannot be created, or is full.
    pub fn request_descriptor_set(&mut self, key: &DescriptorSetKey) -> RhiResult<vk::DescriptorSet> {
        let device = &self.device;
        let descriptor_pool = &mut self.descriptor_pool;
        let capacity = self.descriptor_capacity;
        let slot = self.slot;

        self.descriptor_sets.get_or_try_insert_with(key, || {
            let pool = match *descriptor_pool {
                Some(pool) => pool,
                None => {
                    let pool = device.create_descriptor_pool(capacity)?;
                    debug!(slot, capacity, "frame descriptor pool created");
                    *descriptor_pool = Some(pool);
                    pool
                }
            };
            device.allocate_descriptor_set(pool, key)
        })
    }

    /// Destroys every cached framebuffer.
    ///
    /// The caller guarantees none is still used by pending work, typically
    /// after views they reference have been recreated.
    pub fn clear_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain() {
            self.device.destroy_framebuffer(framebuffer);
        }
    }

    /// Frees every cached descriptor set by resetting the descriptor pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool reset fails.
    pub fn clear_descriptor_sets(&mut self) -> RhiResult<()> {
        if let Some(pool) = self.descriptor_pool {
            self.device.reset_descriptor_pool(pool)?;
        }
        self.descriptor_sets.drain();
        Ok(())
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn reset_mode(&self) -> ResetMode {
        self.reset_mode
    }

    #[inline]
    pub fn descriptor_capacity(&self) -> u32 {
        self.descriptor_capacity
    }

    #[inline]
    pub fn semaphores_in_use(&self) -> usize {
        self.semaphore_pool.in_use()
    }

    #[inline]
    pub fn fences_in_use(&self) -> usize {
        self.fence_pool.in_use()
    }

    /// Command buffers requested since the last reset, over all queue families.
    pub fn command_buffers_in_use(&self) -> usize {
        self.command_pools.values().map(CommandPool::in_use).sum()
    }

    #[inline]
    pub fn cached_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    #[inline]
    pub fn cached_descriptor_sets(&self) -> usize {
        self.descriptor_sets.len()
    }
}

impl<D: GpuDevice> Drop for RenderFrame<D> {
    fn drop(&mut self) {
        self.clear_framebuffers();
        if let Some(pool) = self.descriptor_pool.take() {
            self.device.destroy_descriptor_pool(pool);
        }
        // Command and sync pools destroy their own handles.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use framepace_rhi::descriptor::BufferBinding;
    use framepace_rhi::headless::{DeviceEvent, HeadlessDevice};
    use framepace_rhi::{RhiError, Submission};

    fn framebuffer_key(view: u64) -> FramebufferKey {
        FramebufferKey::new(
            vk::RenderPass::from_raw(0xAA),
            vec![vk::ImageView::from_raw(view)],
            vk::Extent2D {
                width: 640,
                height: 480,
            },
        )
    }

    fn descriptor_key(offset: u64) -> DescriptorSetKey {
        DescriptorSetKey::new(vk::DescriptorSetLayout::from_raw(0xBB)).with_buffer(
            BufferBinding::uniform(0, vk::Buffer::from_raw(0xCC), offset, 256),
        )
    }

    fn count(device: &HeadlessDevice, pred: impl Fn(&DeviceEvent) -> bool) -> usize {
        device.events().iter().filter(|e| pred(e)).count()
    }

    #[test]
    fn test_new_frame_allocates_nothing() {
        let device = Arc::new(HeadlessDevice::new());
        let frame = RenderFrame::new(Arc::clone(&device), 0);

        assert_eq!(frame.descriptor_capacity(), DEFAULT_DESCRIPTOR_CAPACITY);
        assert_eq!(frame.reset_mode(), ResetMode::ResetPool);
        assert!(device.events().is_empty());
    }

    #[test]
    fn test_framebuffer_cache_hits() {
        let device = Arc::new(HeadlessDevice::new());
        let mut frame = RenderFrame::new(Arc::clone(&device), 0);

        let a = frame.request_framebuffer(&framebuffer_key(1)).unwrap();
        let b = frame.request_framebuffer(&framebuffer_key(1)).unwrap();
        let c = frame.request_framebuffer(&framebuffer_key(2)).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(frame.cached_framebuffers(), 2);
        assert_eq!(
            count(&device, |e| matches!(e, DeviceEvent::CreateFramebuffer(_))),
            2
        );
    }

    #[test]
    fn test_descriptor_cache_hits_and_survives_reset() {
        let device = Arc::new(HeadlessDevice::new());
        let mut frame = RenderFrame::new(Arc::clone(&device), 0);

        let first = frame.request_descriptor_set(&descriptor_key(0)).unwrap();
        frame.reset().unwrap();
        let again = frame.request_descriptor_set(&descriptor_key(0)).unwrap();

        assert_eq!(first, again);
        assert_eq!(frame.cached_descriptor_sets(), 1);
        assert_eq!(
            count(&device, |e| matches!(e, DeviceEvent::AllocateDescriptorSet(_))),
            1
        );
        assert_eq!(
            count(&device, |e| matches!(e, DeviceEvent::CreateDescriptorPool(_))),
            1
        );
    }

    #[test]
    fn test_descriptor_capacity_exhaustion_propagates() {
        let device = Arc::new(HeadlessDevice::new());
        let mut frame = RenderFrame::new(Arc::clone(&device), 0).with_descriptor_capacity(1);

        frame.request_descriptor_set(&descriptor_key(0)).unwrap();
        let err = frame.request_descriptor_set(&descriptor_key(256)).unwrap_err();

        assert!(matches!(
            err,
            RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        ));
        assert_eq!(frame.cached_descriptor_sets(), 1);

        frame.clear_descriptor_sets().unwrap();
        assert_eq!(frame.cached_descriptor_sets(), 0);
        frame.request_descriptor_set(&descriptor_key(256)).unwrap();
    }

    #[test]
    fn test_clear_framebuffers_destroys_them() {
        let device = Arc::new(HeadlessDevice::new());
        let mut frame = RenderFrame::new(Arc::clone(&device), 0);
        let fb = frame.request_framebuffer(&framebuffer_key(1)).unwrap();

        frame.clear_framebuffers();

        assert_eq!(frame.cached_framebuffers(), 0);
        assert!(device.events().contains(&DeviceEvent::DestroyFramebuffer(fb)));
    }

    #[test]
    fn test_command_pools_grouped_by_family() {
        let device = Arc::new(HeadlessDevice::new());
        let mut frame = RenderFrame::new(Arc::clone(&device), 0);

        let graphics = frame.request_command_context(device.queue(0)).unwrap();
        let compute = frame.request_command_context(device.queue(1)).unwrap();
        frame.request_command_context(device.queue(0)).unwrap();

        assert_eq!(graphics.queue_family_index(), 0);
        assert_eq!(compute.queue_family_index(), 1);
        assert_eq!(frame.command_buffers_in_use(), 3);
        assert_eq!(
            count(&device, |e| matches!(e, DeviceEvent::CreateCommandPool { .. })),
            2
        );
    }

    #[test]
    fn test_reset_waits_then_recycles() {
        let device = Arc::new(HeadlessDevice::new());
        let mut frame = RenderFrame::new(Arc::clone(&device), 0);

        let ctx = frame.request_command_context(device.graphics_queue()).unwrap();
        ctx.record(|_| ()).unwrap();
        let fence = frame.request_fence().unwrap();
        frame.request_semaphore().unwrap();
        let buffers = [ctx.handle()];
        device
            .queue_submit(device.graphics_queue(), &Submission::new(&buffers), fence)
            .unwrap();
        device.clear_events();

        frame.reset().unwrap();

        assert_eq!(frame.fences_in_use(), 0);
        assert_eq!(frame.semaphores_in_use(), 0);
        assert_eq!(frame.command_buffers_in_use(), 0);

        let events = device.events();
        assert_eq!(events[0], DeviceEvent::WaitForFences(vec![fence]));
        assert_eq!(events[1], DeviceEvent::ResetFences(vec![fence]));
        assert!(matches!(events[2], DeviceEvent::ResetCommandPool(_)));
    }

    #[test]
    fn test_drop_releases_everything() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let mut frame = RenderFrame::new(Arc::clone(&device), 0);
            frame.request_command_context(device.graphics_queue()).unwrap();
            frame.request_semaphore().unwrap();
            frame.request_fence().unwrap();
            frame.request_framebuffer(&framebuffer_key(1)).unwrap();
            frame.request_descriptor_set(&descriptor_key(0)).unwrap();
            assert!(device.live_object_count() > 0);
        }
        assert_eq!(device.live_object_count(), 0);
    }
}
