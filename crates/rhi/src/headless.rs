//! Simulated device and presentation surface.
//!
//! [`HeadlessDevice`] implements [`GpuDevice`] without a GPU. Handles are
//! minted from a counter, every call is appended to an event log, and
//! submitted work completes either immediately or only when a test calls
//! [`HeadlessDevice::complete_next`] / [`HeadlessDevice::complete_all`]. That
//! makes fence waits observable: a blocked waiter is counted, so tests can
//! assert that a thread is stuck on the GPU before letting it go.
//!
//! [`HeadlessSurface`] implements [`PresentSurface`] on top of a
//! [`HeadlessWindow`] whose size can change underneath it. Once the window
//! and the surface disagree on the extent, acquire and present report
//! `ERROR_OUT_OF_DATE_KHR`, exactly like a resized Vulkan swapchain.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ash::vk;
use ash::vk::Handle;
use tracing::{debug, trace};

use crate::descriptor::DescriptorSetKey;
use crate::framebuffer::FramebufferKey;
use crate::gpu::{GpuDevice, PresentSurface, Submission};
use crate::queue::Queue;
use crate::{RhiError, RhiResult};

/// How submitted work completes on a [`HeadlessDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Fences are signaled as soon as the submission is made.
    #[default]
    Immediate,
    /// Submissions stay pending until completed by the test.
    Manual,
}

/// A command recorded into a simulated command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSet {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

/// Everything observable that happened on a [`HeadlessDevice`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitForFences(Vec<vk::Fence>),
    ResetFences(Vec<vk::Fence>),
    CreateCommandPool {
        pool: vk::CommandPool,
        queue_family_index: u32,
    },
    DestroyCommandPool(vk::CommandPool),
    ResetCommandPool(vk::CommandPool),
    AllocateCommandBuffer(vk::CommandBuffer),
    ResetCommandBuffer(vk::CommandBuffer),
    Submit {
        queue: Queue,
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    WaitIdle,
    CreateFramebuffer(vk::Framebuffer),
    DestroyFramebuffer(vk::Framebuffer),
    CreateDescriptorPool(vk::DescriptorPool),
    ResetDescriptorPool(vk::DescriptorPool),
    DestroyDescriptorPool(vk::DescriptorPool),
    AllocateDescriptorSet(vk::DescriptorSet),
    CreateSurface {
        surface: vk::SwapchainKHR,
        image_count: u32,
        extent: vk::Extent2D,
    },
    DestroySurface(vk::SwapchainKHR),
    Acquire {
        surface: vk::SwapchainKHR,
        image_index: u32,
    },
    Present {
        surface: vk::SwapchainKHR,
        image_index: u32,
    },
}

#[derive(Debug, Default)]
struct CommandBufferState {
    pool: u64,
    recording: bool,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug)]
struct DescriptorPoolState {
    max_sets: u32,
    sets: Vec<u64>,
}

#[derive(Debug)]
struct PendingSubmission {
    fence: Option<u64>,
}

#[derive(Debug)]
struct State {
    next_handle: u64,
    mode: CompletionMode,
    fences: HashMap<u64, bool>,
    semaphores: HashSet<u64>,
    command_pools: HashMap<u64, Vec<u64>>,
    command_buffers: HashMap<u64, CommandBufferState>,
    framebuffers: HashSet<u64>,
    descriptor_pools: HashMap<u64, DescriptorPoolState>,
    pending: VecDeque<PendingSubmission>,
    events: Vec<DeviceEvent>,
    blocked_waiters: usize,
}

impl State {
    fn mint(&mut self) -> u64 {
        let raw = self.next_handle;
        self.next_handle += 1;
        raw
    }

    fn all_signaled(&self, fences: &[vk::Fence]) -> bool {
        fences
            .iter()
            .all(|f| self.fences.get(&f.as_raw()).copied().unwrap_or(false))
    }

    fn complete(&mut self, submission: PendingSubmission) {
        if let Some(fence) = submission.fence
            && let Some(signaled) = self.fences.get_mut(&fence)
        {
            *signaled = true;
        }
    }

    fn command_buffer(&mut self, command_buffer: vk::CommandBuffer) -> &mut CommandBufferState {
        self.command_buffers
            .get_mut(&command_buffer.as_raw())
            .unwrap_or_else(|| panic!("HeadlessDevice: unknown command buffer {command_buffer:?}"))
    }
}

/// A [`GpuDevice`] that runs no GPU work.
///
/// Graphics and present share queue family 0.
#[derive(Debug)]
pub struct HeadlessDevice {
    state: Mutex<State>,
    changed: Condvar,
    graphics_queue: Queue,
}

impl HeadlessDevice {
    /// A device whose submissions complete immediately.
    pub fn new() -> Self {
        Self::with_completion(CompletionMode::Immediate)
    }

    /// A device whose submissions complete only when told to.
    pub fn manual() -> Self {
        Self::with_completion(CompletionMode::Manual)
    }

    pub fn with_completion(mode: CompletionMode) -> Self {
        Self {
            state: Mutex::new(State {
                next_handle: 2,
                mode,
                fences: HashMap::new(),
                semaphores: HashSet::new(),
                command_pools: HashMap::new(),
                command_buffers: HashMap::new(),
                framebuffers: HashSet::new(),
                descriptor_pools: HashMap::new(),
                pending: VecDeque::new(),
                events: Vec::new(),
                blocked_waiters: 0,
            }),
            changed: Condvar::new(),
            graphics_queue: Queue::new(vk::Queue::from_raw(1), 0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(state: &mut State, event: DeviceEvent) {
        trace!(?event, "headless device");
        state.events.push(event);
    }

    /// A queue on an arbitrary family, for grouping tests.
    pub fn queue(&self, family_index: u32) -> Queue {
        if family_index == self.graphics_queue.family_index() {
            return self.graphics_queue;
        }
        Queue::new(vk::Queue::from_raw(0x1000 + u64::from(family_index)), family_index)
    }

    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.lock().mode = mode;
    }

    /// Completes the oldest pending submission. Returns `false` if none was
    /// pending.
    pub fn complete_next(&self) -> bool {
        let mut state = self.lock();
        let Some(submission) = state.pending.pop_front() else {
            return false;
        };
        state.complete(submission);
        drop(state);
        self.changed.notify_all();
        true
    }

    /// Completes every pending submission and returns how many there were.
    pub fn complete_all(&self) -> usize {
        let mut state = self.lock();
        let count = state.pending.len();
        while let Some(submission) = state.pending.pop_front() {
            state.complete(submission);
        }
        drop(state);
        self.changed.notify_all();
        count
    }

    pub fn pending_submissions(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of threads currently blocked in a fence or idle wait.
    pub fn blocked_waiters(&self) -> usize {
        self.lock().blocked_waiters
    }

    /// Blocks until at least `count` threads are waiting on the device, or
    /// `timeout` elapses. Returns whether the count was reached.
    pub fn wait_for_blocked_waiters(&self, count: usize, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| s.blocked_waiters < count)
            .unwrap_or_else(PoisonError::into_inner);
        state.blocked_waiters >= count
    }

    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.lock().all_signaled(&[fence])
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// Commands recorded into `command_buffer` since it was last begun or reset.
    pub fn recorded_commands(&self, command_buffer: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.lock()
            .command_buffers
            .get(&command_buffer.as_raw())
            .map(|cb| cb.commands.clone())
            .unwrap_or_default()
    }

    /// Objects created and not yet destroyed. Command buffers and descriptor
    /// sets are owned by their pools and not counted.
    pub fn live_object_count(&self) -> usize {
        let state = self.lock();
        state.fences.len()
            + state.semaphores.len()
            + state.command_pools.len()
            + state.framebuffers.len()
            + state.descriptor_pools.len()
    }

    /// Mints a handle for a presentation surface and logs its creation.
    fn register_surface(&self, image_count: u32, extent: vk::Extent2D) -> vk::SwapchainKHR {
        let mut state = self.lock();
        let surface = vk::SwapchainKHR::from_raw(state.mint());
        Self::record(
            &mut state,
            DeviceEvent::CreateSurface {
                surface,
                image_count,
                extent,
            },
        );
        surface
    }

    fn log(&self, event: DeviceEvent) {
        Self::record(&mut self.lock(), event);
    }

    fn push_command(&self, command_buffer: vk::CommandBuffer, command: RecordedCommand) {
        let mut state = self.lock();
        let cb = state.command_buffer(command_buffer);
        assert!(
            cb.recording,
            "HeadlessDevice: command recorded outside begin/end on {command_buffer:?}"
        );
        cb.commands.push(command);
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn graphics_queue(&self) -> Queue {
        self.graphics_queue
    }

    fn present_queue(&self) -> Queue {
        self.graphics_queue
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let mut state = self.lock();
        let raw = state.mint();
        state.semaphores.insert(raw);
        let semaphore = vk::Semaphore::from_raw(raw);
        Self::record(&mut state, DeviceEvent::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.lock();
        assert!(
            state.semaphores.remove(&semaphore.as_raw()),
            "HeadlessDevice: destroy of unknown semaphore {semaphore:?}"
        );
        Self::record(&mut state, DeviceEvent::DestroySemaphore(semaphore));
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.lock();
        let raw = state.mint();
        state.fences.insert(raw, signaled);
        let fence = vk::Fence::from_raw(raw);
        Self::record(&mut state, DeviceEvent::CreateFence(fence));
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.lock();
        assert!(
            state.fences.remove(&fence.as_raw()).is_some(),
            "HeadlessDevice: destroy of unknown fence {fence:?}"
        );
        Self::record(&mut state, DeviceEvent::DestroyFence(fence));
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> RhiResult<()> {
        let mut state = self.lock();
        Self::record(&mut state, DeviceEvent::WaitForFences(fences.to_vec()));

        if let Some(unknown) = fences
            .iter()
            .find(|f| !state.fences.contains_key(&f.as_raw()))
        {
            return Err(RhiError::InvalidHandle(format!("fence {unknown:?}")));
        }

        let deadline = if timeout_ns == u64::MAX {
            None
        } else {
            Instant::now().checked_add(Duration::from_nanos(timeout_ns))
        };

        while !state.all_signaled(fences) {
            state.blocked_waiters += 1;
            self.changed.notify_all();
            state = match deadline {
                None => self
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        state.blocked_waiters -= 1;
                        return Err(RhiError::VulkanError(vk::Result::TIMEOUT));
                    }
                    self.changed
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
            state.blocked_waiters -= 1;
        }

        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        let mut state = self.lock();
        for fence in fences {
            match state.fences.get_mut(&fence.as_raw()) {
                Some(signaled) => *signaled = false,
                None => return Err(RhiError::InvalidHandle(format!("fence {fence:?}"))),
            }
        }
        Self::record(&mut state, DeviceEvent::ResetFences(fences.to_vec()));
        Ok(())
    }

    fn create_command_pool(&self, queue_family_index: u32) -> RhiResult<vk::CommandPool> {
        let mut state = self.lock();
        let raw = state.mint();
        state.command_pools.insert(raw, Vec::new());
        let pool = vk::CommandPool::from_raw(raw);
        Self::record(
            &mut state,
            DeviceEvent::CreateCommandPool {
                pool,
                queue_family_index,
            },
        );
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.lock();
        let buffers = state
            .command_pools
            .remove(&pool.as_raw())
            .unwrap_or_else(|| panic!("HeadlessDevice: destroy of unknown command pool {pool:?}"));
        for buffer in buffers {
            state.command_buffers.remove(&buffer);
        }
        Self::record(&mut state, DeviceEvent::DestroyCommandPool(pool));
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        let mut state = self.lock();
        let buffers = state
            .command_pools
            .get(&pool.as_raw())
            .cloned()
            .ok_or_else(|| RhiError::InvalidHandle(format!("command pool {pool:?}")))?;
        for buffer in buffers {
            if let Some(cb) = state.command_buffers.get_mut(&buffer) {
                cb.recording = false;
                cb.commands.clear();
            }
        }
        Self::record(&mut state, DeviceEvent::ResetCommandPool(pool));
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer> {
        let mut state = self.lock();
        let raw = state.mint();
        state
            .command_pools
            .get_mut(&pool.as_raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("command pool {pool:?}")))?
            .push(raw);
        state.command_buffers.insert(
            raw,
            CommandBufferState {
                pool: pool.as_raw(),
                ..Default::default()
            },
        );
        let command_buffer = vk::CommandBuffer::from_raw(raw);
        Self::record(&mut state, DeviceEvent::AllocateCommandBuffer(command_buffer));
        Ok(command_buffer)
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.lock();
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.as_raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("command buffer {command_buffer:?}")))?;
        cb.recording = false;
        cb.commands.clear();
        Self::record(&mut state, DeviceEvent::ResetCommandBuffer(command_buffer));
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.lock();
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.as_raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("command buffer {command_buffer:?}")))?;
        cb.recording = true;
        cb.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.lock();
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.as_raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("command buffer {command_buffer:?}")))?;
        cb.recording = false;
        Ok(())
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.push_command(
            command_buffer,
            RecordedCommand::BindPipeline {
                bind_point,
                pipeline,
            },
        );
    }

    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        self.push_command(
            command_buffer,
            RecordedCommand::BindDescriptorSet {
                bind_point,
                layout,
                set,
            },
        );
    }

    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.push_command(
            command_buffer,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            },
        );
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.push_command(command_buffer, RecordedCommand::Dispatch { x, y, z });
    }

    fn queue_submit(
        &self,
        queue: Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> RhiResult<()> {
        let mut state = self.lock();

        for cb in submission.command_buffers {
            match state.command_buffers.get(&cb.as_raw()) {
                Some(cb_state) if !cb_state.recording => {}
                Some(cb_state) => {
                    debug!(pool = cb_state.pool, "submitting a command buffer still recording");
                    return Err(RhiError::VulkanError(vk::Result::ERROR_VALIDATION_FAILED_EXT));
                }
                None => return Err(RhiError::InvalidHandle(format!("command buffer {cb:?}"))),
            }
        }
        let fence_raw = (fence != vk::Fence::null()).then(|| fence.as_raw());
        if let Some(raw) = fence_raw
            && !state.fences.contains_key(&raw)
        {
            return Err(RhiError::InvalidHandle(format!("fence {fence:?}")));
        }

        Self::record(
            &mut state,
            DeviceEvent::Submit {
                queue,
                command_buffers: submission.command_buffers.to_vec(),
                wait_semaphores: submission.wait_semaphores.to_vec(),
                signal_semaphores: submission.signal_semaphores.to_vec(),
                fence,
            },
        );

        let pending = PendingSubmission { fence: fence_raw };
        match state.mode {
            CompletionMode::Immediate => state.complete(pending),
            CompletionMode::Manual => state.pending.push_back(pending),
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.lock();
        Self::record(&mut state, DeviceEvent::WaitIdle);
        while !state.pending.is_empty() {
            state.blocked_waiters += 1;
            self.changed.notify_all();
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            state.blocked_waiters -= 1;
        }
        Ok(())
    }

    fn create_framebuffer(&self, key: &FramebufferKey) -> RhiResult<vk::Framebuffer> {
        if key.width == 0 || key.height == 0 || key.layers == 0 {
            return Err(RhiError::VulkanError(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        let mut state = self.lock();
        let raw = state.mint();
        state.framebuffers.insert(raw);
        let framebuffer = vk::Framebuffer::from_raw(raw);
        Self::record(&mut state, DeviceEvent::CreateFramebuffer(framebuffer));
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.lock();
        assert!(
            state.framebuffers.remove(&framebuffer.as_raw()),
            "HeadlessDevice: destroy of unknown framebuffer {framebuffer:?}"
        );
        Self::record(&mut state, DeviceEvent::DestroyFramebuffer(framebuffer));
    }

    fn create_descriptor_pool(&self, max_sets: u32) -> RhiResult<vk::DescriptorPool> {
        let mut state = self.lock();
        let raw = state.mint();
        state.descriptor_pools.insert(
            raw,
            DescriptorPoolState {
                max_sets,
                sets: Vec::new(),
            },
        );
        let pool = vk::DescriptorPool::from_raw(raw);
        Self::record(&mut state, DeviceEvent::CreateDescriptorPool(pool));
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        let mut state = self.lock();
        state
            .descriptor_pools
            .get_mut(&pool.as_raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("descriptor pool {pool:?}")))?
            .sets
            .clear();
        Self::record(&mut state, DeviceEvent::ResetDescriptorPool(pool));
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.lock();
        assert!(
            state.descriptor_pools.remove(&pool.as_raw()).is_some(),
            "HeadlessDevice: destroy of unknown descriptor pool {pool:?}"
        );
        Self::record(&mut state, DeviceEvent::DestroyDescriptorPool(pool));
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _key: &DescriptorSetKey,
    ) -> RhiResult<vk::DescriptorSet> {
        let mut state = self.lock();
        let raw = state.mint();
        let pool_state = state
            .descriptor_pools
            .get_mut(&pool.as_raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("descriptor pool {pool:?}")))?;
        if pool_state.sets.len() as u32 >= pool_state.max_sets {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        pool_state.sets.push(raw);
        let set = vk::DescriptorSet::from_raw(raw);
        Self::record(&mut state, DeviceEvent::AllocateDescriptorSet(set));
        Ok(set)
    }
}

/// The drawable area a [`HeadlessSurface`] presents into.
#[derive(Debug)]
pub struct HeadlessWindow {
    extent: Mutex<vk::Extent2D>,
    suboptimal: AtomicBool,
    resize_suboptimal: AtomicBool,
}

impl HeadlessWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: Mutex::new(vk::Extent2D { width, height }),
            suboptimal: AtomicBool::new(false),
            resize_suboptimal: AtomicBool::new(false),
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        *self.extent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes the drawable size. Surfaces created for the old size go stale.
    pub fn resize(&self, width: u32, height: u32) {
        *self.extent.lock().unwrap_or_else(PoisonError::into_inner) =
            vk::Extent2D { width, height };
    }

    /// Makes presentation report a suboptimal (but successful) result.
    pub fn set_suboptimal(&self, suboptimal: bool) {
        self.suboptimal.store(suboptimal, Ordering::SeqCst);
    }

    /// Makes surfaces sized for an old extent keep working and report
    /// suboptimal instead of out of date, as some drivers do on rotation.
    pub fn set_resize_reports_suboptimal(&self, suboptimal: bool) {
        self.resize_suboptimal.store(suboptimal, Ordering::SeqCst);
    }
}

/// A [`PresentSurface`] that hands out image indices round-robin.
#[derive(Debug)]
pub struct HeadlessSurface {
    device: Arc<HeadlessDevice>,
    window: Arc<HeadlessWindow>,
    handle: vk::SwapchainKHR,
    extent: vk::Extent2D,
    image_count: u32,
    present_mode: vk::PresentModeKHR,
    image_usage: vk::ImageUsageFlags,
    next_image: AtomicU32,
    present_error: Mutex<Option<vk::Result>>,
}

impl HeadlessSurface {
    pub const FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;

    /// A surface with `image_count` images, sized to `window`.
    pub fn new(device: Arc<HeadlessDevice>, window: Arc<HeadlessWindow>, image_count: u32) -> Self {
        let extent = window.extent();
        Self::create(
            device,
            window,
            extent,
            image_count,
            vk::PresentModeKHR::FIFO,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        )
    }

    fn create(
        device: Arc<HeadlessDevice>,
        window: Arc<HeadlessWindow>,
        extent: vk::Extent2D,
        image_count: u32,
        present_mode: vk::PresentModeKHR,
        image_usage: vk::ImageUsageFlags,
    ) -> Self {
        assert!(image_count > 0, "HeadlessSurface needs at least one image");
        let handle = device.register_surface(image_count, extent);
        Self {
            device,
            window,
            handle,
            extent,
            image_count,
            present_mode,
            image_usage,
            next_image: AtomicU32::new(0),
            present_error: Mutex::new(None),
        }
    }

    fn successor(
        &self,
        extent: vk::Extent2D,
        image_count: u32,
        present_mode: vk::PresentModeKHR,
        image_usage: vk::ImageUsageFlags,
    ) -> Self {
        Self::create(
            Arc::clone(&self.device),
            Arc::clone(&self.window),
            extent,
            image_count,
            present_mode,
            image_usage,
        )
    }

    /// A replacement with a different image count.
    pub fn with_image_count(&self, image_count: u32) -> Self {
        self.successor(self.window.extent(), image_count, self.present_mode, self.image_usage)
    }

    /// A replacement with different image usage flags.
    pub fn with_image_usage(&self, image_usage: vk::ImageUsageFlags) -> Self {
        self.successor(self.window.extent(), self.image_count, self.present_mode, image_usage)
    }

    /// A replacement with a different present mode.
    pub fn with_present_mode(&self, present_mode: vk::PresentModeKHR) -> Self {
        self.successor(self.window.extent(), self.image_count, present_mode, self.image_usage)
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    /// Makes the next present fail with `error`.
    pub fn fail_next_present(&self, error: vk::Result) {
        *self
            .present_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn is_stale(&self) -> bool {
        self.window.extent() != self.extent
    }

    /// Whether a stale surface is out of date rather than merely suboptimal.
    fn is_out_of_date(&self) -> bool {
        self.is_stale() && !self.window.resize_suboptimal.load(Ordering::SeqCst)
    }
}

impl PresentSurface for HeadlessSurface {
    fn image_count(&self) -> u32 {
        self.image_count
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        Self::FORMAT
    }

    fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    fn image_usage(&self) -> vk::ImageUsageFlags {
        self.image_usage
    }

    fn acquire_next_image(&self, _semaphore: vk::Semaphore) -> Result<(u32, bool), vk::Result> {
        if self.is_out_of_date() {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        let image_index = self.next_image.fetch_add(1, Ordering::SeqCst) % self.image_count;
        self.device.log(DeviceEvent::Acquire {
            surface: self.handle,
            image_index,
        });
        Ok((image_index, self.is_stale()))
    }

    fn present(
        &self,
        _queue: Queue,
        image_index: u32,
        _wait: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        if let Some(error) = self
            .present_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(error);
        }
        if self.is_out_of_date() {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        self.device.log(DeviceEvent::Present {
            surface: self.handle,
            image_index,
        });
        Ok(self.is_stale() || self.window.suboptimal.load(Ordering::SeqCst))
    }

    fn current_extent(&self) -> RhiResult<vk::Extent2D> {
        Ok(self.window.extent())
    }

    fn recreate(&self, extent: vk::Extent2D) -> RhiResult<Self> {
        Ok(self.successor(extent, self.image_count, self.present_mode, self.image_usage))
    }
}

impl Drop for HeadlessSurface {
    fn drop(&mut self) {
        self.device.log(DeviceEvent::DestroySurface(self.handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const INFINITE: u64 = u64::MAX;

    #[test]
    fn test_immediate_submission_signals_fence() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();

        device
            .queue_submit(device.graphics_queue(), &Submission::default(), fence)
            .unwrap();

        assert!(device.is_signaled(fence));
        device.wait_for_fences(&[fence], INFINITE).unwrap();
        device.destroy_fence(fence);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_manual_submission_blocks_waiter() {
        let device = Arc::new(HeadlessDevice::manual());
        let fence = device.create_fence(false).unwrap();
        device
            .queue_submit(device.graphics_queue(), &Submission::default(), fence)
            .unwrap();

        let waiter = {
            let device = Arc::clone(&device);
            thread::spawn(move || device.wait_for_fences(&[fence], INFINITE))
        };

        assert!(device.wait_for_blocked_waiters(1, Duration::from_secs(5)));
        assert!(!device.is_signaled(fence));
        assert!(device.complete_next());

        waiter.join().unwrap().unwrap();
        assert_eq!(device.blocked_waiters(), 0);
    }

    #[test]
    fn test_finite_wait_times_out() {
        let device = HeadlessDevice::manual();
        let fence = device.create_fence(false).unwrap();

        let err = device.wait_for_fences(&[fence], 1_000).unwrap_err();
        assert!(matches!(err, RhiError::VulkanError(vk::Result::TIMEOUT)));
    }

    #[test]
    fn test_unknown_fence_is_invalid() {
        let device = HeadlessDevice::new();
        let err = device
            .wait_for_fences(&[vk::Fence::from_raw(999)], INFINITE)
            .unwrap_err();
        assert!(matches!(err, RhiError::InvalidHandle(_)));
    }

    #[test]
    fn test_recording_is_captured() {
        let device = HeadlessDevice::new();
        let pool = device.create_command_pool(0).unwrap();
        let cb = device.allocate_command_buffer(pool).unwrap();

        device.begin_command_buffer(cb).unwrap();
        device.cmd_dispatch(cb, 4, 2, 1);
        device.end_command_buffer(cb).unwrap();

        assert_eq!(
            device.recorded_commands(cb),
            vec![RecordedCommand::Dispatch { x: 4, y: 2, z: 1 }]
        );

        device.reset_command_pool(pool).unwrap();
        assert!(device.recorded_commands(cb).is_empty());
        device.destroy_command_pool(pool);
    }

    #[test]
    fn test_descriptor_pool_capacity() {
        let device = HeadlessDevice::new();
        let pool = device.create_descriptor_pool(1).unwrap();
        let key = DescriptorSetKey::new(vk::DescriptorSetLayout::from_raw(1));

        device.allocate_descriptor_set(pool, &key).unwrap();
        let err = device.allocate_descriptor_set(pool, &key).unwrap_err();
        assert!(matches!(
            err,
            RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        ));

        device.reset_descriptor_pool(pool).unwrap();
        device.allocate_descriptor_set(pool, &key).unwrap();
        device.destroy_descriptor_pool(pool);
    }

    #[test]
    fn test_surface_goes_stale_on_resize() {
        let device = Arc::new(HeadlessDevice::new());
        let window = Arc::new(HeadlessWindow::new(800, 600));
        let surface = HeadlessSurface::new(Arc::clone(&device), Arc::clone(&window), 3);
        let semaphore = device.create_semaphore().unwrap();

        assert_eq!(surface.acquire_next_image(semaphore), Ok((0, false)));
        assert_eq!(surface.acquire_next_image(semaphore), Ok((1, false)));

        window.resize(1024, 768);
        assert_eq!(
            surface.acquire_next_image(semaphore),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );

        let replacement = surface
            .recreate(surface.current_extent().unwrap())
            .unwrap();
        assert_eq!(replacement.extent(), vk::Extent2D { width: 1024, height: 768 });
        assert_eq!(replacement.acquire_next_image(semaphore), Ok((0, false)));
    }

    #[test]
    fn test_resize_can_report_suboptimal() {
        let device = Arc::new(HeadlessDevice::new());
        let window = Arc::new(HeadlessWindow::new(800, 600));
        let surface = HeadlessSurface::new(Arc::clone(&device), Arc::clone(&window), 2);
        let semaphore = device.create_semaphore().unwrap();

        window.set_resize_reports_suboptimal(true);
        window.resize(600, 800);

        assert_eq!(surface.acquire_next_image(semaphore), Ok((0, true)));
        assert_eq!(
            surface.present(device.present_queue(), 0, semaphore),
            Ok(true)
        );
    }
}
