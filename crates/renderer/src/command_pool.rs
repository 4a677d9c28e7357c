//! Recycled command buffers.
//!
//! A [`CommandPool`] wraps one device command pool for a single queue family
//! and the primary buffers allocated from it. Buffers are requested through
//! [`CommandPool::request_command_buffer`], which hands back an already
//! allocated buffer when one is free and allocates otherwise. A reset makes
//! every buffer free again, following the pool's [`ResetMode`].
//!
//! Requested buffers come wrapped in a [`CommandContext`], a cheap clonable
//! handle used for recording.

use std::sync::Arc;

use ash::vk;
use tracing::trace;

use framepace_rhi::{GpuDevice, RhiResult};

/// How a [`CommandPool`] returns its buffers to the free state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetMode {
    /// Reset the whole device pool in one call.
    #[default]
    ResetPool,
    /// Reset each used buffer on its own.
    ResetIndividually,
}

/// One device command pool and the primary buffers allocated from it.
pub struct CommandPool<D: GpuDevice> {
    device: Arc<D>,
    handle: vk::CommandPool,
    queue_family_index: u32,
    reset_mode: ResetMode,
    buffers: Vec<vk::CommandBuffer>,
    active_count: usize,
}

impl<D: GpuDevice> CommandPool<D> {
    /// Creates a device command pool for `queue_family_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device pool cannot be created.
    pub fn new(device: Arc<D>, queue_family_index: u32, reset_mode: ResetMode) -> RhiResult<Self> {
        let handle = device.create_command_pool(queue_family_index)?;
        trace!(queue_family_index, ?reset_mode, "command pool created");
        Ok(Self {
            device,
            handle,
            queue_family_index,
            reset_mode,
            buffers: Vec::new(),
            active_count: 0,
        })
    }

    /// Returns a free primary buffer, allocating one if none is free.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn request_command_buffer(&mut self) -> RhiResult<CommandContext<D>> {
        let buffer = match self.buffers.get(self.active_count) {
            Some(&buffer) => buffer,
            None => {
                let buffer = self.device.allocate_command_buffer(self.handle)?;
                self.buffers.push(buffer);
                buffer
            }
        };
        self.active_count += 1;

        Ok(CommandContext {
            device: Arc::clone(&self.device),
            buffer,
            queue_family_index: self.queue_family_index,
        })
    }

    /// Returns every requested buffer to the free state.
    ///
    /// The caller guarantees the GPU has finished executing them.
    ///
    /// # Errors
    ///
    /// Returns an error if the device reset fails.
    pub fn reset(&mut self) -> RhiResult<()> {
        if self.active_count == 0 {
            return Ok(());
        }

        match self.reset_mode {
            ResetMode::ResetPool => self.device.reset_command_pool(self.handle)?,
            ResetMode::ResetIndividually => {
                for &buffer in &self.buffers[..self.active_count] {
                    self.device.reset_command_buffer(buffer)?;
                }
            }
        }
        self.active_count = 0;
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn reset_mode(&self) -> ResetMode {
        self.reset_mode
    }

    /// Buffers requested since the last reset.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.active_count
    }

    /// Buffers allocated over the pool's lifetime.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.buffers.len()
    }
}

impl<D: GpuDevice> Drop for CommandPool<D> {
    fn drop(&mut self) {
        // Frees the buffers along with the pool.
        self.device.destroy_command_pool(self.handle);
    }
}

/// A command buffer handed out for recording.
///
/// The buffer belongs to the pool it came from and is recycled when that pool
/// resets, so a context must not be used after the reset that follows its
/// request.
pub struct CommandContext<D: GpuDevice> {
    device: Arc<D>,
    buffer: vk::CommandBuffer,
    queue_family_index: u32,
}

impl<D: GpuDevice> Clone for CommandContext<D> {
    fn clone(&self) -> Self {
        Self {
            device: Arc::clone(&self.device),
            buffer: self.buffer,
            queue_family_index: self.queue_family_index,
        }
    }
}

impl<D: GpuDevice> CommandContext<D> {
    /// Begins one-time-submit recording.
    pub fn begin(&self) -> RhiResult<()> {
        self.device.begin_command_buffer(self.buffer)
    }

    pub fn end(&self) -> RhiResult<()> {
        self.device.end_command_buffer(self.buffer)
    }

    /// Resets just this buffer.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_command_buffer(self.buffer)
    }

    /// Begins recording, runs `f`, and ends recording.
    ///
    /// # Errors
    ///
    /// Returns an error if beginning or ending the buffer fails. `f`'s own
    /// result is returned on success.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use framepace_renderer::command_pool::{CommandPool, ResetMode};
    /// use framepace_rhi::headless::{HeadlessDevice, RecordedCommand};
    ///
    /// # fn example() -> Result<(), framepace_rhi::RhiError> {
    /// let device = Arc::new(HeadlessDevice::new());
    /// let mut pool = CommandPool::new(Arc::clone(&device), 0, ResetMode::ResetPool)?;
    /// let ctx = pool.request_command_buffer()?;
    ///
    /// ctx.record(|ctx| ctx.dispatch(8, 8, 1))?;
    ///
    /// assert_eq!(
    ///     device.recorded_commands(ctx.handle()),
    ///     vec![RecordedCommand::Dispatch { x: 8, y: 8, z: 1 }]
    /// );
    /// # Ok(())
    /// # }
    /// # example().unwrap();
    /// ```
    pub fn record<R, F>(&self, f: F) -> RhiResult<R>
    where
        F: FnOnce(&Self) -> R,
    {
        self.begin()?;
        let result = f(self);
        self.end()?;
        Ok(result)
    }

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.device
            .cmd_bind_pipeline(self.buffer, bind_point, pipeline);
    }

    /// Binds `set` at set index 0 of `layout`.
    pub fn bind_descriptor_set(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        self.device
            .cmd_bind_descriptor_set(self.buffer, bind_point, layout, set);
    }

    pub fn draw(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.device.cmd_draw(
            self.buffer,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        self.device.cmd_dispatch(self.buffer, x, y, z);
    }

    /// The raw buffer, for recording commands the context does not wrap.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}
