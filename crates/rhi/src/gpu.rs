//! Device and presentation seams.
//!
//! [`GpuDevice`] is the subset of logical-device functionality the frame
//! lifecycle needs: synchronization objects, command pools and buffers, a few
//! recording primitives, submission, and the handles cached per frame.
//! [`PresentSurface`] is a chain of presentable images.
//!
//! Both are implemented for Vulkan by [`Device`](crate::device::Device) and
//! [`Swapchain`](crate::swapchain::Swapchain), and for tests by the simulated
//! types in the `headless` module, behind the `headless` feature. Handles are
//! plain `ash` handle types either way.

use ash::vk;

use crate::descriptor::DescriptorSetKey;
use crate::framebuffer::FramebufferKey;
use crate::queue::Queue;
use crate::RhiResult;

/// One batch of command buffers submitted to a queue.
///
/// `wait_semaphores` and `wait_stages` are parallel slices.
#[derive(Debug, Clone, Copy, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

impl<'a> Submission<'a> {
    /// A submission of `command_buffers` with no semaphores.
    pub fn new(command_buffers: &'a [vk::CommandBuffer]) -> Self {
        Self {
            command_buffers,
            ..Default::default()
        }
    }

    /// Waits on `semaphores` at the matching `stages` before executing.
    pub fn wait(
        mut self,
        semaphores: &'a [vk::Semaphore],
        stages: &'a [vk::PipelineStageFlags],
    ) -> Self {
        assert_eq!(
            semaphores.len(),
            stages.len(),
            "Submission::wait: every wait semaphore needs a stage"
        );
        self.wait_semaphores = semaphores;
        self.wait_stages = stages;
        self
    }

    /// Signals `semaphores` once the command buffers complete.
    pub fn signal(mut self, semaphores: &'a [vk::Semaphore]) -> Self {
        self.signal_semaphores = semaphores;
        self
    }
}

/// Logical device operations used by the frame lifecycle.
pub trait GpuDevice: Send + Sync {
    fn graphics_queue(&self) -> Queue;
    fn present_queue(&self) -> Queue;

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Waits until every fence in `fences` is signaled or `timeout_ns` elapses.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> RhiResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()>;

    fn create_command_pool(&self, queue_family_index: u32) -> RhiResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()>;
    /// Allocates one primary command buffer from `pool`.
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;
    /// Begins one-time-submit recording.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );
    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);

    /// Submits `submission` to `queue`, signaling `fence` (which may be null)
    /// when it completes.
    fn queue_submit(
        &self,
        queue: Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> RhiResult<()>;
    fn wait_idle(&self) -> RhiResult<()>;

    fn create_framebuffer(&self, key: &FramebufferKey) -> RhiResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_descriptor_pool(&self, max_sets: u32) -> RhiResult<vk::DescriptorPool>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Allocates a set of `key`'s layout from `pool` and writes its bindings.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        key: &DescriptorSetKey,
    ) -> RhiResult<vk::DescriptorSet>;
}

/// A chain of presentable images that can be replaced wholesale.
///
/// Acquire and present return the raw `vk::Result` so that callers can tell
/// `ERROR_OUT_OF_DATE_KHR` apart from hard failures. The `bool` in both
/// results is the suboptimal flag.
pub trait PresentSurface: Send {
    fn image_count(&self) -> u32;
    fn extent(&self) -> vk::Extent2D;
    fn format(&self) -> vk::Format;
    fn present_mode(&self) -> vk::PresentModeKHR;
    fn image_usage(&self) -> vk::ImageUsageFlags;

    /// Acquires the next image, signaling `semaphore` when it can be written.
    fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<(u32, bool), vk::Result>;

    /// Queues `image_index` for presentation once `wait` is signaled.
    fn present(
        &self,
        queue: Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool, vk::Result>;

    /// The drawable size right now, which may differ from [`extent`](Self::extent)
    /// after a resize.
    fn current_extent(&self) -> RhiResult<vk::Extent2D>;

    /// Creates a replacement sized to `extent`, with otherwise equal settings.
    fn recreate(&self, extent: vk::Extent2D) -> RhiResult<Self>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_submission_builder() {
        let buffers = [vk::CommandBuffer::from_raw(1)];
        let waits = [vk::Semaphore::from_raw(2)];
        let stages = [vk::PipelineStageFlags::TRANSFER];
        let signals = [vk::Semaphore::from_raw(3)];

        let submission = Submission::new(&buffers)
            .wait(&waits, &stages)
            .signal(&signals);

        assert_eq!(submission.command_buffers, &buffers);
        assert_eq!(submission.wait_semaphores, &waits);
        assert_eq!(submission.signal_semaphores, &signals);
    }

    #[test]
    #[should_panic(expected = "every wait semaphore needs a stage")]
    fn test_submission_mismatched_waits() {
        let waits = [vk::Semaphore::from_raw(2)];
        let _ = Submission::new(&[]).wait(&waits, &[]);
    }
}
