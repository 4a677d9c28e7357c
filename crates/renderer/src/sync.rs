//! Recycling pools of synchronization handles.
//!
//! Each frame slot owns one [`SemaphorePool`] and one [`FencePool`]. Handles
//! are created on first demand and kept for the lifetime of the pool. A
//! handle handed out by `request_*` is never handed out again until the pool
//! is reset, which the owning frame does once per visit of its slot.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use framepace_renderer::sync::SemaphorePool;
//! use framepace_rhi::headless::HeadlessDevice;
//!
//! # fn example() -> Result<(), framepace_rhi::RhiError> {
//! let device = Arc::new(HeadlessDevice::new());
//! let mut pool = SemaphorePool::new(device);
//!
//! let a = pool.request_semaphore()?;
//! let b = pool.request_semaphore()?;
//! assert_ne!(a, b);
//!
//! pool.reset();
//! assert_eq!(pool.request_semaphore()?, a);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::trace;

use framepace_rhi::{GpuDevice, RhiResult};

/// Lazily grown pool of binary semaphores.
pub struct SemaphorePool<D: GpuDevice> {
    device: Arc<D>,
    semaphores: Vec<vk::Semaphore>,
    active_count: usize,
}

impl<D: GpuDevice> SemaphorePool<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            semaphores: Vec::new(),
            active_count: 0,
        }
    }

    /// Returns a semaphore not handed out since the last reset.
    ///
    /// # Errors
    ///
    /// Returns an error if a new semaphore has to be created and creation fails.
    pub fn request_semaphore(&mut self) -> RhiResult<vk::Semaphore> {
        if let Some(&semaphore) = self.semaphores.get(self.active_count) {
            self.active_count += 1;
            return Ok(semaphore);
        }

        let semaphore = self.device.create_semaphore()?;
        self.semaphores.push(semaphore);
        self.active_count += 1;
        trace!(created = self.semaphores.len(), "semaphore pool grew");
        Ok(semaphore)
    }

    /// Makes every semaphore available again.
    ///
    /// The caller guarantees that no pending GPU work still waits on or signals
    /// them, which for a frame slot is established by waiting on its fences.
    pub fn reset(&mut self) {
        self.active_count = 0;
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.active_count
    }

    #[inline]
    pub fn created(&self) -> usize {
        self.semaphores.len()
    }
}

impl<D: GpuDevice> Drop for SemaphorePool<D> {
    fn drop(&mut self) {
        for semaphore in self.semaphores.drain(..) {
            self.device.destroy_semaphore(semaphore);
        }
    }
}

/// Lazily grown pool of fences.
///
/// Fences are created unsignaled. Every fence handed out is expected to be
/// submitted with work before [`wait`](Self::wait) is called, otherwise the
/// wait never returns.
pub struct FencePool<D: GpuDevice> {
    device: Arc<D>,
    fences: Vec<vk::Fence>,
    active_count: usize,
}

impl<D: GpuDevice> FencePool<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            fences: Vec::new(),
            active_count: 0,
        }
    }

    /// Returns an unsignaled fence not handed out since the last reset.
    ///
    /// # Errors
    ///
    /// Returns an error if a new fence has to be created and creation fails.
    pub fn request_fence(&mut self) -> RhiResult<vk::Fence> {
        if let Some(&fence) = self.fences.get(self.active_count) {
            self.active_count += 1;
            return Ok(fence);
        }

        let fence = self.device.create_fence(false)?;
        self.fences.push(fence);
        self.active_count += 1;
        trace!(created = self.fences.len(), "fence pool grew");
        Ok(fence)
    }

    /// Takes back `fence`, the most recently requested one, after it turned
    /// out never to be submitted. Waiting on it would never return.
    ///
    /// # Panics
    ///
    /// Panics if `fence` is not the most recently requested fence.
    pub fn release_unsubmitted(&mut self, fence: vk::Fence) {
        assert!(
            self.active_count > 0 && self.fences[self.active_count - 1] == fence,
            "FencePool::release_unsubmitted: {fence:?} is not the most recently requested fence"
        );
        self.active_count -= 1;
    }

    /// Blocks until every fence handed out since the last reset is signaled.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails or times out.
    pub fn wait(&self, timeout_ns: u64) -> RhiResult<()> {
        if self.active_count == 0 {
            return Ok(());
        }
        self.device
            .wait_for_fences(&self.fences[..self.active_count], timeout_ns)
    }

    /// Unsignals the handed-out fences and makes them available again.
    ///
    /// # Errors
    ///
    /// Returns an error if resetting the fences fails.
    pub fn reset(&mut self) -> RhiResult<()> {
        if self.active_count == 0 {
            return Ok(());
        }
        self.device.reset_fences(&self.fences[..self.active_count])?;
        self.active_count = 0;
        Ok(())
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.active_count
    }

    #[inline]
    pub fn created(&self) -> usize {
        self.fences.len()
    }
}

impl<D: GpuDevice> Drop for FencePool<D> {
    fn drop(&mut self) {
        for fence in self.fences.drain(..) {
            self.device.destroy_fence(fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepace_rhi::Submission;
    use framepace_rhi::headless::{DeviceEvent, HeadlessDevice};

    #[test]
    fn test_semaphores_distinct_until_reset() {
        let device = Arc::new(HeadlessDevice::new());
        let mut pool = SemaphorePool::new(Arc::clone(&device));

        let first: Vec<_> = (0..3).map(|_| pool.request_semaphore().unwrap()).collect();
        assert_eq!(pool.in_use(), 3);
        assert!(first[0] != first[1] && first[1] != first[2] && first[0] != first[2]);

        pool.reset();
        assert_eq!(pool.in_use(), 0);

        let second: Vec<_> = (0..3).map(|_| pool.request_semaphore().unwrap()).collect();
        assert_eq!(first, second);
        assert_eq!(pool.created(), 3);
    }

    #[test]
    fn test_semaphore_pool_destroys_on_drop() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let mut pool = SemaphorePool::new(Arc::clone(&device));
            pool.request_semaphore().unwrap();
            pool.request_semaphore().unwrap();
            assert_eq!(device.live_object_count(), 2);
        }
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_empty_fence_pool_never_touches_device() {
        let device = Arc::new(HeadlessDevice::new());
        let mut pool = FencePool::new(Arc::clone(&device));

        pool.wait(u64::MAX).unwrap();
        pool.reset().unwrap();

        assert!(device.events().is_empty());
    }

    #[test]
    fn test_released_fence_is_handed_out_again() {
        let device = Arc::new(HeadlessDevice::manual());
        let mut pool = FencePool::new(Arc::clone(&device));

        let fence = pool.request_fence().unwrap();
        pool.release_unsubmitted(fence);

        assert_eq!(pool.in_use(), 0);
        pool.wait(0).unwrap();
        assert_eq!(pool.request_fence().unwrap(), fence);
    }

    #[test]
    #[should_panic(expected = "most recently requested")]
    fn test_release_of_older_fence_panics() {
        let device = Arc::new(HeadlessDevice::new());
        let mut pool = FencePool::new(device);

        let first = pool.request_fence().unwrap();
        pool.request_fence().unwrap();
        pool.release_unsubmitted(first);
    }

    #[test]
    fn test_fence_pool_wait_and_reset() {
        let device = Arc::new(HeadlessDevice::new());
        let mut pool = FencePool::new(Arc::clone(&device));

        let fence = pool.request_fence().unwrap();
        device
            .queue_submit(device.graphics_queue(), &Submission::default(), fence)
            .unwrap();

        pool.wait(u64::MAX).unwrap();
        pool.reset().unwrap();

        assert!(!device.is_signaled(fence));
        assert_eq!(pool.in_use(), 0);
        assert!(device
            .events()
            .contains(&DeviceEvent::ResetFences(vec![fence])));
        assert_eq!(pool.request_fence().unwrap(), fence);
    }
}
