//! Device queue identity.

use ash::vk;

/// A device queue together with the family it was retrieved from.
///
/// Command pools are created per queue family, so the family index is what
/// groups command contexts; the handle is what work is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Queue {
    handle: vk::Queue,
    family_index: u32,
}

impl Queue {
    /// Wraps a retrieved queue handle.
    #[inline]
    pub fn new(handle: vk::Queue, family_index: u32) -> Self {
        Self {
            handle,
            family_index,
        }
    }

    /// Returns the raw Vulkan queue handle.
    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    /// Returns the queue family index.
    #[inline]
    pub fn family_index(&self) -> u32 {
        self.family_index
    }
}
