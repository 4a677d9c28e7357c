//! Framebuffer fingerprints.

use ash::vk;

/// Structural fingerprint of a framebuffer.
///
/// Equal keys describe framebuffers that are interchangeable, so a frame can
/// keep the framebuffer it built on an earlier visit and hand it out again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

impl FramebufferKey {
    /// A single-layer framebuffer covering `extent`.
    pub fn new(
        render_pass: vk::RenderPass,
        attachments: Vec<vk::ImageView>,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            render_pass,
            attachments,
            width: extent.width,
            height: extent.height,
            layers: 1,
        }
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}
