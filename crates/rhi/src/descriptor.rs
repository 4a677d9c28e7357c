//! Descriptor binding fingerprints and descriptor pool helpers.
//!
//! A [`DescriptorSetKey`] describes the full content of a descriptor set: its
//! layout and every resource written into it. Two keys compare equal exactly
//! when the sets they describe would be identical, which lets a frame reuse a
//! previously written set instead of allocating and writing a new one.
//!
//! # Example
//!
//! ```
//! use ash::vk;
//! use ash::vk::Handle;
//! use framepace_rhi::descriptor::{BufferBinding, DescriptorSetKey};
//!
//! let layout = vk::DescriptorSetLayout::from_raw(1);
//! let buffer = vk::Buffer::from_raw(2);
//!
//! let key = DescriptorSetKey::new(layout)
//!     .with_buffer(BufferBinding::uniform(0, buffer, 0, 256));
//!
//! assert_eq!(key.buffers().len(), 1);
//! ```

use ash::vk;

/// Number of descriptors of each type reserved per set in a frame pool.
const DESCRIPTORS_PER_SET: u32 = 4;

/// Descriptor types every frame descriptor pool can serve.
const POOLED_DESCRIPTOR_TYPES: [vk::DescriptorType; 5] = [
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    vk::DescriptorType::SAMPLED_IMAGE,
    vk::DescriptorType::STORAGE_IMAGE,
];

/// A buffer written to one binding of a descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

impl BufferBinding {
    /// A uniform buffer range at `binding`.
    pub fn uniform(
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            buffer,
            offset,
            range,
        }
    }

    /// A storage buffer range at `binding`.
    pub fn storage(
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            buffer,
            offset,
            range,
        }
    }
}

/// An image (and optional sampler) written to one binding of a descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub sampler: vk::Sampler,
    pub image_view: vk::ImageView,
    pub image_layout: vk::ImageLayout,
}

impl ImageBinding {
    /// A combined image sampler at `binding`, read in shader-read-only layout.
    pub fn sampled(binding: u32, sampler: vk::Sampler, image_view: vk::ImageView) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            sampler,
            image_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// A storage image at `binding`, accessed in general layout.
    pub fn storage(binding: u32, image_view: vk::ImageView) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
            sampler: vk::Sampler::null(),
            image_view,
            image_layout: vk::ImageLayout::GENERAL,
        }
    }
}

/// Structural fingerprint of a descriptor set's content.
///
/// Bindings are kept sorted by binding index so that the order in which they
/// were added does not change the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorSetKey {
    layout: vk::DescriptorSetLayout,
    buffers: Vec<BufferBinding>,
    images: Vec<ImageBinding>,
}

impl DescriptorSetKey {
    /// An empty set of the given layout.
    pub fn new(layout: vk::DescriptorSetLayout) -> Self {
        Self {
            layout,
            buffers: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Adds a buffer binding.
    pub fn with_buffer(mut self, binding: BufferBinding) -> Self {
        let at = self
            .buffers
            .partition_point(|b| b.binding <= binding.binding);
        self.buffers.insert(at, binding);
        self
    }

    /// Adds an image binding.
    pub fn with_image(mut self, binding: ImageBinding) -> Self {
        let at = self.images.partition_point(|b| b.binding <= binding.binding);
        self.images.insert(at, binding);
        self
    }

    #[inline]
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    #[inline]
    pub fn buffers(&self) -> &[BufferBinding] {
        &self.buffers
    }

    #[inline]
    pub fn images(&self) -> &[ImageBinding] {
        &self.images
    }
}

/// Pool sizes for a frame descriptor pool holding up to `max_sets` sets.
pub fn pool_sizes(max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
    POOLED_DESCRIPTOR_TYPES
        .iter()
        .map(|&ty| {
            vk::DescriptorPoolSize::default()
                .ty(ty)
                .descriptor_count(max_sets.saturating_mul(DESCRIPTORS_PER_SET))
        })
        .collect()
}

/// Writes every binding of `key` into `set`.
pub(crate) fn write_descriptor_set(
    device: &ash::Device,
    set: vk::DescriptorSet,
    key: &DescriptorSetKey,
) {
    let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = key
        .buffers
        .iter()
        .map(|b| {
            [vk::DescriptorBufferInfo::default()
                .buffer(b.buffer)
                .offset(b.offset)
                .range(b.range)]
        })
        .collect();
    let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = key
        .images
        .iter()
        .map(|i| {
            [vk::DescriptorImageInfo::default()
                .sampler(i.sampler)
                .image_view(i.image_view)
                .image_layout(i.image_layout)]
        })
        .collect();

    let mut writes = Vec::with_capacity(buffer_infos.len() + image_infos.len());
    for (binding, info) in key.buffers.iter().zip(&buffer_infos) {
        writes.push(
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding.binding)
                .descriptor_type(binding.descriptor_type)
                .buffer_info(info),
        );
    }
    for (binding, info) in key.images.iter().zip(&image_infos) {
        writes.push(
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding.binding)
                .descriptor_type(binding.descriptor_type)
                .image_info(info),
        );
    }

    if writes.is_empty() {
        return;
    }

    unsafe {
        device.update_descriptor_sets(&writes, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_key_ignores_insertion_order() {
        let layout = vk::DescriptorSetLayout::from_raw(7);
        let a = BufferBinding::uniform(0, vk::Buffer::from_raw(1), 0, 64);
        let b = BufferBinding::storage(1, vk::Buffer::from_raw(2), 0, 128);

        let forward = DescriptorSetKey::new(layout).with_buffer(a).with_buffer(b);
        let reverse = DescriptorSetKey::new(layout).with_buffer(b).with_buffer(a);

        assert_eq!(forward, reverse);
        assert_eq!(forward.buffers()[0].binding, 0);
    }

    #[test]
    fn test_key_differs_on_content() {
        let layout = vk::DescriptorSetLayout::from_raw(7);
        let base = DescriptorSetKey::new(layout)
            .with_buffer(BufferBinding::uniform(0, vk::Buffer::from_raw(1), 0, 64));
        let moved = DescriptorSetKey::new(layout)
            .with_buffer(BufferBinding::uniform(0, vk::Buffer::from_raw(1), 64, 64));
        let imaged = base
            .clone()
            .with_image(ImageBinding::storage(1, vk::ImageView::from_raw(3)));

        assert_ne!(base, moved);
        assert_ne!(base, imaged);
    }

    #[test]
    fn test_pool_sizes_scale_with_sets() {
        let sizes = pool_sizes(10);
        assert_eq!(sizes.len(), POOLED_DESCRIPTOR_TYPES.len());
        assert!(sizes.iter().all(|s| s.descriptor_count == 40));
    }
}
