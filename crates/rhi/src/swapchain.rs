//! Vulkan swapchain.
//!
//! A [`Swapchain`] is immutable once created. Resizing or changing its image
//! usage or present mode produces a successor through [`PresentSurface::recreate`],
//! [`Swapchain::with_image_usage`] or [`Swapchain::with_present_mode`]. The
//! successor is created with the current swapchain as `oldSwapchain`, and the
//! owner swaps it in once the GPU no longer uses the old one.
//!
//! # Example
//!
//! ```no_run
//! use framepace_rhi::device::Device;
//! use framepace_rhi::instance::Instance;
//! use framepace_rhi::physical_device::select_physical_device;
//! use framepace_rhi::swapchain::{Swapchain, SwapchainSettings};
//! use ash::vk;
//!
//! let instance = Instance::new(c"example", &[], false).expect("Failed to create instance");
//! let surface: vk::SurfaceKHR = vk::SurfaceKHR::null(); // from the windowing layer
//! let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
//! let info = select_physical_device(instance.handle(), surface, &surface_loader)
//!     .expect("No suitable GPU found");
//! let device = Device::new(&instance, &info).expect("Failed to create device");
//!
//! let extent = vk::Extent2D { width: 1280, height: 720 };
//! let swapchain = Swapchain::new(&instance, device, surface, extent, SwapchainSettings::default())
//!     .expect("Failed to create swapchain");
//!
//! // Framebuffer compression is only possible without STORAGE usage.
//! let compressed = swapchain
//!     .with_image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
//!     .expect("Failed to create successor");
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::gpu::PresentSurface;
use crate::instance::Instance;
use crate::queue::Queue;

/// Requested swapchain configuration.
///
/// Every field is a preference. Creation validates it against the surface's
/// capabilities and falls back, with a warning, where the surface disagrees.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainSettings {
    pub desired_image_count: u32,
    pub present_mode: vk::PresentModeKHR,
    pub image_usage: vk::ImageUsageFlags,
    pub surface_format: vk::SurfaceFormatKHR,
    /// `None` keeps the surface's current transform.
    pub pre_transform: Option<vk::SurfaceTransformFlagsKHR>,
}

impl Default for SwapchainSettings {
    fn default() -> Self {
        Self {
            desired_image_count: 3,
            present_mode: vk::PresentModeKHR::FIFO,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::STORAGE,
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            pre_transform: None,
        }
    }
}

/// What a surface supports, queried per swapchain creation.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// # Errors
    ///
    /// Returns an error if any surface query fails.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> Result<Self, RhiError> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// A Vulkan swapchain with one image view per image.
pub struct Swapchain {
    device: Arc<Device>,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    surface_format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    image_usage: vk::ImageUsageFlags,
    settings: SwapchainSettings,
}

impl Swapchain {
    /// Creates the first swapchain for `surface`.
    ///
    /// `extent` is used only when the surface leaves the size to the
    /// swapchain (current extent of `u32::MAX`).
    ///
    /// # Errors
    ///
    /// Returns an error if the surface queries fail, the surface supports no
    /// formats or present modes, or swapchain or image view creation fails.
    pub fn new(
        instance: &Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        extent: vk::Extent2D,
        settings: SwapchainSettings,
    ) -> RhiResult<Self> {
        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());
        Self::create(
            device,
            surface_loader,
            swapchain_loader,
            surface,
            extent,
            settings,
            vk::SwapchainKHR::null(),
        )
    }

    /// A successor with `usage` as its requested image usage.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails.
    pub fn with_image_usage(&self, usage: vk::ImageUsageFlags) -> RhiResult<Self> {
        let settings = SwapchainSettings {
            image_usage: usage,
            ..self.settings
        };
        self.successor(self.extent, settings)
    }

    /// A successor presenting with `mode` when the surface supports it.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails.
    pub fn with_present_mode(&self, mode: vk::PresentModeKHR) -> RhiResult<Self> {
        let settings = SwapchainSettings {
            present_mode: mode,
            ..self.settings
        };
        self.successor(self.extent, settings)
    }

    fn successor(&self, extent: vk::Extent2D, settings: SwapchainSettings) -> RhiResult<Self> {
        Self::create(
            Arc::clone(&self.device),
            self.surface_loader.clone(),
            self.swapchain_loader.clone(),
            self.surface,
            extent,
            settings,
            self.swapchain,
        )
    }

    fn create(
        device: Arc<Device>,
        surface_loader: ash::khr::surface::Instance,
        swapchain_loader: ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        extent: vk::Extent2D,
        settings: SwapchainSettings,
        old_swapchain: vk::SwapchainKHR,
    ) -> RhiResult<Self> {
        let support =
            SwapchainSupportDetails::query(device.physical_device(), surface, &surface_loader)?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "Surface reports no formats or present modes".to_string(),
            ));
        }

        let caps = &support.capabilities;
        let surface_format = choose_surface_format(&support.formats, settings.surface_format);
        let present_mode = choose_present_mode(&support.present_modes, settings.present_mode);
        let extent = choose_extent(caps, extent.width, extent.height);
        let image_count = choose_image_count(caps, settings.desired_image_count);
        let image_usage = choose_image_usage(caps.supported_usage_flags, settings.image_usage)?;
        let pre_transform = match settings.pre_transform {
            Some(transform) if caps.supported_transforms.contains(transform) => transform,
            Some(transform) => {
                warn!(?transform, "Pre-transform not supported, using current transform");
                caps.current_transform
            }
            None => caps.current_transform,
        };

        let queue_families = device.queue_families();
        let family_indices: Vec<u32> = queue_families.unique_families();
        let (sharing_mode, shared_families) = if family_indices.len() > 1 {
            (vk::SharingMode::CONCURRENT, family_indices.as_slice())
        } else {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(image_usage)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_families)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None)? };

        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };

        let mut this = Self {
            device,
            surface_loader,
            swapchain_loader,
            surface,
            swapchain,
            images,
            image_views: Vec::new(),
            surface_format,
            extent,
            present_mode,
            image_usage,
            settings,
        };
        this.image_views = create_image_views(&this.device, &this.images, surface_format.format)?;

        info!(
            "Swapchain created: {}x{}, {:?}, {:?}, {} images, usage {:?}",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            this.images.len(),
            image_usage
        );

        Ok(this)
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    #[inline]
    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.surface_format.color_space
    }

    #[inline]
    pub fn settings(&self) -> &SwapchainSettings {
        &self.settings
    }

    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn image(&self, index: usize) -> vk::Image {
        self.images[index]
    }

    #[inline]
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    #[inline]
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }
}

impl PresentSurface for Swapchain {
    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    fn image_usage(&self) -> vk::ImageUsageFlags {
        self.image_usage
    }

    fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<(u32, bool), vk::Result> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    fn present(
        &self,
        queue: Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.swapchain_loader
                .queue_present(queue.handle(), &present_info)
        }
    }

    /// The surface's current extent, or this swapchain's extent when the
    /// surface leaves sizing to the application.
    fn current_extent(&self) -> RhiResult<vk::Extent2D> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.device.physical_device(), self.surface)?
        };
        if caps.current_extent.width == u32::MAX {
            return Ok(self.extent);
        }
        Ok(caps.current_extent)
    }

    fn recreate(&self, extent: vk::Extent2D) -> RhiResult<Self> {
        debug!(
            "Recreating swapchain {}x{} -> {}x{}",
            self.extent.width, self.extent.height, extent.width, extent.height
        );
        self.successor(extent, self.settings)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.handle().destroy_image_view(view, None);
            }
            self.swapchain_loader
                .destroy_swapchain(self.swapchain, None);
        }
        debug!(
            "Swapchain destroyed (was {}x{}, {} images)",
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
    }
}

/// Uses `preferred` if offered, else an 8-bit BGRA format in sRGB space, else
/// the first format.
fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> vk::SurfaceFormatKHR {
    if formats.contains(&preferred) {
        return preferred;
    }

    let fallback = formats.iter().find(|f| {
        matches!(
            f.format,
            vk::Format::B8G8R8A8_SRGB | vk::Format::B8G8R8A8_UNORM
        ) && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });
    let chosen = fallback.copied().unwrap_or(formats[0]);
    warn!(
        "Surface format {:?} unavailable, using {:?}",
        preferred.format, chosen.format
    );
    chosen
}

/// FIFO is always available, so it is the fallback.
fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if present_modes.contains(&preferred) {
        return preferred;
    }
    warn!("Present mode {:?} unavailable, using FIFO", preferred);
    vk::PresentModeKHR::FIFO
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Clamps `desired` to the surface's range. A maximum of 0 means unbounded.
fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, desired: u32) -> u32 {
    let count = desired.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Drops requested usage bits the surface does not support.
///
/// # Errors
///
/// Fails if color attachment usage itself is unsupported.
fn choose_image_usage(
    supported: vk::ImageUsageFlags,
    requested: vk::ImageUsageFlags,
) -> RhiResult<vk::ImageUsageFlags> {
    if !supported.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
        return Err(RhiError::SwapchainError(
            "Surface does not support color attachment usage".to_string(),
        ));
    }

    let usage = requested & supported;
    if usage != requested {
        warn!(
            "Swapchain image usage {:?} not supported, dropped",
            requested & !supported
        );
    }
    Ok(usage | vk::ImageUsageFlags::COLOR_ATTACHMENT)
}

fn create_image_views(
    device: &Device,
    images: &[vk::Image],
    format: vk::Format,
) -> Result<Vec<vk::ImageView>, RhiError> {
    let mut image_views = Vec::with_capacity(images.len());

    for (i, &image) in images.iter().enumerate() {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );

        let view = unsafe { device.handle().create_image_view(&create_info, None) };
        match view {
            Ok(view) => image_views.push(view),
            Err(e) => {
                for &view in &image_views {
                    unsafe { device.handle().destroy_image_view(view, None) };
                }
                return Err(RhiError::SwapchainError(format!(
                    "Failed to create image view {}: {:?}",
                    i, e
                )));
            }
        }
    }

    Ok(image_views)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRGB: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    #[test]
    fn test_choose_surface_format_prefers_requested() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            SRGB,
        ];
        assert_eq!(choose_surface_format(&formats, SRGB), SRGB);
    }

    #[test]
    fn test_choose_surface_format_fallback() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let other = vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };

        assert_eq!(choose_surface_format(&[other, unorm], SRGB), unorm);
        assert_eq!(choose_surface_format(&[other], SRGB), other);
    }

    #[test]
    fn test_choose_present_mode() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_choose_extent_uses_current() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };

        let extent = choose_extent(&capabilities, 800, 600);
        assert_eq!((extent.width, extent.height), (1920, 1080));
    }

    #[test]
    fn test_choose_extent_clamps_to_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 2000,
                height: 2000,
            },
            ..Default::default()
        };

        let extent = choose_extent(&capabilities, 3000, 50);
        assert_eq!((extent.width, extent.height), (2000, 100));

        let extent = choose_extent(&capabilities, 800, 600);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_choose_image_count() {
        let bounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&bounded, 3), 3);
        assert_eq!(choose_image_count(&bounded, 8), 3);
        assert_eq!(choose_image_count(&bounded, 1), 2);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&unbounded, 5), 5);
    }

    #[test]
    fn test_choose_image_usage_drops_unsupported() {
        let supported =
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST;
        let requested = SwapchainSettings::default().image_usage;

        let usage = choose_image_usage(supported, requested).unwrap();
        assert_eq!(usage, supported);
        assert!(!usage.contains(vk::ImageUsageFlags::STORAGE));
    }

    #[test]
    fn test_choose_image_usage_requires_color_attachment() {
        let result = choose_image_usage(
            vk::ImageUsageFlags::TRANSFER_DST,
            vk::ImageUsageFlags::TRANSFER_DST,
        );
        assert!(matches!(result, Err(RhiError::SwapchainError(_))));
    }

    #[test]
    fn test_swapchain_support_details_is_adequate() {
        let adequate = SwapchainSupportDetails {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(adequate.is_adequate());

        let no_modes = SwapchainSupportDetails {
            present_modes: vec![],
            ..adequate
        };
        assert!(!no_modes.is_adequate());
    }

    #[test]
    fn test_swapchain_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Swapchain>();
    }
}
