//! framepace demo.
//!
//! Clears every swapchain image with an animated colour through the render
//! context, and switches swapchain configuration while running:
//! - `C` toggles STORAGE image usage. Without it, drivers may enable
//!   framebuffer compression.
//! - `V` toggles between FIFO and MAILBOX presentation.
//! - `Esc` quits.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::PhysicalKey;
use winit::window::WindowId;

use framepace_core::FrameStats;
use framepace_platform::{InputState, KeyCode, Surface, Window};
use framepace_renderer::RenderContext;
use framepace_rhi::device::Device;
use framepace_rhi::instance::Instance;
use framepace_rhi::physical_device::select_physical_device;
use framepace_rhi::swapchain::{Swapchain, SwapchainSettings};
use framepace_rhi::{GpuDevice, PresentSurface, RhiError, RhiResult};

const TITLE: &str = "framepace";

/// Everything Vulkan. Fields drop in declaration order: the context (and its
/// swapchain) before the device, the surface and finally the instance.
struct Gpu {
    context: RenderContext<Device, Swapchain>,
    device: Arc<Device>,
    _surface: Surface,
    _instance: Instance,
}

impl Gpu {
    fn new(window: &Window) -> Result<Self> {
        let extensions = window.required_extensions()?;
        let instance = Instance::new(c"framepace", &extensions, cfg!(debug_assertions))?;
        let surface = window.create_surface(instance.entry(), instance.handle())?;

        let info = select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let device = Device::new(&instance, &info)?;

        let swapchain = Swapchain::new(
            &instance,
            Arc::clone(&device),
            surface.handle(),
            window.extent(),
            SwapchainSettings::default(),
        )?;

        let mut context = RenderContext::new(Arc::clone(&device), swapchain)?;
        context.prepare()?;

        Ok(Self {
            context,
            device,
            _surface: surface,
            _instance: instance,
        })
    }

    /// Renders one frame. A surface with no drawable area skips the frame.
    fn render(&mut self, elapsed: f32) -> RhiResult<()> {
        let acquired = match self.context.begin_frame() {
            Ok(semaphore) => semaphore,
            Err(RhiError::SurfaceOutOfDate) => return Ok(()),
            Err(e) => return Err(e),
        };
        let Some(image_index) = self.context.active_image_index() else {
            unreachable!("begin_frame leaves a frame active");
        };
        let image = self.context.swapchain().image(image_index as usize);

        let queue = self.device.graphics_queue();
        let ctx = self.context.request_command_context(queue)?;
        let device = self.device.handle();
        ctx.record(|ctx| record_clear(device, ctx.handle(), image, clear_color(elapsed)))?;

        let cleared = self
            .context
            .submit(queue, &ctx, acquired, vk::PipelineStageFlags::TRANSFER)?;
        self.context.end_frame(cleared)
    }

    fn toggle_compression(&mut self) -> RhiResult<()> {
        let usage = self.context.swapchain().image_usage() ^ vk::ImageUsageFlags::STORAGE;
        let next = self.context.swapchain().with_image_usage(usage)?;
        self.context.update_swapchain(next)?;

        if self.context.swapchain().image_usage() == usage {
            let storage = usage.contains(vk::ImageUsageFlags::STORAGE);
            info!("Storage usage {}", if storage { "on" } else { "off" });
        } else {
            warn!("Surface does not support the requested usage {:?}", usage);
        }
        Ok(())
    }

    fn toggle_present_mode(&mut self) -> RhiResult<()> {
        let mode = if self.context.swapchain().present_mode() == vk::PresentModeKHR::FIFO {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        };
        let next = self.context.swapchain().with_present_mode(mode)?;
        self.context.update_swapchain(next)?;
        info!("Present mode {:?}", self.context.swapchain().present_mode());
        Ok(())
    }

    fn resize(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        if extent.width == 0 || extent.height == 0 || extent == self.context.surface_extent() {
            return Ok(());
        }
        let next = self.context.swapchain().recreate(extent)?;
        self.context.update_swapchain(next)
    }

    fn stats_line(&self, fps: f32) -> String {
        let swapchain = self.context.swapchain();
        let extent = self.context.surface_extent();
        format!(
            "{}x{} {:?} {:?} storage={} {:.1} fps",
            extent.width,
            extent.height,
            swapchain.format(),
            swapchain.present_mode(),
            swapchain.image_usage().contains(vk::ImageUsageFlags::STORAGE),
            fps
        )
    }
}

fn clear_color(elapsed: f32) -> vk::ClearColorValue {
    let wave = |phase: f32| (elapsed + phase).sin() * 0.5 + 0.5;
    vk::ClearColorValue {
        float32: [wave(0.0), wave(2.1), wave(4.2), 1.0],
    }
}

/// Transitions `image` for transfer, clears it and hands it to presentation.
fn record_clear(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    color: vk::ClearColorValue,
) {
    let range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1);

    let to_transfer = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range);

    let to_present = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range);

    // SAFETY: The command buffer is recording, and the image belongs to the
    // swapchain acquired for this frame.
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );
        device.cmd_clear_color_image(
            command_buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &color,
            &[range],
        );
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_present],
        );
    }
}

// The GPU state goes before the window: the surface must be destroyed while
// its window still exists.
struct App {
    gpu: Option<Gpu>,
    window: Option<Window>,
    input: InputState,
    stats: FrameStats,
}

impl App {
    fn new() -> Self {
        Self {
            gpu: None,
            window: None,
            input: InputState::new(),
            stats: FrameStats::default(),
        }
    }

    fn redraw(&mut self) -> RhiResult<()> {
        let Some(gpu) = self.gpu.as_mut() else {
            return Ok(());
        };

        if self.input.is_key_just_pressed(KeyCode::KeyC) {
            gpu.toggle_compression()?;
        }
        if self.input.is_key_just_pressed(KeyCode::KeyV) {
            gpu.toggle_present_mode()?;
        }
        self.input.begin_frame();

        gpu.render(self.stats.elapsed_secs())?;

        if let Some(fps) = self.stats.tick() {
            let line = gpu.stats_line(fps);
            info!("{}", line);
            if let Some(window) = &self.window {
                window.set_title(&format!("{TITLE} - {line}"));
            }
        }
        Ok(())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match Window::new(event_loop, 1280, 720, TITLE) {
            Ok(window) => window,
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };

        match Gpu::new(&window) {
            Ok(gpu) => {
                info!("Initialization complete, entering main loop");
                self.gpu = Some(gpu);
                self.window = Some(window);
            }
            Err(e) => {
                error!("Failed to initialize Vulkan: {:?}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                let extent = vk::Extent2D {
                    width: size.width,
                    height: size.height,
                };
                if let Some(gpu) = self.gpu.as_mut()
                    && let Err(e) = gpu.resize(extent)
                {
                    error!("Failed to resize swapchain: {}", e);
                    event_loop.exit();
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    error!("Render error: {}", e);
                    event_loop.exit();
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    if event.state.is_pressed() {
                        self.input.on_key_pressed(key);
                    } else {
                        self.input.on_key_released(key);
                    }
                }
                if self.input.is_key_just_pressed(KeyCode::Escape) {
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Tear down Vulkan while the window is still alive.
        self.gpu = None;
    }
}

fn main() -> Result<()> {
    framepace_core::init_logging();
    info!("Starting {}", TITLE);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new();
    event_loop.run_app(&mut app)?;

    Ok(())
}
