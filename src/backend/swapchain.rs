// Presentable chain - Window presentation
//
// Manages the chain of images we render to and present to the screen, plus
// the depth targets, render pass and framebuffers that go with them.
// The whole set is built and torn down as a unit.

use anyhow::{Context, Result};
use ash::vk;
use std::time::Duration;

use super::context::{AcquireOutcome, PresentOutcome, SurfacePlatform, SwapchainDesc};
use super::image::ImageResources;
use crate::error::FrameError;

/// Four-component 8-bit sRGB formats, in order of preference.
const SRGB_FORMATS: [vk::Format; 3] = [
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::A8B8G8R8_SRGB_PACK32,
];

/// Chain-level policy that survives rebuilds.
#[derive(Debug, Clone, Copy)]
pub struct ChainSettings {
    /// Used when the surface offers it, otherwise FIFO.
    pub preferred_present_mode: vk::PresentModeKHR,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            preferred_present_mode: vk::PresentModeKHR::MAILBOX,
        }
    }
}

/// Outcome of [`PresentableChain::rebuild`].
pub enum Rebuild<'d, D: SurfacePlatform> {
    /// The new chain; the previous one has been destroyed.
    Ready(PresentableChain<'d, D>),
    /// The extent was degenerate. The previous chain is handed back untouched
    /// and the caller should retry once the surface has a drawable size.
    Deferred(PresentableChain<'d, D>),
}

pub struct PresentableChain<'d, D: SurfacePlatform> {
    device: &'d D,
    settings: ChainSettings,
    swapchain: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    depth_format: vk::Format,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    render_pass: vk::RenderPass,
    images: Vec<ImageResources<D::Memory>>,
}

impl<'d, D: SurfacePlatform> PresentableChain<'d, D> {
    /// Build a chain for `extent`. Returns `None` when the extent (or the
    /// extent the surface insists on) has a zero dimension.
    pub fn build(device: &'d D, extent: vk::Extent2D, settings: ChainSettings) -> Result<Option<Self>> {
        Self::create(device, extent, settings, vk::SwapchainKHR::null())
    }

    /// Replace this chain with one sized for `extent`.
    ///
    /// Waits for the device to go idle, builds the new chain with this one as
    /// the aliasing hint, and only then destroys this one. A color or depth
    /// format change is fatal.
    pub fn rebuild(self, extent: vk::Extent2D) -> Result<Rebuild<'d, D>> {
        if is_degenerate(extent) {
            log::debug!("Deferring chain rebuild: extent {}x{}", extent.width, extent.height);
            return Ok(Rebuild::Deferred(self));
        }

        self.device.wait_idle().context("Failed to drain GPU before chain rebuild")?;

        let new = match Self::create(self.device, extent, self.settings, self.swapchain)? {
            Some(new) => new,
            None => {
                log::debug!("Surface reports a degenerate extent, deferring chain rebuild");
                return Ok(Rebuild::Deferred(self));
            }
        };

        if !self.is_format_compatible(&new) {
            return Err(FrameError::FormatChanged {
                old_color: self.color_format(),
                new_color: new.color_format(),
                old_depth: self.depth_format,
                new_depth: new.depth_format,
            }
            .into());
        }

        drop(self);
        Ok(Rebuild::Ready(new))
    }

    fn create(
        device: &'d D,
        requested: vk::Extent2D,
        settings: ChainSettings,
        old: vk::SwapchainKHR,
    ) -> Result<Option<Self>> {
        if is_degenerate(requested) {
            return Ok(None);
        }

        let support = device.surface_support().context("Failed to query surface support")?;
        let surface_format = choose_surface_format(&support.formats)?;
        let present_mode = choose_present_mode(&support.present_modes, settings.preferred_present_mode);
        let extent = choose_extent(&support.capabilities, requested);
        if is_degenerate(extent) {
            return Ok(None);
        }
        let image_count = choose_image_count(&support.capabilities);
        let depth_format = device.depth_format().context("No supported depth format")?;

        log::info!(
            "Creating presentable chain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            image_count,
            present_mode
        );

        let desc = SwapchainDesc {
            image_count,
            surface_format,
            present_mode,
            extent,
            pre_transform: support.capabilities.current_transform,
        };
        let swapchain = device
            .create_swapchain(&desc, old)
            .context("Failed to create swapchain")?;

        // From here on, an early return drops the partially built chain and
        // Drop releases whatever exists so far.
        let mut chain = Self {
            device,
            settings,
            swapchain,
            surface_format,
            depth_format,
            present_mode,
            extent,
            render_pass: vk::RenderPass::null(),
            images: Vec::new(),
        };

        let color_images = device.swapchain_images(swapchain)?;
        chain.render_pass = device
            .create_render_pass(surface_format.format, depth_format)
            .context("Failed to create render pass")?;

        chain.images.reserve(color_images.len());
        for image in color_images {
            let resources = ImageResources::create(
                device,
                image,
                surface_format.format,
                depth_format,
                chain.render_pass,
                extent,
            )?;
            chain.images.push(resources);
        }

        log::info!("Created presentable chain with {} images", chain.images.len());
        Ok(Some(chain))
    }

    /// Ask for the next image, signalling `signal` once it is ready.
    pub fn acquire_image(&self, signal: vk::Semaphore, timeout: Duration) -> Result<AcquireOutcome> {
        let outcome = self.device.acquire_next_image(self.swapchain, signal, timeout)?;
        if let AcquireOutcome::Image { index, .. } = outcome {
            debug_assert!((index as usize) < self.images.len());
        }
        Ok(outcome)
    }

    /// Queue `image_index` for display once `wait` is signalled.
    pub fn present(&self, wait: vk::Semaphore, image_index: u32) -> Result<PresentOutcome> {
        self.device.present(self.swapchain, image_index, wait)
    }

    /// Two chains can replace each other only if their attachments agree.
    pub fn is_format_compatible(&self, other: &Self) -> bool {
        self.color_format() == other.color_format() && self.depth_format == other.depth_format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }

    pub fn color_format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, index: usize) -> vk::Framebuffer {
        self.images[index].framebuffer
    }

    pub fn color_view(&self, index: usize) -> vk::ImageView {
        self.images[index].color_view
    }

    pub fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }
}

impl<D: SurfacePlatform> Drop for PresentableChain<'_, D> {
    fn drop(&mut self) {
        for resources in self.images.drain(..) {
            resources.destroy(self.device);
        }
        if self.render_pass != vk::RenderPass::null() {
            self.device.destroy_render_pass(self.render_pass);
        }
        self.device.destroy_swapchain(self.swapchain);
    }
}

pub(crate) fn is_degenerate(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

/// Prefer an 8-bit sRGB format, otherwise take whatever comes first.
pub(crate) fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            SRGB_FORMATS.contains(&f.format) && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or_else(|| FrameError::NoSurfaceFormat.into())
}

// MAILBOX: No vsync, no tearing, triple buffered
// FIFO: Vsync enabled, guaranteed available
pub(crate) fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub(crate) fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: requested
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means no maximum).
pub(crate) fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        image_count = caps.max_image_count;
    }
    image_count
}
