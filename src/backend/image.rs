// Per-slot image resources
//
// Each presentable image gets a color view, a depth target and a framebuffer
// binding both to the chain's render pass. They are created together and torn
// down together; a slot is never half-built.

use anyhow::{Context, Result};
use ash::vk;

use super::context::SurfacePlatform;

/// Depth image, its backing memory and view.
#[derive(Debug)]
pub struct DepthTarget<M> {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: M,
}

/// Everything owned by one chain slot.
#[derive(Debug)]
pub struct ImageResources<M> {
    pub color_image: vk::Image,
    pub color_view: vk::ImageView,
    pub depth: DepthTarget<M>,
    pub framebuffer: vk::Framebuffer,
}

impl<M> ImageResources<M> {
    /// Build the resources for one swapchain image. On failure anything this
    /// call already created is released before the error is returned.
    pub fn create<D>(
        device: &D,
        color_image: vk::Image,
        color_format: vk::Format,
        depth_format: vk::Format,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<Self>
    where
        D: SurfacePlatform<Memory = M>,
    {
        let color_view = device
            .create_color_view(color_image, color_format)
            .context("Failed to create color view")?;

        let depth = match device.create_depth_target(extent, depth_format) {
            Ok(depth) => depth,
            Err(e) => {
                device.destroy_image_view(color_view);
                return Err(e.context("Failed to create depth target"));
            }
        };

        let framebuffer =
            match device.create_framebuffer(render_pass, &[color_view, depth.view], extent) {
                Ok(framebuffer) => framebuffer,
                Err(e) => {
                    device.destroy_depth_target(depth);
                    device.destroy_image_view(color_view);
                    return Err(e.context("Failed to create framebuffer"));
                }
            };

        Ok(Self {
            color_image,
            color_view,
            depth,
            framebuffer,
        })
    }

    /// Release in reverse creation order. The color image itself belongs to
    /// the swapchain.
    pub fn destroy<D>(self, device: &D)
    where
        D: SurfacePlatform<Memory = M>,
    {
        device.destroy_framebuffer(self.framebuffer);
        device.destroy_depth_target(self.depth);
        device.destroy_image_view(self.color_view);
    }
}
