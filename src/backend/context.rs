// Device seam
//
// Everything the frame pipeline needs from the GPU goes through these two
// traits. `VulkanDevice` implements them on top of ash; tests use a recording
// mock. Handles are plain `ash::vk` handles so both sides share one vocabulary.

use anyhow::Result;
use ash::vk;
use std::time::Duration;

use super::image::DepthTarget;

/// One graphics-queue submission: a single command buffer guarded by the
/// frame slot's semaphores and completion fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

/// What the output-target pass binds and clears.
#[derive(Debug, Clone, Copy)]
pub struct TargetPassInfo {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
}

/// Snapshot of what the surface currently allows.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Parameters for a swapchain, already resolved against `SurfaceSupport`.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// Result of asking the surface for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image { index: u32, suboptimal: bool },
    /// The chain no longer matches the surface and must be rebuilt.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented, but the chain should be rebuilt.
    Suboptimal,
    /// Not presented; the chain must be rebuilt.
    Stale,
}

impl PresentOutcome {
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, PresentOutcome::Presented)
    }
}

/// Logical device, its queues and its command pool.
///
/// Errors returned from here are fatal (device lost, out of memory). Callers
/// propagate them and shut down.
pub trait DeviceContext {
    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]);

    /// Reset `cmd` and begin a one-time-submit recording.
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Begin the output-target pass and set a full-extent viewport and scissor.
    fn begin_target_pass(&self, cmd: vk::CommandBuffer, target: &TargetPassInfo);
    fn end_target_pass(&self, cmd: vk::CommandBuffer);

    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn destroy_fence(&self, fence: vk::Fence);

    /// Block until `fence` is signalled. Expiry of `timeout` is fatal.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn submit(&self, submission: &Submission) -> Result<()>;

    /// Block until every queue is drained.
    fn wait_idle(&self) -> Result<()>;
}

/// The presentable-surface half of the platform: swapchain and the
/// attachments that hang off it.
pub trait SurfacePlatform: DeviceContext {
    /// Backing memory of a depth target.
    type Memory;

    fn surface_support(&self) -> Result<SurfaceSupport>;
    fn depth_format(&self) -> Result<vk::Format>;

    /// `old` is the chain being replaced (null on first build) and lets the
    /// platform alias its resources.
    fn create_swapchain(&self, desc: &SwapchainDesc, old: vk::SwapchainKHR)
        -> Result<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    fn create_color_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_depth_target(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Result<DepthTarget<Self::Memory>>;
    fn destroy_depth_target(&self, target: DepthTarget<Self::Memory>);

    fn create_render_pass(&self, color: vk::Format, depth: vk::Format) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> Result<AcquireOutcome>;

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome>;
}
