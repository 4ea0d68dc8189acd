// Recording device for tests
//
// Hands out fake handles, logs every call in order and models fences as
// signalled/unsignalled. A wait on an unsignalled fence stands in for the GPU
// finishing that work.

use anyhow::{anyhow, Result};
use ash::vk::{self, Handle};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use super::context::{
    AcquireOutcome, DeviceContext, PresentOutcome, Submission, SurfacePlatform, SurfaceSupport,
    SwapchainDesc, TargetPassInfo,
};
use super::image::DepthTarget;
use crate::error::FrameError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AllocateCommandBuffers(Vec<vk::CommandBuffer>),
    FreeCommandBuffers(Vec<vk::CommandBuffer>),
    BeginCommands(vk::CommandBuffer),
    EndCommands(vk::CommandBuffer),
    BeginTargetPass { cmd: vk::CommandBuffer, framebuffer: vk::Framebuffer },
    EndTargetPass(vk::CommandBuffer),
    CreateSemaphore(vk::Semaphore),
    CreateFence { fence: vk::Fence, signaled: bool },
    DestroySemaphore(vk::Semaphore),
    DestroyFence(vk::Fence),
    WaitFence { fence: vk::Fence, was_pending: bool },
    ResetFence(vk::Fence),
    Submit(Submission),
    WaitIdle,
    SurfaceSupport,
    CreateSwapchain { swapchain: vk::SwapchainKHR, old: vk::SwapchainKHR, image_count: u32 },
    DestroySwapchain(vk::SwapchainKHR),
    CreateColorView(vk::ImageView),
    DestroyImageView(vk::ImageView),
    CreateDepthTarget(vk::Image),
    DestroyDepthTarget(vk::Image),
    CreateRenderPass(vk::RenderPass),
    DestroyRenderPass(vk::RenderPass),
    CreateFramebuffer(vk::Framebuffer),
    DestroyFramebuffer(vk::Framebuffer),
    Acquire { swapchain: vk::SwapchainKHR, signal: vk::Semaphore },
    Present { swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore },
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: bool,
    hung: bool,
}

struct State {
    next_handle: u64,
    calls: Vec<Call>,
    support: SurfaceSupport,
    depth_format: vk::Format,
    fences: HashMap<vk::Fence, FenceState>,
    live: BTreeMap<u64, &'static str>,
    swapchain_images: HashMap<vk::SwapchainKHR, u32>,
    last_image_count: Option<u32>,
    next_image: u32,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    present_failure: Option<vk::Result>,
    framebuffer_budget: Option<usize>,
    outstanding: HashSet<vk::Fence>,
    max_outstanding: usize,
}

pub struct MockDevice {
    state: RefCell<State>,
}

impl MockDevice {
    pub fn new() -> Self {
        let support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D { width: 16384, height: 16384 },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };

        Self {
            state: RefCell::new(State {
                next_handle: 1,
                calls: Vec::new(),
                support,
                depth_format: vk::Format::D32_SFLOAT,
                fences: HashMap::new(),
                live: BTreeMap::new(),
                swapchain_images: HashMap::new(),
                last_image_count: None,
                next_image: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                present_failure: None,
                framebuffer_budget: None,
                outstanding: HashSet::new(),
                max_outstanding: 0,
            }),
        }
    }

    // --- scripting -------------------------------------------------------

    pub fn set_image_counts(&self, min: u32, max: u32) {
        let mut state = self.state.borrow_mut();
        state.support.capabilities.min_image_count = min;
        state.support.capabilities.max_image_count = max;
    }

    pub fn set_current_extent(&self, extent: vk::Extent2D) {
        self.state.borrow_mut().support.capabilities.current_extent = extent;
    }

    pub fn set_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.borrow_mut().support.formats = formats;
    }

    pub fn push_acquire(&self, outcome: AcquireOutcome) {
        self.state.borrow_mut().acquire_script.push_back(outcome);
    }

    pub fn push_present(&self, outcome: PresentOutcome) {
        self.state.borrow_mut().present_script.push_back(outcome);
    }

    pub fn fail_next_present(&self, result: vk::Result) {
        self.state.borrow_mut().present_failure = Some(result);
    }

    /// Let `count` framebuffer creations succeed, fail the next one.
    pub fn fail_framebuffer_after(&self, count: usize) {
        self.state.borrow_mut().framebuffer_budget = Some(count);
    }

    pub fn mark_pending(&self, fence: vk::Fence) {
        self.state.borrow_mut().fences.entry(fence).or_default().signaled = false;
    }

    /// The fence never signals; waits on it time out.
    pub fn hang_fence(&self, fence: vk::Fence) {
        self.state.borrow_mut().fences.entry(fence).or_default().hung = true;
    }

    // --- inspection ------------------------------------------------------

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|&c| pred(c)).count()
    }

    pub fn last_swapchain_image_count(&self) -> Option<u32> {
        self.state.borrow().last_image_count
    }

    /// Objects created and not yet destroyed, as `(raw handle, kind)`.
    pub fn live_objects(&self) -> Vec<(u64, &'static str)> {
        self.state.borrow().live.iter().map(|(h, k)| (*h, *k)).collect()
    }

    /// Most submissions that were ever outstanding (submitted, not yet waited).
    pub fn max_outstanding(&self) -> usize {
        self.state.borrow().max_outstanding
    }

    pub fn is_pending(&self, fence: vk::Fence) -> bool {
        self.state
            .borrow()
            .fences
            .get(&fence)
            .map(|f| !f.signaled)
            .unwrap_or(false)
    }

    // --- helpers ---------------------------------------------------------

    fn handle<H: Handle>(&self, kind: &'static str) -> H {
        let mut state = self.state.borrow_mut();
        let raw = state.next_handle;
        state.next_handle += 1;
        state.live.insert(raw, kind);
        H::from_raw(raw)
    }

    fn release<H: Handle>(&self, handle: H) {
        let raw = handle.as_raw();
        let removed = self.state.borrow_mut().live.remove(&raw);
        assert!(removed.is_some(), "double destroy of handle {:#x}", raw);
    }

    fn log(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceContext for MockDevice {
    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let buffers: Vec<vk::CommandBuffer> =
            (0..count).map(|_| self.handle("command buffer")).collect();
        self.log(Call::AllocateCommandBuffers(buffers.clone()));
        Ok(buffers)
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        for &cmd in buffers {
            self.release(cmd);
        }
        self.log(Call::FreeCommandBuffers(buffers.to_vec()));
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.log(Call::BeginCommands(cmd));
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.log(Call::EndCommands(cmd));
        Ok(())
    }

    fn begin_target_pass(&self, cmd: vk::CommandBuffer, target: &TargetPassInfo) {
        self.log(Call::BeginTargetPass { cmd, framebuffer: target.framebuffer });
    }

    fn end_target_pass(&self, cmd: vk::CommandBuffer) {
        self.log(Call::EndTargetPass(cmd));
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore = self.handle("semaphore");
        self.log(Call::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let fence = self.handle("fence");
        self.state
            .borrow_mut()
            .fences
            .insert(fence, FenceState { signaled, hung: false });
        self.log(Call::CreateFence { fence, signaled });
        Ok(fence)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.release(semaphore);
        self.log(Call::DestroySemaphore(semaphore));
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.release(fence);
        self.state.borrow_mut().fences.remove(&fence);
        self.log(Call::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()> {
        let was_pending = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let entry = state.fences.entry(fence).or_default();
            if entry.hung {
                return Err(FrameError::FenceTimeout(timeout).into());
            }
            let was_pending = !entry.signaled;
            entry.signaled = true;
            state.outstanding.remove(&fence);
            was_pending
        };
        self.log(Call::WaitFence { fence, was_pending });
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.state.borrow_mut().fences.entry(fence).or_default().signaled = false;
        self.log(Call::ResetFence(fence));
        Ok(())
    }

    fn submit(&self, submission: &Submission) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let fence = state.fences.entry(submission.fence).or_default();
            assert!(!fence.signaled, "submitted with a fence that was not reset");
            state.outstanding.insert(submission.fence);
            state.max_outstanding = state.max_outstanding.max(state.outstanding.len());
        }
        self.log(Call::Submit(*submission));
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            state.outstanding.clear();
            for fence in state.fences.values_mut() {
                if !fence.hung {
                    fence.signaled = true;
                }
            }
        }
        self.log(Call::WaitIdle);
        Ok(())
    }
}

impl SurfacePlatform for MockDevice {
    type Memory = u64;

    fn surface_support(&self) -> Result<SurfaceSupport> {
        self.log(Call::SurfaceSupport);
        Ok(self.state.borrow().support.clone())
    }

    fn depth_format(&self) -> Result<vk::Format> {
        Ok(self.state.borrow().depth_format)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc, old: vk::SwapchainKHR) -> Result<vk::SwapchainKHR> {
        let swapchain = self.handle("swapchain");
        {
            let mut state = self.state.borrow_mut();
            state.swapchain_images.insert(swapchain, desc.image_count);
            state.last_image_count = Some(desc.image_count);
            state.next_image = 0;
        }
        self.log(Call::CreateSwapchain { swapchain, old, image_count: desc.image_count });
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let count = self.state.borrow().swapchain_images[&swapchain];
        // Swapchain images are owned by the swapchain, not tracked as live.
        Ok((0..count)
            .map(|i| vk::Image::from_raw(0x1000_0000 + (swapchain.as_raw() << 8) + i as u64))
            .collect())
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.release(swapchain);
        self.log(Call::DestroySwapchain(swapchain));
    }

    fn create_color_view(&self, _image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        let view = self.handle("color view");
        self.log(Call::CreateColorView(view));
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.release(view);
        self.log(Call::DestroyImageView(view));
    }

    fn create_depth_target(&self, _extent: vk::Extent2D, _format: vk::Format) -> Result<DepthTarget<u64>> {
        let image: vk::Image = self.handle("depth image");
        let view = self.handle("depth view");
        let memory = self.handle::<vk::DeviceMemory>("depth memory").as_raw();
        self.log(Call::CreateDepthTarget(image));
        Ok(DepthTarget { image, view, memory })
    }

    fn destroy_depth_target(&self, target: DepthTarget<u64>) {
        self.release(target.view);
        self.release(target.image);
        self.release(vk::DeviceMemory::from_raw(target.memory));
        self.log(Call::DestroyDepthTarget(target.image));
    }

    fn create_render_pass(&self, _color: vk::Format, _depth: vk::Format) -> Result<vk::RenderPass> {
        let render_pass = self.handle("render pass");
        self.log(Call::CreateRenderPass(render_pass));
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.release(render_pass);
        self.log(Call::DestroyRenderPass(render_pass));
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        {
            let mut state = self.state.borrow_mut();
            if let Some(budget) = state.framebuffer_budget.as_mut() {
                if *budget == 0 {
                    return Err(anyhow!(FrameError::from_vk(
                        "vkCreateFramebuffer",
                        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                    )));
                }
                *budget -= 1;
            }
        }
        let framebuffer = self.handle("framebuffer");
        self.log(Call::CreateFramebuffer(framebuffer));
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.release(framebuffer);
        self.log(Call::DestroyFramebuffer(framebuffer));
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        _timeout: Duration,
    ) -> Result<AcquireOutcome> {
        self.log(Call::Acquire { swapchain, signal });
        let mut state = self.state.borrow_mut();
        if let Some(outcome) = state.acquire_script.pop_front() {
            return Ok(outcome);
        }
        let count = state.swapchain_images[&swapchain];
        let index = state.next_image % count;
        state.next_image += 1;
        Ok(AcquireOutcome::Image { index, suboptimal: false })
    }

    fn present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        self.log(Call::Present { swapchain, image_index, wait });
        let mut state = self.state.borrow_mut();
        if let Some(result) = state.present_failure.take() {
            return Err(FrameError::from_vk("vkQueuePresentKHR", result).into());
        }
        Ok(state.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
    }
}
