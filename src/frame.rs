// Frame pipeline - acquire / record / submit / present
//
// FRAME FLOW:
// ┌──────────────────────────────────────────────────────────────────────┐
// │  begin_frame ─> (record) ─> end_frame                                 │
// │   wait slot fence           register image use                        │
// │   acquire image             submit (wait acquired, signal finished)   │
// │   begin command buffer      present (wait finished)                   │
// │                             rebuild chain if stale / resized          │
// └──────────────────────────────────────────────────────────────────────┘
//
// Stale surfaces and degenerate extents never surface as errors: begin_frame
// returns `None` ("skip this tick") and the chain is rebuilt transparently.
// Calling the operations out of order is a programming error and panics.

use anyhow::{Context, Result};
use ash::vk;
use std::time::Duration;

use crate::backend::context::{AcquireOutcome, SurfacePlatform, Submission, TargetPassInfo};
use crate::backend::swapchain::{is_degenerate, ChainSettings, PresentableChain, Rebuild};
use crate::backend::sync::FrameSynchronizer;

/// Tunables for a [`FramePipeline`].
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Frame slots; bounds how far the CPU may run ahead of the GPU.
    pub frames_in_flight: usize,
    pub chain: ChainSettings,
    pub clear_color: [f32; 4],
    /// A frame fence that stays unsignalled this long is treated as a device
    /// fault.
    pub fence_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            chain: ChainSettings::default(),
            clear_color: [0.1, 0.1, 0.1, 1.0],
            fence_timeout: Duration::from_secs(10),
        }
    }
}

/// Counts submitted frames. The active frame slot is derived from it; the
/// acquired image index is tracked separately since acquisition order need
/// not follow submission order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCursor {
    submitted: u64,
}

impl FrameCursor {
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn slot(&self, frames_in_flight: usize) -> usize {
        (self.submitted % frames_in_flight as u64) as usize
    }

    fn advance(&mut self) {
        self.submitted += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording { in_target_pass: bool },
    Submitted,
}

/// Recording context handed to renderers between `begin_frame` and
/// `end_frame`. Must not be used after `end_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub command_buffer: vk::CommandBuffer,
    pub image_index: u32,
    pub frame_index: usize,
    pub extent: vk::Extent2D,
}

/// Drives the presentable chain and frame synchronization for one surface.
///
/// Borrows the device, which must outlive the pipeline. Owns the chain and
/// the per-slot command buffers.
pub struct FramePipeline<'d, D: SurfacePlatform> {
    device: &'d D,
    settings: PipelineSettings,
    chain: Option<PresentableChain<'d, D>>,
    sync: FrameSynchronizer<'d, D>,
    command_buffers: Vec<vk::CommandBuffer>,
    cursor: FrameCursor,
    state: FrameState,
    current_image: u32,
    target: Option<TargetPassInfo>,
    /// Latest drawable extent reported by the platform.
    extent: vk::Extent2D,
    resized: bool,
    needs_rebuild: bool,
}

impl<'d, D: SurfacePlatform> FramePipeline<'d, D> {
    pub fn new(device: &'d D, extent: vk::Extent2D, settings: PipelineSettings) -> Result<Self> {
        log::info!(
            "Creating frame pipeline: {}x{}, {} frames in flight",
            extent.width,
            extent.height,
            settings.frames_in_flight
        );

        let chain = PresentableChain::build(device, extent, settings.chain)
            .context("Failed to build presentable chain")?;
        if chain.is_none() {
            log::debug!("Surface has no drawable extent yet, deferring chain build");
        }
        let image_count = chain.as_ref().map_or(0, |c| c.image_count());

        let sync = FrameSynchronizer::new(
            device,
            settings.frames_in_flight,
            image_count,
            settings.fence_timeout,
        )?;

        // One command buffer per frame slot, reused across chain rebuilds
        let command_buffers = device
            .allocate_command_buffers(settings.frames_in_flight as u32)
            .context("Failed to allocate frame command buffers")?;

        Ok(Self {
            device,
            settings,
            needs_rebuild: chain.is_none(),
            chain,
            sync,
            command_buffers,
            cursor: FrameCursor::default(),
            state: FrameState::Idle,
            current_image: 0,
            target: None,
            extent,
            resized: false,
        })
    }

    /// The platform's "please rebuild" notification.
    pub fn notify_resized(&mut self, extent: vk::Extent2D) {
        log::debug!("Drawable resized to {}x{}", extent.width, extent.height);
        self.extent = extent;
        self.resized = true;
    }

    /// Start a frame. `None` means there is nothing to render into this tick
    /// (stale chain just rebuilt, or no drawable extent); try again next tick.
    pub fn begin_frame(&mut self) -> Result<Option<FrameContext>> {
        assert_eq!(
            self.state,
            FrameState::Idle,
            "begin_frame called while a frame is already in progress"
        );

        if is_degenerate(self.extent) {
            self.needs_rebuild = true;
            return Ok(None);
        }
        if self.needs_rebuild && !self.rebuild_chain()? {
            return Ok(None);
        }

        let slot = self.cursor.slot(self.settings.frames_in_flight);
        let image_available = self.sync.slot(slot).image_available;

        self.state = FrameState::Acquiring;
        self.sync.acquire_wait(slot)?;

        let chain = self.chain.as_ref().context("Presentable chain not initialized")?;
        let chain_extent = chain.extent();
        let render_pass = chain.render_pass();
        let outcome = chain.acquire_image(image_available, self.settings.fence_timeout)?;

        let image_index = match outcome {
            AcquireOutcome::Image { index, suboptimal } => {
                if suboptimal {
                    log::warn!("Acquired image from a suboptimal chain, rebuilding after present");
                    self.needs_rebuild = true;
                }
                index
            }
            AcquireOutcome::Stale => {
                log::debug!("Presentable chain is stale, skipping frame");
                self.state = FrameState::Idle;
                self.needs_rebuild = true;
                self.rebuild_chain()?;
                return Ok(None);
            }
        };

        let framebuffer = self
            .chain
            .as_ref()
            .context("Presentable chain not initialized")?
            .framebuffer(image_index as usize);

        let command_buffer = self.command_buffers[slot];
        self.device.begin_commands(command_buffer)?;

        self.current_image = image_index;
        self.target = Some(TargetPassInfo {
            render_pass,
            framebuffer,
            extent: chain_extent,
            clear_color: self.settings.clear_color,
        });
        self.state = FrameState::Recording { in_target_pass: false };

        Ok(Some(FrameContext {
            command_buffer,
            image_index,
            frame_index: slot,
            extent: chain_extent,
        }))
    }

    /// Open the output-target pass on the acquired image.
    pub fn begin_target_pass(&mut self, ctx: &FrameContext) {
        match (self.state, self.target) {
            (FrameState::Recording { in_target_pass: false }, Some(target)) => {
                self.check_context(ctx);
                self.device.begin_target_pass(ctx.command_buffer, &target);
                self.state = FrameState::Recording { in_target_pass: true };
            }
            (state, _) => panic!("begin_target_pass called outside frame recording (state: {:?})", state),
        }
    }

    pub fn end_target_pass(&mut self, ctx: &FrameContext) {
        assert_eq!(
            self.state,
            FrameState::Recording { in_target_pass: true },
            "end_target_pass called without an open target pass"
        );
        self.check_context(ctx);
        self.device.end_target_pass(ctx.command_buffer);
        self.state = FrameState::Recording { in_target_pass: false };
    }

    /// Finish recording, submit and present. Rebuilds the chain afterwards if
    /// presentation reported it stale or the drawable was resized; the frame
    /// just submitted completes normally either way.
    pub fn end_frame(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            FrameState::Recording { in_target_pass: false },
            "end_frame called outside frame recording or with the target pass still open"
        );

        let slot = self.cursor.slot(self.settings.frames_in_flight);
        let command_buffer = self.command_buffers[slot];
        self.device.end_commands(command_buffer)?;

        self.sync.register_image_use(self.current_image as usize, slot)?;
        self.sync.begin_submission(slot)?;

        let frame = *self.sync.slot(slot);
        self.device.submit(&Submission {
            command_buffer,
            wait_semaphore: frame.image_available,
            signal_semaphore: frame.render_finished,
            fence: frame.in_flight_fence,
        })?;
        self.state = FrameState::Submitted;
        self.target = None;

        let outcome = self
            .chain
            .as_ref()
            .context("Presentable chain not initialized")?
            .present(frame.render_finished, self.current_image)?;

        if outcome.needs_rebuild() || self.resized || self.needs_rebuild {
            self.resized = false;
            self.needs_rebuild = true;
            self.rebuild_chain()?;
        }

        self.cursor.advance();
        self.state = FrameState::Idle;
        Ok(())
    }

    /// Rebuild (or first build) the chain for the latest extent. Returns
    /// `false` when the extent is degenerate and the rebuild stays pending.
    fn rebuild_chain(&mut self) -> Result<bool> {
        let extent = self.extent;
        let rebuilt = match self.chain.take() {
            None => PresentableChain::build(self.device, extent, self.settings.chain)?,
            Some(old) => match old.rebuild(extent)? {
                Rebuild::Ready(new) => Some(new),
                Rebuild::Deferred(old) => {
                    self.chain = Some(old);
                    None
                }
            },
        };

        match rebuilt {
            Some(chain) => {
                log::info!(
                    "Presentable chain ready: {}x{}, {} images",
                    chain.extent().width,
                    chain.extent().height,
                    chain.image_count()
                );
                self.sync.reset_images(chain.image_count());
                self.chain = Some(chain);
                self.needs_rebuild = false;
                Ok(true)
            }
            None => {
                log::debug!("No drawable extent, chain rebuild stays pending");
                self.needs_rebuild = true;
                Ok(false)
            }
        }
    }

    fn check_context(&self, ctx: &FrameContext) {
        assert_eq!(
            ctx.command_buffer,
            self.command_buffers[self.cursor.slot(self.settings.frames_in_flight)],
            "frame context does not belong to the current frame"
        );
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_frame_in_progress(&self) -> bool {
        matches!(self.state, FrameState::Recording { .. })
    }

    pub fn cursor(&self) -> FrameCursor {
        self.cursor
    }

    /// Frame slot the next (or current) frame uses.
    pub fn frame_index(&self) -> usize {
        self.cursor.slot(self.settings.frames_in_flight)
    }

    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        assert!(self.is_frame_in_progress(), "no frame in progress");
        self.command_buffers[self.frame_index()]
    }

    pub fn chain(&self) -> Option<&PresentableChain<'d, D>> {
        self.chain.as_ref()
    }

    pub fn aspect_ratio(&self) -> Option<f32> {
        self.chain.as_ref().map(|c| c.aspect_ratio())
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }
}

impl<D: SurfacePlatform> Drop for FramePipeline<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Failed to drain GPU before pipeline teardown: {:?}", e);
        }
        self.device.free_command_buffers(&self.command_buffers);
        // chain and synchronizer drop after this
    }
}
