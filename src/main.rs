// =============================================================================
// FRAME PIPELINE DEMO - Clears a window every frame
// =============================================================================
//
// Drives the frame pipeline against a real window:
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop                                               │
// │    └── FramePipeline (frame slots, acquire / submit / present)  │
// │          └── PresentableChain (swapchain + per-image targets)   │
// │                └── VulkanDevice (instance, queues, allocator)   │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the frame slot's previous submission
// 2. Acquire swapchain image (rebuild on out-of-date)
// 3. Record the clear pass
// 4. Submit, then present
// 5. Rebuild if the window changed or the surface went suboptimal
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use frame_pipeline::{Config, FramePipeline, VulkanDevice};
use std::process::ExitCode;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> ExitCode {
    init_logging();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Fatal error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` overrides the default `info` level.
fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn run() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    log::info!("Starting frame pipeline demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;

    let mut window_attributes = WindowAttributes::default()
        .with_title(&config.window.title)
        .with_inner_size(PhysicalSize::new(config.window.width, config.window.height));
    if config.window.fullscreen {
        window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
    }

    // The window and device must outlive the pipeline that borrows them, so
    // both are created up front instead of inside `resumed`.
    #[allow(deprecated)]
    let window = event_loop
        .create_window(window_attributes)
        .context("Failed to create window")?;

    let device = VulkanDevice::new(&config.window.title, config.debug.validation_layers, &window)
        .context("Failed to initialize Vulkan")?;

    let pipeline = FramePipeline::new(
        &device,
        drawable_extent(window.inner_size()),
        config.pipeline_settings(),
    )
    .context("Failed to create frame pipeline")?;

    let mut app = App::new(&config, &window, pipeline);
    event_loop.run_app(&mut app)?;

    app.finish()
}

fn drawable_extent(size: PhysicalSize<u32>) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App<'d> {
    config: &'d Config,
    window: &'d Window,
    pipeline: FramePipeline<'d, VulkanDevice>,
    is_fullscreen: bool,

    /// First fatal error; ends the event loop.
    fatal: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_frame_time: Instant,
    last_fps_update: Instant,
}

impl<'d> App<'d> {
    fn new(config: &'d Config, window: &'d Window, pipeline: FramePipeline<'d, VulkanDevice>) -> Self {
        let now = Instant::now();
        Self {
            config,
            window,
            pipeline,
            is_fullscreen: config.window.fullscreen,
            fatal: None,
            frame_count: 0,
            last_frame_time: now,
            last_fps_update: now,
        }
    }

    fn finish(self) -> Result<()> {
        match self.fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    /// Returns `false` when the tick was skipped (minimized or rebuilding).
    fn render_frame(&mut self) -> Result<bool> {
        let Some(ctx) = self.pipeline.begin_frame()? else {
            return Ok(false);
        };

        // Clear-only: the pass clears to the configured color
        self.pipeline.begin_target_pass(&ctx);
        self.pipeline.end_target_pass(&ctx);

        self.pipeline.end_frame()?;
        Ok(true)
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Render error: {:?}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        self.is_fullscreen = !self.is_fullscreen;

        if self.is_fullscreen {
            // Enter fullscreen (use current monitor)
            self.window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            self.window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }
        // The resulting Resized event triggers the rebuild
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
            self.window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{}]",
                self.config.window.title,
                fps,
                frame_time * 1000.0,
                mode
            ));

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn is_minimized(&self) -> bool {
        let size = self.window.inner_size();
        size.width == 0 || size.height == 0
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App<'_> {
    fn resumed(&mut self, _event_loop: &ActiveEventLoop) {
        self.window.request_redraw();
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.pipeline.notify_resized(drawable_extent(size));
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => self.fail(event_loop, e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Redraw continuously while visible; block on events while minimized.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.is_minimized() {
            event_loop.set_control_flow(ControlFlow::Wait);
        } else {
            event_loop.set_control_flow(ControlFlow::Poll);
            self.window.request_redraw();
        }
    }
}
