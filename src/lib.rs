//! Frame pipeline and swapchain lifecycle on top of Vulkan.
//!
//! `FramePipeline` drives acquire / record / submit / present for a window
//! surface and rebuilds the presentable chain when the surface changes.

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;

pub use backend::{DeviceContext, PresentableChain, SurfacePlatform, VulkanDevice};
pub use config::Config;
pub use error::FrameError;
pub use frame::{FrameContext, FramePipeline, FrameState, PipelineSettings};
