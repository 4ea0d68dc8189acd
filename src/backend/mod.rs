// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash behind two traits, so the swapchain and
// frame-sync logic runs unchanged against a test double.

pub mod context;
pub mod device;
pub mod image;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub(crate) mod mock;

pub use context::{AcquireOutcome, DeviceContext, PresentOutcome, SurfacePlatform};
pub use device::VulkanDevice;
pub use swapchain::{ChainSettings, PresentableChain, Rebuild};
pub use sync::{FrameSlot, FrameSynchronizer};
