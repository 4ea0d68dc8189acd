// Fatal error taxonomy
//
// Stale surfaces and degenerate extents are ordinary control flow and never
// show up here. Everything in this enum is unrecoverable for the frame
// pipeline: the caller is expected to log it and shut down.

use ash::vk;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("GPU device lost")]
    DeviceLost,

    #[error("frame fence not signalled after {0:?}; assuming a device fault")]
    FenceTimeout(Duration),

    #[error(
        "presentable chain format changed across rebuild \
         (color {old_color:?} -> {new_color:?}, depth {old_depth:?} -> {new_depth:?})"
    )]
    FormatChanged {
        old_color: vk::Format,
        new_color: vk::Format,
        old_depth: vk::Format,
        new_depth: vk::Format,
    },

    #[error("surface reports no supported formats")]
    NoSurfaceFormat,

    #[error("no GPU can render and present to this surface")]
    NoSuitableGpu,

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
}

impl FrameError {
    /// Classify a raw Vulkan failure from `call`.
    pub fn from_vk(call: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => FrameError::DeviceLost,
            result => FrameError::Vulkan { call, result },
        }
    }
}

/// Extension for turning `VkResult<T>` into `anyhow::Result<T>` tagged with the
/// failing call.
pub trait VkResultExt<T> {
    fn vk_context(self, call: &'static str) -> anyhow::Result<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn vk_context(self, call: &'static str) -> anyhow::Result<T> {
        self.map_err(|result| FrameError::from_vk(call, result).into())
    }
}
