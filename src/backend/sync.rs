// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync.
// Semaphores are per frame slot; image reuse is guarded by tracking which
// slot's fence last submitted work against each presentable image.

use anyhow::{Context, Result};
use ash::vk;
use std::time::Duration;

use super::context::DeviceContext;

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSlot {
    fn new<D: DeviceContext>(device: &D) -> Result<Self> {
        let image_available = device.create_semaphore()?;
        let render_finished = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        // Start signaled so the first wait on each slot returns immediately
        let in_flight_fence = match device.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(render_finished);
                device.destroy_semaphore(image_available);
                return Err(e);
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    fn destroy<D: DeviceContext>(&self, device: &D) {
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
        device.destroy_fence(self.in_flight_fence);
    }
}

/// Bounds the number of frames in flight and keeps two frame slots from ever
/// touching the same presentable image at once.
pub struct FrameSynchronizer<'d, D: DeviceContext> {
    device: &'d D,
    slots: Vec<FrameSlot>,
    /// Fence of the last submission that rendered into each image.
    images_in_flight: Vec<Option<vk::Fence>>,
    fence_timeout: Duration,
}

impl<'d, D: DeviceContext> FrameSynchronizer<'d, D> {
    pub fn new(
        device: &'d D,
        frames_in_flight: usize,
        image_count: usize,
        fence_timeout: Duration,
    ) -> Result<Self> {
        assert!(frames_in_flight >= 1, "at least one frame must be allowed in flight");

        let mut sync = Self {
            device,
            slots: Vec::with_capacity(frames_in_flight),
            images_in_flight: vec![None; image_count],
            fence_timeout,
        };
        for i in 0..frames_in_flight {
            let slot = FrameSlot::new(device)
                .with_context(|| format!("Failed to create sync objects for frame slot {}", i))?;
            sync.slots.push(slot);
        }

        Ok(sync)
    }

    /// CPU back-pressure: block until the frame that last used `slot` is done
    /// on the GPU.
    pub fn acquire_wait(&self, slot: usize) -> Result<()> {
        self.device
            .wait_for_fence(self.slots[slot].in_flight_fence, self.fence_timeout)
            .with_context(|| format!("Waiting for frame slot {}", slot))
    }

    /// Record that `slot` is about to submit work rendering into `image`.
    ///
    /// If another slot's submission still owns the image, wait for it first.
    /// This covers chains with more images than frames in flight and
    /// acquisition orders that skip ahead.
    pub fn register_image_use(&mut self, image: usize, slot: usize) -> Result<()> {
        let fence = self.slots[slot].in_flight_fence;
        if let Some(previous) = self.images_in_flight[image] {
            if previous != fence {
                log::debug!("Image {} still owned by another frame slot, waiting", image);
                self.device
                    .wait_for_fence(previous, self.fence_timeout)
                    .with_context(|| format!("Waiting for previous user of image {}", image))?;
            }
        }
        self.images_in_flight[image] = Some(fence);
        Ok(())
    }

    /// Unsignal `slot`'s fence right before it is handed to a submission.
    pub fn begin_submission(&self, slot: usize) -> Result<()> {
        self.device.reset_fence(self.slots[slot].in_flight_fence)
    }

    /// Forget image ownership and resize for a rebuilt chain. Only valid once
    /// the device is idle.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, None);
    }

    pub fn slot(&self, slot: usize) -> &FrameSlot {
        &self.slots[slot]
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn image_count(&self) -> usize {
        self.images_in_flight.len()
    }

    /// Fence that last submitted against `image`, if any.
    pub fn image_owner(&self, image: usize) -> Option<vk::Fence> {
        self.images_in_flight[image]
    }
}

impl<D: DeviceContext> Drop for FrameSynchronizer<'_, D> {
    fn drop(&mut self) {
        for slot in &self.slots {
            slot.destroy(self.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, MockDevice};

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn slots_are_independent_of_image_count() {
        let device = MockDevice::new();
        let sync = FrameSynchronizer::new(&device, 2, 3, TIMEOUT).unwrap();
        assert_eq!(sync.frames_in_flight(), 2);
        assert_eq!(sync.image_count(), 3);
        assert_eq!(device.count(|c| matches!(c, Call::CreateSemaphore(_))), 4);
        assert_eq!(device.count(|c| matches!(c, Call::CreateFence { signaled: true, .. })), 2);
    }

    #[test]
    fn fresh_slots_do_not_block() {
        let device = MockDevice::new();
        let sync = FrameSynchronizer::new(&device, 2, 3, TIMEOUT).unwrap();
        sync.acquire_wait(0).unwrap();
        sync.acquire_wait(1).unwrap();
        assert_eq!(device.count(|c| matches!(c, Call::WaitFence { was_pending: true, .. })), 0);
    }

    #[test]
    fn reusing_image_from_another_slot_waits_on_its_fence() {
        let device = MockDevice::new();
        let mut sync = FrameSynchronizer::new(&device, 2, 3, TIMEOUT).unwrap();
        let first = sync.slot(0).in_flight_fence;

        sync.register_image_use(1, 0).unwrap();
        sync.begin_submission(0).unwrap();
        device.mark_pending(first);
        device.clear_calls();

        sync.register_image_use(1, 1).unwrap();
        assert_eq!(
            device.calls(),
            vec![Call::WaitFence { fence: first, was_pending: true }]
        );
        assert_eq!(sync.image_owner(1), Some(sync.slot(1).in_flight_fence));
    }

    #[test]
    fn reusing_image_from_same_slot_does_not_wait_again() {
        let device = MockDevice::new();
        let mut sync = FrameSynchronizer::new(&device, 2, 3, TIMEOUT).unwrap();
        sync.register_image_use(2, 1).unwrap();
        device.clear_calls();

        sync.register_image_use(2, 1).unwrap();
        assert!(device.calls().is_empty());
    }

    #[test]
    fn reset_images_clears_and_resizes_table() {
        let device = MockDevice::new();
        let mut sync = FrameSynchronizer::new(&device, 2, 2, TIMEOUT).unwrap();
        sync.register_image_use(0, 0).unwrap();
        sync.register_image_use(1, 1).unwrap();

        sync.reset_images(4);
        assert_eq!(sync.image_count(), 4);
        assert!((0..4).all(|i| sync.image_owner(i).is_none()));
        assert_eq!(sync.frames_in_flight(), 2);
    }

    #[test]
    fn fence_timeout_is_fatal() {
        let device = MockDevice::new();
        let sync = FrameSynchronizer::new(&device, 2, 2, TIMEOUT).unwrap();
        let fence = sync.slot(0).in_flight_fence;
        device.mark_pending(fence);
        device.hang_fence(fence);

        let err = sync.acquire_wait(0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::FrameError>(),
            Some(crate::error::FrameError::FenceTimeout(_))
        ));
    }

    #[test]
    fn drop_destroys_sync_objects() {
        let device = MockDevice::new();
        let sync = FrameSynchronizer::new(&device, 3, 2, TIMEOUT).unwrap();
        drop(sync);
        assert!(device.live_objects().is_empty());
    }
}
