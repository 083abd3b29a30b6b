// Frame synchronization
//
// One fence and two semaphores, full stop: this engine keeps exactly one
// frame in flight. The fence gates command-buffer re-recording on the
// CPU; the semaphores order acquire -> submit -> present on the GPU.

use anyhow::Result;
use ash::vk;

use super::DeviceContext;

/// How long a frame fence may stay unsignaled before the driver is
/// declared lost. An unbounded wait would hang the process on a hung
/// GPU.
const FENCE_TIMEOUT_NS: u64 = 4_000_000_000;

/// Surfaced when the frame fence times out or the driver reports device
/// loss. Callers can downcast to it through the anyhow chain.
#[derive(Debug, Clone, Copy)]
pub struct DeviceLost;

impl std::fmt::Display for DeviceLost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GPU device lost (frame fence not signaled within 4s)")
    }
}

impl std::error::Error for DeviceLost {}

/// The single frame-in-flight synchronization trio.
///
/// Created once in `post_initialize` and destroyed only at cleanup;
/// swapchain recreation does not touch it.
pub struct FrameSync {
    pub image_acquired: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Signaled so the first frame's wait falls through
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_acquired: ctx.device.create_semaphore(&semaphore_info, None)?,
                render_finished: ctx.device.create_semaphore(&semaphore_info, None)?,
                in_flight: ctx.device.create_fence(&fence_info, None)?,
            })
        }
    }

    /// Block until the previous frame's GPU work completes, bounded by
    /// [`FENCE_TIMEOUT_NS`]. A timeout or driver-reported loss surfaces
    /// [`DeviceLost`].
    pub fn wait_previous_frame(&self, ctx: &DeviceContext) -> Result<()> {
        let result = unsafe {
            ctx.device
                .wait_for_fences(&[self.in_flight], true, FENCE_TIMEOUT_NS)
        };

        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::ERROR_DEVICE_LOST) => {
                Err(anyhow::Error::new(DeviceLost))
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to wait for frame fence")),
        }
    }

    pub fn reset(&self, ctx: &DeviceContext) -> Result<()> {
        unsafe { ctx.device.reset_fences(&[self.in_flight])? };
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_acquired, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}
