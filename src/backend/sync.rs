// Synchronization primitives
//
// Fence and acquire semaphore per frame in flight. Present semaphores
// belong to the swapchain images.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Start signaled so the first wait returns at once
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
            device: Arc::clone(device),
        };

        unsafe {
            sync.image_available = device.device.create_semaphore(&semaphore_info, None)?;
            sync.in_flight_fence = device.device.create_fence(&fence_info, None)?;
        }

        Ok(sync)
    }

    /// Block until the GPU has finished the last submission using this slot
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)?;
        }
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight_fence])? };
        Ok(())
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        // Destroying null handles is a no-op
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
