use ash::vk;
use std::sync::Arc;

use crate::context::DeviceContext;
use crate::error::Result;

/// Synchronization objects of one frame slot.
///
/// The fence starts signaled so the very first wait on a fresh slot
/// returns immediately.
pub struct FrameSync {
    context: Arc<DeviceContext>,
    pub image_available: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub fn new(context: Arc<DeviceContext>) -> Result<Self> {
        let device = context.device();
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let image_available = unsafe { device.create_semaphore(&semaphore_info, None)? };
        let in_flight = match unsafe { device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(err) => {
                unsafe { device.destroy_semaphore(image_available, None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            context,
            image_available,
            in_flight,
        })
    }

    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.context
                .device()
                .wait_for_fences(&[self.in_flight], true, u64::MAX)?
        };
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.context.device().reset_fences(&[self.in_flight])? };
        Ok(())
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        let device = self.context.device();
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}

/// One render-finished semaphore per swapchain image. Presentation holds on
/// to the semaphore until the image is acquired again, so these are indexed
/// by image, not by frame slot.
pub struct PresentSemaphores {
    context: Arc<DeviceContext>,
    semaphores: Vec<vk::Semaphore>,
}

impl PresentSemaphores {
    pub fn new(context: Arc<DeviceContext>) -> Self {
        Self {
            context,
            semaphores: Vec::new(),
        }
    }

    /// Grows the set to at least `count` semaphores. Existing ones are kept;
    /// a swapchain rebuild waits for the device first, so none is pending.
    pub fn ensure(&mut self, count: usize) -> Result<()> {
        let info = vk::SemaphoreCreateInfo::builder();
        while self.semaphores.len() < count {
            let semaphore = unsafe { self.context.device().create_semaphore(&info, None)? };
            self.semaphores.push(semaphore);
        }
        Ok(())
    }

    pub fn get(&self, image_index: u32) -> Option<vk::Semaphore> {
        self.semaphores.get(image_index as usize).copied()
    }
}

impl Drop for PresentSemaphores {
    fn drop(&mut self) {
        let device = self.context.device();
        for semaphore in self.semaphores.drain(..) {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
    }
}
