//! Synchronization primitives.
//!
//! Fences and semaphores own their handle and destroy it when dropped.

use crate::device::GpuDevice;
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// CPU-observable completion signal.
pub struct Fence {
    device: Arc<dyn GpuDevice>,
    handle: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled.
    pub fn new(device: Arc<dyn GpuDevice>, signaled: bool) -> Result<Self> {
        let handle = device.create_fence(signaled)?;
        Ok(Self { device, handle })
    }

    /// Raw fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Wait for the fence to be signaled.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        self.device.wait_for_fence(self.handle, timeout_ns)
    }

    /// Reset the fence to the unsignaled state.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn reset(&self) -> Result<()> {
        self.device.reset_fence(self.handle)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.handle);
    }
}

/// GPU-side ordering primitive.
pub struct Semaphore {
    device: Arc<dyn GpuDevice>,
    handle: vk::Semaphore,
}

impl Semaphore {
    /// Create a binary semaphore.
    pub fn new(device: Arc<dyn GpuDevice>) -> Result<Self> {
        let handle = device.create_semaphore()?;
        Ok(Self { device, handle })
    }

    /// Raw semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.handle);
    }
}

/// Synchronization resources owned by one frame slot.
pub struct FrameSync {
    /// Semaphore signaled when the swapchain image is available
    pub image_available: Semaphore,
    /// Semaphore signaled when rendering is complete
    pub render_finished: Semaphore,
    /// Fence signaled when the slot's last submission completes
    pub in_flight: Fence,
    /// Command buffer recorded for this slot
    pub command_buffer: vk::CommandBuffer,
}

impl FrameSync {
    /// Create the slot's semaphores and fence around an allocated command buffer.
    ///
    /// The fence starts signaled so the first wait on a fresh slot returns at once.
    pub fn new(device: &Arc<dyn GpuDevice>, command_buffer: vk::CommandBuffer) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(device.clone())?,
            render_finished: Semaphore::new(device.clone())?,
            in_flight: Fence::new(device.clone(), true)?,
            command_buffer,
        })
    }
}
