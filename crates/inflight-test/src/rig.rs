//! Wiring of the library components onto a simulated device.

use crate::device::{GpuClock, SimulatedDevice};
use crate::swapchain::SimulatedSwapchain;
use ash::vk;
use inflight_gpu::{
    CommandBufferManager, DescriptorAllocatorConfig, DescriptorPoolAllocator,
    DescriptorSetLayoutBuilder, FrameScheduler, FrameSchedulerConfig, GpuDevice, Result,
    StagingUploader,
};
use std::sync::Arc;

/// Swapchain image count used by [`TestRig::new`].
pub const DEFAULT_SWAPCHAIN_IMAGES: u32 = 3;

/// A simulated device, a command manager and a swapchain.
pub struct TestRig {
    pub device: Arc<SimulatedDevice>,
    pub commands: Arc<CommandBufferManager>,
    pub swapchain: SimulatedSwapchain,
}

impl TestRig {
    pub fn new(clock: GpuClock) -> Result<Self> {
        Self::with_swapchain_images(clock, DEFAULT_SWAPCHAIN_IMAGES)
    }

    pub fn with_swapchain_images(clock: GpuClock, image_count: u32) -> Result<Self> {
        let device = SimulatedDevice::new(clock);
        let gpu: Arc<dyn GpuDevice> = device.clone();
        let commands = Arc::new(CommandBufferManager::new(gpu)?);
        let swapchain = SimulatedSwapchain::new(
            device.clone(),
            image_count,
            vk::Extent2D {
                width: 1280,
                height: 720,
            },
        );

        Ok(Self {
            device,
            commands,
            swapchain,
        })
    }

    /// The device as the library sees it.
    pub fn gpu(&self) -> Arc<dyn GpuDevice> {
        self.device.clone()
    }

    pub fn scheduler(&self, config: FrameSchedulerConfig) -> Result<FrameScheduler> {
        FrameScheduler::new(self.commands.clone(), config)
    }

    pub fn uploader(&self) -> StagingUploader {
        StagingUploader::new(self.commands.clone())
    }

    /// An allocator over a two-uniform buffer layout and a one-sampler image layout.
    pub fn descriptor_allocator(
        &self,
        config: DescriptorAllocatorConfig,
    ) -> Result<DescriptorPoolAllocator> {
        let gpu = self.gpu();
        let buffer_layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .uniform_buffer(1, vk::ShaderStageFlags::FRAGMENT)
            .build(gpu.as_ref())?;
        let image_layout = DescriptorSetLayoutBuilder::new()
            .sampled_image(0, vk::ShaderStageFlags::FRAGMENT)
            .build(gpu.as_ref())?;

        DescriptorPoolAllocator::new(gpu, buffer_layout, image_layout, config)
    }
}
