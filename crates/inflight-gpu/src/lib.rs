//! Per-frame CPU/GPU synchronization for a Vulkan renderer.
//!
//! This crate provides:
//! - Frames-in-flight scheduling with per-slot fences and semaphores
//! - Descriptor pool management for per-frame and per-material sets
//! - Command buffer management and one-shot submissions
//! - Blocking staging uploads for buffers and images
//! - A Vulkan backend behind the [`GpuDevice`] trait

pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod staging;
pub mod swapchain;
pub mod sync;
mod vulkan;

pub use command::{CommandBufferManager, CommandRecorder};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{
    write_combined_image_sampler, write_uniform_buffer, DescriptorAllocatorConfig,
    DescriptorPoolAllocator, DescriptorSetHandle, DescriptorSetLayoutBuilder,
    ImagePoolPartitions, PoolInfo,
};
pub use device::{
    BufferDesc, Command, DescriptorWrite, GpuDevice, ImageDesc, MemoryLocation, SubmitDesc,
};
pub use error::{GpuError, Result};
pub use frame::{FrameScheduler, FrameSchedulerConfig, SlotState};
pub use instance::DeviceCandidate;
pub use memory::{DeviceBuffer, DeviceImage, GpuAllocator, GpuBuffer, GpuImage};
pub use staging::StagingUploader;
pub use swapchain::{Swapchain, SwapchainPresenter};
pub use sync::{Fence, FrameSync, Semaphore};
