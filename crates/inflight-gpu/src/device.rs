//! Device capability trait.
//!
//! Every component in this crate talks to the GPU through [`GpuDevice`]. The
//! Vulkan implementation lives on [`crate::GpuContext`]; test harnesses can
//! provide their own. Components receive an `Arc<dyn GpuDevice>` when they are
//! constructed, so all shared device state is explicit.
//!
//! Implementations assume that every handle argument was created by the same
//! device and has not been destroyed yet. The owning wrappers in this crate
//! uphold that.

use crate::error::Result;
use crate::memory::{GpuBuffer, GpuImage};
use ash::vk;
pub use gpu_allocator::MemoryLocation;

/// Parameters for [`GpuDevice::create_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    /// Size in bytes. Must be non-zero.
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// Debug name for the allocation.
    pub name: &'a str,
}

/// Parameters for [`GpuDevice::create_image`].
///
/// Images are 2D, single mip, single layer, optimal tiling.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub name: &'a str,
}

/// One queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitDesc<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    /// One stage mask per wait semaphore.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Contents written into a single descriptor binding.
#[derive(Debug, Clone, Copy)]
pub enum DescriptorWrite {
    UniformBuffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    CombinedImageSampler {
        sampler: vk::Sampler,
        image_view: vk::ImageView,
        layout: vk::ImageLayout,
    },
}

/// A command recorded into a command buffer.
#[derive(Clone, Copy)]
pub enum Command<'a> {
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &'a [vk::ClearValue],
    },
    EndRenderPass,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: &'a [vk::Buffer],
        offsets: &'a [u64],
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &'a [vk::DescriptorSet],
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &'a [vk::BufferCopy],
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &'a [vk::BufferImageCopy],
    },
    /// Whole-image color layout transition.
    TransitionImage {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
}

/// Primitive creation, recording and submission on one logical device.
pub trait GpuDevice: Send + Sync {
    /// Queue used for rendering, transfers and presentation.
    fn graphics_queue(&self) -> vk::Queue;

    fn graphics_queue_family(&self) -> u32;

    /// Block until every queue on the device is idle.
    fn wait_idle(&self) -> Result<()>;

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()>;

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    /// Wait for a fence. Running out of time yields `GpuError::FenceWaitTimeout`.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;

    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn create_semaphore(&self) -> Result<vk::Semaphore>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]);

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Record one command into a command buffer in the recording state.
    fn record(&self, cmd: vk::CommandBuffer, command: &Command<'_>);

    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDesc<'_>, fence: vk::Fence)
        -> Result<()>;

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> Result<vk::DescriptorPool>;

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>>;

    /// Return sets to a pool created with `FREE_DESCRIPTOR_SET`.
    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> Result<()>;

    fn update_descriptor_set(&self, set: vk::DescriptorSet, binding: u32, write: &DescriptorWrite);

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<GpuBuffer>;

    fn free_buffer(&self, buffer: &mut GpuBuffer) -> Result<()>;

    /// Copy bytes into a host-visible buffer.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Read bytes back from a buffer. Real devices only allow host-visible buffers.
    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Create an image together with a full 2D color view.
    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<GpuImage>;

    fn free_image(&self, image: &mut GpuImage) -> Result<()>;
}
