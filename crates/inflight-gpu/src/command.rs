//! Command buffer management.

use crate::device::{Command, GpuDevice, SubmitDesc};
use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Owns one long-lived, reset-enabled command pool.
///
/// Allocation and freeing are serialized through an internal lock. Recording into
/// buffers from this pool must still happen on one thread at a time.
pub struct CommandBufferManager {
    device: Arc<dyn GpuDevice>,
    pool: Mutex<vk::CommandPool>,
    queue_family: u32,
}

impl CommandBufferManager {
    /// Create the pool on the device's graphics queue family.
    pub fn new(device: Arc<dyn GpuDevice>) -> Result<Self> {
        let queue_family = device.graphics_queue_family();
        let pool = device
            .create_command_pool(queue_family, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;

        tracing::debug!("Command pool created on queue family {queue_family}");

        Ok(Self {
            device,
            pool: Mutex::new(pool),
            queue_family,
        })
    }

    /// The device this manager allocates from.
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single primary command buffer.
    pub fn create_one_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let mut buffers = self.create_command_buffers(1)?;
        buffers
            .pop()
            .ok_or_else(|| GpuError::Other("Device returned no command buffer".to_string()))
    }

    /// Allocate `count` primary command buffers.
    pub fn create_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let pool = self.pool.lock();
        self.device
            .allocate_command_buffers(*pool, vk::CommandBufferLevel::PRIMARY, count)
    }

    /// Return command buffers to the pool.
    ///
    /// The buffers must not be pending execution.
    pub fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }
        let pool = self.pool.lock();
        self.device.free_command_buffers(*pool, command_buffers);
    }

    /// Record and run a one-shot submission, blocking until the queue is idle.
    ///
    /// Meant for setup-time work such as staging copies and layout transitions.
    /// The transient command buffer is freed on every path.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn execute_cmd<F>(&self, queue: vk::Queue, f: F) -> Result<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>),
    {
        let transient = TransientCommandBuffer {
            manager: self,
            cmd: self.create_one_command_buffer()?,
        };
        let cmd = transient.cmd;

        self.device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        f(&mut CommandRecorder::new(self.device.as_ref(), cmd));
        self.device.end_command_buffer(cmd)?;

        let command_buffers = [cmd];
        let submit = SubmitDesc {
            command_buffers: &command_buffers,
            ..Default::default()
        };
        self.device.queue_submit(queue, &submit, vk::Fence::null())?;
        self.device.queue_wait_idle(queue)?;

        Ok(())
    }
}

impl Drop for CommandBufferManager {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Device wait before command pool teardown failed: {e}");
        }
        self.device.destroy_command_pool(*self.pool.get_mut());
    }
}

/// Frees a command buffer from `execute_cmd` however the call ends.
struct TransientCommandBuffer<'a> {
    manager: &'a CommandBufferManager,
    cmd: vk::CommandBuffer,
}

impl Drop for TransientCommandBuffer<'_> {
    fn drop(&mut self) {
        self.manager.free_command_buffers(&[self.cmd]);
    }
}

/// Borrowed view of a command buffer in the recording state.
pub struct CommandRecorder<'a> {
    device: &'a dyn GpuDevice,
    cmd: vk::CommandBuffer,
}

impl<'a> CommandRecorder<'a> {
    /// Wrap a command buffer that is already recording.
    pub fn new(device: &'a dyn GpuDevice, cmd: vk::CommandBuffer) -> Self {
        Self { device, cmd }
    }

    /// Raw command buffer handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Record an arbitrary command.
    pub fn record(&mut self, command: &Command<'_>) -> &mut Self {
        self.device.record(self.cmd, command);
        self
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) -> &mut Self {
        self.record(&Command::BeginRenderPass {
            render_pass,
            framebuffer,
            render_area,
            clear_values,
        })
    }

    pub fn end_render_pass(&mut self) -> &mut Self {
        self.record(&Command::EndRenderPass)
    }

    pub fn bind_pipeline(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) -> &mut Self {
        self.record(&Command::BindPipeline {
            bind_point,
            pipeline,
        })
    }

    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) -> &mut Self {
        self.record(&Command::BindVertexBuffers {
            first_binding,
            buffers,
            offsets,
        })
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) -> &mut Self {
        self.record(&Command::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        })
    }

    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) -> &mut Self {
        self.record(&Command::BindDescriptorSets {
            bind_point,
            layout,
            first_set,
            sets,
        })
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> &mut Self {
        self.record(&Command::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        })
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> &mut Self {
        self.record(&Command::DrawIndexed {
            index_count,
            instance_count,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        })
    }

    pub fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) -> &mut Self {
        self.record(&Command::CopyBuffer { src, dst, regions })
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) -> &mut Self {
        self.record(&Command::CopyBufferToImage {
            src,
            dst,
            dst_layout,
            regions,
        })
    }

    pub fn transition_image(
        &mut self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> &mut Self {
        self.record(&Command::TransitionImage {
            image,
            old_layout,
            new_layout,
        })
    }
}

/// Access masks and pipeline stages for a color layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Pick barrier masks for a layout transition.
///
/// The upload transitions get tight masks; anything else falls back to a full barrier.
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> TransitionMasks {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            TransitionMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            }
        }
        _ => TransitionMasks {
            src_access: vk::AccessFlags::MEMORY_WRITE,
            dst_access: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
        },
    }
}
