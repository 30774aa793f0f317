//! [`GpuDevice`] over a live Vulkan device.

use crate::command::transition_masks;
use crate::context::GpuContext;
use crate::device::{BufferDesc, Command, DescriptorWrite, GpuDevice, ImageDesc, SubmitDesc};
use crate::error::{GpuError, Result};
use crate::memory::{color_subresource_range, GpuBuffer, GpuImage};
use ash::vk;

// SAFETY (whole impl): callers pass handles created by this context and still
// alive, as documented on `GpuDevice`. Destruction happens only after the owning
// wrappers have waited for the GPU.
impl GpuDevice for GpuContext {
    fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        unsafe { self.device.queue_wait_idle(queue)? };
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::FenceWaitTimeout { timeout_ns }),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);
        Ok(unsafe { self.device.create_command_pool(&info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&info)? })
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, command_buffers) };
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?
        };
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(cmd, &info)? };
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(())
    }

    fn record(&self, cmd: vk::CommandBuffer, command: &Command<'_>) {
        let device = &self.device;
        unsafe {
            match *command {
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    render_area,
                    clear_values,
                } => {
                    let info = vk::RenderPassBeginInfo::default()
                        .render_pass(render_pass)
                        .framebuffer(framebuffer)
                        .render_area(render_area)
                        .clear_values(clear_values);
                    device.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE);
                }
                Command::EndRenderPass => device.cmd_end_render_pass(cmd),
                Command::BindPipeline {
                    bind_point,
                    pipeline,
                } => device.cmd_bind_pipeline(cmd, bind_point, pipeline),
                Command::BindVertexBuffers {
                    first_binding,
                    buffers,
                    offsets,
                } => device.cmd_bind_vertex_buffers(cmd, first_binding, buffers, offsets),
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => device.cmd_bind_index_buffer(cmd, buffer, offset, index_type),
                Command::BindDescriptorSets {
                    bind_point,
                    layout,
                    first_set,
                    sets,
                } => device.cmd_bind_descriptor_sets(cmd, bind_point, layout, first_set, sets, &[]),
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => device.cmd_draw(
                    cmd,
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                ),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => device.cmd_draw_indexed(
                    cmd,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                ),
                Command::CopyBuffer { src, dst, regions } => {
                    device.cmd_copy_buffer(cmd, src, dst, regions)
                }
                Command::CopyBufferToImage {
                    src,
                    dst,
                    dst_layout,
                    regions,
                } => device.cmd_copy_buffer_to_image(cmd, src, dst, dst_layout, regions),
                Command::TransitionImage {
                    image,
                    old_layout,
                    new_layout,
                } => {
                    let masks = transition_masks(old_layout, new_layout);
                    let barrier = vk::ImageMemoryBarrier::default()
                        .old_layout(old_layout)
                        .new_layout(new_layout)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(image)
                        .subresource_range(color_subresource_range())
                        .src_access_mask(masks.src_access)
                        .dst_access_mask(masks.dst_access);
                    device.cmd_pipeline_barrier(
                        cmd,
                        masks.src_stage,
                        masks.dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                }
            }
        }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        let info = vk::SubmitInfo::default()
            .command_buffers(submit.command_buffers)
            .wait_semaphores(submit.wait_semaphores)
            .wait_dst_stage_mask(submit.wait_stages)
            .signal_semaphores(submit.signal_semaphores);
        unsafe { self.device.queue_submit(queue, &[info], fence)? };
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        Ok(unsafe { self.device.create_descriptor_set_layout(&info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> Result<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(flags);
        Ok(unsafe { self.device.create_descriptor_pool(&info, None)? })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        Ok(unsafe { self.device.allocate_descriptor_sets(&info)? })
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> Result<()> {
        unsafe { self.device.free_descriptor_sets(pool, sets)? };
        Ok(())
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, binding: u32, write: &DescriptorWrite) {
        match *write {
            DescriptorWrite::UniformBuffer {
                buffer,
                offset,
                range,
            } => {
                let buffer_info = [vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range,
                }];
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info);
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
            DescriptorWrite::CombinedImageSampler {
                sampler,
                image_view,
                layout,
            } => {
                let image_info = [vk::DescriptorImageInfo {
                    sampler,
                    image_view,
                    image_layout: layout,
                }];
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info);
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
        }
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<GpuBuffer> {
        self.allocator.lock().create_buffer(desc)
    }

    fn free_buffer(&self, buffer: &mut GpuBuffer) -> Result<()> {
        self.allocator.lock().free_buffer(buffer)
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        buffer.write_bytes(offset, data)
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, len: u64) -> Result<Vec<u8>> {
        buffer.read_bytes(offset, len)
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<GpuImage> {
        self.allocator.lock().create_image(desc)
    }

    fn free_image(&self, image: &mut GpuImage) -> Result<()> {
        self.allocator.lock().free_image(image)
    }
}
