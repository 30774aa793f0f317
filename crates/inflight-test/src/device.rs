//! Simulated [`GpuDevice`] with a controllable GPU clock.
//!
//! Handles are minted from a counter and every object lives in host memory.
//! Submissions sit in a FIFO queue until the clock completes them; completion
//! executes recorded copies and layout transitions, then signals the fence.
//! Misuse that a real driver would not catch (or would catch only under
//! validation layers) is recorded as a [`Violation`] instead of failing.

use ash::vk::{self, Handle};
use inflight_gpu::staging::bytes_per_pixel;
use inflight_gpu::{
    BufferDesc, Command, DescriptorWrite, GpuBuffer, GpuDevice, GpuError, GpuImage, ImageDesc,
    MemoryLocation, Result, SubmitDesc,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// When submitted work completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuClock {
    /// Work completes inside `queue_submit`.
    Immediate,
    /// Work stays pending until [`SimulatedDevice::complete_next`],
    /// [`SimulatedDevice::complete_all`], an idle wait or a [`crate::GpuThread`].
    Manual,
}

/// Device calls that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    BeginCommandBuffer,
    EndCommandBuffer,
    QueueSubmit,
    CreateBuffer,
    AllocateDescriptorSets,
}

/// Protocol misuse observed by the simulated device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("wait on semaphore {0:?} with no pending signal")]
    SemaphoreWaitWithoutSignal(vk::Semaphore),
    #[error("signal on semaphore {0:?} that is already signaled")]
    SemaphoreAlreadySignaled(vk::Semaphore),
    #[error("command buffer {0:?} reset, recorded or freed while its submission is pending")]
    CommandBufferInUse(vk::CommandBuffer),
    #[error("command buffer {0:?} submitted without a finished recording")]
    CommandBufferNotExecutable(vk::CommandBuffer),
    #[error("command recorded into {0:?} outside begin/end")]
    RecordOutsideBegin(vk::CommandBuffer),
    #[error("fence {0:?} submitted while still signaled")]
    FenceNotReset(vk::Fence),
    #[error("fence {0:?} reset while a submission is pending on it")]
    FenceResetWhilePending(vk::Fence),
    #[error("fence {0:?} destroyed while a submission is pending on it")]
    FenceDestroyedWhilePending(vk::Fence),
    #[error("unbounded wait on fence {0:?} that nothing will signal")]
    FenceNeverSignaled(vk::Fence),
    #[error("descriptor pool {pool:?} asked for {requested} sets with {remaining} left")]
    DescriptorPoolOverflow {
        pool: vk::DescriptorPool,
        requested: u32,
        remaining: u32,
    },
    #[error("descriptor set freed to pool {0:?} created without FREE_DESCRIPTOR_SET")]
    DescriptorFreeNotAllowed(vk::DescriptorPool),
    #[error("descriptor set {set:?} was not allocated from pool {pool:?}")]
    ForeignDescriptorSet {
        set: vk::DescriptorSet,
        pool: vk::DescriptorPool,
    },
    #[error("image {image:?} used as {expected:?} while in {actual:?}")]
    ImageLayoutMismatch {
        image: vk::Image,
        expected: vk::ImageLayout,
        actual: vk::ImageLayout,
    },
    #[error("copy outside the bounds of {0}")]
    CopyOutOfBounds(&'static str),
    #[error("unknown {kind} handle {raw:#x}")]
    UnknownHandle { kind: &'static str, raw: u64 },
}

/// Owned copy of a recorded [`Command`].
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    TransitionImage {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    /// Any state-setting command with no simulated effect.
    Other(&'static str),
}

impl From<&Command<'_>> for RecordedCommand {
    fn from(command: &Command<'_>) -> Self {
        match *command {
            Command::CopyBuffer { src, dst, regions } => Self::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
            Command::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            } => Self::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
            Command::TransitionImage {
                image,
                old_layout,
                new_layout,
            } => Self::TransitionImage {
                image,
                old_layout,
                new_layout,
            },
            Command::Draw {
                vertex_count,
                instance_count,
                ..
            } => Self::Draw {
                vertex_count,
                instance_count,
            },
            Command::DrawIndexed {
                index_count,
                instance_count,
                ..
            } => Self::DrawIndexed {
                index_count,
                instance_count,
            },
            Command::BeginRenderPass { .. } => Self::Other("begin_render_pass"),
            Command::EndRenderPass => Self::Other("end_render_pass"),
            Command::BindPipeline { .. } => Self::Other("bind_pipeline"),
            Command::BindVertexBuffers { .. } => Self::Other("bind_vertex_buffers"),
            Command::BindIndexBuffer { .. } => Self::Other("bind_index_buffer"),
            Command::BindDescriptorSets { .. } => Self::Other("bind_descriptor_sets"),
        }
    }
}

/// One `queue_submit` call as the device saw it.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub id: u64,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
    pub commands: Vec<RecordedCommand>,
}

/// Number of live objects of each kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub fences: usize,
    pub semaphores: usize,
    pub command_pools: usize,
    pub command_buffers: usize,
    pub descriptor_set_layouts: usize,
    pub descriptor_pools: usize,
    pub descriptor_sets: usize,
    pub buffers: usize,
    pub images: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct FenceState {
    signaled: bool,
    pending: bool,
}

#[derive(Debug)]
struct CommandBufferState {
    pool: vk::CommandPool,
    recording: bool,
    executable: bool,
    pending: u32,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug)]
struct DescriptorPoolState {
    max_sets: u32,
    allocated: u32,
    free_allowed: bool,
}

#[derive(Debug)]
struct SimImage {
    extent: vk::Extent2D,
    texel_size: u64,
    layout: vk::ImageLayout,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct PendingSubmission {
    command_buffers: Vec<vk::CommandBuffer>,
    fence: vk::Fence,
    commands: Vec<RecordedCommand>,
    submitted_at: Instant,
}

struct SimState {
    clock: GpuClock,
    next_handle: u64,
    fences: HashMap<vk::Fence, FenceState>,
    semaphores: HashMap<vk::Semaphore, u32>,
    command_pools: HashMap<vk::CommandPool, u32>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferState>,
    set_layouts: HashMap<vk::DescriptorSetLayout, usize>,
    descriptor_pools: HashMap<vk::DescriptorPool, DescriptorPoolState>,
    descriptor_sets: HashMap<vk::DescriptorSet, vk::DescriptorPool>,
    descriptor_writes: HashMap<(vk::DescriptorSet, u32), DescriptorWrite>,
    buffers: HashMap<vk::Buffer, Vec<u8>>,
    images: HashMap<vk::Image, SimImage>,
    pending: VecDeque<PendingSubmission>,
    submissions: Vec<SubmissionRecord>,
    completed: u64,
    violations: Vec<Violation>,
    failures: Vec<FailPoint>,
}

impl SimState {
    fn new(clock: GpuClock) -> Self {
        Self {
            clock,
            // Keep the first minted handles clear of the queue handle
            next_handle: 0x1000,
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            command_pools: HashMap::new(),
            command_buffers: HashMap::new(),
            set_layouts: HashMap::new(),
            descriptor_pools: HashMap::new(),
            descriptor_sets: HashMap::new(),
            descriptor_writes: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            pending: VecDeque::new(),
            submissions: Vec::new(),
            completed: 0,
            violations: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn mint<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn take_failure(&mut self, point: FailPoint) -> Result<()> {
        if let Some(position) = self.failures.iter().position(|&p| p == point) {
            self.failures.remove(position);
            return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        Ok(())
    }

    fn unknown<H: Handle>(&mut self, kind: &'static str, handle: H) -> GpuError {
        let raw = handle.as_raw();
        self.violations.push(Violation::UnknownHandle { kind, raw });
        GpuError::ResourceNotFound(format!("{kind} {raw:#x}"))
    }

    fn signal_semaphore(&mut self, semaphore: vk::Semaphore) {
        match self.semaphores.get_mut(&semaphore) {
            Some(signals) => {
                if *signals > 0 {
                    self.violations
                        .push(Violation::SemaphoreAlreadySignaled(semaphore));
                }
                *signals += 1;
            }
            None => {
                self.unknown("semaphore", semaphore);
            }
        }
    }

    fn consume_semaphore(&mut self, semaphore: vk::Semaphore) {
        match self.semaphores.get_mut(&semaphore) {
            Some(0) => self
                .violations
                .push(Violation::SemaphoreWaitWithoutSignal(semaphore)),
            Some(signals) => *signals -= 1,
            None => {
                self.unknown("semaphore", semaphore);
            }
        }
    }

    /// Pop and execute the oldest submission.
    fn complete_front(&mut self) -> bool {
        let Some(submission) = self.pending.pop_front() else {
            return false;
        };

        for command in &submission.commands {
            self.execute(command);
        }
        for cmd in &submission.command_buffers {
            if let Some(state) = self.command_buffers.get_mut(cmd) {
                state.pending = state.pending.saturating_sub(1);
            }
        }
        if submission.fence != vk::Fence::null() {
            if let Some(fence) = self.fences.get_mut(&submission.fence) {
                fence.signaled = true;
                fence.pending = false;
            }
        }

        self.completed += 1;
        true
    }

    fn complete_all(&mut self) -> usize {
        let mut completed = 0;
        while self.complete_front() {
            completed += 1;
        }
        completed
    }

    fn execute(&mut self, command: &RecordedCommand) {
        match command {
            RecordedCommand::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    self.copy_buffer_region(*src, *dst, region);
                }
            }
            RecordedCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            } => {
                let actual = self.images.get(dst).map(|image| image.layout);
                if let Some(actual) = actual {
                    if actual != *dst_layout {
                        self.violations.push(Violation::ImageLayoutMismatch {
                            image: *dst,
                            expected: *dst_layout,
                            actual,
                        });
                    }
                }
                for region in regions {
                    self.copy_buffer_to_image_region(*src, *dst, region);
                }
            }
            RecordedCommand::TransitionImage {
                image,
                old_layout,
                new_layout,
            } => match self.images.get_mut(image) {
                Some(state) => {
                    let actual = state.layout;
                    state.layout = *new_layout;
                    if *old_layout != vk::ImageLayout::UNDEFINED && *old_layout != actual {
                        self.violations.push(Violation::ImageLayoutMismatch {
                            image: *image,
                            expected: *old_layout,
                            actual,
                        });
                    }
                }
                None => {
                    self.unknown("image", *image);
                }
            },
            RecordedCommand::Draw { .. }
            | RecordedCommand::DrawIndexed { .. }
            | RecordedCommand::Other(_) => {}
        }
    }

    fn copy_buffer_region(&mut self, src: vk::Buffer, dst: vk::Buffer, region: &vk::BufferCopy) {
        let Some(source) = self.buffers.get(&src) else {
            self.unknown("buffer", src);
            return;
        };
        let start = region.src_offset as usize;
        let end = start + region.size as usize;
        let Some(bytes) = source.get(start..end).map(<[u8]>::to_vec) else {
            self.violations
                .push(Violation::CopyOutOfBounds("copy source buffer"));
            return;
        };

        let Some(destination) = self.buffers.get_mut(&dst) else {
            self.unknown("buffer", dst);
            return;
        };
        let start = region.dst_offset as usize;
        match destination.get_mut(start..start + bytes.len()) {
            Some(target) => target.copy_from_slice(&bytes),
            None => self
                .violations
                .push(Violation::CopyOutOfBounds("copy destination buffer")),
        }
    }

    fn copy_buffer_to_image_region(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        region: &vk::BufferImageCopy,
    ) {
        let Some(source) = self.buffers.get(&src) else {
            self.unknown("buffer", src);
            return;
        };
        let Some(image) = self.images.get_mut(&dst) else {
            self.unknown("image", dst);
            return;
        };

        let texel = image.texel_size as usize;
        let width = region.image_extent.width as usize;
        let row_length = if region.buffer_row_length == 0 {
            width
        } else {
            region.buffer_row_length as usize
        };
        let row_bytes = width * texel;
        let x = usize::try_from(region.image_offset.x).unwrap_or(0);
        let y = usize::try_from(region.image_offset.y).unwrap_or(0);

        let mut out_of_bounds = false;
        for row in 0..region.image_extent.height as usize {
            let src_start = region.buffer_offset as usize + row * row_length * texel;
            let dst_start = ((y + row) * image.extent.width as usize + x) * texel;
            match (
                source.get(src_start..src_start + row_bytes),
                image.bytes.get_mut(dst_start..dst_start + row_bytes),
            ) {
                (Some(from), Some(to)) => to.copy_from_slice(from),
                _ => out_of_bounds = true,
            }
        }
        if out_of_bounds {
            self.violations
                .push(Violation::CopyOutOfBounds("buffer-to-image copy"));
        }
    }
}

/// Host-memory stand-in for a Vulkan device with one graphics queue.
pub struct SimulatedDevice {
    state: Mutex<SimState>,
    progress: Condvar,
    queue: vk::Queue,
}

impl SimulatedDevice {
    /// Queue family index reported for the graphics queue.
    pub const GRAPHICS_QUEUE_FAMILY: u32 = 0;

    pub fn new(clock: GpuClock) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::new(clock)),
            progress: Condvar::new(),
            queue: vk::Queue::from_raw(0x51),
        })
    }

    pub fn clock(&self) -> GpuClock {
        self.state.lock().clock
    }

    /// Switch clocks. Switching to `Immediate` completes pending work.
    pub fn set_clock(&self, clock: GpuClock) {
        let mut state = self.state.lock();
        state.clock = clock;
        if clock == GpuClock::Immediate {
            state.complete_all();
        }
        drop(state);
        self.progress.notify_all();
    }

    /// Complete the oldest pending submission.
    pub fn complete_next(&self) -> bool {
        let completed = self.state.lock().complete_front();
        self.progress.notify_all();
        completed
    }

    /// Complete every pending submission.
    pub fn complete_all(&self) -> usize {
        let completed = self.state.lock().complete_all();
        self.progress.notify_all();
        completed
    }

    /// Complete, in order, every submission older than `age`.
    pub fn complete_older_than(&self, age: Duration) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let mut completed = 0;
        while state
            .pending
            .front()
            .is_some_and(|front| now.duration_since(front.submitted_at) >= age)
        {
            state.complete_front();
            completed += 1;
        }
        drop(state);
        if completed > 0 {
            self.progress.notify_all();
        }
        completed
    }

    /// Submission time of the oldest pending submission.
    pub fn oldest_pending(&self) -> Option<Instant> {
        self.state.lock().pending.front().map(|p| p.submitted_at)
    }

    /// Block until the queue changes or `timeout` passes.
    pub fn wait_for_progress(&self, timeout: Duration) {
        let mut state = self.state.lock();
        let _ = self.progress.wait_for(&mut state, timeout);
    }

    /// Wake every thread blocked on the device.
    pub fn notify(&self) {
        self.progress.notify_all();
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn completed_submissions(&self) -> u64 {
        self.state.lock().completed
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// Every submission so far, oldest first.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.state.lock().violations.clone()
    }

    /// Make the next call through `point` fail with `ERROR_DEVICE_LOST`.
    pub fn fail_next(&self, point: FailPoint) {
        self.state.lock().failures.push(point);
    }

    /// Signal a binary semaphore from outside any queue.
    pub fn signal_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().signal_semaphore(semaphore);
    }

    /// Consume a semaphore signal from outside any queue.
    pub fn consume_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().consume_semaphore(semaphore);
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> Option<bool> {
        self.state.lock().fences.get(&fence).map(|f| f.signaled)
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state.lock().images.get(&image).map(|i| i.layout)
    }

    pub fn image_bytes(&self, image: vk::Image) -> Option<Vec<u8>> {
        self.state.lock().images.get(&image).map(|i| i.bytes.clone())
    }

    pub fn descriptor_write(&self, set: vk::DescriptorSet, binding: u32) -> Option<DescriptorWrite> {
        self.state
            .lock()
            .descriptor_writes
            .get(&(set, binding))
            .copied()
    }

    /// Sets a pool has handed out and not taken back.
    pub fn descriptor_pool_usage(&self, pool: vk::DescriptorPool) -> Option<u32> {
        self.state
            .lock()
            .descriptor_pools
            .get(&pool)
            .map(|p| p.allocated)
    }

    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state.lock();
        LiveObjects {
            fences: state.fences.len(),
            semaphores: state.semaphores.len(),
            command_pools: state.command_pools.len(),
            command_buffers: state.command_buffers.len(),
            descriptor_set_layouts: state.set_layouts.len(),
            descriptor_pools: state.descriptor_pools.len(),
            descriptor_sets: state.descriptor_sets.len(),
            buffers: state.buffers.len(),
            images: state.images.len(),
        }
    }
}

impl GpuDevice for SimulatedDevice {
    fn graphics_queue(&self) -> vk::Queue {
        self.queue
    }

    fn graphics_queue_family(&self) -> u32 {
        Self::GRAPHICS_QUEUE_FAMILY
    }

    fn wait_idle(&self) -> Result<()> {
        self.complete_all();
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        if queue != self.queue {
            return Err(self.state.lock().unknown("queue", queue));
        }
        self.complete_all();
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.mint();
        state.fences.insert(
            fence,
            FenceState {
                signaled,
                pending: false,
            },
        );
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        match state.fences.remove(&fence) {
            Some(f) if f.pending => state
                .violations
                .push(Violation::FenceDestroyedWhilePending(fence)),
            Some(_) => {}
            None => {
                state.unknown("fence", fence);
            }
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        let deadline = if timeout_ns == u64::MAX {
            None
        } else {
            Instant::now().checked_add(Duration::from_nanos(timeout_ns))
        };

        let mut state = self.state.lock();
        loop {
            let Some(current) = state.fences.get(&fence).copied() else {
                return Err(state.unknown("fence", fence));
            };
            if current.signaled {
                return Ok(());
            }

            match deadline {
                None if !current.pending => {
                    // A real device would hang here forever
                    state.violations.push(Violation::FenceNeverSignaled(fence));
                    return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
                }
                None => self.progress.wait(&mut state),
                Some(deadline) => {
                    if self.progress.wait_until(&mut state, deadline).timed_out() {
                        let signaled = state.fences.get(&fence).is_some_and(|f| f.signaled);
                        if !signaled {
                            return Err(GpuError::FenceWaitTimeout { timeout_ns });
                        }
                    }
                }
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        let Some(current) = state.fences.get_mut(&fence) else {
            return Err(state.unknown("fence", fence));
        };
        let pending = current.pending;
        current.signaled = false;
        if pending {
            state
                .violations
                .push(Violation::FenceResetWhilePending(fence));
        }
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = state.mint();
        state.semaphores.insert(semaphore, 0);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        if state.semaphores.remove(&semaphore).is_none() {
            state.unknown("semaphore", semaphore);
        }
    }

    fn create_command_pool(
        &self,
        queue_family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = state.mint();
        state.command_pools.insert(pool, queue_family);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        if state.command_pools.remove(&pool).is_none() {
            state.unknown("command pool", pool);
            return;
        }
        state.command_buffers.retain(|_, cmd| cmd.pool != pool);
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if !state.command_pools.contains_key(&pool) {
            return Err(state.unknown("command pool", pool));
        }

        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let cmd = state.mint();
            state.command_buffers.insert(
                cmd,
                CommandBufferState {
                    pool,
                    recording: false,
                    executable: false,
                    pending: 0,
                    commands: Vec::new(),
                },
            );
            buffers.push(cmd);
        }
        Ok(buffers)
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for &cmd in command_buffers {
            match state.command_buffers.remove(&cmd) {
                Some(freed) if freed.pending > 0 => {
                    state.violations.push(Violation::CommandBufferInUse(cmd));
                }
                Some(_) => {}
                None => {
                    state.unknown("command buffer", cmd);
                }
            }
        }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let Some(buffer) = state.command_buffers.get_mut(&cmd) else {
            return Err(state.unknown("command buffer", cmd));
        };
        let in_use = buffer.pending > 0;
        buffer.recording = false;
        buffer.executable = false;
        buffer.commands.clear();
        if in_use {
            state.violations.push(Violation::CommandBufferInUse(cmd));
        }
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::BeginCommandBuffer)?;
        let Some(buffer) = state.command_buffers.get_mut(&cmd) else {
            return Err(state.unknown("command buffer", cmd));
        };
        let in_use = buffer.pending > 0;
        buffer.recording = true;
        buffer.executable = false;
        buffer.commands.clear();
        if in_use {
            state.violations.push(Violation::CommandBufferInUse(cmd));
        }
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::EndCommandBuffer)?;
        let Some(buffer) = state.command_buffers.get_mut(&cmd) else {
            return Err(state.unknown("command buffer", cmd));
        };
        let was_recording = buffer.recording;
        buffer.recording = false;
        buffer.executable = was_recording;
        if !was_recording {
            state.violations.push(Violation::RecordOutsideBegin(cmd));
        }
        Ok(())
    }

    fn record(&self, cmd: vk::CommandBuffer, command: &Command<'_>) {
        let mut state = self.state.lock();
        let Some(buffer) = state.command_buffers.get_mut(&cmd) else {
            state.unknown("command buffer", cmd);
            return;
        };
        if buffer.recording {
            buffer.commands.push(command.into());
        } else {
            state.violations.push(Violation::RecordOutsideBegin(cmd));
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::QueueSubmit)?;
        if queue != self.queue {
            return Err(state.unknown("queue", queue));
        }

        if fence != vk::Fence::null() {
            let Some(current) = state.fences.get_mut(&fence) else {
                return Err(state.unknown("fence", fence));
            };
            let signaled = current.signaled;
            current.pending = true;
            if signaled {
                state.violations.push(Violation::FenceNotReset(fence));
            }
        }

        let mut commands = Vec::new();
        for &cmd in submit.command_buffers {
            let Some(buffer) = state.command_buffers.get_mut(&cmd) else {
                return Err(state.unknown("command buffer", cmd));
            };
            buffer.pending += 1;
            commands.extend(buffer.commands.iter().cloned());
            if !buffer.executable {
                state
                    .violations
                    .push(Violation::CommandBufferNotExecutable(cmd));
            }
        }

        for &semaphore in submit.wait_semaphores {
            state.consume_semaphore(semaphore);
        }
        // Binary semaphore signals count from submission, matching the
        // "signal operation pending" rule for later waits
        for &semaphore in submit.signal_semaphores {
            state.signal_semaphore(semaphore);
        }

        let id = state.submissions.len() as u64;
        state.submissions.push(SubmissionRecord {
            id,
            command_buffers: submit.command_buffers.to_vec(),
            wait_semaphores: submit.wait_semaphores.to_vec(),
            wait_stages: submit.wait_stages.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence,
            commands: commands.clone(),
        });
        state.pending.push_back(PendingSubmission {
            command_buffers: submit.command_buffers.to_vec(),
            fence,
            commands,
            submitted_at: Instant::now(),
        });

        if state.clock == GpuClock::Immediate {
            state.complete_all();
        }
        drop(state);
        self.progress.notify_all();
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        let layout = state.mint();
        state.set_layouts.insert(layout, bindings.len());
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let mut state = self.state.lock();
        if state.set_layouts.remove(&layout).is_none() {
            state.unknown("descriptor set layout", layout);
        }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> Result<vk::DescriptorPool> {
        let mut state = self.state.lock();
        let pool = state.mint();
        state.descriptor_pools.insert(
            pool,
            DescriptorPoolState {
                max_sets,
                allocated: 0,
                free_allowed: flags.contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET),
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        if state.descriptor_pools.remove(&pool).is_none() {
            state.unknown("descriptor pool", pool);
            return;
        }
        state.descriptor_sets.retain(|_, owner| *owner != pool);
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::AllocateDescriptorSets)?;
        if let Some(&layout) = layouts
            .iter()
            .find(|&layout| !state.set_layouts.contains_key(layout))
        {
            return Err(state.unknown("descriptor set layout", layout));
        }
        let Some(pool_state) = state.descriptor_pools.get_mut(&pool) else {
            return Err(state.unknown("descriptor pool", pool));
        };

        let requested = layouts.len() as u32;
        let remaining = pool_state.max_sets - pool_state.allocated;
        if requested > remaining {
            state.violations.push(Violation::DescriptorPoolOverflow {
                pool,
                requested,
                remaining,
            });
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        pool_state.allocated += requested;

        let mut sets = Vec::with_capacity(layouts.len());
        for _ in layouts {
            let set = state.mint();
            state.descriptor_sets.insert(set, pool);
            sets.push(set);
        }
        Ok(sets)
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let Some(pool_state) = state.descriptor_pools.get(&pool) else {
            return Err(state.unknown("descriptor pool", pool));
        };
        if !pool_state.free_allowed {
            state
                .violations
                .push(Violation::DescriptorFreeNotAllowed(pool));
            return Err(GpuError::Vulkan(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        }

        for &set in sets {
            if state.descriptor_sets.get(&set) != Some(&pool) {
                state
                    .violations
                    .push(Violation::ForeignDescriptorSet { set, pool });
                return Err(GpuError::Vulkan(vk::Result::ERROR_VALIDATION_FAILED_EXT));
            }
            state.descriptor_sets.remove(&set);
            state.descriptor_writes.retain(|(written, _), _| *written != set);
            if let Some(pool_state) = state.descriptor_pools.get_mut(&pool) {
                pool_state.allocated -= 1;
            }
        }
        Ok(())
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, binding: u32, write: &DescriptorWrite) {
        let mut state = self.state.lock();
        if !state.descriptor_sets.contains_key(&set) {
            state.unknown("descriptor set", set);
            return;
        }
        state.descriptor_writes.insert((set, binding), *write);
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<GpuBuffer> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::CreateBuffer)?;
        if desc.size == 0 {
            return Err(GpuError::InvalidState(format!(
                "Buffer '{}' has zero size",
                desc.name
            )));
        }

        let buffer = state.mint();
        state.buffers.insert(buffer, vec![0; desc.size as usize]);
        Ok(GpuBuffer {
            buffer,
            allocation: None,
            size: desc.size,
            location: desc.location,
        })
    }

    fn free_buffer(&self, buffer: &mut GpuBuffer) -> Result<()> {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer.buffer).is_none() {
            return Err(state.unknown("buffer", buffer.buffer));
        }
        buffer.buffer = vk::Buffer::null();
        Ok(())
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        if buffer.location == MemoryLocation::GpuOnly {
            return Err(GpuError::InvalidState("Buffer not mapped".to_string()));
        }

        let mut state = self.state.lock();
        let Some(bytes) = state.buffers.get_mut(&buffer.buffer) else {
            return Err(state.unknown("buffer", buffer.buffer));
        };
        let start = offset as usize;
        let target = bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| GpuError::InvalidState("Data range too large for buffer".to_string()))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        let Some(bytes) = state.buffers.get(&buffer.buffer) else {
            return Err(state.unknown("buffer", buffer.buffer));
        };
        let start = offset as usize;
        bytes
            .get(start..start + len as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| GpuError::InvalidState("Data range too large for buffer".to_string()))
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<GpuImage> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(GpuError::InvalidState(format!(
                "Image '{}' has zero extent",
                desc.name
            )));
        }

        let mut state = self.state.lock();
        let image = state.mint();
        let view = state.mint();
        let texel_size = bytes_per_pixel(desc.format).unwrap_or(4);
        let len = u64::from(desc.extent.width) * u64::from(desc.extent.height) * texel_size;
        state.images.insert(
            image,
            SimImage {
                extent: desc.extent,
                texel_size,
                layout: vk::ImageLayout::UNDEFINED,
                bytes: vec![0; len as usize],
            },
        );
        Ok(GpuImage {
            image,
            view,
            allocation: None,
            format: desc.format,
            extent: desc.extent,
        })
    }

    fn free_image(&self, image: &mut GpuImage) -> Result<()> {
        let mut state = self.state.lock();
        if state.images.remove(&image.image).is_none() {
            return Err(state.unknown("image", image.image));
        }
        image.image = vk::Image::null();
        image.view = vk::ImageView::null();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_holds_submissions_until_completed() {
        let device = SimulatedDevice::new(GpuClock::Manual);
        let fence = device.create_fence(false).unwrap();
        device
            .queue_submit(device.graphics_queue(), &SubmitDesc::default(), fence)
            .unwrap();

        assert_eq!(device.pending_submissions(), 1);
        assert_eq!(device.fence_signaled(fence), Some(false));

        assert!(device.complete_next());
        assert_eq!(device.fence_signaled(fence), Some(true));
        assert!(!device.complete_next());
    }

    #[test]
    fn double_signal_is_a_violation() {
        let device = SimulatedDevice::new(GpuClock::Immediate);
        let semaphore = device.create_semaphore().unwrap();
        device.signal_semaphore(semaphore);
        device.signal_semaphore(semaphore);
        assert_eq!(
            device.violations(),
            vec![Violation::SemaphoreAlreadySignaled(semaphore)]
        );
    }

    #[test]
    fn unsatisfiable_wait_fails_instead_of_hanging() {
        let device = SimulatedDevice::new(GpuClock::Manual);
        let fence = device.create_fence(false).unwrap();
        assert!(device.wait_for_fence(fence, u64::MAX).is_err());
        assert_eq!(device.violations(), vec![Violation::FenceNeverSignaled(fence)]);
    }

    #[test]
    fn finite_wait_times_out() {
        let device = SimulatedDevice::new(GpuClock::Manual);
        let fence = device.create_fence(false).unwrap();
        let err = device.wait_for_fence(fence, 1_000_000).unwrap_err();
        assert!(matches!(err, GpuError::FenceWaitTimeout { timeout_ns: 1_000_000 }));
    }

    #[test]
    fn pool_overflow_is_reported() {
        let device = SimulatedDevice::new(GpuClock::Immediate);
        let layout = device.create_descriptor_set_layout(&[]).unwrap();
        let pool = device
            .create_descriptor_pool(1, &[], vk::DescriptorPoolCreateFlags::empty())
            .unwrap();

        device.allocate_descriptor_sets(pool, &[layout]).unwrap();
        let err = device.allocate_descriptor_sets(pool, &[layout]).unwrap_err();
        assert!(matches!(
            err,
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        ));
        assert_eq!(device.violations().len(), 1);
    }
}
