//! Frames-in-flight scheduling.
//!
//! Each frame slot owns a fence, an image-available semaphore, a
//! render-finished semaphore and a command buffer. A frame runs
//! [`FrameScheduler::begin_frame`] → [`FrameScheduler::record_and_submit`] →
//! [`FrameScheduler::present`] → [`FrameScheduler::end_frame`]. The fence wait in
//! `begin_frame` is the only place the CPU blocks, and it bounds outstanding GPU
//! work to `max_frames_in_flight` submissions.

use crate::command::{CommandBufferManager, CommandRecorder};
use crate::device::{GpuDevice, SubmitDesc};
use crate::error::{GpuError, Result};
use crate::swapchain::SwapchainPresenter;
use crate::sync::{Fence, FrameSync, Semaphore};
use ash::vk;
use std::sync::Arc;

/// Frame scheduler configuration.
#[derive(Debug, Clone)]
pub struct FrameSchedulerConfig {
    /// Number of frame slots.
    pub max_frames_in_flight: usize,
    /// Timeout for the slot fence wait in `begin_frame`.
    pub fence_timeout_ns: u64,
    /// Timeout passed to the swapchain acquire.
    pub acquire_timeout_ns: u64,
}

impl Default for FrameSchedulerConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            fence_timeout_ns: u64::MAX,
            acquire_timeout_ns: u64::MAX,
        }
    }
}

impl FrameSchedulerConfig {
    /// Set the number of frame slots.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Set the fence wait timeout.
    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Set the acquire timeout.
    pub fn with_acquire_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.acquire_timeout_ns = timeout_ns;
        self
    }
}

/// Where a frame slot is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Ready for `begin_frame`.
    Idle,
    /// An image was acquired; waiting for `record_and_submit`.
    Acquiring {
        image_index: u32,
    },
    /// The command buffer is open inside `record_and_submit`.
    Recording {
        image_index: u32,
    },
    /// Work is queued behind the slot fence; waiting for `present`.
    Submitted {
        image_index: u32,
    },
}

/// Drives the acquire → record/submit → present → advance cycle.
pub struct FrameScheduler {
    device: Arc<dyn GpuDevice>,
    commands: Arc<CommandBufferManager>,
    frames: Vec<FrameSync>,
    states: Vec<SlotState>,
    current_frame: usize,
    frame_count: u64,
    config: FrameSchedulerConfig,
}

impl FrameScheduler {
    /// Create per-slot synchronization resources.
    pub fn new(commands: Arc<CommandBufferManager>, config: FrameSchedulerConfig) -> Result<Self> {
        if config.max_frames_in_flight == 0 {
            return Err(GpuError::InvalidState(
                "max_frames_in_flight must be at least 1".to_string(),
            ));
        }

        let device = commands.device().clone();
        let slots = config.max_frames_in_flight;
        let command_buffers = commands.create_command_buffers(slots as u32)?;

        let mut frames = Vec::with_capacity(slots);
        for &command_buffer in &command_buffers {
            match FrameSync::new(&device, command_buffer) {
                Ok(sync) => frames.push(sync),
                Err(e) => {
                    commands.free_command_buffers(&command_buffers);
                    return Err(e);
                }
            }
        }

        tracing::info!("Frame scheduler created with {slots} frames in flight");

        Ok(Self {
            device,
            commands,
            frames,
            states: vec![SlotState::Idle; slots],
            current_frame: 0,
            frame_count: 0,
            config,
        })
    }

    /// Wait for the current slot to retire and acquire the next swapchain image.
    ///
    /// Blocks until the submission made `max_frames_in_flight` frames ago has
    /// completed. The fence is reset only after the acquire succeeds, so a
    /// failed acquire leaves the slot reusable.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&mut self, swapchain: &dyn SwapchainPresenter) -> Result<u32> {
        let slot = self.current_frame;
        if self.states[slot] != SlotState::Idle {
            return Err(out_of_order("begin_frame", slot, self.states[slot]));
        }

        let frame = &self.frames[slot];
        frame.in_flight.wait(self.config.fence_timeout_ns)?;

        let image_index = swapchain
            .acquire_next_image(self.config.acquire_timeout_ns, frame.image_available.handle())?;
        frame.in_flight.reset()?;

        tracing::trace!("Frame slot {slot} acquired image {image_index}");
        self.states[slot] = SlotState::Acquiring { image_index };
        Ok(image_index)
    }

    /// Record the slot's command buffer and submit it to the graphics queue.
    ///
    /// The submission waits on the image-available semaphore at the
    /// color-attachment-output stage, signals the render-finished semaphore and
    /// the slot fence. If recording or submission fails the slot is returned to
    /// `Idle` with its fence signaled, so the next `begin_frame` on it does not
    /// block forever.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn record_and_submit<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>),
    {
        let slot = self.current_frame;
        let image_index = match self.states[slot] {
            SlotState::Acquiring { image_index } => image_index,
            state => return Err(out_of_order("record_and_submit", slot, state)),
        };

        let result = self.submit_slot(slot, image_index, f);
        if let Err(e) = &result {
            tracing::warn!("Frame slot {slot} failed to submit: {e}");
            self.recover_slot(slot);
        }
        result
    }

    fn submit_slot<F>(&mut self, slot: usize, image_index: u32, f: F) -> Result<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>),
    {
        let frame = &self.frames[slot];
        let cmd = frame.command_buffer;

        self.device.reset_command_buffer(cmd)?;
        self.device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        self.states[slot] = SlotState::Recording { image_index };

        f(&mut CommandRecorder::new(self.device.as_ref(), cmd));
        self.device.end_command_buffer(cmd)?;

        let command_buffers = [cmd];
        let wait_semaphores = [frame.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished.handle()];
        let submit = SubmitDesc {
            command_buffers: &command_buffers,
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            signal_semaphores: &signal_semaphores,
        };
        self.device.queue_submit(
            self.device.graphics_queue(),
            &submit,
            frame.in_flight.handle(),
        )?;

        self.states[slot] = SlotState::Submitted { image_index };
        Ok(())
    }

    /// Put a slot whose fence was reset, but which never submitted, back to `Idle`.
    ///
    /// An empty batch consumes the pending image-available signal and signals
    /// the fence. If the queue rejects that as well, the fence is recreated
    /// signaled and the semaphore recreated unsignaled.
    fn recover_slot(&mut self, slot: usize) {
        self.states[slot] = SlotState::Idle;

        let frame = &self.frames[slot];
        let wait_semaphores = [frame.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit = SubmitDesc {
            command_buffers: &[],
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            signal_semaphores: &[],
        };
        let Err(e) = self.device.queue_submit(
            self.device.graphics_queue(),
            &submit,
            frame.in_flight.handle(),
        ) else {
            tracing::debug!("Frame slot {slot} released with an empty submission");
            return;
        };

        tracing::warn!(
            "Empty submission for frame slot {slot} failed ({e}); recreating its sync objects"
        );
        let replacement = Fence::new(self.device.clone(), true)
            .and_then(|fence| Ok((fence, Semaphore::new(self.device.clone())?)));
        match replacement {
            Ok((fence, semaphore)) => {
                let frame = &mut self.frames[slot];
                frame.in_flight = fence;
                frame.image_available = semaphore;
            }
            Err(e) => {
                tracing::error!("Failed to recreate sync objects for frame slot {slot}: {e}");
            }
        }
    }

    /// Present the submitted image once rendering has finished.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(&mut self, swapchain: &dyn SwapchainPresenter, image_index: u32) -> Result<()> {
        let slot = self.current_frame;
        match self.states[slot] {
            SlotState::Submitted { image_index: submitted } if submitted == image_index => {}
            SlotState::Submitted { image_index: submitted } => {
                return Err(GpuError::InvalidState(format!(
                    "present of image {image_index} but slot {slot} rendered image {submitted}"
                )));
            }
            state => return Err(out_of_order("present", slot, state)),
        }

        // The submission is queued either way; the slot is reusable once its fence signals
        self.states[slot] = SlotState::Idle;

        swapchain.present(
            self.device.graphics_queue(),
            self.frames[slot].render_finished.handle(),
            image_index,
        )
    }

    /// Advance to the next frame slot.
    ///
    /// A slot abandoned after `begin_frame` is released so its fence and
    /// image-available semaphore are usable again.
    pub fn end_frame(&mut self) {
        let slot = self.current_frame;
        match self.states[slot] {
            SlotState::Idle => {}
            SlotState::Submitted { .. } => {
                // Submitted but not presented; the fence still retires the slot
                self.states[slot] = SlotState::Idle;
            }
            state @ (SlotState::Acquiring { .. } | SlotState::Recording { .. }) => {
                tracing::warn!("Frame slot {slot} ended in state {state:?} without submitting");
                self.recover_slot(slot);
            }
        }

        self.current_frame = (self.current_frame + 1) % self.frames.len();
        self.frame_count += 1;
    }

    /// Get the current frame slot index.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Total frames ended so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// State of a frame slot.
    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.states.get(slot).copied()
    }

    /// Command buffer bound to the current slot.
    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.frames[self.current_frame].command_buffer
    }

    /// Wait for every slot's last submission to complete.
    pub fn wait_all(&self) -> Result<()> {
        for frame in &self.frames {
            frame.in_flight.wait(self.config.fence_timeout_ns)?;
        }
        Ok(())
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Device wait before frame scheduler teardown failed: {e}");
        }
        let command_buffers: Vec<_> = self.frames.iter().map(|f| f.command_buffer).collect();
        self.commands.free_command_buffers(&command_buffers);
        // FrameSync fields release their fence and semaphores when `frames` drops
    }
}

fn out_of_order(operation: &str, slot: usize, state: SlotState) -> GpuError {
    GpuError::InvalidState(format!(
        "{operation} called on frame slot {slot} in state {state:?}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_double_buffered_and_unbounded() {
        let config = FrameSchedulerConfig::default();
        assert_eq!(config.max_frames_in_flight, 2);
        assert_eq!(config.fence_timeout_ns, u64::MAX);
        assert_eq!(config.acquire_timeout_ns, u64::MAX);
    }

    #[test]
    fn config_builder_overrides() {
        let config = FrameSchedulerConfig::default()
            .with_frames_in_flight(3)
            .with_fence_timeout_ns(1_000)
            .with_acquire_timeout_ns(2_000);
        assert_eq!(config.max_frames_in_flight, 3);
        assert_eq!(config.fence_timeout_ns, 1_000);
        assert_eq!(config.acquire_timeout_ns, 2_000);
    }

    #[test]
    fn out_of_order_error_names_operation() {
        let err = out_of_order("present", 1, SlotState::Idle);
        let message = err.to_string();
        assert!(message.contains("present"));
        assert!(message.contains("slot 1"));
    }
}
