//! Simulated presentation engine.

use crate::device::SimulatedDevice;
use ash::vk::{self, Handle};
use inflight_gpu::{GpuError, Result, SwapchainPresenter};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Default)]
struct PresentState {
    next_image: u32,
    acquired: u64,
    presented: Vec<u32>,
    acquire_failures: VecDeque<vk::Result>,
    present_failures: VecDeque<vk::Result>,
}

/// Hands out images round-robin and signals semaphores through the device.
pub struct SimulatedSwapchain {
    device: Arc<SimulatedDevice>,
    image_count: u32,
    extent: vk::Extent2D,
    framebuffers: Vec<vk::Framebuffer>,
    state: Mutex<PresentState>,
}

impl SimulatedSwapchain {
    pub fn new(device: Arc<SimulatedDevice>, image_count: u32, extent: vk::Extent2D) -> Self {
        let framebuffers = (0..u64::from(image_count))
            .map(|i| vk::Framebuffer::from_raw(0xF000 + i))
            .collect();
        Self {
            device,
            image_count,
            extent,
            framebuffers,
            state: Mutex::new(PresentState::default()),
        }
    }

    /// Make the next acquire report `result`.
    ///
    /// `SUBOPTIMAL_KHR` still hands out an image and signals the semaphore, as
    /// a real presentation engine does. Other results signal nothing.
    pub fn fail_next_acquire(&self, result: vk::Result) {
        self.state.lock().acquire_failures.push_back(result);
    }

    /// Make the next present fail with `result` after consuming its wait.
    pub fn fail_next_present(&self, result: vk::Result) {
        self.state.lock().present_failures.push_back(result);
    }

    /// Image indices presented so far, in order.
    pub fn presented(&self) -> Vec<u32> {
        self.state.lock().presented.clone()
    }

    pub fn acquire_count(&self) -> u64 {
        self.state.lock().acquired
    }
}

impl SwapchainPresenter for SimulatedSwapchain {
    fn acquire_next_image(&self, _timeout_ns: u64, signal_semaphore: vk::Semaphore) -> Result<u32> {
        let mut state = self.state.lock();
        let failure = state.acquire_failures.pop_front();
        if let Some(result) = failure {
            if result != vk::Result::SUBOPTIMAL_KHR {
                return Err(GpuError::Acquire(result));
            }
        }

        let index = state.next_image;
        state.next_image = (state.next_image + 1) % self.image_count;
        state.acquired += 1;
        drop(state);

        self.device.signal_semaphore(signal_semaphore);
        match failure {
            Some(result) => Err(GpuError::Acquire(result)),
            None => Ok(index),
        }
    }

    fn present(
        &self,
        _queue: vk::Queue,
        wait_semaphore: vk::Semaphore,
        image_index: u32,
    ) -> Result<()> {
        self.device.consume_semaphore(wait_semaphore);

        let mut state = self.state.lock();
        if let Some(result) = state.present_failures.pop_front() {
            return Err(GpuError::Present(result));
        }
        state.presented.push(image_index);
        Ok(())
    }

    fn image_count(&self) -> usize {
        self.image_count as usize
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }
}
