//! Test harness for the inflight frame layer.
//!
//! Provides a simulated device and swapchain with a controllable GPU clock,
//! so frame pacing, semaphore handoff and pool recycling can be checked
//! without a GPU.

pub mod device;
pub mod gpu_thread;
pub mod rig;
pub mod swapchain;

pub use device::{
    FailPoint, GpuClock, LiveObjects, RecordedCommand, SimulatedDevice, SubmissionRecord,
    Violation,
};
pub use gpu_thread::GpuThread;
pub use rig::{TestRig, DEFAULT_SWAPCHAIN_IMAGES};
pub use swapchain::SimulatedSwapchain;
