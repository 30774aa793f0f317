//! Background completion of simulated GPU work.

use crate::device::SimulatedDevice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Completes each submission a fixed latency after it was queued.
///
/// Pair with [`crate::GpuClock::Manual`]. Stops and joins on drop.
pub struct GpuThread {
    device: Arc<SimulatedDevice>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GpuThread {
    pub fn spawn(device: Arc<SimulatedDevice>, latency: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let device = device.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("simulated-gpu".to_string())
                .spawn(move || run(&device, &stop, latency))
                .ok()
        };
        if handle.is_none() {
            tracing::error!("Failed to spawn simulated GPU thread");
        }

        Self {
            device,
            stop,
            handle,
        }
    }
}

fn run(device: &SimulatedDevice, stop: &AtomicBool, latency: Duration) {
    tracing::debug!("Simulated GPU running with {latency:?} latency");
    while !stop.load(Ordering::Acquire) {
        device.complete_older_than(latency);

        let wait = match device.oldest_pending() {
            Some(submitted_at) => (submitted_at + latency).saturating_duration_since(Instant::now()),
            None => Duration::from_millis(5),
        };
        if !wait.is_zero() {
            device.wait_for_progress(wait);
        }
    }
}

impl Drop for GpuThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.device.notify();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Simulated GPU thread panicked");
            }
        }
    }
}
