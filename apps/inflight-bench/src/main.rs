//! Inflight Frame Pacing Benchmark
//!
//! Drives the full begin/record/present/end frame loop against the simulated
//! device, with a background thread completing GPU work after a fixed latency,
//! and reports frame time and how long the CPU stalled on frame fences.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p inflight-bench --release -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--frames <N>`: Frames to run (default: 600)
//! - `--frames-in-flight <N>`: Frame slots (default: 2)
//! - `--gpu-latency-us <N>`: Simulated GPU time per submission (default: 2000)
//! - `--uploads <N>`: Staging uploads before the frame loop (default: 16)
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::time::{Duration, Instant};

use anyhow::Context;
use ash::vk;
use inflight_gpu::{DescriptorAllocatorConfig, FrameSchedulerConfig};
use inflight_test::{GpuClock, GpuThread, TestRig};
use tracing::info;
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Benchmark parameters (from CLI or defaults).
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub frames: u32,
    pub frames_in_flight: usize,
    pub gpu_latency: Duration,
    pub uploads: u32,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            frames: 600,
            frames_in_flight: 2,
            gpu_latency: Duration::from_micros(2000),
            uploads: 16,
        }
    }
}

impl BenchConfig {
    pub fn with_frames(mut self, frames: u32) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    pub fn with_gpu_latency(mut self, latency: Duration) -> Self {
        self.gpu_latency = latency;
        self
    }

    pub fn with_uploads(mut self, uploads: u32) -> Self {
        self.uploads = uploads;
        self
    }

    /// Parse benchmark parameters from command line arguments.
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut config = Self::default();
        let args: Vec<String> = args.into_iter().collect();

        let mut i = 0;
        while i < args.len() {
            let value = args.get(i + 1).map(String::as_str);
            match (args[i].as_str(), value) {
                ("--frames", Some(v)) => {
                    if let Ok(v) = v.parse() {
                        config = config.with_frames(v);
                        i += 1;
                    }
                }
                ("--frames-in-flight", Some(v)) => {
                    if let Ok(v) = v.parse() {
                        config = config.with_frames_in_flight(v);
                        i += 1;
                    }
                }
                ("--gpu-latency-us", Some(v)) => {
                    if let Ok(v) = v.parse() {
                        config = config.with_gpu_latency(Duration::from_micros(v));
                        i += 1;
                    }
                }
                ("--uploads", Some(v)) => {
                    if let Ok(v) = v.parse() {
                        config = config.with_uploads(v);
                        i += 1;
                    }
                }
                (other, _) => tracing::warn!("Ignoring argument '{other}'"),
            }
            i += 1;
        }

        config
    }
}

/// Timings collected over the frame loop.
#[derive(Debug, Default)]
struct FrameStats {
    frames: u32,
    total: Duration,
    worst: Duration,
    fence_stall: Duration,
}

impl FrameStats {
    fn record(&mut self, frame: Duration, stall: Duration) {
        self.frames += 1;
        self.total += frame;
        self.worst = self.worst.max(frame);
        self.fence_stall += stall;
    }

    fn average(&self) -> Duration {
        if self.frames == 0 {
            Duration::ZERO
        } else {
            self.total / self.frames
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Check for help flag before doing anything else
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    init_logging();

    let config = BenchConfig::from_args();
    info!("Inflight frame pacing benchmark: {config:?}");

    let rig = TestRig::new(GpuClock::Manual).context("Failed to create simulated device")?;
    let _gpu = GpuThread::spawn(rig.device.clone(), config.gpu_latency);

    run_uploads(&rig, config.uploads)?;
    let stats = run_frames(&rig, &config)?;

    let violations = rig.device.violations();
    info!(
        "{} frames, avg {:.3} ms, worst {:.3} ms, fence stall {:.3} ms total ({:.1}%)",
        stats.frames,
        stats.average().as_secs_f64() * 1000.0,
        stats.worst.as_secs_f64() * 1000.0,
        stats.fence_stall.as_secs_f64() * 1000.0,
        100.0 * stats.fence_stall.as_secs_f64() / stats.total.as_secs_f64().max(f64::EPSILON)
    );
    if violations.is_empty() {
        info!("No synchronization violations");
    } else {
        for violation in &violations {
            tracing::error!("{violation}");
        }
        anyhow::bail!("{} synchronization violations", violations.len());
    }

    Ok(())
}

fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,inflight_gpu=trace,inflight_bench=trace"));
        let tracy_layer = tracing_tracy::TracyLayer::default();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracy_layer)
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

fn run_uploads(rig: &TestRig, uploads: u32) -> anyhow::Result<()> {
    let uploader = rig.uploader();
    let start = Instant::now();
    let mut bytes = 0u64;

    for i in 0..uploads {
        let data = vec![(i % 256) as u8; 64 * 1024];
        let buffer = uploader
            .upload(&data, vk::BufferUsageFlags::VERTEX_BUFFER, "bench_vertices")
            .with_context(|| format!("Upload {i} failed"))?;
        bytes += buffer.size;
    }

    let elapsed = start.elapsed();
    if uploads > 0 {
        info!(
            "{uploads} uploads ({} KiB) in {:.3} ms",
            bytes / 1024,
            elapsed.as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

fn run_frames(rig: &TestRig, config: &BenchConfig) -> anyhow::Result<FrameStats> {
    let mut scheduler = rig
        .scheduler(FrameSchedulerConfig::default().with_frames_in_flight(config.frames_in_flight))
        .context("Failed to create frame scheduler")?;
    let mut descriptors = rig.descriptor_allocator(
        DescriptorAllocatorConfig::default().with_frames_in_flight(config.frames_in_flight as u32),
    )?;
    let frame_sets = descriptors.alloc_buffer_sets(config.frames_in_flight as u32)?;

    let mut stats = FrameStats::default();
    for _ in 0..config.frames {
        let frame_start = Instant::now();

        let image_index = scheduler.begin_frame(&rig.swapchain)?;
        let stall = frame_start.elapsed();

        let frame_set = frame_sets[scheduler.current_frame()].set;
        scheduler.record_and_submit(|cmd| {
            cmd.bind_descriptor_sets(
                vk::PipelineBindPoint::GRAPHICS,
                vk::PipelineLayout::null(),
                0,
                &[frame_set],
            )
            .draw(3, 1);
        })?;
        scheduler.present(&rig.swapchain, image_index)?;
        scheduler.end_frame();

        stats.record(frame_start.elapsed(), stall);
    }

    scheduler.wait_all()?;
    Ok(stats)
}

fn print_help() {
    eprintln!(
        "Inflight Frame Pacing Benchmark

USAGE:
    cargo run -p inflight-bench --release -- [OPTIONS]

OPTIONS:
    --frames <N>            Frames to run (default: 600)
    --frames-in-flight <N>  Frame slots (default: 2)
    --gpu-latency-us <N>    Simulated GPU time per submission (default: 2000)
    --uploads <N>           Staging uploads before the frame loop (default: 16)
    -h, --help              Print this help message

EXAMPLES:
    # Double buffering with a 2 ms GPU
    cargo run -p inflight-bench --release

    # Triple buffering hides a slower GPU
    cargo run -p inflight-bench --release -- --frames-in-flight 3 --gpu-latency-us 8000

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn parses_every_option() {
        let config = BenchConfig::parse(args(&[
            "--frames",
            "10",
            "--frames-in-flight",
            "3",
            "--gpu-latency-us",
            "250",
            "--uploads",
            "0",
        ]));
        assert_eq!(config.frames, 10);
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.gpu_latency, Duration::from_micros(250));
        assert_eq!(config.uploads, 0);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let config = BenchConfig::parse(args(&["--frames", "many", "--uploads"]));
        let defaults = BenchConfig::default();
        assert_eq!(config.frames, defaults.frames);
        assert_eq!(config.uploads, defaults.uploads);
    }

    #[test]
    fn short_run_has_no_violations() {
        let rig = TestRig::new(GpuClock::Immediate).unwrap();
        let config = BenchConfig::default().with_frames(8).with_uploads(2);
        run_uploads(&rig, config.uploads).unwrap();
        let stats = run_frames(&rig, &config).unwrap();
        assert_eq!(stats.frames, 8);
        assert!(rig.device.violations().is_empty());
    }
}
