//! Frame pacing and semaphore handoff against the simulated device.

use ash::vk;
use inflight_gpu::{FrameSchedulerConfig, GpuError, SlotState, SwapchainPresenter};
use inflight_test::{FailPoint, GpuClock, GpuThread, RecordedCommand, TestRig, Violation};
use std::sync::mpsc;
use std::time::Duration;

fn run_frame(
    scheduler: &mut inflight_gpu::FrameScheduler,
    swapchain: &dyn SwapchainPresenter,
) -> inflight_gpu::Result<u32> {
    let image_index = scheduler.begin_frame(swapchain)?;
    scheduler.record_and_submit(|cmd| {
        cmd.draw(3, 1);
    })?;
    scheduler.present(swapchain, image_index)?;
    scheduler.end_frame();
    Ok(image_index)
}

#[test]
fn slots_rotate_modulo_frames_in_flight() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig.scheduler(FrameSchedulerConfig::default()).unwrap();

    let mut slots = Vec::new();
    for _ in 0..5 {
        slots.push(scheduler.current_frame());
        run_frame(&mut scheduler, &rig.swapchain).unwrap();
    }

    assert_eq!(slots, vec![0, 1, 0, 1, 0]);
    assert_eq!(scheduler.frame_count(), 5);
    assert_eq!(rig.swapchain.presented(), vec![0, 1, 2, 0, 1]);
    assert!(rig.device.violations().is_empty());
}

#[test]
fn triple_buffering_rotates_three_slots() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig
        .scheduler(FrameSchedulerConfig::default().with_frames_in_flight(3))
        .unwrap();

    let mut slots = Vec::new();
    for _ in 0..7 {
        slots.push(scheduler.current_frame());
        run_frame(&mut scheduler, &rig.swapchain).unwrap();
    }

    assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    assert_eq!(scheduler.frames_in_flight(), 3);
    assert!(rig.device.violations().is_empty());
}

#[test]
fn each_submission_hands_off_the_slot_semaphores() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig.scheduler(FrameSchedulerConfig::default()).unwrap();

    for _ in 0..4 {
        run_frame(&mut scheduler, &rig.swapchain).unwrap();
    }

    let submissions = rig.device.submissions();
    assert_eq!(submissions.len(), 4);
    for submission in &submissions {
        assert_eq!(submission.wait_semaphores.len(), 1);
        assert_eq!(
            submission.wait_stages,
            vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT]
        );
        assert_eq!(submission.signal_semaphores.len(), 1);
        assert_ne!(submission.fence, vk::Fence::null());
        assert!(matches!(
            submission.commands.as_slice(),
            [RecordedCommand::Draw {
                vertex_count: 3,
                instance_count: 1
            }]
        ));
    }

    // Slot k and slot k+2 share their synchronization objects
    assert_eq!(submissions[0].fence, submissions[2].fence);
    assert_eq!(submissions[0].command_buffers, submissions[2].command_buffers);
    assert_eq!(
        submissions[0].signal_semaphores,
        submissions[2].signal_semaphores
    );
    assert_ne!(submissions[0].fence, submissions[1].fence);
    assert_ne!(
        submissions[0].wait_semaphores,
        submissions[1].wait_semaphores
    );
}

#[test]
fn third_frame_blocks_until_first_frame_fence_signals() {
    let rig = TestRig::new(GpuClock::Manual).unwrap();
    let mut scheduler = rig.scheduler(FrameSchedulerConfig::default()).unwrap();

    run_frame(&mut scheduler, &rig.swapchain).unwrap();
    run_frame(&mut scheduler, &rig.swapchain).unwrap();
    assert_eq!(rig.device.pending_submissions(), 2);

    let first_fence = rig.device.submissions()[0].fence;
    let device = rig.device.clone();
    let (tx, rx) = mpsc::channel();

    std::thread::scope(|scope| {
        let swapchain = &rig.swapchain;
        let scheduler = &mut scheduler;
        let tx = tx.clone();
        scope.spawn(move || {
            let result = scheduler.begin_frame(swapchain);
            let _ = tx.send(result.map_err(|e| e.to_string()));
        });

        // Nothing has completed, so the slot 0 fence holds the CPU back
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(device.fence_signaled(first_fence), Some(false));

        // Completing frame 0 releases the wait
        assert!(device.complete_next());
        let image_index = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("begin_frame did not return after the fence signaled")
            .unwrap();
        assert_eq!(image_index, 2);
    });

    assert_eq!(rig.device.pending_submissions(), 1);
    assert_eq!(
        scheduler.slot_state(0),
        Some(SlotState::Acquiring { image_index: 2 })
    );
    assert!(rig.device.violations().is_empty());
}

#[test]
fn no_reuse_violations_under_real_latency() {
    let rig = TestRig::new(GpuClock::Manual).unwrap();
    let mut scheduler = rig
        .scheduler(FrameSchedulerConfig::default().with_frames_in_flight(3))
        .unwrap();
    let gpu = GpuThread::spawn(rig.device.clone(), Duration::from_micros(500));

    for _ in 0..30 {
        run_frame(&mut scheduler, &rig.swapchain).unwrap();
    }
    scheduler.wait_all().unwrap();
    drop(gpu);

    assert_eq!(rig.device.submission_count(), 30);
    assert_eq!(rig.device.pending_submissions(), 0);
    assert!(
        rig.device.violations().is_empty(),
        "{:?}",
        rig.device.violations()
    );
}

#[test]
fn out_of_order_calls_are_rejected_without_gpu_work() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig.scheduler(FrameSchedulerConfig::default()).unwrap();

    let err = scheduler.record_and_submit(|_| {}).unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));
    let err = scheduler.present(&rig.swapchain, 0).unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));

    let image_index = scheduler.begin_frame(&rig.swapchain).unwrap();
    let err = scheduler.begin_frame(&rig.swapchain).unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));
    let err = scheduler.present(&rig.swapchain, image_index).unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));

    scheduler.record_and_submit(|_| {}).unwrap();
    let err = scheduler
        .present(&rig.swapchain, image_index + 1)
        .unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));
    scheduler.present(&rig.swapchain, image_index).unwrap();
    scheduler.end_frame();

    assert_eq!(rig.device.submission_count(), 1);
    assert_eq!(rig.swapchain.acquire_count(), 1);
    assert!(rig.device.violations().is_empty());
}

#[test]
fn acquire_failure_propagates_and_leaves_slot_usable() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig.scheduler(FrameSchedulerConfig::default()).unwrap();

    rig.swapchain
        .fail_next_acquire(vk::Result::ERROR_OUT_OF_DATE_KHR);
    let err = scheduler.begin_frame(&rig.swapchain).unwrap_err();
    assert!(matches!(
        err,
        GpuError::Acquire(vk::Result::ERROR_OUT_OF_DATE_KHR)
    ));
    assert!(err.requires_swapchain_recreation());
    assert_eq!(scheduler.slot_state(0), Some(SlotState::Idle));

    // The fence was not reset, so the retry does not deadlock
    run_frame(&mut scheduler, &rig.swapchain).unwrap();
    assert!(rig.device.violations().is_empty());
}

#[test]
fn suboptimal_acquire_is_an_error() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig.scheduler(FrameSchedulerConfig::default()).unwrap();

    rig.swapchain.fail_next_acquire(vk::Result::SUBOPTIMAL_KHR);
    let err = scheduler.begin_frame(&rig.swapchain).unwrap_err();
    assert!(matches!(err, GpuError::Acquire(vk::Result::SUBOPTIMAL_KHR)));
    assert!(err.requires_swapchain_recreation());
    assert_eq!(scheduler.slot_state(0), Some(SlotState::Idle));

    // The image-available semaphore of slot 0 is still signaled, so reusing
    // the slot without rebuilding signals it a second time
    run_frame(&mut scheduler, &rig.swapchain).unwrap();
    assert!(matches!(
        rig.device.violations().as_slice(),
        [Violation::SemaphoreAlreadySignaled(_)]
    ));
}

#[test]
fn rebuilding_after_suboptimal_acquire_starts_clean() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig.scheduler(FrameSchedulerConfig::default()).unwrap();

    rig.swapchain.fail_next_acquire(vk::Result::SUBOPTIMAL_KHR);
    assert!(scheduler.begin_frame(&rig.swapchain).is_err());
    assert_eq!(rig.swapchain.acquire_count(), 1);

    drop(scheduler);
    let mut scheduler = rig.scheduler(FrameSchedulerConfig::default()).unwrap();
    for _ in 0..4 {
        run_frame(&mut scheduler, &rig.swapchain).unwrap();
    }
    scheduler.wait_all().unwrap();
    assert!(rig.device.violations().is_empty());
}

#[test]
fn failed_submit_returns_slot_to_service() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig.scheduler(FrameSchedulerConfig::default()).unwrap();

    scheduler.begin_frame(&rig.swapchain).unwrap();
    rig.device.fail_next(FailPoint::QueueSubmit);
    let err = scheduler
        .record_and_submit(|cmd| {
            cmd.draw(3, 1);
        })
        .unwrap_err();
    assert!(matches!(
        err,
        GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
    ));
    assert_eq!(scheduler.slot_state(0), Some(SlotState::Idle));

    // Come back around to slot 0
    scheduler.end_frame();
    scheduler.end_frame();
    assert_eq!(scheduler.current_frame(), 0);
    run_frame(&mut scheduler, &rig.swapchain).unwrap();
    run_frame(&mut scheduler, &rig.swapchain).unwrap();
    scheduler.wait_all().unwrap();

    // The failed frame left only an empty batch behind
    let submissions = rig.device.submissions();
    assert_eq!(submissions.len(), 3);
    assert!(submissions[0].command_buffers.is_empty());
    assert!(
        rig.device.violations().is_empty(),
        "{:?}",
        rig.device.violations()
    );
}

#[test]
fn failed_submit_and_failed_release_recreate_slot_sync() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig
        .scheduler(FrameSchedulerConfig::default().with_frames_in_flight(1))
        .unwrap();
    let before = rig.device.live_objects();

    scheduler.begin_frame(&rig.swapchain).unwrap();
    rig.device.fail_next(FailPoint::QueueSubmit);
    rig.device.fail_next(FailPoint::QueueSubmit);
    assert!(scheduler.record_and_submit(|_| {}).is_err());
    assert_eq!(scheduler.slot_state(0), Some(SlotState::Idle));
    assert_eq!(rig.device.submission_count(), 0);
    assert_eq!(rig.device.live_objects(), before);

    scheduler.end_frame();
    run_frame(&mut scheduler, &rig.swapchain).unwrap();
    scheduler.wait_all().unwrap();
    assert!(rig.device.violations().is_empty());
}

#[test]
fn failed_recording_returns_slot_to_service() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig
        .scheduler(FrameSchedulerConfig::default().with_frames_in_flight(1))
        .unwrap();

    for point in [FailPoint::BeginCommandBuffer, FailPoint::EndCommandBuffer] {
        scheduler.begin_frame(&rig.swapchain).unwrap();
        rig.device.fail_next(point);
        assert!(scheduler.record_and_submit(|_| {}).is_err(), "{point:?}");
        assert_eq!(scheduler.slot_state(0), Some(SlotState::Idle), "{point:?}");
        scheduler.end_frame();
    }

    run_frame(&mut scheduler, &rig.swapchain).unwrap();
    scheduler.wait_all().unwrap();
    assert!(rig.device.violations().is_empty());
}

#[test]
fn ending_an_acquired_frame_releases_the_slot() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig
        .scheduler(FrameSchedulerConfig::default().with_frames_in_flight(1))
        .unwrap();

    scheduler.begin_frame(&rig.swapchain).unwrap();
    scheduler.end_frame();
    assert_eq!(scheduler.slot_state(0), Some(SlotState::Idle));

    run_frame(&mut scheduler, &rig.swapchain).unwrap();
    scheduler.wait_all().unwrap();
    assert!(rig.device.violations().is_empty());
}

#[test]
fn present_failure_propagates_and_frame_can_end() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let mut scheduler = rig.scheduler(FrameSchedulerConfig::default()).unwrap();

    let image_index = scheduler.begin_frame(&rig.swapchain).unwrap();
    scheduler.record_and_submit(|_| {}).unwrap();
    rig.swapchain
        .fail_next_present(vk::Result::ERROR_OUT_OF_DATE_KHR);
    let err = scheduler
        .present(&rig.swapchain, image_index)
        .unwrap_err();
    assert!(matches!(
        err,
        GpuError::Present(vk::Result::ERROR_OUT_OF_DATE_KHR)
    ));
    scheduler.end_frame();

    assert_eq!(scheduler.current_frame(), 1);
    assert_eq!(scheduler.slot_state(0), Some(SlotState::Idle));
    run_frame(&mut scheduler, &rig.swapchain).unwrap();
    assert!(rig.device.violations().is_empty());
}

#[test]
fn stuck_gpu_surfaces_fence_timeout() {
    let rig = TestRig::new(GpuClock::Manual).unwrap();
    let mut scheduler = rig
        .scheduler(
            FrameSchedulerConfig::default()
                .with_frames_in_flight(1)
                .with_fence_timeout_ns(2_000_000),
        )
        .unwrap();

    run_frame(&mut scheduler, &rig.swapchain).unwrap();
    let err = scheduler.begin_frame(&rig.swapchain).unwrap_err();
    assert!(matches!(
        err,
        GpuError::FenceWaitTimeout {
            timeout_ns: 2_000_000
        }
    ));

    rig.device.complete_all();
    run_frame(&mut scheduler, &rig.swapchain).unwrap();
}

#[test]
fn zero_frames_in_flight_is_rejected() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let result = rig.scheduler(FrameSchedulerConfig::default().with_frames_in_flight(0));
    assert!(matches!(result, Err(GpuError::InvalidState(_))));
}

#[test]
fn dropping_scheduler_releases_slot_resources() {
    let rig = TestRig::new(GpuClock::Manual).unwrap();
    let before = rig.device.live_objects();

    {
        let mut scheduler = rig.scheduler(FrameSchedulerConfig::default()).unwrap();
        run_frame(&mut scheduler, &rig.swapchain).unwrap();
        run_frame(&mut scheduler, &rig.swapchain).unwrap();
        let live = rig.device.live_objects();
        assert_eq!(live.fences, before.fences + 2);
        assert_eq!(live.semaphores, before.semaphores + 4);
        assert_eq!(live.command_buffers, before.command_buffers + 2);
    }

    assert_eq!(rig.device.pending_submissions(), 0);
    assert_eq!(rig.device.live_objects(), before);
    assert!(rig.device.violations().is_empty());
}
