//! One-shot command execution against the simulated device.

use ash::vk;
use inflight_gpu::{CommandBufferManager, GpuDevice, GpuError};
use inflight_test::{FailPoint, GpuClock, RecordedCommand, SimulatedDevice, TestRig};
use std::sync::Arc;

#[test]
fn execute_cmd_submits_and_waits() {
    let rig = TestRig::new(GpuClock::Manual).unwrap();
    let queue = rig.device.graphics_queue();

    rig.commands
        .execute_cmd(queue, |cmd| {
            cmd.draw(6, 2).draw_indexed(36, 1);
        })
        .unwrap();

    assert_eq!(rig.device.pending_submissions(), 0);
    let submissions = rig.device.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].fence, vk::Fence::null());
    assert!(matches!(
        submissions[0].commands.as_slice(),
        [
            RecordedCommand::Draw {
                vertex_count: 6,
                instance_count: 2
            },
            RecordedCommand::DrawIndexed {
                index_count: 36,
                instance_count: 1
            },
        ]
    ));
}

#[test]
fn execute_cmd_frees_its_buffer_on_every_path() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let queue = rig.device.graphics_queue();
    let before = rig.device.live_objects().command_buffers;

    for point in [
        FailPoint::BeginCommandBuffer,
        FailPoint::EndCommandBuffer,
        FailPoint::QueueSubmit,
    ] {
        rig.device.fail_next(point);
        let result = rig.commands.execute_cmd(queue, |cmd| {
            cmd.draw(3, 1);
        });
        assert!(
            matches!(result, Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))),
            "{point:?}"
        );
        assert_eq!(rig.device.live_objects().command_buffers, before, "{point:?}");
    }

    rig.commands.execute_cmd(queue, |_| {}).unwrap();
    assert_eq!(rig.device.live_objects().command_buffers, before);
    assert!(rig.device.violations().is_empty());
}

#[test]
fn command_buffers_come_from_one_pool() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    assert_eq!(
        rig.commands.queue_family(),
        SimulatedDevice::GRAPHICS_QUEUE_FAMILY
    );

    let one = rig.commands.create_one_command_buffer().unwrap();
    let many = rig.commands.create_command_buffers(3).unwrap();
    assert_eq!(many.len(), 3);
    assert!(!many.contains(&one));
    assert_eq!(rig.device.live_objects().command_buffers, 4);

    rig.commands.free_command_buffers(&many);
    rig.commands.free_command_buffers(&[one]);
    rig.commands.free_command_buffers(&[]);
    assert_eq!(rig.device.live_objects().command_buffers, 0);
}

#[test]
fn dropping_manager_waits_and_destroys_pool() {
    let device = SimulatedDevice::new(GpuClock::Manual);
    let gpu: Arc<dyn GpuDevice> = device.clone();
    let manager = CommandBufferManager::new(gpu).unwrap();
    assert_eq!(device.live_objects().command_pools, 1);

    manager.create_one_command_buffer().unwrap();
    drop(manager);

    let live = device.live_objects();
    assert_eq!(live.command_pools, 0);
    assert_eq!(live.command_buffers, 0);
}

#[test]
fn recording_outside_begin_is_flagged() {
    let rig = TestRig::new(GpuClock::Immediate).unwrap();
    let cmd = rig.commands.create_one_command_buffer().unwrap();
    let gpu = rig.gpu();

    inflight_gpu::CommandRecorder::new(gpu.as_ref(), cmd).draw(3, 1);

    assert_eq!(
        rig.device.violations(),
        vec![inflight_test::Violation::RecordOutsideBegin(cmd)]
    );
    rig.commands.free_command_buffers(&[cmd]);
}
