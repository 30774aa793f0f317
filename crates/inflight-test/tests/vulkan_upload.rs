//! Upload round trip on a real Vulkan device.

use ash::vk;
use inflight_gpu::{
    BufferDesc, CommandBufferManager, DeviceBuffer, GpuContextBuilder, GpuDevice, MemoryLocation,
    StagingUploader,
};
use std::sync::Arc;

#[test]
#[ignore = "requires a Vulkan 1.3 device"]
fn upload_round_trip_on_hardware() {
    let context = GpuContextBuilder::new()
        .app_name("inflight-test")
        .validation(true)
        .build()
        .unwrap();
    let gpu: Arc<dyn GpuDevice> = Arc::new(context);
    let commands = Arc::new(CommandBufferManager::new(gpu.clone()).unwrap());
    let uploader = StagingUploader::new(commands.clone());

    let data: Vec<u8> = (0..=255).collect();
    let buffer = uploader
        .upload(
            &data,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
            "round_trip",
        )
        .unwrap();

    // Device-local memory is not mapped, so copy back into a readback buffer
    let readback = DeviceBuffer::new(
        gpu.clone(),
        &BufferDesc {
            size: data.len() as u64,
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuToCpu,
            name: "readback",
        },
    )
    .unwrap();
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: data.len() as u64,
    };
    commands
        .execute_cmd(gpu.graphics_queue(), |cmd| {
            cmd.copy_buffer(buffer.handle(), readback.handle(), &[region]);
        })
        .unwrap();

    assert_eq!(readback.read().unwrap(), data);
}
