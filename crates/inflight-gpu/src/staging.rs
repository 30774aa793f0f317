//! Synchronous host-to-device uploads through staging buffers.

use crate::command::CommandBufferManager;
use crate::device::{BufferDesc, GpuDevice, ImageDesc, MemoryLocation};
use crate::error::{GpuError, Result};
use crate::memory::{DeviceBuffer, DeviceImage};
use ash::vk;
use std::sync::Arc;

/// Copies host data into device-local memory.
///
/// Every call blocks until the copy has completed, so on return the data is
/// visible to any later GPU read of the destination.
pub struct StagingUploader {
    device: Arc<dyn GpuDevice>,
    commands: Arc<CommandBufferManager>,
}

impl StagingUploader {
    /// Create an uploader that records its copies through `commands`.
    pub fn new(commands: Arc<CommandBufferManager>) -> Self {
        Self {
            device: commands.device().clone(),
            commands,
        }
    }

    /// Upload bytes into a new device-local buffer.
    ///
    /// `usage` is combined with `TRANSFER_DST`. An empty slice yields an empty
    /// buffer without touching the GPU.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn upload(
        &self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<DeviceBuffer> {
        if data.is_empty() {
            return Ok(DeviceBuffer::empty(self.device.clone()));
        }

        let size = data.len() as u64;
        let staging = self.stage(data, name)?;

        let destination = DeviceBuffer::new(
            self.device.clone(),
            &BufferDesc {
                size,
                usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::GpuOnly,
                name,
            },
        )?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        self.commands
            .execute_cmd(self.device.graphics_queue(), |cmd| {
                cmd.copy_buffer(staging.handle(), destination.handle(), &[region]);
            })?;

        tracing::debug!("Uploaded {size} bytes to '{name}'");
        Ok(destination)
    }

    /// Upload a typed slice into a new device-local buffer.
    pub fn upload_slice<T: bytemuck::Pod>(
        &self,
        data: &[T],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<DeviceBuffer> {
        self.upload(bytemuck::cast_slice(data), usage, name)
    }

    /// Upload tightly packed pixels into a new sampled image.
    ///
    /// The image ends in `SHADER_READ_ONLY_OPTIMAL`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn upload_image(
        &self,
        pixels: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
        name: &str,
    ) -> Result<DeviceImage> {
        let texel_size = bytes_per_pixel(format).ok_or_else(|| {
            GpuError::InvalidState(format!("Unsupported upload format {format:?}"))
        })?;
        let expected = u64::from(extent.width) * u64::from(extent.height) * texel_size;
        if expected == 0 || pixels.len() as u64 != expected {
            return Err(GpuError::InvalidState(format!(
                "Image '{name}' expects {expected} bytes, got {}",
                pixels.len()
            )));
        }

        let staging = self.stage(pixels, name)?;
        let image = DeviceImage::new(
            self.device.clone(),
            &ImageDesc {
                extent,
                format,
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                name,
            },
        )?;

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_offset(vk::Offset3D::default())
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });

        self.commands
            .execute_cmd(self.device.graphics_queue(), |cmd| {
                cmd.transition_image(
                    image.handle(),
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )
                .copy_buffer_to_image(
                    staging.handle(),
                    image.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                )
                .transition_image(
                    image.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            })?;

        tracing::debug!(
            "Uploaded {}x{} image '{name}'",
            extent.width,
            extent.height
        );
        Ok(image)
    }

    /// Copy `data` into a fresh host-visible buffer.
    fn stage(&self, data: &[u8], name: &str) -> Result<DeviceBuffer> {
        let staging_name = format!("{name}_staging");
        let staging = DeviceBuffer::new(
            self.device.clone(),
            &BufferDesc {
                size: data.len() as u64,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                name: &staging_name,
            },
        )?;
        self.device.write_buffer(&staging, 0, data)?;
        Ok(staging)
    }
}

/// Texel size for the formats `upload_image` accepts.
pub fn bytes_per_pixel(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8G8B8A8_SRGB
        | vk::Format::R8G8B8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM => Some(4),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba8_formats_are_four_bytes() {
        assert_eq!(bytes_per_pixel(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(bytes_per_pixel(vk::Format::B8G8R8A8_UNORM), Some(4));
    }

    #[test]
    fn compressed_formats_are_rejected() {
        assert_eq!(bytes_per_pixel(vk::Format::BC7_SRGB_BLOCK), None);
        assert_eq!(bytes_per_pixel(vk::Format::R32G32B32A32_SFLOAT), None);
    }
}
