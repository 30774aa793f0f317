//! Swapchain acquire/present.

use crate::context::GpuContext;
use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;

/// Source of presentable images.
///
/// Acquire and present failures are reported, never retried. Rebuilding the
/// swapchain after `ERROR_OUT_OF_DATE_KHR` is the caller's job.
pub trait SwapchainPresenter {
    /// Request the next image, signaling `signal_semaphore` once it is ready.
    ///
    /// Fails with `GpuError::Acquire`. A suboptimal swapchain is reported as
    /// `GpuError::Acquire(vk::Result::SUBOPTIMAL_KHR)`.
    fn acquire_next_image(&self, timeout_ns: u64, signal_semaphore: vk::Semaphore) -> Result<u32>;

    /// Queue `image_index` for presentation after `wait_semaphore` is signaled.
    ///
    /// Fails with `GpuError::Present`, including for out-of-date and suboptimal results.
    fn present(
        &self,
        queue: vk::Queue,
        wait_semaphore: vk::Semaphore,
        image_index: u32,
    ) -> Result<()>;

    /// Number of swapchain images.
    fn image_count(&self) -> usize;

    /// Image extent.
    fn extent(&self) -> vk::Extent2D;

    /// Framebuffer for an image, once framebuffers exist.
    fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer>;
}

/// Swapchain wrapper.
pub struct Swapchain {
    device: ash::Device,
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a new swapchain for an existing surface.
    ///
    /// # Safety
    /// The surface must be valid, belong to the context's instance, and be
    /// presentable from the context's graphics queue.
    pub unsafe fn new(
        context: &GpuContext,
        surface: vk::SurfaceKHR,
        surface_capabilities: &vk::SurfaceCapabilitiesKHR,
        surface_format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let device = context.device().clone();
        let loader = ash::khr::swapchain::Device::new(context.instance(), &device);

        let image_count = desired_image_count(surface_capabilities);

        let queue_families = [context.graphics_queue_family()];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(surface_capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let mut this = Self {
            device,
            loader,
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            format: surface_format.format,
            extent,
        };

        // From here on, Drop releases whatever was created if a later step fails
        this.images = unsafe { this.loader.get_swapchain_images(swapchain)? };
        for &image in &this.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(crate::memory::color_subresource_range());

            let view = unsafe { this.device.create_image_view(&view_info, None)? };
            this.image_views.push(view);
        }

        tracing::info!(
            "Swapchain created: {}x{} ({} images)",
            extent.width,
            extent.height,
            this.images.len()
        );

        Ok(this)
    }

    /// Create one framebuffer per image for `render_pass`.
    ///
    /// Replaces any framebuffers created earlier.
    pub fn create_framebuffers(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        self.destroy_framebuffers();

        for &view in &self.image_views {
            let attachments = [view];
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);

            // SAFETY: render pass and view come from this device
            let framebuffer = unsafe { self.device.create_framebuffer(&info, None)? };
            self.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    /// Swapchain images.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Image format.
    pub fn format(&self) -> vk::Format {
        self.format
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            // SAFETY: callers wait for the device before replacing or dropping
            unsafe { self.device.destroy_framebuffer(framebuffer, None) };
        }
    }
}

impl SwapchainPresenter for Swapchain {
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn acquire_next_image(&self, timeout_ns: u64, signal_semaphore: vk::Semaphore) -> Result<u32> {
        // SAFETY: swapchain and semaphore are owned by live wrappers on this device
        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                signal_semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, false)) => Ok(index),
            Ok((_, true)) => Err(GpuError::Acquire(vk::Result::SUBOPTIMAL_KHR)),
            Err(e) => Err(GpuError::Acquire(e)),
        }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn present(
        &self,
        queue: vk::Queue,
        wait_semaphore: vk::Semaphore,
        image_index: u32,
    ) -> Result<()> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: queue and semaphore belong to this device
        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(()),
            Ok(true) => Err(GpuError::Present(vk::Result::SUBOPTIMAL_KHR)),
            Err(e) => Err(GpuError::Present(e)),
        }
    }

    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // SAFETY: everything below was created from this device and the wait
        // guarantees no submission still references it
        unsafe {
            let _ = self.device.device_wait_idle();
            self.destroy_framebuffers();
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// One more image than the surface minimum, clamped to its maximum.
///
/// A maximum of zero means the surface has no upper limit.
fn desired_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn asks_for_one_image_over_the_minimum() {
        assert_eq!(desired_image_count(&capabilities(2, 8)), 3);
        assert_eq!(desired_image_count(&capabilities(2, 0)), 3);
    }

    #[test]
    fn clamps_to_the_surface_maximum() {
        assert_eq!(desired_image_count(&capabilities(3, 3)), 3);
    }
}
