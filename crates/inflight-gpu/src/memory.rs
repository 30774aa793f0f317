//! GPU memory management.

use crate::device::{BufferDesc, GpuDevice, ImageDesc};
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::ops::Deref;
use std::sync::Arc;

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Allocate a buffer.
    pub fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<GpuBuffer> {
        if desc.size == 0 {
            return Err(GpuError::InvalidState(format!(
                "Buffer '{}' has zero size",
                desc.name
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(e.to_string()));
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let mut buffer = GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            location: desc.location,
        };
        if let Err(e) = bound {
            self.free_buffer(&mut buffer)?;
            return Err(e.into());
        }

        Ok(buffer)
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        if buffer.buffer != vk::Buffer::null() {
            unsafe {
                self.device.destroy_buffer(buffer.buffer, None);
            }
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Allocate an image and a matching 2D color view.
    pub fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<GpuImage> {
        let extent = vk::Extent3D {
            width: desc.extent.width,
            height: desc.extent.height,
            depth: 1,
        };
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            self.device
                .create_image(&create_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(GpuError::AllocationFailed(e.to_string()));
            }
        };

        let (memory, offset) = unsafe { (allocation.memory(), allocation.offset()) };
        let mut gpu_image = GpuImage {
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            format: desc.format,
            extent: desc.extent,
        };

        if let Err(e) = unsafe { self.device.bind_image_memory(image, memory, offset) } {
            self.free_image(&mut gpu_image)?;
            return Err(e.into());
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(color_subresource_range());

        match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => gpu_image.view = view,
            Err(e) => {
                self.free_image(&mut gpu_image)?;
                return Err(e.into());
            }
        }

        Ok(gpu_image)
    }

    /// Free an image allocation and its view.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if image.view != vk::ImageView::null() {
            unsafe { self.device.destroy_image_view(image.view, None) };
            image.view = vk::ImageView::null();
        }

        if let Some(allocation) = image.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        if image.image != vk::Image::null() {
            unsafe {
                self.device.destroy_image(image.image, None);
            }
        }
        image.image = vk::Image::null();

        Ok(())
    }
}

impl GpuAllocator {
    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        // Dropping gpu_allocator::Allocator calls vkFreeMemory on every block
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Subresource range covering the single color mip and layer of an image.
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    /// `None` for buffers whose memory is not managed by gpu-allocator.
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub location: MemoryLocation,
}

impl GpuBuffer {
    /// A zero-sized buffer with a null handle.
    pub fn empty() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 0,
            location: MemoryLocation::GpuOnly,
        }
    }

    /// Map the buffer memory for CPU access.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr().cast::<u8>())
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(
                "Data range too large for buffer".to_string(),
            ));
        }
        Ok(())
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        self.check_range(offset, data.len() as u64)?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Read raw bytes from the buffer at the given offset (must be host-visible).
    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        self.check_range(offset, len)?;

        let mut out = vec![0u8; len as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }

        Ok(out)
    }
}

/// A GPU image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// A buffer that is released when dropped.
pub struct DeviceBuffer {
    device: Arc<dyn GpuDevice>,
    buffer: GpuBuffer,
}

impl DeviceBuffer {
    /// Allocate a buffer owned by the returned guard.
    pub fn new(device: Arc<dyn GpuDevice>, desc: &BufferDesc<'_>) -> Result<Self> {
        let buffer = device.create_buffer(desc)?;
        Ok(Self { device, buffer })
    }

    /// A zero-sized buffer that owns nothing.
    pub fn empty(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            buffer: GpuBuffer::empty(),
        }
    }

    /// Raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    /// Read the contents back through the owning device.
    pub fn read(&self) -> Result<Vec<u8>> {
        if self.buffer.size == 0 {
            return Ok(Vec::new());
        }
        self.device.read_buffer(&self.buffer, 0, self.buffer.size)
    }
}

impl Deref for DeviceBuffer {
    type Target = GpuBuffer;

    fn deref(&self) -> &GpuBuffer {
        &self.buffer
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.buffer.buffer == vk::Buffer::null() {
            return;
        }
        if let Err(e) = self.device.free_buffer(&mut self.buffer) {
            tracing::error!("Failed to free buffer: {e}");
        }
    }
}

/// An image that is released when dropped.
pub struct DeviceImage {
    device: Arc<dyn GpuDevice>,
    image: GpuImage,
}

impl DeviceImage {
    /// Allocate an image owned by the returned guard.
    pub fn new(device: Arc<dyn GpuDevice>, desc: &ImageDesc<'_>) -> Result<Self> {
        let image = device.create_image(desc)?;
        Ok(Self { device, image })
    }

    /// Raw image handle.
    pub fn handle(&self) -> vk::Image {
        self.image.image
    }

    /// Color view over the whole image.
    pub fn view(&self) -> vk::ImageView {
        self.image.view
    }
}

impl Deref for DeviceImage {
    type Target = GpuImage;

    fn deref(&self) -> &GpuImage {
        &self.image
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        if let Err(e) = self.device.free_image(&mut self.image) {
            tracing::error!("Failed to free image: {e}");
        }
    }
}
