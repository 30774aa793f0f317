//! GPU context management.

use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device, DEVICE_EXTENSIONS};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Vulkan instance, device and graphics queue.
///
/// Implements [`crate::GpuDevice`], so it can be shared as an
/// `Arc<dyn GpuDevice>` with every component in this crate.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) device_name: String,

    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Name reported by the driver for the selected GPU.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "inflight".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let selected = match unsafe { select_physical_device(&instance) } {
            Ok(candidate) => candidate,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let physical_device = selected.handle;
        let device_name = selected.name;
        let Some(graphics_queue_family) = selected.graphics_queue_family else {
            unsafe { instance.destroy_instance(None) };
            return Err(GpuError::NoSuitableDevice);
        };
        tracing::info!(
            "Selected GPU: {device_name} ({:?}, Vulkan {}.{}, graphics family {graphics_queue_family})",
            selected.device_type,
            vk::api_version_major(selected.api_version),
            vk::api_version_minor(selected.api_version)
        );

        let (device, graphics_queue) =
            match unsafe { create_device(&instance, physical_device, graphics_queue_family) } {
                Ok(created) => created,
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            };

        let device = Arc::new(device);

        let allocator =
            match unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) } {
                Ok(allocator) => allocator,
                Err(e) => {
                    unsafe {
                        device.destroy_device(None);
                        instance.destroy_instance(None);
                    }
                    return Err(e);
                }
            };

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            allocator: Mutex::new(allocator),
            device_name,
            graphics_queue_family,
            graphics_queue,
        })
    }
}

/// Create the logical device and retrieve the graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extension_names: Vec<*const i8> = DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

    let features = vk::PhysicalDeviceFeatures::default();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = unsafe {
        instance
            .create_device(physical_device, &device_create_info, None)
            .map_err(GpuError::from)?
    };

    let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

    Ok((device, graphics_queue))
}
