//! Instance creation and physical device selection.
//!
//! A device qualifies when it reports Vulkan 1.3, has a graphics queue family
//! and exposes `VK_KHR_swapchain`. Frames are submitted and presented on that
//! one graphics queue.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Device extensions enabled on the logical device.
pub const DEVICE_EXTENSIONS: [&CStr; 1] = [ash::khr::swapchain::NAME];

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions a caller needs to create a presentable surface.
fn surface_extensions() -> Vec<&'static CStr> {
    let mut extensions = vec![ash::khr::surface::NAME];
    #[cfg(target_os = "windows")]
    extensions.push(ash::khr::win32_surface::NAME);
    #[cfg(target_os = "linux")]
    extensions.extend([ash::khr::xlib_surface::NAME, ash::khr::wayland_surface::NAME]);
    #[cfg(target_os = "macos")]
    extensions.extend([
        ash::ext::metal_surface::NAME,
        ash::khr::portability_enumeration::NAME,
    ]);
    extensions
}

/// Create a Vulkan 1.3 instance.
///
/// The validation layer is enabled only when requested and installed; a
/// missing layer is logged and skipped.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .engine_name(c"inflight")
        .api_version(vk::API_VERSION_1_3);

    let mut layers = Vec::new();
    if enable_validation {
        let available = unsafe { entry.enumerate_instance_layer_properties()? };
        if available
            .iter()
            .any(|props| props.layer_name_as_c_str() == Ok(VALIDATION_LAYER))
        {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!("{VALIDATION_LAYER:?} requested but not installed");
        }
    }

    let extensions: Vec<*const i8> = surface_extensions().iter().map(|e| e.as_ptr()).collect();

    #[cfg(target_os = "macos")]
    let flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers)
        .flags(flags);

    Ok(unsafe { entry.create_instance(&create_info, None)? })
}

/// What selection needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub api_version: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub device_local_bytes: u64,
    /// First queue family with graphics support.
    pub graphics_queue_family: Option<u32>,
    pub supports_swapchain: bool,
}

impl DeviceCandidate {
    /// Query a physical device.
    ///
    /// # Safety
    /// The device must have been enumerated from `instance`.
    pub unsafe fn query(instance: &ash::Instance, handle: vk::PhysicalDevice) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let memory = unsafe { instance.get_physical_device_memory_properties(handle) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(handle) };
        let extensions = unsafe { instance.enumerate_device_extension_properties(handle)? };

        let device_local_bytes = memory
            .memory_heaps_as_slice()
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();

        let supports_swapchain = DEVICE_EXTENSIONS.iter().all(|&required| {
            extensions
                .iter()
                .any(|ext| ext.extension_name_as_c_str() == Ok(required))
        });

        Ok(Self {
            handle,
            name: properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            api_version: properties.api_version,
            device_type: properties.device_type,
            device_local_bytes,
            graphics_queue_family: families
                .iter()
                .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|index| index as u32),
            supports_swapchain,
        })
    }

    /// Why this device cannot be used, if it cannot.
    pub fn rejection(&self) -> Option<&'static str> {
        let (major, minor) = (
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
        );
        if (major, minor) < (1, 3) {
            Some("Vulkan 1.3 not supported")
        } else if self.graphics_queue_family.is_none() {
            Some("no graphics queue family")
        } else if !self.supports_swapchain {
            Some("VK_KHR_swapchain not supported")
        } else {
            None
        }
    }

    /// Preference among usable devices: device type first, then one point per
    /// GiB of device-local memory. `None` for unusable devices.
    pub fn score(&self) -> Option<u64> {
        if self.rejection().is_some() {
            return None;
        }
        let type_score = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 1,
        };
        Some(type_score + self.device_local_bytes / (1 << 30))
    }
}

/// Pick the highest-scoring usable device.
pub fn pick_best(candidates: Vec<DeviceCandidate>) -> Result<DeviceCandidate> {
    candidates
        .into_iter()
        .filter(|candidate| match candidate.rejection() {
            Some(reason) => {
                tracing::debug!("Skipping GPU {}: {reason}", candidate.name);
                false
            }
            None => true,
        })
        .max_by_key(|candidate| candidate.score())
        .ok_or(GpuError::NoSuitableDevice)
}

/// Enumerate physical devices and pick the best usable one.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<DeviceCandidate> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    let candidates = devices
        .into_iter()
        .map(|device| unsafe { DeviceCandidate::query(instance, device) })
        .collect::<Result<Vec<_>>>()?;
    pick_best(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn candidate(raw: u64, device_type: vk::PhysicalDeviceType, gib: u64) -> DeviceCandidate {
        DeviceCandidate {
            handle: vk::PhysicalDevice::from_raw(raw),
            name: format!("gpu{raw}"),
            api_version: vk::API_VERSION_1_3,
            device_type,
            device_local_bytes: gib << 30,
            graphics_queue_family: Some(0),
            supports_swapchain: true,
        }
    }

    #[test]
    fn discrete_beats_integrated_with_more_memory() {
        let picked = pick_best(vec![
            candidate(1, vk::PhysicalDeviceType::INTEGRATED_GPU, 32),
            candidate(2, vk::PhysicalDeviceType::DISCRETE_GPU, 8),
        ])
        .unwrap();
        assert_eq!(picked.handle.as_raw(), 2);
    }

    #[test]
    fn memory_breaks_ties_between_same_type() {
        let small = candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU, 4);
        let large = candidate(2, vk::PhysicalDeviceType::DISCRETE_GPU, 16);
        assert_eq!(small.score(), Some(1004));
        assert_eq!(pick_best(vec![small, large]).unwrap().handle.as_raw(), 2);
    }

    #[test]
    fn devices_missing_requirements_are_skipped() {
        let mut old = candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU, 24);
        old.api_version = vk::API_VERSION_1_2;
        let mut compute_only = candidate(2, vk::PhysicalDeviceType::DISCRETE_GPU, 24);
        compute_only.graphics_queue_family = None;
        let mut headless = candidate(3, vk::PhysicalDeviceType::DISCRETE_GPU, 24);
        headless.supports_swapchain = false;

        assert_eq!(old.rejection(), Some("Vulkan 1.3 not supported"));
        assert_eq!(compute_only.score(), None);

        let usable = candidate(4, vk::PhysicalDeviceType::CPU, 0);
        let picked = pick_best(vec![old.clone(), compute_only.clone(), headless.clone(), usable]);
        assert_eq!(picked.unwrap().handle.as_raw(), 4);

        assert!(matches!(
            pick_best(vec![old, compute_only, headless]),
            Err(GpuError::NoSuitableDevice)
        ));
    }

    #[test]
    fn empty_device_list_has_no_pick() {
        assert!(matches!(pick_best(Vec::new()), Err(GpuError::NoSuitableDevice)));
    }
}
