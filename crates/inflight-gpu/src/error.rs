//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Acquiring the next swapchain image failed (stale or suboptimal swapchain).
    #[error("Swapchain image acquire failed: {0}")]
    Acquire(vk::Result),

    /// Presenting a swapchain image failed.
    #[error("Swapchain present failed: {0}")]
    Present(vk::Result),

    /// A fence wait ran out of time. Treated as a GPU hang.
    #[error("Fence wait timed out after {timeout_ns} ns")]
    FenceWaitTimeout { timeout_ns: u64 },

    /// A fixed-capacity descriptor pool cannot satisfy the request.
    #[error("Descriptor pool exhausted: requested {requested}, {remaining} remaining")]
    PoolExhausted { requested: u32, remaining: u32 },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether the error means the swapchain no longer matches the surface.
    ///
    /// Recreation itself is left to the caller.
    pub fn requires_swapchain_recreation(&self) -> bool {
        matches!(
            self,
            Self::Acquire(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR)
                | Self::Present(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR)
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_needs_recreation() {
        assert!(GpuError::Acquire(vk::Result::ERROR_OUT_OF_DATE_KHR).requires_swapchain_recreation());
        assert!(GpuError::Present(vk::Result::SUBOPTIMAL_KHR).requires_swapchain_recreation());
        assert!(!GpuError::Present(vk::Result::ERROR_DEVICE_LOST).requires_swapchain_recreation());
        assert!(!GpuError::FenceWaitTimeout { timeout_ns: 1 }.requires_swapchain_recreation());
    }
}
