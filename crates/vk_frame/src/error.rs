//! Error types shared by every Vulkan-facing module
//!
//! External API failures are returned as [`VulkanError`]. Contract violations
//! (self-copy, size mismatch, out-of-range writes, timer misuse, submitting a
//! command buffer to a queue of another family) are programming errors and
//! panic at the call site instead.

use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No memory type satisfies both the resource and the requested properties
    #[error("No suitable memory type found for {required:?}")]
    NoSuitableMemoryType {
        /// Property flags that were requested
        required: vk::MemoryPropertyFlags,
    },

    /// The queue family writes no timestamps or cannot reset query pools
    #[error("Queue family {family} cannot host timestamp queries")]
    TimestampsUnsupported {
        /// Queue family index that was asked for timestamps
        family: u32,
    },
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;
