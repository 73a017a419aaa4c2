//! Presentation helpers
//!
//! The window layer creates and owns the swapchain. [`Presenter`] borrows it
//! to acquire images and to wrap them as [`ImageResource`]s; presenting goes
//! through [`QueueCoordinator::present`](crate::queue::QueueCoordinator::present).

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::vk;

use crate::context::DeviceContext;
use crate::error::{VulkanError, VulkanResult};
use crate::image::ImageResource;
use crate::sync::Semaphore;

/// Non-owning view of an externally created swapchain
pub struct Presenter {
    context: DeviceContext,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
}

impl Presenter {
    /// Borrow `swapchain`; the context must have been created with a surface
    pub fn new(context: &DeviceContext, swapchain: vk::SwapchainKHR) -> VulkanResult<Self> {
        if !context.swapchain_enabled() {
            return Err(VulkanError::InvalidOperation {
                reason: "device was created without VK_KHR_swapchain".to_string(),
            });
        }
        Ok(Self {
            context: context.clone(),
            loader: SwapchainLoader::new(context.instance(), context.device()),
            swapchain,
        })
    }

    /// Block until a presentable image is available; `signal` fires when the
    /// image may be written. Returns the image index and whether the swapchain
    /// is suboptimal.
    pub fn acquire_next_image(&self, signal: &Semaphore) -> VulkanResult<(u32, bool)> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, signal.handle(), vk::Fence::null())
        };
        match result {
            Ok(acquired) => Ok(acquired),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date during acquire");
                Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR))
            }
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    /// Wrap every swapchain image, each starting in UNDEFINED layout
    pub fn wrap_images(&self, format: vk::Format, extent: vk::Extent2D) -> VulkanResult<Vec<ImageResource>> {
        let images = unsafe {
            self.loader
                .get_swapchain_images(self.swapchain)
                .map_err(VulkanError::Api)?
        };
        images
            .into_iter()
            .map(|image| ImageResource::from_external(&self.context, image, format, extent))
            .collect()
    }

    /// Swapchain handle
    pub fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Extension loader used for acquire and present
    pub fn loader(&self) -> &SwapchainLoader {
        &self.loader
    }
}
