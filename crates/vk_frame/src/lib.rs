//! # vk_frame
//!
//! Explicit building blocks for assembling Vulkan frames: images that track
//! their own layout, device-local buffers fed through staging memory, a
//! double-buffered producer/consumer pair, multi-queue submission with
//! semaphores, and GPU timestamp timers.
//!
//! Nothing here inserts barriers or waits on the caller's behalf. The frame
//! loop decides the dependency graph; each primitive only guarantees its own
//! correctness.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vk_frame::prelude::*;
//!
//! fn main() -> Result<(), VulkanError> {
//!     let context = DeviceContext::headless(&ContextConfig::default())?;
//!     let queues = QueueCoordinator::new(&context)?;
//!     let mut particles = SwapBuffer::staged(&context, 1024, 64)?;
//!
//!     let data = [0u8; 1024];
//!     queues.one_shot(QueueRole::Transfer, |cmd| {
//!         particles.write_buffer_mut().write(cmd, &data, 0)
//!     })??;
//!     particles.swap();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)]

pub mod clock;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod image;
pub mod logging;
pub mod present;
pub mod queue;
pub mod resource;
pub mod staged_buffer;
pub mod swap_buffer;
pub mod sync;
pub mod timer;

#[cfg(test)]
mod testing;

pub use error::{VulkanError, VulkanResult};

/// Common imports for frame assembly
pub mod prelude {
    pub use crate::{
        clock::{CpuStopwatch, FrameClock},
        command::{CommandBuffer, CommandPool, RecordingState},
        config::{Config, ConfigError, ContextConfig},
        context::DeviceContext,
        error::{VulkanError, VulkanResult},
        image::{ImageResource, LayoutTracker, LayoutTransition, CLEAR_LAYOUT},
        present::Presenter,
        queue::{QueueCoordinator, QueueFamilies, QueueRole, QueueRoles},
        staged_buffer::StagedBuffer,
        swap_buffer::SwapBuffer,
        sync::{Fence, Semaphore},
        timer::{FrameTimer, TimerMisuse, TimerState},
    };
    pub use ash::vk;
}
