//! Command buffer management
//!
//! One [`CommandPool`] exists per distinct queue family. A [`CommandBuffer`]
//! remembers the family its pool belongs to, so submission can check that it
//! goes to a queue of the same family.

use std::sync::Arc;

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{VulkanError, VulkanResult};

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    context: DeviceContext,
    command_pool: vk::CommandPool,
    family_index: u32,
}

impl CommandPool {
    /// Create a new command pool whose buffers can be reset individually
    pub fn new(context: &DeviceContext, family_index: u32) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family_index);

        let command_pool = unsafe {
            context
                .device()
                .create_command_pool(&pool_create_info, None)
                .map_err(VulkanError::Api)?
        };
        log::debug!("Command pool created for queue family {}", family_index);

        Ok(Self {
            context: context.clone(),
            command_pool,
            family_index,
        })
    }

    /// Allocate one primary command buffer from this pool
    pub fn allocate(self: &Arc<Self>) -> VulkanResult<CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe {
            self.context
                .device()
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        };
        let handle = buffers
            .first()
            .copied()
            .ok_or(VulkanError::Api(vk::Result::ERROR_OUT_OF_HOST_MEMORY))?;

        Ok(CommandBuffer {
            pool: Arc::clone(self),
            handle,
            state: RecordingState::Initial,
        })
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Queue family this pool allocates for
    pub fn family_index(&self) -> u32 {
        self.family_index
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            // Buffers from this pool may still be executing
            if let Err(e) = self.context.device().device_wait_idle() {
                log::warn!("device_wait_idle failed before destroying command pool: {:?}", e);
            }
            self.context.device().destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Lifecycle of a command buffer as far as the host can observe it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    /// Allocated or reset, nothing recorded
    Initial,
    /// Between `begin` and `end`
    Recording,
    /// Ended and ready to submit
    Executable,
}

/// Primary command buffer tied to the pool it came from
pub struct CommandBuffer {
    pool: Arc<CommandPool>,
    handle: vk::CommandBuffer,
    state: RecordingState,
}

impl CommandBuffer {
    /// Begin recording for a single submission
    pub fn begin(&mut self) -> VulkanResult<()> {
        self.begin_with(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    }

    /// Begin recording for a buffer that will be submitted more than once
    pub fn begin_reusable(&mut self) -> VulkanResult<()> {
        self.begin_with(vk::CommandBufferUsageFlags::empty())
    }

    fn begin_with(&mut self, flags: vk::CommandBufferUsageFlags) -> VulkanResult<()> {
        if self.state == RecordingState::Recording {
            return Err(VulkanError::InvalidOperation {
                reason: "Command buffer already recording".to_string(),
            });
        }

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe {
            self.pool
                .context
                .device()
                .begin_command_buffer(self.handle, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        self.state = RecordingState::Recording;
        Ok(())
    }

    /// End command recording
    pub fn end(&mut self) -> VulkanResult<()> {
        if self.state != RecordingState::Recording {
            return Err(VulkanError::InvalidOperation {
                reason: "Command buffer not recording".to_string(),
            });
        }

        unsafe {
            self.pool
                .context
                .device()
                .end_command_buffer(self.handle)
                .map_err(VulkanError::Api)?;
        }

        self.state = RecordingState::Executable;
        Ok(())
    }

    /// Return the buffer to the initial state
    pub fn reset(&mut self) -> VulkanResult<()> {
        unsafe {
            self.pool
                .context
                .device()
                .reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
        }
        self.state = RecordingState::Initial;
        Ok(())
    }

    /// Global memory barrier between two pipeline scopes
    pub fn memory_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        self.assert_recording();
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();

        unsafe {
            self.pool.context.device().cmd_pipeline_barrier(
                self.handle,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    pub(crate) fn assert_recording(&self) {
        assert!(
            self.state == RecordingState::Recording,
            "command buffer must be recording, state is {:?}",
            self.state
        );
    }

    /// Current recording state
    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Whether `begin` has been called without a matching `end`
    pub fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }

    /// Queue family this buffer may be submitted to
    pub fn family_index(&self) -> u32 {
        self.pool.family_index
    }

    /// Get the command buffer handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        unsafe {
            self.pool
                .context
                .device()
                .free_command_buffers(self.pool.command_pool, &[self.handle]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_recording_state_machine() {
        let Some(context) = testing::headless() else { return };
        let family = context.queue_families().index_of(crate::queue::QueueRole::Graphics);
        let pool = Arc::new(CommandPool::new(&context, family).unwrap());
        let mut cmd = pool.allocate().unwrap();

        assert_eq!(cmd.state(), RecordingState::Initial);
        assert!(cmd.end().is_err());

        cmd.begin().unwrap();
        assert!(cmd.is_recording());
        assert!(cmd.begin().is_err());

        cmd.end().unwrap();
        assert_eq!(cmd.state(), RecordingState::Executable);
        assert_eq!(cmd.family_index(), family);

        cmd.reset().unwrap();
        assert_eq!(cmd.state(), RecordingState::Initial);
    }
}
