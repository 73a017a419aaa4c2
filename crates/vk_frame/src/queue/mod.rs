//! Queue coordination
//!
//! [`QueueCoordinator`] resolves a family for each [`QueueRole`], fetches one
//! device queue per distinct family and keeps one command pool per distinct
//! family. Submission is the only ordering mechanism across queues: callers
//! thread semaphores between submissions explicitly.

pub mod family;

pub use family::{FamilyPreferences, QueueFamilies, QueueRole, QueueRoles};

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;

use crate::command::{CommandBuffer, CommandPool, RecordingState};
use crate::context::DeviceContext;
use crate::error::{VulkanError, VulkanResult};
use crate::present::Presenter;
use crate::sync::{Fence, Semaphore};

/// Per-role queues and per-family command pools
pub struct QueueCoordinator {
    context: DeviceContext,
    families: QueueFamilies,
    queues: [vk::Queue; 4],
    pools: BTreeMap<u32, Arc<CommandPool>>,
}

impl QueueCoordinator {
    /// Fetch queues and create one command pool per distinct family
    pub fn new(context: &DeviceContext) -> VulkanResult<Self> {
        let families = context.queue_families();

        let mut pools = BTreeMap::new();
        for family in families.distinct() {
            pools.insert(family, Arc::new(CommandPool::new(context, family)?));
        }

        let queues = QueueRole::ALL
            .map(|role| unsafe { context.device().get_device_queue(families.index_of(role), 0) });

        log::info!(
            "Queue coordinator ready: graphics={} compute={} transfer={} present={} ({} pools)",
            families.index_of(QueueRole::Graphics),
            families.index_of(QueueRole::Compute),
            families.index_of(QueueRole::Transfer),
            families.index_of(QueueRole::Present),
            pools.len()
        );

        Ok(Self {
            context: context.clone(),
            families,
            queues,
            pools,
        })
    }

    /// Family index resolved for `role`
    pub fn family_index(&self, role: QueueRole) -> u32 {
        self.families.index_of(role)
    }

    /// Resolved roles
    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    /// Queue handle for `role`
    pub fn queue(&self, role: QueueRole) -> vk::Queue {
        self.queues[role.slot()]
    }

    /// Command pool serving `role`'s family
    pub fn command_pool(&self, role: QueueRole) -> &Arc<CommandPool> {
        let family = self.family_index(role);
        // Every resolved family got a pool in `new`
        &self.pools[&family]
    }

    /// Number of command pools, one per distinct family
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Allocate a primary command buffer for `role`
    pub fn allocate_command_buffer(&self, role: QueueRole) -> VulkanResult<CommandBuffer> {
        self.command_pool(role).allocate()
    }

    /// Enqueue command buffers on `role`'s queue.
    ///
    /// Execution starts only once every `wait` semaphore is signaled (at
    /// `wait_stage`), and every `signal` semaphore is signaled when the
    /// buffers complete. Never blocks the CPU.
    ///
    /// # Panics
    ///
    /// Panics if a buffer is not ended or was allocated for another family.
    pub fn submit(
        &self,
        role: QueueRole,
        command_buffers: &[&CommandBuffer],
        signal: &[&Semaphore],
        wait: &[&Semaphore],
        wait_stage: vk::PipelineStageFlags,
    ) -> VulkanResult<()> {
        self.submit_inner(role, command_buffers, signal, wait, wait_stage, vk::Fence::null())
    }

    /// As [`submit`](Self::submit), additionally signaling `fence`
    pub fn submit_with_fence(
        &self,
        role: QueueRole,
        command_buffers: &[&CommandBuffer],
        signal: &[&Semaphore],
        wait: &[&Semaphore],
        wait_stage: vk::PipelineStageFlags,
        fence: &Fence,
    ) -> VulkanResult<()> {
        self.submit_inner(role, command_buffers, signal, wait, wait_stage, fence.handle())
    }

    fn submit_inner(
        &self,
        role: QueueRole,
        command_buffers: &[&CommandBuffer],
        signal: &[&Semaphore],
        wait: &[&Semaphore],
        wait_stage: vk::PipelineStageFlags,
        fence: vk::Fence,
    ) -> VulkanResult<()> {
        let family = self.family_index(role);
        for cmd in command_buffers {
            assert_submittable(cmd.state(), cmd.family_index(), role, family);
        }

        let buffers: Vec<vk::CommandBuffer> = command_buffers.iter().map(|cmd| cmd.handle()).collect();
        let signal_semaphores: Vec<vk::Semaphore> = signal.iter().map(|s| s.handle()).collect();
        let wait_semaphores: Vec<vk::Semaphore> = wait.iter().map(|s| s.handle()).collect();
        let wait_stages = vec![wait_stage; wait_semaphores.len()];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.context
                .device()
                .queue_submit(self.queue(role), &[submit_info], fence)
                .map_err(VulkanError::Api)
        }
    }

    /// Block until all work on `role`'s queue has completed
    pub fn wait_idle(&self, role: QueueRole) -> VulkanResult<()> {
        unsafe {
            self.context
                .device()
                .queue_wait_idle(self.queue(role))
                .map_err(VulkanError::Api)
        }
    }

    /// Record, submit and wait for a throwaway command buffer
    pub fn one_shot<R, F>(&self, role: QueueRole, record: F) -> VulkanResult<R>
    where
        F: FnOnce(&mut CommandBuffer) -> R,
    {
        let mut cmd = self.allocate_command_buffer(role)?;
        cmd.begin()?;
        let result = record(&mut cmd);
        cmd.end()?;
        self.submit(role, &[&cmd], &[], &[], vk::PipelineStageFlags::BOTTOM_OF_PIPE)?;
        self.wait_idle(role)?;
        Ok(result)
    }

    /// Queue `image_index` for presentation once every `wait` semaphore is
    /// signaled. Returns `true` when the swapchain is suboptimal.
    pub fn present(&self, presenter: &Presenter, image_index: u32, wait: &[&Semaphore]) -> VulkanResult<bool> {
        let wait_semaphores: Vec<vk::Semaphore> = wait.iter().map(|s| s.handle()).collect();
        let swapchains = [presenter.swapchain()];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            presenter
                .loader()
                .queue_present(self.queue(QueueRole::Present), &present_info)
        };
        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date during present");
                Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR))
            }
            Err(e) => Err(VulkanError::Api(e)),
        }
    }
}

fn assert_submittable(state: RecordingState, buffer_family: u32, role: QueueRole, queue_family: u32) {
    assert_eq!(
        state,
        RecordingState::Executable,
        "command buffer must be ended before submission"
    );
    assert_eq!(
        buffer_family, queue_family,
        "command buffer from family {} submitted to {:?} queue of family {}",
        buffer_family, role, queue_family
    );
}
