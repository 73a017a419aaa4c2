//! GPU frame timing with timestamp queries
//!
//! [`FrameTimer`] brackets recorded work with a pair of timestamps. Its
//! lifecycle is Reset, Running, Stopped and back to Reset; calls out of that
//! order are programming errors and panic. [`TimerState`] is the same state
//! machine without any GPU objects.

use std::time::Duration;

use ash::vk;
use thiserror::Error;

use crate::command::CommandBuffer;
use crate::context::DeviceContext;
use crate::error::{VulkanError, VulkanResult};

const START_QUERY: u32 = 0;
const STOP_QUERY: u32 = 1;
const QUERY_COUNT: u32 = 2;

/// Where a [`FrameTimer`] is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Both slots cleared; `start` is next
    Reset,
    /// Start timestamp recorded; `stop` is next
    Running,
    /// Both timestamps recorded; results may be read, `reset` is next
    Stopped,
}

/// An operation was called in the wrong state
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("frame timer cannot {operation} while {state:?}")]
pub struct TimerMisuse {
    /// Operation that was attempted
    pub operation: &'static str,
    /// State the timer was in
    pub state: TimerState,
}

impl TimerState {
    /// Reset to Running
    pub fn start(self) -> Result<Self, TimerMisuse> {
        self.require(Self::Reset, "start", Self::Running)
    }

    /// Running to Stopped
    pub fn stop(self) -> Result<Self, TimerMisuse> {
        self.require(Self::Running, "stop", Self::Stopped)
    }

    /// Stopped to Reset
    pub fn reset(self) -> Result<Self, TimerMisuse> {
        self.require(Self::Stopped, "reset", Self::Reset)
    }

    /// Results are only defined once stopped
    pub fn read(self) -> Result<Self, TimerMisuse> {
        self.require(Self::Stopped, "read", Self::Stopped)
    }

    fn require(self, expected: Self, operation: &'static str, next: Self) -> Result<Self, TimerMisuse> {
        if self == expected {
            Ok(next)
        } else {
            Err(TimerMisuse { operation, state: self })
        }
    }
}

/// Keep only the bits a queue family actually writes
pub fn mask_ticks(ticks: u64, valid_bits: u32) -> u64 {
    if valid_bits >= 64 {
        ticks
    } else {
        ticks & ((1u64 << valid_bits) - 1)
    }
}

/// Convert a tick count into seconds given nanoseconds per tick
pub fn ticks_to_seconds(ticks: u64, period_ns: f32) -> f64 {
    ticks as f64 * f64::from(period_ns) * 1e-9
}

/// Ticks from `start` to `stop`, tolerating one counter wrap
pub fn elapsed_ticks(start: u64, stop: u64, valid_bits: u32) -> u64 {
    mask_ticks(stop.wrapping_sub(start), valid_bits)
}

/// Timestamp bits written by `family_index`, or `None` when the family
/// cannot host a timer.
///
/// Query resets are only legal on graphics or compute families, so
/// transfer-only families are rejected even when they report timestamp bits.
pub fn timer_valid_bits(properties: &[vk::QueueFamilyProperties], family_index: u32) -> Option<u32> {
    let family = properties.get(family_index as usize)?;
    let resettable = family
        .queue_flags
        .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
    (resettable && family.timestamp_valid_bits != 0).then_some(family.timestamp_valid_bits)
}

/// Timestamp pair bracketing GPU work on one queue family
pub struct FrameTimer {
    context: DeviceContext,
    query_pool: vk::QueryPool,
    family_index: u32,
    valid_bits: u32,
    period_ns: f32,
    state: TimerState,
    primed: bool,
}

impl FrameTimer {
    /// Create a timer for command buffers of `family_index`
    ///
    /// Fails with [`VulkanError::TimestampsUnsupported`] when the family
    /// writes no timestamps or supports neither graphics nor compute.
    pub fn new(context: &DeviceContext, family_index: u32) -> VulkanResult<Self> {
        let valid_bits = timer_valid_bits(context.queue_family_properties(), family_index)
            .ok_or(VulkanError::TimestampsUnsupported { family: family_index })?;

        let pool_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(QUERY_COUNT);
        let query_pool = unsafe {
            context
                .device()
                .create_query_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            context: context.clone(),
            query_pool,
            family_index,
            valid_bits,
            period_ns: context.timestamp_period(),
            state: TimerState::Reset,
            primed: false,
        })
    }

    /// Record the start timestamp
    ///
    /// # Panics
    ///
    /// Panics unless the timer is Reset.
    pub fn start(&mut self, cmd: &mut CommandBuffer) {
        self.state = advance(self.state.start());
        self.check_family(cmd);
        if !self.primed {
            self.record_reset(cmd);
            self.primed = true;
        }
        unsafe {
            self.context.device().cmd_write_timestamp(
                cmd.handle(),
                vk::PipelineStageFlags::TOP_OF_PIPE,
                self.query_pool,
                START_QUERY,
            );
        }
    }

    /// Record the stop timestamp
    ///
    /// # Panics
    ///
    /// Panics unless the timer is Running.
    pub fn stop(&mut self, cmd: &mut CommandBuffer) {
        self.state = advance(self.state.stop());
        self.check_family(cmd);
        unsafe {
            self.context.device().cmd_write_timestamp(
                cmd.handle(),
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.query_pool,
                STOP_QUERY,
            );
        }
    }

    /// Record clearing both slots for the next cycle
    ///
    /// # Panics
    ///
    /// Panics unless the timer is Stopped.
    pub fn reset(&mut self, cmd: &mut CommandBuffer) {
        self.state = advance(self.state.reset());
        self.check_family(cmd);
        self.record_reset(cmd);
    }

    /// GPU time between the two timestamps, in seconds.
    ///
    /// Blocks until the submitted timestamps are available.
    pub fn elapsed_seconds(&self) -> VulkanResult<f64> {
        let [start, stop] = self.results()?;
        Ok(ticks_to_seconds(elapsed_ticks(start, stop, self.valid_bits), self.period_ns))
    }

    /// Start timestamp on the device timeline, in seconds
    pub fn begin_seconds(&self) -> VulkanResult<f64> {
        let [start, _] = self.results()?;
        Ok(ticks_to_seconds(start, self.period_ns))
    }

    /// [`elapsed_seconds`](Self::elapsed_seconds) as a `Duration`
    pub fn elapsed(&self) -> VulkanResult<Duration> {
        Ok(Duration::from_secs_f64(self.elapsed_seconds()?))
    }

    /// Current state
    pub fn state(&self) -> TimerState {
        self.state
    }

    /// Queue family whose command buffers this timer records into
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    fn results(&self) -> VulkanResult<[u64; 2]> {
        advance(self.state.read());
        let mut ticks = [0u64; QUERY_COUNT as usize];
        unsafe {
            self.context
                .device()
                .get_query_pool_results(
                    self.query_pool,
                    START_QUERY,
                    QUERY_COUNT,
                    &mut ticks,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
                .map_err(VulkanError::Api)?;
        }
        Ok(ticks.map(|value| mask_ticks(value, self.valid_bits)))
    }

    fn record_reset(&self, cmd: &CommandBuffer) {
        unsafe {
            self.context
                .device()
                .cmd_reset_query_pool(cmd.handle(), self.query_pool, START_QUERY, QUERY_COUNT);
        }
    }

    fn check_family(&self, cmd: &CommandBuffer) {
        cmd.assert_recording();
        assert_eq!(
            cmd.family_index(),
            self.family_index,
            "frame timer for family {} used with a command buffer of family {}",
            self.family_index,
            cmd.family_index()
        );
    }
}

impl Drop for FrameTimer {
    fn drop(&mut self) {
        unsafe {
            self.context.device().destroy_query_pool(self.query_pool, None);
        }
    }
}

fn advance(result: Result<TimerState, TimerMisuse>) -> TimerState {
    result.unwrap_or_else(|misuse| panic!("{}", misuse))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueCoordinator, QueueRole};
    use crate::testing;
    use approx::assert_relative_eq;

    #[test]
    fn test_full_cycle() {
        let state = TimerState::Reset;
        let state = state.start().unwrap();
        assert_eq!(state, TimerState::Running);
        let state = state.stop().unwrap();
        assert_eq!(state.read(), Ok(TimerState::Stopped));
        assert_eq!(state.reset(), Ok(TimerState::Reset));
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let running = TimerState::Reset.start().unwrap();
        assert_eq!(
            running.start(),
            Err(TimerMisuse {
                operation: "start",
                state: TimerState::Running
            })
        );
        assert!(TimerState::Reset.stop().is_err());
        assert!(TimerState::Running.reset().is_err());
        assert!(TimerState::Running.read().is_err());
        assert!(TimerState::Stopped.start().is_err());
    }

    #[test]
    #[should_panic(expected = "cannot start while Running")]
    fn test_double_start_panics() {
        let running = advance(TimerState::Reset.start());
        advance(running.start());
    }

    #[test]
    fn test_tick_conversion() {
        assert_relative_eq!(ticks_to_seconds(1_000_000, 1.0), 0.001, epsilon = 1e-12);
        assert_relative_eq!(ticks_to_seconds(1_000, 52.08), 52.08e-6, epsilon = 1e-9);
        assert_relative_eq!(ticks_to_seconds(0, 83.3), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_masking_and_wrap() {
        assert_eq!(mask_ticks(u64::MAX, 64), u64::MAX);
        assert_eq!(mask_ticks(0x1_0000_0005, 32), 5);
        assert_eq!(elapsed_ticks(10, 25, 64), 15);
        // 36-bit counter wrapping between the two writes
        assert_eq!(elapsed_ticks((1 << 36) - 4, 6, 36), 10);
    }

    fn family(queue_flags: vk::QueueFlags, timestamp_valid_bits: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags,
            queue_count: 1,
            timestamp_valid_bits,
            ..Default::default()
        }
    }

    #[test]
    fn test_timer_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 64),
            family(vk::QueueFlags::TRANSFER, 64),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 36),
            family(vk::QueueFlags::GRAPHICS, 0),
        ];
        assert_eq!(timer_valid_bits(&families, 0), Some(64));
        assert_eq!(timer_valid_bits(&families, 1), None);
        assert_eq!(timer_valid_bits(&families, 2), Some(36));
        assert_eq!(timer_valid_bits(&families, 3), None);
        assert_eq!(timer_valid_bits(&families, 4), None);
    }

    #[test]
    fn test_gpu_transfer_only_family_rejected() {
        let Some(context) = testing::headless() else { return };
        let properties = context.queue_family_properties().to_vec();
        for (index, props) in properties.iter().enumerate() {
            if timer_valid_bits(&properties, index as u32).is_none() {
                assert!(
                    matches!(
                        FrameTimer::new(&context, index as u32),
                        Err(VulkanError::TimestampsUnsupported { .. })
                    ),
                    "family {} with {:?} accepted",
                    index,
                    props.queue_flags
                );
            }
        }
    }

    #[test]
    fn test_gpu_cycles_report_non_negative_time() {
        let Some(context) = testing::headless() else { return };
        let coordinator = QueueCoordinator::new(&context).unwrap();
        let family = coordinator.family_index(QueueRole::Graphics);
        let mut timer = match FrameTimer::new(&context, family) {
            Ok(timer) => timer,
            Err(VulkanError::TimestampsUnsupported { .. }) => return,
            Err(e) => panic!("{}", e),
        };

        for _ in 0..3 {
            coordinator
                .one_shot(QueueRole::Graphics, |cmd| {
                    timer.start(cmd);
                    timer.stop(cmd);
                })
                .unwrap();
            assert_eq!(timer.state(), TimerState::Stopped);
            let elapsed = timer.elapsed_seconds().unwrap();
            assert!(elapsed >= 0.0);
            assert!(timer.begin_seconds().unwrap() >= 0.0);
            assert_eq!(timer.elapsed().unwrap(), Duration::from_secs_f64(elapsed));

            coordinator.one_shot(QueueRole::Graphics, |cmd| timer.reset(cmd)).unwrap();
            assert_eq!(timer.state(), TimerState::Reset);
        }
    }
}
