//! Headless frame loop
//!
//! Drives the frame core without a window: a transfer-queue producer fills
//! the write side of a swap buffer each frame, and a graphics-queue consumer
//! waits on it, copies the read side into a scratch buffer and moves two
//! offscreen images through clear, copy and a final layout. The consumer's
//! work is timed on the graphics queue. The loop stalls on `wait_idle` at
//! the end of every frame.
//!
//! Usage: `headless_demo [config.toml|config.ron]`

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vk_frame::prelude::*;

/// Demo settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct DemoConfig {
    frames: u32,
    element_count: u64,
    stride: u64,
    image_width: u32,
    image_height: u32,
    context: ContextConfig,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frames: 8,
            element_count: 16,
            stride: 64,
            image_width: 256,
            image_height: 256,
            context: ContextConfig::new("headless_demo"),
        }
    }
}

impl Config for DemoConfig {}

impl DemoConfig {
    fn validate(&self) -> Result<(), String> {
        if self.frames == 0 {
            return Err("frames must be at least 1".to_string());
        }
        if self.element_count == 0 || self.stride == 0 {
            return Err("element_count and stride must be non-zero".to_string());
        }
        if self.image_width == 0 || self.image_height == 0 {
            return Err("image extent must be non-zero".to_string());
        }
        self.context.validate()
    }

    fn buffer_size(&self) -> u64 {
        self.element_count * self.stride
    }

    fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.image_width,
            height: self.image_height,
        }
    }
}

#[derive(Error, Debug)]
enum DemoError {
    #[error(transparent)]
    Vulkan(#[from] VulkanError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Frame {frame}: consumer saw byte {found:#04x}, expected {expected:#04x}")]
    Mismatch { frame: u32, found: u8, expected: u8 },
}

/// Byte the producer writes during `frame`
fn frame_pattern(frame: u32) -> u8 {
    (frame % 251) as u8 + 1
}

/// Byte the consumer should see during `frame`: last frame's pattern, or the
/// zeroed initial contents on the first frame
fn expected_read(frame: u32) -> u8 {
    if frame == 0 {
        0
    } else {
        frame_pattern(frame - 1)
    }
}

/// Waits for the device to go idle when dropped, so command buffers and
/// semaphores declared before it are never destroyed while pending
struct IdleOnDrop<'a>(&'a DeviceContext);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.wait_idle() {
            log::warn!("Device wait idle failed during teardown: {}", e);
        }
    }
}

fn run(config: &DemoConfig) -> Result<(), DemoError> {
    config.validate().map_err(DemoError::InvalidConfig)?;

    let context = DeviceContext::headless(&config.context)?;
    let queues = QueueCoordinator::new(&context)?;
    let size = config.buffer_size();
    let extent = config.extent();
    let format = vk::Format::R8G8B8A8_UNORM;

    let mut pair = SwapBuffer::staged(&context, size, config.stride)?;
    let mut scratch = StagedBuffer::new(&context, size, config.stride)?;
    let mut render_target = ImageResource::new(&context, extent, format)?;
    let mut resolved = ImageResource::new(&context, extent, format)?;
    let final_layout = if context.swapchain_enabled() {
        vk::ImageLayout::PRESENT_SRC_KHR
    } else {
        vk::ImageLayout::GENERAL
    };

    // Zero both sides so the first frame's read is well defined
    let zeros = vec![0u8; size as usize];
    for _ in 0..vk_frame::swap_buffer::BUFFER_COUNT {
        queues.one_shot(QueueRole::Transfer, |cmd| pair.write_buffer_mut().write(cmd, &zeros, 0))??;
        pair.swap();
    }

    let mut timer = match FrameTimer::new(&context, queues.family_index(QueueRole::Graphics)) {
        Ok(timer) => Some(timer),
        Err(VulkanError::TimestampsUnsupported { family }) => {
            log::info!("Queue family {} has no timestamps, GPU timing disabled", family);
            None
        }
        Err(e) => return Err(e.into()),
    };

    let produced = Semaphore::new(&context)?;
    let mut producer_cmd = queues.allocate_command_buffer(QueueRole::Transfer)?;
    let mut consumer_cmd = queues.allocate_command_buffer(QueueRole::Graphics)?;
    let mut clock = FrameClock::new();
    let mut record_time = CpuStopwatch::new();
    let _idle = IdleOnDrop(&context);

    for frame in 0..config.frames {
        let delta = clock.tick();
        record_time.reset();
        record_time.start();

        // Producer: fill the write side on the transfer queue
        let pattern = vec![frame_pattern(frame); size as usize];
        producer_cmd.begin()?;
        pair.write_buffer_mut().write(&mut producer_cmd, &pattern, 0)?;
        producer_cmd.end()?;
        queues.submit(
            QueueRole::Transfer,
            &[&producer_cmd],
            &[&produced],
            &[],
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        )?;

        // Consumer: read the other side on the graphics queue
        consumer_cmd.begin()?;
        if let Some(timer) = timer.as_mut() {
            if timer.state() == TimerState::Stopped {
                timer.reset(&mut consumer_cmd);
            }
            timer.start(&mut consumer_cmd);
        }
        scratch.copy_from(&mut consumer_cmd, pair.read_buffer());
        consumer_cmd.memory_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        );
        scratch.download(&mut consumer_cmd);

        render_target.transition(&mut consumer_cmd, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let shade = f32::from(frame_pattern(frame)) / 255.0;
        render_target.clear(&mut consumer_cmd, [shade, 0.2, 1.0 - shade, 1.0]);
        resolved.copy_from(&mut consumer_cmd, &mut render_target);
        resolved.transition(&mut consumer_cmd, final_layout);
        if let Some(timer) = timer.as_mut() {
            timer.stop(&mut consumer_cmd);
        }
        consumer_cmd.end()?;
        queues.submit(
            QueueRole::Graphics,
            &[&consumer_cmd],
            &[],
            &[&produced],
            vk::PipelineStageFlags::TRANSFER,
        )?;

        pair.swap();
        record_time.stop();

        context.wait_idle()?;

        let seen = scratch.read(0, 1)?;
        let found = seen.first().copied().unwrap_or_default();
        if found != expected_read(frame) {
            return Err(DemoError::Mismatch {
                frame,
                found,
                expected: expected_read(frame),
            });
        }

        let gpu_ms = match timer.as_ref() {
            Some(timer) => timer.elapsed_seconds()? * 1000.0,
            None => 0.0,
        };
        log::info!(
            "frame {:>3}: dt {:>7.3} ms, record {:>7.3} ms, consume {:>7.4} ms GPU, read {:#04x}",
            frame,
            delta * 1000.0,
            record_time.elapsed_millis(),
            gpu_ms,
            found
        );
    }

    log::info!(
        "{} frames, average {:.1} fps, final image layout {:?}",
        clock.frame_count(),
        clock.average_fps(),
        resolved.layout()
    );
    Ok(())
}

fn load_config() -> Result<DemoConfig, DemoError> {
    match std::env::args().nth(1) {
        Some(path) => {
            log::info!("Loading configuration from {}", path);
            Ok(DemoConfig::load_from_file(&path)?)
        }
        None => Ok(DemoConfig::default()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC occurred: {:?}", panic_info);

        if let Some(location) = panic_info.location() {
            eprintln!("Panic location: {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = load_config()?;

    log::info!("Starting headless demo: {:?}", config);
    match run(&config) {
        Ok(()) => {
            log::info!("Headless demo finished successfully");
            Ok(())
        }
        Err(e) => {
            log::error!("Headless demo failed: {}", e);
            Err(e.into())
        }
    }
}
