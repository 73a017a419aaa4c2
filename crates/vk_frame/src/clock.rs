//! CPU-side frame timing
//!
//! [`FrameClock`] supplies the per-frame delta time the presentation loop
//! feeds to producers. [`CpuStopwatch`] measures host spans such as recording
//! or fence waits, next to the GPU spans a [`FrameTimer`](crate::timer::FrameTimer) reports.

use std::time::{Duration, Instant};

/// Wall-clock delta between successive frames
pub struct FrameClock {
    last_tick: Instant,
    delta_time: f32,
    total_time: f32,
    frame_count: u64,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock {
    /// Create a clock; the first `tick` measures from now
    pub fn new() -> Self {
        Self {
            last_tick: Instant::now(),
            delta_time: 0.0,
            total_time: 0.0,
            frame_count: 0,
        }
    }

    /// Mark the start of a new frame and return its delta time in seconds
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        self.advance(now.duration_since(self.last_tick));
        self.last_tick = now;
        self.delta_time
    }

    fn advance(&mut self, elapsed: Duration) {
        self.delta_time = elapsed.as_secs_f32();
        self.total_time += self.delta_time;
        self.frame_count += 1;
    }

    /// Seconds between the last two ticks
    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    /// Seconds accumulated over all ticks
    pub fn total_time(&self) -> f32 {
        self.total_time
    }

    /// Number of ticks so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Frames per second averaged over the clock's lifetime
    pub fn average_fps(&self) -> f32 {
        if self.total_time > 0.0 {
            self.frame_count as f32 / self.total_time
        } else {
            0.0
        }
    }
}

/// Accumulating stopwatch for host-side spans
#[derive(Default)]
pub struct CpuStopwatch {
    start_time: Option<Instant>,
    elapsed: Duration,
}

impl CpuStopwatch {
    /// Create a stopped stopwatch at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stopwatch that is already running
    pub fn start_new() -> Self {
        let mut stopwatch = Self::new();
        stopwatch.start();
        stopwatch
    }

    /// Start or resume timing
    pub fn start(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    /// Stop timing and keep the accumulated span
    pub fn stop(&mut self) {
        if let Some(start) = self.start_time.take() {
            self.elapsed += start.elapsed();
        }
    }

    /// Stop and clear
    pub fn reset(&mut self) {
        self.start_time = None;
        self.elapsed = Duration::ZERO;
    }

    /// Accumulated time including a running span
    pub fn elapsed(&self) -> Duration {
        self.elapsed + self.start_time.map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// Accumulated time in milliseconds
    pub fn elapsed_millis(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Whether a span is open
    pub fn is_running(&self) -> bool {
        self.start_time.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_clock_accumulates_deltas() {
        let mut clock = FrameClock::new();
        clock.advance(Duration::from_millis(20));
        clock.advance(Duration::from_millis(30));

        assert_eq!(clock.frame_count(), 2);
        assert_relative_eq!(clock.delta_time(), 0.03, epsilon = 1e-6);
        assert_relative_eq!(clock.total_time(), 0.05, epsilon = 1e-6);
        assert_relative_eq!(clock.average_fps(), 40.0, epsilon = 1e-3);
    }

    #[test]
    fn test_tick_is_non_negative() {
        let mut clock = FrameClock::new();
        assert_eq!(clock.average_fps(), 0.0);
        assert!(clock.tick() >= 0.0);
        assert_eq!(clock.frame_count(), 1);
    }

    #[test]
    fn test_stopwatch_accumulates_spans() {
        let mut stopwatch = CpuStopwatch::start_new();
        assert!(stopwatch.is_running());
        std::thread::sleep(Duration::from_millis(2));
        stopwatch.stop();
        let first = stopwatch.elapsed();
        assert!(first >= Duration::from_millis(2));
        assert!(!stopwatch.is_running());

        // Stopped time does not count
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(stopwatch.elapsed(), first);

        stopwatch.start();
        stopwatch.stop();
        assert!(stopwatch.elapsed() >= first);

        stopwatch.reset();
        assert_eq!(stopwatch.elapsed(), Duration::ZERO);
    }
}
