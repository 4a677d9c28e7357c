//! Frame timing statistics.

use std::time::{Duration, Instant};

/// Measures frame deltas and reports an averaged frame rate.
///
/// Frames are accumulated into a reporting window. Once the window has
/// elapsed, [`tick`](Self::tick) returns the average frame rate over it and
/// starts a new one.
#[derive(Debug)]
pub struct FrameStats {
    start: Instant,
    last_tick: Instant,
    window_start: Instant,
    window: Duration,
    frames_in_window: u32,
    total_frames: u64,
    last_fps: f32,
}

impl FrameStats {
    /// Create frame statistics that report once per `window`.
    pub fn new(window: Duration) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            window_start: now,
            window,
            frames_in_window: 0,
            total_frames: 0,
            last_fps: 0.0,
        }
    }

    /// Record one frame.
    ///
    /// Returns the average frame rate when a reporting window closes.
    pub fn tick(&mut self) -> Option<f32> {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> Option<f32> {
        self.last_tick = now;
        self.frames_in_window += 1;
        self.total_frames += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }

        self.last_fps = self.frames_in_window as f32 / elapsed.as_secs_f32();
        self.frames_in_window = 0;
        self.window_start = now;
        Some(self.last_fps)
    }

    /// Seconds since these statistics were created.
    pub fn elapsed_secs(&self) -> f32 {
        self.last_tick.saturating_duration_since(self.start).as_secs_f32()
    }

    /// Frame rate reported by the last closed window.
    pub fn fps(&self) -> f32 {
        self.last_fps
    }

    /// Number of frames recorded since creation.
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_report_inside_window() {
        let mut stats = FrameStats::new(Duration::from_secs(1));
        let base = stats.window_start;

        assert!(stats.tick_at(base + Duration::from_millis(100)).is_none());
        assert!(stats.tick_at(base + Duration::from_millis(200)).is_none());
        assert_eq!(stats.total_frames(), 2);
        assert_eq!(stats.fps(), 0.0);
    }

    #[test]
    fn test_report_when_window_closes() {
        let mut stats = FrameStats::new(Duration::from_secs(1));
        let base = stats.window_start;

        for i in 1..=59 {
            assert!(stats.tick_at(base + Duration::from_millis(i * 16)).is_none());
        }
        let fps = stats
            .tick_at(base + Duration::from_secs(1))
            .expect("window should close");

        assert!((fps - 60.0).abs() < 0.01);
        assert_eq!(stats.fps(), fps);
        assert_eq!(stats.total_frames(), 60);
    }

    #[test]
    fn test_window_restarts_after_report() {
        let mut stats = FrameStats::new(Duration::from_millis(500));
        let base = stats.window_start;

        assert!(stats.tick_at(base + Duration::from_millis(500)).is_some());
        assert!(stats.tick_at(base + Duration::from_millis(600)).is_none());
        assert!(stats.tick_at(base + Duration::from_millis(1000)).is_some());
    }
}
