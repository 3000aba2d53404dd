// Audio clock - Shared sample clock driving every scheduled ramp

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared audio clock
///
/// The clock counts rendered frames. Every automation timeline and envelope
/// completion reads its time from here, so a suspended context freezes them
/// together.
#[derive(Clone, Debug)]
pub struct AudioClock {
    /// Current frame position (incremented by the render path)
    frame_position: Arc<AtomicU64>,
    sample_rate: f64,
}

impl AudioClock {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            frame_position: Arc::new(AtomicU64::new(0)),
            sample_rate: sample_rate as f64,
        }
    }

    /// Current frame position
    pub fn current_frame(&self) -> u64 {
        self.frame_position.load(Ordering::Relaxed)
    }

    /// Current time in seconds
    pub fn now(&self) -> f64 {
        self.current_frame() as f64 / self.sample_rate
    }

    /// Advance the clock (called from the render path)
    pub fn advance(&self, frames: usize) {
        self.frame_position
            .fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate).round() as u64
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate as f32
    }
}
