// Metrics - Best-effort performance counters
//
// Observability only: nothing in the engine makes control decisions from
// these numbers.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Render-callback load, shared between the audio thread and readers
///
/// Measures one callback out of `measure_every_n` and compares the time spent
/// rendering with the time the rendered frames represent.
#[derive(Clone)]
pub struct CpuMonitor {
    busy_ns: Arc<AtomicU64>,
    available_ns: Arc<AtomicU64>,
    measured: Arc<AtomicU64>,
    callbacks: Arc<AtomicU32>,
    sample_rate: f32,
    measure_every_n: u32,
}

impl CpuMonitor {
    pub fn new(sample_rate: f32, measure_every_n: u32) -> Self {
        Self {
            busy_ns: Arc::new(AtomicU64::new(0)),
            available_ns: Arc::new(AtomicU64::new(0)),
            measured: Arc::new(AtomicU64::new(0)),
            callbacks: Arc::new(AtomicU32::new(0)),
            sample_rate,
            measure_every_n: measure_every_n.max(1),
        }
    }

    /// `Some` when this callback is one of the measured ones
    #[inline]
    pub fn start_measure(&self) -> Option<Instant> {
        let count = self.callbacks.fetch_add(1, Ordering::Relaxed);
        (count % self.measure_every_n == 0).then(Instant::now)
    }

    #[inline]
    pub fn end_measure(&self, started: Option<Instant>, frames: usize) {
        if let Some(start) = started {
            let busy = start.elapsed().as_nanos() as u64;
            let available = (frames as f64 / self.sample_rate as f64 * 1e9) as u64;
            self.busy_ns.fetch_add(busy, Ordering::Relaxed);
            self.available_ns.fetch_add(available, Ordering::Relaxed);
            self.measured.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Percentage of the real-time budget spent rendering (may exceed 100)
    pub fn cpu_percentage(&self) -> f32 {
        let available = self.available_ns.load(Ordering::Relaxed);
        if available == 0 {
            return 0.0;
        }
        (self.busy_ns.load(Ordering::Relaxed) as f64 / available as f64 * 100.0) as f32
    }

    pub fn measured_callbacks(&self) -> u64 {
        self.measured.load(Ordering::Relaxed)
    }

    pub fn load_level(&self) -> CpuLoad {
        CpuLoad::from_percentage(self.cpu_percentage())
    }

    pub fn reset(&self) {
        self.busy_ns.store(0, Ordering::Relaxed);
        self.available_ns.store(0, Ordering::Relaxed);
        self.measured.store(0, Ordering::Relaxed);
        self.callbacks.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CpuLoad {
    Low,
    Medium,
    High,
}

impl CpuLoad {
    pub fn from_percentage(cpu: f32) -> Self {
        if cpu < 50.0 {
            CpuLoad::Low
        } else if cpu < 75.0 {
            CpuLoad::Medium
        } else {
            CpuLoad::High
        }
    }
}

/// Snapshot refreshed by the facade on its metrics interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct PerformanceMetrics {
    /// Approximate output latency in milliseconds
    pub output_latency_ms: f32,
    pub active_notes: usize,
    pub cached_reverbs: usize,
    pub connected_peers: usize,
    /// Rough heap estimate of live notes and impulse responses
    pub memory_estimate_bytes: usize,
    pub cpu_percent: f32,
    /// Context time of the snapshot, seconds
    pub measured_at: f64,
}

/// Rough per-note footprint used by the memory estimate
pub const NOTE_FOOTPRINT_BYTES: usize = 4 * 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_monitor_starts_empty() {
        let monitor = CpuMonitor::new(48000.0, 10);
        assert_eq!(monitor.cpu_percentage(), 0.0);
        assert_eq!(monitor.measured_callbacks(), 0);
        assert_eq!(monitor.load_level(), CpuLoad::Low);
    }

    #[test]
    fn test_measures_one_in_n() {
        let monitor = CpuMonitor::new(48000.0, 10);
        let measured = (0..100).filter(|_| monitor.start_measure().is_some()).count();
        assert_eq!(measured, 10);
    }

    #[test]
    fn test_percentage_and_reset() {
        let monitor = CpuMonitor::new(48000.0, 1);
        for _ in 0..5 {
            let start = monitor.start_measure();
            thread::sleep(Duration::from_micros(100));
            // 4800 frames = 100 ms of budget
            monitor.end_measure(start, 4800);
        }
        let cpu = monitor.cpu_percentage();
        assert!(cpu > 0.0 && cpu < 100.0, "{}", cpu);
        assert_eq!(monitor.measured_callbacks(), 5);

        monitor.reset();
        assert_eq!(monitor.cpu_percentage(), 0.0);
    }

    #[test]
    fn test_load_levels() {
        assert_eq!(CpuLoad::from_percentage(10.0), CpuLoad::Low);
        assert_eq!(CpuLoad::from_percentage(60.0), CpuLoad::Medium);
        assert_eq!(CpuLoad::from_percentage(90.0), CpuLoad::High);
    }
}
