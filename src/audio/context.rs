// Audio context - The one processing context shared by every note
//
// Explicitly constructed and handed around as Arc<AudioContext>. Holds the
// sample clock, the run state and the mix graph. Two backends:
// - Device: a cpal stream renders the graph and advances the clock
// - Offline: the host calls render() and the clock advances with it
//
// Platforms keep audio suspended until a user gesture; with
// `require_gesture` the context starts Suspended and the first
// notify_gesture() resumes it.
//
// The sample clock stands still while the context is not running. uptime()
// adds the wall time spent paused, so housekeeping keyed on it (idle sweep,
// note lifetime ceiling) keeps moving under suspension.

use super::AudioError;
use super::bus::MixGraph;
use super::clock::AudioClock;
use super::metrics::CpuMonitor;
use super::output::{OutputStream, RenderTarget};
use crate::config::{AudioBackend, AudioConfig, LatencyPreference};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Suspended = 0,
    Running = 1,
    Closed = 2,
}

impl From<u8> for ContextState {
    fn from(value: u8) -> Self {
        match value {
            0 => ContextState::Suspended,
            1 => ContextState::Running,
            _ => ContextState::Closed,
        }
    }
}

/// Wall time accumulated while not running
#[derive(Debug, Default)]
struct PauseLedger {
    total: Duration,
    since: Option<Instant>,
}

impl PauseLedger {
    fn paused_at(now: Instant) -> Self {
        Self {
            total: Duration::ZERO,
            since: Some(now),
        }
    }

    fn pause(&mut self, now: Instant) {
        if self.since.is_none() {
            self.since = Some(now);
        }
    }

    fn unpause(&mut self, now: Instant) {
        if let Some(since) = self.since.take() {
            self.total += now.saturating_duration_since(since);
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.total + self.since.map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }
}

enum Backend {
    Device(Mutex<OutputStream>),
    Offline,
}

pub struct AudioContext {
    sample_rate: f32,
    clock: AudioClock,
    state: AtomicU8,
    running: Arc<AtomicBool>,
    gesture_seen: AtomicBool,
    paused: Mutex<PauseLedger>,
    graph: Arc<Mutex<MixGraph>>,
    monitor: CpuMonitor,
    backend: Backend,
    buffer_frames: u32,
}

impl AudioContext {
    /// Create a context for `config`, opening the output device if asked to
    pub fn new(config: &AudioConfig, latency: LatencyPreference) -> Result<Arc<Self>, AudioError> {
        let initial = if config.require_gesture {
            ContextState::Suspended
        } else {
            ContextState::Running
        };

        match config.backend {
            AudioBackend::Offline => Ok(Arc::new(Self::offline_with_state(
                config.sample_rate as f32,
                config.render_quantum,
                initial,
            ))),
            AudioBackend::Device => {
                let running = Arc::new(AtomicBool::new(initial == ContextState::Running));
                let quantum = config.render_quantum;
                let running_for_target = Arc::clone(&running);
                let (stream, target) = OutputStream::open(latency, move |sample_rate| RenderTarget {
                    graph: Arc::new(Mutex::new(MixGraph::new(sample_rate, quantum))),
                    clock: AudioClock::new(sample_rate),
                    running: running_for_target,
                    monitor: CpuMonitor::new(sample_rate, 10),
                })?;
                let info = stream.info();

                let context = Self {
                    sample_rate: info.sample_rate,
                    clock: target.clock,
                    state: AtomicU8::new(initial as u8),
                    running,
                    gesture_seen: AtomicBool::new(false),
                    paused: Mutex::new(Self::ledger_for(initial)),
                    graph: target.graph,
                    monitor: target.monitor,
                    backend: Backend::Device(Mutex::new(stream)),
                    buffer_frames: info.buffer_frames,
                };
                if initial == ContextState::Suspended {
                    context.with_stream(OutputStream::pause);
                }
                tracing::info!(sample_rate = context.sample_rate, state = ?initial, "Audio context created");
                Ok(Arc::new(context))
            }
        }
    }

    /// Running offline context, driven by render()
    pub fn offline(sample_rate: f32, quantum: usize) -> Arc<Self> {
        Arc::new(Self::offline_with_state(sample_rate, quantum, ContextState::Running))
    }

    fn offline_with_state(sample_rate: f32, quantum: usize, state: ContextState) -> Self {
        Self {
            sample_rate,
            clock: AudioClock::new(sample_rate),
            state: AtomicU8::new(state as u8),
            running: Arc::new(AtomicBool::new(state == ContextState::Running)),
            gesture_seen: AtomicBool::new(false),
            paused: Mutex::new(Self::ledger_for(state)),
            graph: Arc::new(Mutex::new(MixGraph::new(sample_rate, quantum))),
            monitor: CpuMonitor::new(sample_rate, 1),
            backend: Backend::Offline,
            buffer_frames: quantum as u32,
        }
    }

    fn ledger_for(state: ContextState) -> PauseLedger {
        match state {
            ContextState::Running => PauseLedger::default(),
            _ => PauseLedger::paused_at(Instant::now()),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, PauseLedger> {
        self.paused.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_stream(&self, f: impl FnOnce(&OutputStream)) {
        if let Backend::Device(stream) = &self.backend {
            let stream = stream.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&stream);
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn clock(&self) -> &AudioClock {
        &self.clock
    }

    /// Current context time in seconds
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Context time plus wall time spent suspended; never stands still
    pub fn uptime(&self) -> f64 {
        self.now() + self.ledger().elapsed(Instant::now()).as_secs_f64()
    }

    pub fn state(&self) -> ContextState {
        ContextState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.backend, Backend::Offline)
    }

    pub fn monitor(&self) -> &CpuMonitor {
        &self.monitor
    }

    /// Approximate output latency: one device buffer
    pub fn output_latency(&self) -> f64 {
        self.buffer_frames as f64 / self.sample_rate as f64
    }

    /// Lock the mix graph from the control side
    pub fn graph(&self) -> MutexGuard<'_, MixGraph> {
        self.graph.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, from: ContextState, to: ContextState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns false if already running (or closed)
    pub fn resume(&self) -> bool {
        if !self.transition(ContextState::Suspended, ContextState::Running) {
            return false;
        }
        self.ledger().unpause(Instant::now());
        self.running.store(true, Ordering::Release);
        self.with_stream(OutputStream::play);
        tracing::debug!("Audio context resumed");
        true
    }

    /// Returns false if already suspended (or closed)
    pub fn suspend(&self) -> bool {
        if !self.transition(ContextState::Running, ContextState::Suspended) {
            return false;
        }
        self.ledger().pause(Instant::now());
        self.running.store(false, Ordering::Release);
        self.with_stream(OutputStream::pause);
        tracing::debug!("Audio context suspended");
        true
    }

    /// First user gesture unlocks audio; later gestures do nothing
    pub fn notify_gesture(&self) -> bool {
        if self.gesture_seen.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.resume()
    }

    pub fn close(&self) {
        let previous = ContextState::from(self.state.swap(ContextState::Closed as u8, Ordering::AcqRel));
        if previous == ContextState::Closed {
            return;
        }
        self.ledger().pause(Instant::now());
        self.running.store(false, Ordering::Release);
        if let Backend::Device(stream) = &self.backend {
            stream
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .close();
        }
        tracing::info!("Audio context closed");
    }

    /// Render the next block of an offline context
    ///
    /// A suspended or closed context outputs silence and its clock stands
    /// still. Device contexts are rendered by their stream; calling this on
    /// one is an error.
    pub fn render(&self, out: &mut [f32]) -> Result<(), AudioError> {
        if !self.is_offline() {
            return Err(AudioError::NotOffline);
        }
        if self.state() != ContextState::Running {
            out.fill(0.0);
            return Ok(());
        }
        let measure = self.monitor.start_measure();
        self.graph().render(out, self.clock.now());
        self.clock.advance(out.len());
        self.monitor.end_measure(measure, out.len());
        Ok(())
    }

    /// Render `seconds` of audio and throw it away
    pub fn advance(&self, seconds: f64) -> Result<(), AudioError> {
        let frames = self.clock.seconds_to_frames(seconds) as usize;
        let mut block = vec![0.0; 1024];
        let mut remaining = frames;
        while remaining > 0 {
            let n = remaining.min(block.len());
            self.render(&mut block[..n])?;
            remaining -= n;
        }
        Ok(())
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config(require_gesture: bool) -> AudioConfig {
        AudioConfig {
            backend: AudioBackend::Offline,
            sample_rate: 48000,
            render_quantum: 128,
            require_gesture,
        }
    }

    #[test]
    fn test_offline_render_advances_clock() {
        let ctx = AudioContext::offline(48000.0, 128);
        assert_eq!(ctx.state(), ContextState::Running);
        let mut out = vec![1.0; 480];
        ctx.render(&mut out).unwrap();
        assert!((ctx.now() - 0.01).abs() < 1e-9);
        assert!(out.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_gesture_gate() {
        let ctx = AudioContext::new(&offline_config(true), LatencyPreference::Interactive).unwrap();
        assert_eq!(ctx.state(), ContextState::Suspended);

        // Suspended: silence and frozen clock
        ctx.advance(0.5).unwrap();
        assert_eq!(ctx.now(), 0.0);

        assert!(ctx.notify_gesture());
        assert_eq!(ctx.state(), ContextState::Running);
        assert!(!ctx.notify_gesture());

        ctx.advance(0.5).unwrap();
        assert!((ctx.now() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_suspend_resume_are_redundant_safe() {
        let ctx = AudioContext::offline(48000.0, 128);
        assert!(!ctx.resume());
        assert!(ctx.suspend());
        assert!(!ctx.suspend());
        assert_eq!(ctx.state(), ContextState::Suspended);
        assert!(ctx.resume());
        assert!(!ctx.resume());
    }

    #[test]
    fn test_close_is_final() {
        let ctx = AudioContext::offline(48000.0, 128);
        ctx.close();
        ctx.close();
        assert_eq!(ctx.state(), ContextState::Closed);
        assert!(!ctx.resume());
        assert!(!ctx.suspend());

        let mut out = vec![1.0; 64];
        ctx.render(&mut out).unwrap();
        assert!(out.iter().all(|x| *x == 0.0));
        assert_eq!(ctx.now(), 0.0);
    }

    #[test]
    fn test_uptime_keeps_moving_while_suspended() {
        let ctx = AudioContext::offline(48000.0, 128);
        ctx.advance(0.5).unwrap();
        assert!((ctx.uptime() - 0.5).abs() < 1e-3);

        assert!(ctx.suspend());
        std::thread::sleep(Duration::from_millis(60));
        ctx.advance(0.5).unwrap();
        assert!((ctx.now() - 0.5).abs() < 1e-3);
        assert!(ctx.uptime() >= 0.5 + 0.06 - 1e-3);

        // Paused time is banked on resume, then the sample clock takes over
        assert!(ctx.resume());
        let banked = ctx.uptime() - ctx.now();
        ctx.advance(0.25).unwrap();
        assert!((ctx.uptime() - ctx.now() - banked).abs() < 1e-6);
    }

    #[test]
    fn test_uptime_counts_wait_for_gesture() {
        let ctx = AudioContext::new(&offline_config(true), LatencyPreference::Interactive).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ctx.now(), 0.0);
        assert!(ctx.uptime() >= 0.02);
    }

    #[test]
    fn test_output_latency_uses_quantum_offline() {
        let ctx = AudioContext::offline(48000.0, 480);
        assert!((ctx.output_latency() - 0.01).abs() < 1e-9);
    }
}
