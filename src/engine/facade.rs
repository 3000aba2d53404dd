// Sound engine - One entry point for the UI, MIDI keys and remote peers
//
// Every note, whatever its source, goes through play_event(): validation,
// the gesture unlock, the synthesis backend, subscriber fan-out and (for
// local notes) the peer broadcast.
//
// The engine owns no thread of its own. The host calls pump() from its loop
// and every timer-like job runs there: MIDI drain, peer polling, note
// retirement, the idle sweep and the metrics refresh.

use super::{Availability, EngineError, EngineEvent, FailureKind};
use crate::audio::metrics::{CpuLoad, NOTE_FOOTPRINT_BYTES, PerformanceMetrics};
use crate::audio::resources::{ResourceManager, SharedResources, lock_resources};
use crate::config::{EngineConfig, EngineSettings, LatencyPreference, QualityTier};
use crate::messaging::events::{EventBus, Subscription};
use crate::messaging::note::{InvalidParameter, NoteEvent, NoteId, StopReason};
use crate::messaging::notification::{Notification, NotificationCategory};
use crate::midi::device::MidiDevice;
use crate::midi::input::{KeyId, NoteAction, NoteTracker};
use crate::midi::manager::{MidiManager, MidiSender};
use crate::midi::pitch;
use crate::peer::PeerError;
use crate::peer::connection::PeerInfo;
use crate::peer::session::{PeerEvent, PeerSession, RemovalReason};
use crate::peer::signal::{SignalMessage, SignalingRelay};
use crate::peer::transport::TransportFactory;
use crate::synth::engine::SynthesisEngine;
use crate::synth::instrument::{InstrumentBackend, InstrumentTable};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// What one pump() did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub midi_messages: usize,
    pub remote_notes: usize,
    pub finished_notes: usize,
    pub swept_notes: usize,
}

pub struct SoundEngine {
    config: EngineConfig,
    settings: EngineSettings,
    resources: SharedResources,
    backend: Box<dyn InstrumentBackend>,
    bus: EventBus<EngineEvent>,
    midi: MidiManager,
    tracker: NoteTracker,
    /// Notes started by a MIDI key, for the matching note-off
    midi_notes: HashMap<KeyId, NoteId>,
    peers: Option<PeerSession>,
    local_id: String,
    availability: Availability,
    last_metrics: PerformanceMetrics,
    disposed: bool,
}

impl SoundEngine {
    /// Engine with the built-in additive synthesiser
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_backend(config, |resources, instruments, settings| {
            Box::new(SynthesisEngine::new(resources, instruments, settings))
        })
    }

    /// Engine with a custom instrument backend
    pub fn with_backend<F>(config: EngineConfig, build: F) -> Result<Self, EngineError>
    where
        F: FnOnce(SharedResources, InstrumentTable, EngineSettings) -> Box<dyn InstrumentBackend>,
    {
        config.validate()?;

        let settings = config.settings;
        let mut manager = ResourceManager::new(config.audio.clone(), config.resources.clone(), settings.latency);
        manager.set_quality(settings.quality);
        let resources = manager.shared();

        let mut instruments = InstrumentTable::with_builtins();
        for profile in &config.instruments {
            instruments.insert(profile.clone());
        }
        let backend = build(Arc::clone(&resources), instruments, settings);

        let local_id = config
            .peer
            .local_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        tracing::debug!(local_id = %local_id, backend = ?config.audio.backend, "Sound engine created");

        Ok(Self {
            midi: MidiManager::new(config.midi.clone()),
            config,
            settings,
            resources,
            backend,
            bus: EventBus::new(),
            tracker: NoteTracker::new(),
            midi_notes: HashMap::new(),
            peers: None,
            local_id,
            availability: Availability::default(),
            last_metrics: PerformanceMetrics::default(),
            disposed: false,
        })
    }

    /// Bring up audio and MIDI
    ///
    /// Never fails: an unavailable subsystem is reported in the returned
    /// flags and through one notification. Safe to call again.
    pub fn initialize(&mut self) -> Availability {
        if self.disposed {
            return self.availability;
        }

        if self.availability.audio.is_none() {
            let result = lock_resources(&self.resources).get_context();
            match result {
                Ok(context) => {
                    self.availability.audio = Some(true);
                    tracing::info!(sample_rate = context.sample_rate(), state = ?context.state(), "Audio ready");
                }
                Err(e) => {
                    self.availability.audio = Some(false);
                    self.notify(Notification::warning(
                        NotificationCategory::Audio,
                        format!("Audio unavailable ({}), notes will be silent", e.kind()),
                    ));
                }
            }
        }

        if self.availability.midi.is_none() {
            let available = self.midi.initialize();
            self.availability.midi = Some(available);
            if !available && self.config.midi.enabled {
                self.notify(Notification::info(
                    NotificationCategory::Midi,
                    "MIDI unavailable, on-screen input only",
                ));
            }
        }

        self.availability
    }

    pub fn availability(&self) -> Availability {
        self.availability
    }

    pub fn is_audio_available(&self) -> bool {
        lock_resources(&self.resources).is_available() == Some(true)
    }

    pub fn is_midi_available(&self) -> bool {
        self.midi.is_available() == Some(true)
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- Notes ----

    /// Play a note from the local UI
    pub fn play_note(
        &mut self,
        instrument: &str,
        note: &str,
        frequency: f32,
        velocity: f32,
        duration: Option<f64>,
        user_id: Option<String>,
    ) -> Result<NoteId, EngineError> {
        let event = NoteEvent::new(instrument, note, frequency, velocity)
            .with_duration(duration)
            .with_user(user_id);
        self.play_event(event)
    }

    /// Play any note event; remote ones are never rebroadcast
    pub fn play_event(&mut self, event: NoteEvent) -> Result<NoteId, EngineError> {
        if self.disposed {
            return Err(EngineError::Disposed);
        }
        event.validate()?;

        if !event.is_remote {
            // A local play is a user gesture
            let context = lock_resources(&self.resources).get_context()?;
            context.notify_gesture();
        }

        let id = self.backend.attack(&event)?;

        if !event.is_remote
            && let Some(session) = self.peers.as_mut()
        {
            session.broadcast(&event);
        }

        self.bus.publish(&EngineEvent::NoteStarted { id, event });
        Ok(id)
    }

    /// Schedule the release of one note. False if it is unknown or already released.
    pub fn stop_note(&mut self, id: NoteId) -> bool {
        if self.disposed {
            return false;
        }
        self.backend.release(id)
    }

    /// Release every sounding note and forget held MIDI keys
    pub fn stop_all_notes(&mut self) -> usize {
        if self.disposed {
            return 0;
        }
        self.tracker.reset();
        self.midi_notes.clear();
        self.backend.release_all()
    }

    pub fn active_notes(&self) -> usize {
        self.backend.active_notes()
    }

    // ---- Settings ----

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn set_master_volume(&mut self, volume: f32) -> Result<(), EngineError> {
        check_unit("master_volume", volume)?;
        self.settings.master_volume = volume;
        self.apply_settings();
        Ok(())
    }

    pub fn set_reverb_level(&mut self, level: f32) -> Result<(), EngineError> {
        check_unit("reverb_level", level)?;
        self.settings.reverb_level = level;
        self.apply_settings();
        Ok(())
    }

    /// Takes effect when the output stream is next opened
    pub fn set_latency_preference(&mut self, latency: LatencyPreference) {
        self.settings.latency = latency;
        lock_resources(&self.resources).set_latency(latency);
        self.apply_settings();
    }

    pub fn set_quality(&mut self, quality: QualityTier) {
        self.settings.quality = quality;
        lock_resources(&self.resources).set_quality(quality);
        self.apply_settings();
    }

    fn apply_settings(&mut self) {
        self.backend.update_settings(self.settings);
        tracing::debug!(settings = ?self.settings, "Settings updated for new notes");
    }

    // ---- Subscribers ----

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&EngineEvent) + Send + 'static,
    {
        self.bus.subscribe(listener)
    }

    /// Listen to started notes only (local, MIDI and remote)
    pub fn on_note_event<F>(&self, mut listener: F) -> Subscription
    where
        F: FnMut(NoteId, &NoteEvent) + Send + 'static,
    {
        self.bus.subscribe(move |event| {
            if let EngineEvent::NoteStarted { id, event } = event {
                listener(*id, event);
            }
        })
    }

    fn notify(&self, notification: Notification) {
        self.bus.publish(&EngineEvent::Notification { notification });
    }

    // ---- MIDI ----

    pub fn midi_devices(&self) -> Vec<MidiDevice> {
        self.midi.devices()
    }

    /// Queue handle for software MIDI sources
    pub fn midi_sender(&self) -> MidiSender {
        self.midi.sender()
    }

    pub fn midi(&mut self) -> &mut MidiManager {
        &mut self.midi
    }

    // ---- Peers ----

    /// Start peer networking. False if it is already on (or the engine is disposed).
    pub fn enable_webrtc(&mut self, factory: Box<dyn TransportFactory>, relay: Box<dyn SignalingRelay>) -> bool {
        if self.disposed || self.peers.is_some() {
            return false;
        }
        self.peers = Some(PeerSession::new(
            self.local_id.clone(),
            self.config.peer.clone(),
            factory,
            relay,
        ));
        self.availability.peers = true;
        tracing::info!(local_id = %self.local_id, "Peer networking enabled");
        true
    }

    /// Close every peer and stop networking; returns the number of peers closed
    pub fn disable_webrtc(&mut self) -> usize {
        let Some(mut session) = self.peers.take() else {
            return 0;
        };
        let closed = session.close_all();
        for event in session.drain_events() {
            self.publish_peer_event(event);
        }
        self.availability.peers = false;
        tracing::info!(closed, "Peer networking disabled");
        closed
    }

    fn session(&mut self) -> Result<&mut PeerSession, PeerError> {
        self.peers.as_mut().ok_or(PeerError::Disabled)
    }

    pub fn connect_peer(&mut self, peer_id: &str) -> Result<(), EngineError> {
        self.session()?.connect(peer_id)?;
        Ok(())
    }

    /// Apply one signalling message; rejected messages are logged and dropped
    pub fn handle_signal(&mut self, message: SignalMessage) -> Result<(), EngineError> {
        let result = self.session().and_then(|session| session.handle_signal(message));
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Signalling message dropped");
        }
        Ok(result?)
    }

    pub fn handle_signal_json(&mut self, payload: &str) -> Result<(), EngineError> {
        let message = SignalMessage::from_json(payload).inspect_err(|e| {
            tracing::warn!(error = %e, "Malformed signalling message dropped");
        })?;
        self.handle_signal(message)
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        self.peers.as_mut().is_some_and(|session| session.remove_peer(peer_id))
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.as_ref().map(PeerSession::peers).unwrap_or_default()
    }

    fn publish_peer_event(&self, event: PeerEvent) {
        if let PeerEvent::Removed {
            peer,
            reason: RemovalReason::Failed(detail),
        } = &event
        {
            self.notify(Notification::warning(
                NotificationCategory::Peer,
                format!("Lost connection to {peer}: {detail}"),
            ));
        }
        self.bus.publish(&EngineEvent::Peer { event });
    }

    // ---- Tick ----

    /// Cooperative tick, call it from the host loop
    pub fn pump(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if self.disposed {
            return report;
        }

        self.pump_devices();
        report.midi_messages = self.pump_midi();
        report.remote_notes = self.pump_peers();

        let (now, uptime) = {
            let resources = lock_resources(&self.resources);
            (resources.now(), resources.uptime())
        };
        report.finished_notes = self.retire_finished(now);
        report.swept_notes = self.sweep_idle(uptime);

        if now - self.last_metrics.measured_at >= self.config.metrics_interval_secs {
            self.refresh_metrics();
        }
        report
    }

    fn pump_devices(&mut self) {
        for change in self.midi.drain_device_changes() {
            self.bus.publish(&EngineEvent::Device { change });
        }
    }

    fn pump_midi(&mut self) -> usize {
        let messages = self.midi.drain_messages();
        for message in &messages {
            for action in self.tracker.process(message) {
                match action {
                    NoteAction::Start { key, velocity } => self.start_midi_note(key, velocity),
                    NoteAction::Stop { key } => {
                        if let Some(id) = self.midi_notes.remove(&key) {
                            self.backend.release(id);
                        }
                    }
                    NoteAction::Control {
                        channel,
                        controller,
                        value,
                    } => {
                        self.bus.publish(&EngineEvent::MidiControl {
                            channel,
                            controller,
                            value,
                        });
                    }
                    NoteAction::Bend { channel, value } => {
                        self.bus.publish(&EngineEvent::PitchBend { channel, value });
                    }
                }
            }
        }
        messages.len()
    }

    fn start_midi_note(&mut self, key: KeyId, velocity: f32) {
        let (_, number) = key;
        let event = NoteEvent::new(
            self.config.midi.default_instrument.clone(),
            pitch::note_name(number),
            pitch::note_number_to_frequency(number) as f32,
            velocity,
        );
        match self.play_event(event) {
            Ok(id) => {
                self.midi_notes.insert(key, id);
            }
            Err(e) => {
                self.tracker.forget(key);
                tracing::debug!(note = number, error = %e, "MIDI note dropped");
            }
        }
    }

    fn pump_peers(&mut self) -> usize {
        let Some(session) = self.peers.as_mut() else {
            return 0;
        };
        let remote = session.poll();
        let events = session.drain_events();

        for event in events {
            self.publish_peer_event(event);
        }

        let hold = self.config.peer.remote_hold_secs;
        let mut played = 0;
        for mut event in remote {
            if event.duration.is_none() {
                event.duration = Some(hold);
            }
            match self.play_event(event) {
                Ok(_) => played += 1,
                Err(e) => tracing::debug!(error = %e, "Remote note dropped"),
            }
        }
        played
    }

    fn retire_finished(&mut self, now: f64) -> usize {
        let finished = self.backend.maintain(now);
        for (id, reason) in &finished {
            self.note_finished(*id, *reason);
        }
        finished.len()
    }

    /// Collect notes whose completion never fired. `uptime` keeps moving
    /// while the context is suspended.
    fn sweep_idle(&mut self, uptime: f64) -> usize {
        let report = {
            let mut resources = lock_resources(&self.resources);
            if !resources.sweep_due(uptime) {
                return 0;
            }
            resources.sweep(uptime)
        };

        let mut swept = 0;
        for id in report.evicted_notes {
            if self.backend.dispose(id) {
                tracing::debug!(note_id = %id, kind = %FailureKind::SchedulingOverrun, "Idle sweep collected note");
                self.note_finished(id, StopReason::Swept);
                swept += 1;
            }
        }
        swept
    }

    fn note_finished(&mut self, id: NoteId, reason: StopReason) {
        let key = self
            .midi_notes
            .iter()
            .find_map(|(key, note)| (*note == id).then_some(*key));
        if let Some(key) = key {
            self.midi_notes.remove(&key);
            self.tracker.forget(key);
        }
        self.bus.publish(&EngineEvent::NoteStopped { id, reason });
    }

    fn refresh_metrics(&mut self) {
        let metrics = self.performance();
        if CpuLoad::from_percentage(metrics.cpu_percent) == CpuLoad::High {
            tracing::warn!(cpu = metrics.cpu_percent, notes = metrics.active_notes, "Render load is high");
        }
        tracing::trace!(?metrics, "Metrics refreshed");
        self.last_metrics = metrics;
    }

    /// Fresh snapshot of the performance counters
    pub fn performance(&self) -> PerformanceMetrics {
        let active_notes = self.backend.active_notes();
        let connected_peers = self.peers.as_ref().map_or(0, PeerSession::connected_count);

        let resources = lock_resources(&self.resources);
        let context = resources.context();
        PerformanceMetrics {
            output_latency_ms: context
                .as_ref()
                .map_or(0.0, |c| (c.output_latency() * 1000.0) as f32),
            active_notes,
            cached_reverbs: resources.cached_reverbs(),
            connected_peers,
            memory_estimate_bytes: active_notes * NOTE_FOOTPRINT_BYTES + resources.reverb_memory_bytes(),
            cpu_percent: context.as_ref().map_or(0.0, |c| c.monitor().cpu_percentage()),
            measured_at: resources.now(),
        }
    }

    /// Snapshot taken by the last periodic refresh in pump()
    pub fn last_metrics(&self) -> PerformanceMetrics {
        self.last_metrics
    }

    // ---- Context ----

    /// Render the next block of an offline context
    pub fn render(&self, out: &mut [f32]) -> Result<(), EngineError> {
        let context = lock_resources(&self.resources).get_context()?;
        context.render(out)?;
        Ok(())
    }

    /// Visibility lost
    pub fn suspend(&self) -> bool {
        lock_resources(&self.resources).suspend()
    }

    /// Visibility regained
    pub fn resume(&self) -> bool {
        lock_resources(&self.resources).resume()
    }

    pub fn notify_gesture(&self) -> bool {
        lock_resources(&self.resources).notify_gesture()
    }

    /// Release everything: notes, peers, MIDI ports and the context. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        let released = self.stop_all_notes();
        self.disable_webrtc();
        self.midi.close();
        lock_resources(&self.resources).close();
        self.disposed = true;
        self.bus.clear();
        tracing::info!(released, "Sound engine disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for SoundEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn check_unit(field: &'static str, value: f32) -> Result<(), InvalidParameter> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(InvalidParameter {
            field,
            value: value as f64,
        })
    }
}
