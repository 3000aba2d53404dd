// Gallery Audio - Library exports for hosts, tests and benchmarks

pub mod audio;
pub mod config;
pub mod connection;
pub mod engine;
pub mod messaging;
pub mod midi;
pub mod peer;
pub mod synth;

// Re-export commonly used types for convenience
pub use audio::AudioError;
pub use audio::context::{AudioContext, ContextState};
pub use audio::metrics::PerformanceMetrics;
pub use config::{AudioBackend, EngineConfig, EngineSettings, LatencyPreference, QualityTier};
pub use engine::{Availability, EngineError, EngineEvent, FailureKind, SoundEngine, TickReport};
pub use messaging::events::Subscription;
pub use messaging::note::{NoteEvent, NoteId, StopReason};
pub use messaging::notification::Notification;
pub use midi::MidiError;
pub use midi::event::{MidiEvent, MidiMessage};
pub use midi::pitch::{frequency_to_note_number, note_number_to_frequency};
pub use peer::PeerError;
pub use peer::memory::MemoryNetwork;
pub use peer::signal::{SignalKind, SignalMessage};
pub use synth::instrument::{InstrumentBackend, InstrumentProfile};
