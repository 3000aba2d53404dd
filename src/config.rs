// Configuration - Engine options and process-wide settings, stored as RON

use crate::synth::instrument::InstrumentProfile;
use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where the audio context sends its output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioBackend {
    /// Default cpal output device
    #[default]
    Device,
    /// No device; the host drives rendering (tests, file export)
    Offline,
}

/// Output buffer trade-off between responsiveness and robustness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LatencyPreference {
    #[default]
    Interactive,
    Balanced,
    Playback,
}

impl LatencyPreference {
    /// Device buffer size requested for this preference
    pub fn buffer_frames(self) -> u32 {
        match self {
            LatencyPreference::Interactive => 128,
            LatencyPreference::Balanced => 512,
            LatencyPreference::Playback => 2048,
        }
    }
}

/// Synthesis cost tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QualityTier {
    Low,
    #[default]
    Standard,
    High,
}

impl QualityTier {
    /// Maximum partials per note
    pub fn partial_limit(self) -> usize {
        match self {
            QualityTier::Low => 1,
            QualityTier::Standard => 3,
            QualityTier::High => usize::MAX,
        }
    }

    /// Impulse-response length relative to the profile decay
    pub fn impulse_length_scale(self) -> f32 {
        match self {
            QualityTier::Low => 0.5,
            QualityTier::Standard | QualityTier::High => 1.0,
        }
    }
}

/// Process-wide settings, snapshotted into each note when it is created
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub master_volume: f32,
    pub reverb_level: f32,
    #[serde(default)]
    pub latency: LatencyPreference,
    #[serde(default)]
    pub quality: QualityTier,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            master_volume: 0.8,
            reverb_level: 0.3,
            latency: LatencyPreference::Interactive,
            quality: QualityTier::Standard,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub backend: AudioBackend,
    /// Offline sample rate, and a hint for the device
    pub sample_rate: u32,
    /// Frames per render block
    pub render_quantum: usize,
    /// Start suspended until the first user gesture
    pub require_gesture: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: AudioBackend::Device,
            sample_rate: 48000,
            render_quantum: 128,
            require_gesture: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub sweep_interval_secs: f64,
    pub idle_threshold_secs: f64,
    pub max_impulse_responses: usize,
    /// Hard ceiling on any single note
    pub max_note_lifetime_secs: f64,
    /// Release used by explicit stops
    pub fast_release_secs: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30.0,
            idle_threshold_secs: 60.0,
            max_impulse_responses: 20,
            max_note_lifetime_secs: 10.0,
            fast_release_secs: 0.08,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    pub enabled: bool,
    pub default_instrument: String,
    pub monitor_interval_ms: u64,
    pub auto_connect: bool,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_instrument: "piano".to_string(),
            monitor_interval_ms: 2000,
            auto_connect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Local peer id; a random one is generated when absent
    pub local_id: Option<String>,
    /// How long remote notes without a duration are held
    pub remote_hold_secs: f64,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            local_id: None,
            remote_hold_secs: 1.0,
            auto_reconnect: false,
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub settings: EngineSettings,
    pub resources: ResourceConfig,
    pub midi: MidiConfig,
    pub peer: PeerConfig,
    pub metrics_interval_secs: f64,
    /// Extra instruments, replacing built-ins with the same id
    pub instruments: Vec<InstrumentProfile>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            settings: EngineSettings::default(),
            resources: ResourceConfig::default(),
            midi: MidiConfig::default(),
            peer: PeerConfig::default(),
            metrics_interval_secs: 1.0,
            instruments: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Offline configuration for tests and file rendering: no device, no
    /// MIDI hardware, no gesture gate
    pub fn offline(sample_rate: u32) -> Self {
        Self {
            audio: AudioConfig {
                backend: AudioBackend::Offline,
                sample_rate,
                require_gesture: false,
                ..AudioConfig::default()
            },
            midi: MidiConfig {
                enabled: false,
                ..MidiConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn from_ron_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self =
            ron::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, PrettyConfig::default())
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_ron_str(&source)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_ron_string()?)?;
        Ok(())
    }

    /// `<config dir>/gallery-audio/engine.ron`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gallery-audio").join("engine.ron"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if !(8000..=192_000).contains(&self.audio.sample_rate) {
            return invalid("audio.sample_rate must be between 8000 and 192000");
        }
        if self.audio.render_quantum == 0 || self.audio.render_quantum > 8192 {
            return invalid("audio.render_quantum must be between 1 and 8192");
        }
        if !(0.0..=1.0).contains(&self.settings.master_volume) {
            return invalid("settings.master_volume must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.settings.reverb_level) {
            return invalid("settings.reverb_level must be within [0, 1]");
        }
        let positive = |x: f64| x.is_finite() && x > 0.0;
        let r = &self.resources;
        if !positive(r.sweep_interval_secs) || !positive(r.idle_threshold_secs) {
            return invalid("resource intervals must be positive");
        }
        if r.max_impulse_responses == 0 {
            return invalid("resources.max_impulse_responses must be at least 1");
        }
        if !positive(r.max_note_lifetime_secs) {
            return invalid("resources.max_note_lifetime_secs must be positive");
        }
        if !(0.001..=1.0).contains(&r.fast_release_secs) {
            return invalid("resources.fast_release_secs must be within [0.001, 1]");
        }
        // A live note is touched at attack and release only
        if r.idle_threshold_secs <= r.max_note_lifetime_secs + r.fast_release_secs {
            return invalid(
                "resources.idle_threshold_secs must exceed max_note_lifetime_secs plus fast_release_secs",
            );
        }
        if !positive(self.peer.remote_hold_secs) {
            return invalid("peer.remote_hold_secs must be positive");
        }
        if !positive(self.metrics_interval_secs) {
            return invalid("metrics_interval_secs must be positive");
        }
        for instrument in &self.instruments {
            if instrument.partials.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "instrument '{}' has no partials",
                    instrument.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resources.sweep_interval_secs, 30.0);
        assert_eq!(config.resources.idle_threshold_secs, 60.0);
        assert_eq!(config.resources.max_impulse_responses, 20);
        assert_eq!(config.settings.latency, LatencyPreference::Interactive);
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let config = EngineConfig::from_ron_str(
            "(audio: (backend: Offline, sample_rate: 44100), settings: (master_volume: 0.5, reverb_level: 0.1))",
        )
        .unwrap();
        assert_eq!(config.audio.backend, AudioBackend::Offline);
        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.audio.render_quantum, 128);
        assert_eq!(config.settings.master_volume, 0.5);
        assert_eq!(config.settings.quality, QualityTier::Standard);
        assert_eq!(config.midi.default_instrument, "piano");
    }

    #[test]
    fn test_round_trip_through_ron() {
        let mut config = EngineConfig::offline(22050);
        config.peer.local_id = Some("studio-a".to_string());
        let text = config.to_ron_string().unwrap();
        assert_eq!(EngineConfig::from_ron_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let mut config = EngineConfig::default();
        config.settings.master_volume = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = EngineConfig::default();
        config.resources.max_impulse_responses = 0;
        assert!(config.validate().is_err());

        assert!(matches!(
            EngineConfig::from_ron_str("(audio: (sample_rate: 10))"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_ron_str("not ron at all"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation_rejects_non_finite_and_overlapping_timers() {
        let mut config = EngineConfig::default();
        config.resources.sweep_interval_secs = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.resources.idle_threshold_secs = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.metrics_interval_secs = f64::NAN;
        assert!(config.validate().is_err());

        // The sweep must never reach a note still inside its lifetime
        let mut config = EngineConfig::default();
        config.resources.max_note_lifetime_secs = 60.0;
        assert!(config.validate().is_err());
        config.resources.idle_threshold_secs = 60.05;
        assert!(config.validate().is_err());
        config.resources.idle_threshold_secs = 60.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tier_mappings() {
        assert_eq!(QualityTier::Low.partial_limit(), 1);
        assert_eq!(QualityTier::Standard.partial_limit(), 3);
        assert_eq!(QualityTier::Low.impulse_length_scale(), 0.5);
        assert!(LatencyPreference::Interactive.buffer_frames() < LatencyPreference::Playback.buffer_frames());
    }

    #[test]
    fn test_default_path_location() {
        if let Some(path) = EngineConfig::default_path() {
            assert!(path.ends_with("gallery-audio/engine.ron"));
        }
    }
}
