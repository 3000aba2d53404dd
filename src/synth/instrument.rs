// Instruments - Pure-data profiles and the backend contract
//
// Adding an instrument only adds a table entry; nothing in the note graph
// branches on instrument ids.

use super::envelope::AdsrParams;
use super::filter::FilterParams;
use super::oscillator::WaveformType;
use super::reverb::DEFAULT_PROFILE;
use crate::audio::AudioError;
use crate::config::EngineSettings;
use crate::messaging::note::{NoteEvent, NoteId, StopReason};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Instrument used when an id is unknown
pub const FALLBACK_INSTRUMENT: &str = "synth-lead";

/// One oscillator of a harmonic stack
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Partial {
    pub waveform: WaveformType,
    /// Frequency multiple of the note frequency
    pub ratio: f32,
    pub gain: f32,
}

impl Partial {
    pub const fn new(waveform: WaveformType, ratio: f32, gain: f32) -> Self {
        Self {
            waveform,
            ratio,
            gain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentProfile {
    pub id: String,
    /// Ordered by importance: lower quality tiers keep the first ones
    pub partials: Vec<Partial>,
    pub filter: FilterParams,
    pub envelope: AdsrParams,
    /// Waveshaper drive, 0 disables the stage
    #[serde(default)]
    pub distortion: f32,
    #[serde(default)]
    pub compression: bool,
    /// Reverb profile id
    #[serde(default = "default_reverb")]
    pub reverb: String,
    /// Share of the note sent to the reverb
    pub reverb_mix: f32,
}

fn default_reverb() -> String {
    DEFAULT_PROFILE.to_string()
}

impl InstrumentProfile {
    #[allow(clippy::too_many_arguments)]
    fn builtin(
        id: &str,
        partials: &[Partial],
        cutoff: f32,
        resonance: f32,
        envelope: AdsrParams,
        distortion: f32,
        compression: bool,
        reverb: &str,
        reverb_mix: f32,
    ) -> Self {
        Self {
            id: id.to_string(),
            partials: partials.to_vec(),
            filter: FilterParams::lowpass(cutoff, resonance),
            envelope,
            distortion,
            compression,
            reverb: reverb.to_string(),
            reverb_mix,
        }
    }

    /// Partials kept under a partial budget (at least the fundamental)
    pub fn partials_within(&self, limit: usize) -> &[Partial] {
        let count = self.partials.len().min(limit.max(1));
        &self.partials[..count]
    }
}

/// Built-in instrument definitions
pub fn builtin_instruments() -> Vec<InstrumentProfile> {
    use WaveformType::{Saw, Sine, Square, Triangle};
    let adsr = AdsrParams::new;

    vec![
        InstrumentProfile::builtin(
            "piano",
            &[
                Partial::new(Triangle, 1.0, 0.6),
                Partial::new(Sine, 2.0, 0.25),
                Partial::new(Sine, 3.0, 0.12),
                Partial::new(Sine, 4.0, 0.06),
            ],
            3500.0,
            0.9,
            adsr(0.005, 0.8, 0.3, 0.6),
            0.0,
            false,
            "hall",
            0.25,
        ),
        InstrumentProfile::builtin(
            "electric-piano",
            &[
                Partial::new(Sine, 1.0, 0.7),
                Partial::new(Sine, 2.0, 0.2),
                Partial::new(Triangle, 4.0, 0.05),
            ],
            5000.0,
            0.8,
            adsr(0.003, 1.2, 0.3, 0.5),
            0.05,
            false,
            "room",
            0.2,
        ),
        InstrumentProfile::builtin(
            "guitar",
            &[
                Partial::new(Saw, 1.0, 0.5),
                Partial::new(Triangle, 2.0, 0.2),
                Partial::new(Sine, 3.0, 0.1),
            ],
            2800.0,
            1.2,
            adsr(0.002, 0.9, 0.0, 0.3),
            0.15,
            false,
            "room",
            0.2,
        ),
        InstrumentProfile::builtin(
            "bass",
            &[Partial::new(Saw, 1.0, 0.6), Partial::new(Square, 0.5, 0.3)],
            900.0,
            1.5,
            adsr(0.005, 0.3, 0.6, 0.15),
            0.0,
            true,
            "room",
            0.1,
        ),
        InstrumentProfile::builtin(
            "violin",
            &[
                Partial::new(Saw, 1.0, 0.55),
                Partial::new(Saw, 1.003, 0.2),
                Partial::new(Sine, 2.0, 0.1),
            ],
            4500.0,
            1.0,
            adsr(0.08, 0.2, 0.8, 0.3),
            0.0,
            false,
            "hall",
            0.3,
        ),
        InstrumentProfile::builtin(
            "cello",
            &[Partial::new(Saw, 1.0, 0.6), Partial::new(Triangle, 2.0, 0.2)],
            2500.0,
            1.0,
            adsr(0.1, 0.25, 0.8, 0.4),
            0.0,
            false,
            "hall",
            0.3,
        ),
        InstrumentProfile::builtin(
            "flute",
            &[
                Partial::new(Sine, 1.0, 0.7),
                Partial::new(Sine, 2.0, 0.1),
                Partial::new(Triangle, 3.0, 0.05),
            ],
            6000.0,
            0.7,
            adsr(0.06, 0.1, 0.85, 0.2),
            0.0,
            false,
            "hall",
            0.25,
        ),
        InstrumentProfile::builtin(
            "trumpet",
            &[
                Partial::new(Saw, 1.0, 0.55),
                Partial::new(Square, 2.0, 0.2),
                Partial::new(Saw, 3.0, 0.1),
            ],
            3000.0,
            1.5,
            adsr(0.03, 0.15, 0.75, 0.15),
            0.1,
            true,
            "plate",
            0.2,
        ),
        InstrumentProfile::builtin(
            "organ",
            &[
                Partial::new(Sine, 1.0, 0.5),
                Partial::new(Sine, 2.0, 0.3),
                Partial::new(Sine, 3.0, 0.2),
                Partial::new(Sine, 4.0, 0.15),
                Partial::new(Sine, 8.0, 0.1),
            ],
            8000.0,
            0.7,
            adsr(0.01, 0.05, 1.0, 0.08),
            0.0,
            false,
            "room",
            0.2,
        ),
        InstrumentProfile::builtin(
            "synth-lead",
            &[Partial::new(Saw, 1.0, 0.5), Partial::new(Square, 1.005, 0.3)],
            3000.0,
            2.0,
            adsr(0.01, 0.2, 0.7, 0.2),
            0.2,
            true,
            "plate",
            0.2,
        ),
        InstrumentProfile::builtin(
            "synth-pad",
            &[
                Partial::new(Saw, 1.0, 0.35),
                Partial::new(Saw, 1.007, 0.35),
                Partial::new(Triangle, 0.5, 0.25),
            ],
            1800.0,
            0.8,
            adsr(0.6, 0.8, 0.7, 1.5),
            0.0,
            false,
            "hall",
            0.5,
        ),
        InstrumentProfile::builtin(
            "marimba",
            &[
                Partial::new(Sine, 1.0, 0.7),
                Partial::new(Sine, 4.0, 0.2),
                Partial::new(Sine, 10.0, 0.05),
            ],
            5000.0,
            0.7,
            adsr(0.002, 0.5, 0.0, 0.2),
            0.0,
            false,
            "room",
            0.2,
        ),
        InstrumentProfile::builtin(
            "harp",
            &[
                Partial::new(Triangle, 1.0, 0.6),
                Partial::new(Sine, 2.0, 0.2),
                Partial::new(Sine, 3.0, 0.08),
            ],
            4000.0,
            0.7,
            adsr(0.003, 1.2, 0.0, 0.5),
            0.0,
            false,
            "hall",
            0.35,
        ),
        InstrumentProfile::builtin(
            "bells",
            &[
                Partial::new(Sine, 1.0, 0.5),
                Partial::new(Sine, 2.76, 0.3),
                Partial::new(Sine, 5.4, 0.15),
                Partial::new(Sine, 8.93, 0.08),
            ],
            9000.0,
            0.7,
            adsr(0.001, 2.0, 0.0, 1.0),
            0.0,
            false,
            "plate",
            0.4,
        ),
    ]
}

/// Instrument id -> profile lookup
#[derive(Debug, Clone)]
pub struct InstrumentTable {
    profiles: HashMap<String, InstrumentProfile>,
    fallback: InstrumentProfile,
}

impl InstrumentTable {
    pub fn with_builtins() -> Self {
        let mut profiles: HashMap<String, InstrumentProfile> = builtin_instruments()
            .into_iter()
            .map(|profile| (profile.id.clone(), profile))
            .collect();
        let fallback = profiles
            .remove(FALLBACK_INSTRUMENT)
            .unwrap_or_else(|| InstrumentProfile {
                id: FALLBACK_INSTRUMENT.to_string(),
                partials: vec![Partial::new(WaveformType::Saw, 1.0, 0.6)],
                filter: FilterParams::default(),
                envelope: AdsrParams::default(),
                distortion: 0.0,
                compression: false,
                reverb: default_reverb(),
                reverb_mix: 0.2,
            });
        profiles.insert(fallback.id.clone(), fallback.clone());
        Self { profiles, fallback }
    }

    /// Add or replace a profile
    pub fn insert(&mut self, profile: InstrumentProfile) {
        if profile.id == FALLBACK_INSTRUMENT {
            self.fallback = profile.clone();
        }
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn get(&self, id: &str) -> Option<&InstrumentProfile> {
        self.profiles.get(id)
    }

    /// Profile for `id`, or the fallback instrument
    pub fn resolve(&self, id: &str) -> &InstrumentProfile {
        match self.profiles.get(id) {
            Some(profile) => profile,
            None => {
                tracing::debug!(instrument = %id, fallback = FALLBACK_INSTRUMENT, "Unknown instrument");
                &self.fallback
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }

    /// Sorted instrument ids
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl Default for InstrumentTable {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Capability contract every playable backend implements
///
/// The facade only ever talks to this trait, so test doubles and alternative
/// synthesis backends plug in without any runtime probing.
pub trait InstrumentBackend: Send {
    /// Start a note. The event is already validated.
    fn attack(&mut self, event: &NoteEvent) -> Result<NoteId, AudioError>;

    /// Move a note into its fast release. False if the id is unknown.
    fn release(&mut self, id: NoteId) -> bool;

    /// Release every active note, returning how many were released
    fn release_all(&mut self) -> usize;

    /// Disconnect a note immediately, without a release
    fn dispose(&mut self, id: NoteId) -> bool;

    fn active_notes(&self) -> usize;

    /// Fire completion timers and the lifetime ceiling at `now`
    fn maintain(&mut self, now: f64) -> Vec<(NoteId, StopReason)>;

    /// Settings used by notes created from now on
    fn update_settings(&mut self, settings: EngineSettings);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_has_every_instrument() {
        let table = InstrumentTable::with_builtins();
        for id in [
            "piano",
            "electric-piano",
            "guitar",
            "bass",
            "violin",
            "cello",
            "flute",
            "trumpet",
            "organ",
            "synth-lead",
            "synth-pad",
            "marimba",
            "harp",
            "bells",
        ] {
            assert!(table.contains(id), "missing {}", id);
        }
        assert_eq!(table.len(), 14);
        assert!(!table.is_empty());
    }

    #[test]
    fn test_profiles_are_well_formed() {
        for profile in builtin_instruments() {
            assert!(!profile.partials.is_empty(), "{}", profile.id);
            assert!(profile.partials.iter().all(|p| p.ratio > 0.0 && p.gain > 0.0));
            assert!((0.0..=1.0).contains(&profile.reverb_mix));
            assert!((0.0..=1.0).contains(&profile.distortion));
        }
    }

    #[test]
    fn test_unknown_instrument_falls_back() {
        let table = InstrumentTable::with_builtins();
        assert_eq!(table.resolve("theremin").id, FALLBACK_INSTRUMENT);
        assert_eq!(table.resolve("piano").id, "piano");
        assert!(table.get("theremin").is_none());
    }

    #[test]
    fn test_insert_overrides_builtin() {
        let mut table = InstrumentTable::with_builtins();
        let mut custom = table.resolve("piano").clone();
        custom.reverb_mix = 0.9;
        table.insert(custom);
        assert_eq!(table.resolve("piano").reverb_mix, 0.9);

        let mut fallback = table.resolve(FALLBACK_INSTRUMENT).clone();
        fallback.distortion = 0.5;
        table.insert(fallback);
        assert_eq!(table.resolve("kazoo").distortion, 0.5);
    }

    #[test]
    fn test_partial_budget() {
        let table = InstrumentTable::with_builtins();
        let organ = table.resolve("organ");
        assert_eq!(organ.partials_within(1).len(), 1);
        assert_eq!(organ.partials_within(3).len(), 3);
        assert_eq!(organ.partials_within(usize::MAX).len(), 5);
        assert_eq!(organ.partials_within(0).len(), 1);
    }

    #[test]
    fn test_profile_serde_defaults() {
        let json = r#"{
            "id": "kalimba",
            "partials": [{"waveform": "sine", "ratio": 1.0, "gain": 0.8}],
            "filter": {"cutoff": 3000.0, "resonance": 0.7},
            "envelope": {"attack": 0.002, "decay": 0.6, "sustain": 0.0, "release": 0.3},
            "reverb_mix": 0.2
        }"#;
        let profile: InstrumentProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.reverb, DEFAULT_PROFILE);
        assert!(!profile.compression);
        assert_eq!(profile.distortion, 0.0);
    }
}
