// Effects - Per-note processing chain and dynamics
//
// Each note graph runs oscillator mix -> EffectChain -> gain. The chain holds
// the tone filter and, depending on the instrument, a waveshaper and a
// compressor. The same Compressor also sits on the master bus.
//
// Real-time constraints:
// - No allocations in process()
// - Effects are owned by the chain, no locks

use super::filter::{FilterParams, StateVariableFilter};
use crate::audio::dsp_utils::{db_to_gain, flush_denormals_to_zero, gain_to_db, waveshape};
use serde::{Deserialize, Serialize};

/// Common interface for per-sample mono effects
pub trait Effect: Send {
    fn process(&mut self, input: f32) -> f32;

    /// Clear internal state (filter memory, envelope followers)
    fn reset(&mut self);

    fn is_enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    fn name(&self) -> &str;
}

/// Effects processed in series, each individually bypassable
#[derive(Default)]
pub struct EffectChain {
    effects: Vec<Box<dyn Effect>>,
}

impl EffectChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            effects: Vec::with_capacity(capacity),
        }
    }

    pub fn add_effect(&mut self, effect: Box<dyn Effect>) {
        self.effects.push(effect);
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Names of the effects in processing order
    pub fn names(&self) -> Vec<&str> {
        self.effects.iter().map(|e| e.name()).collect()
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let mut sample = input;
        for effect in self.effects.iter_mut() {
            if effect.is_enabled() {
                sample = effect.process(sample);
            }
        }
        sample
    }

    pub fn reset(&mut self) {
        for effect in self.effects.iter_mut() {
            effect.reset();
        }
    }
}

/// Tone filter as a chain stage
pub struct FilterEffect {
    filter: StateVariableFilter,
    enabled: bool,
}

impl FilterEffect {
    pub fn new(params: FilterParams, sample_rate: f32) -> Self {
        Self {
            filter: StateVariableFilter::new(params, sample_rate),
            enabled: true,
        }
    }

    pub fn params(&self) -> FilterParams {
        self.filter.params()
    }
}

impl Effect for FilterEffect {
    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        self.filter.process(input)
    }

    fn reset(&mut self) {
        self.filter.reset();
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn name(&self) -> &str {
        "Filter"
    }
}

/// Tanh waveshaper
///
/// `drive` in [0, 1]; 0 leaves the signal untouched.
pub struct Distortion {
    drive: f32,
    enabled: bool,
}

impl Distortion {
    pub fn new(drive: f32) -> Self {
        Self {
            drive: drive.clamp(0.0, 1.0),
            enabled: true,
        }
    }

    pub fn drive(&self) -> f32 {
        self.drive
    }
}

impl Effect for Distortion {
    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        waveshape(input, self.drive)
    }

    fn reset(&mut self) {}

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn name(&self) -> &str {
        "Distortion"
    }
}

/// Dynamics compressor settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorParams {
    /// Threshold in dBFS
    pub threshold_db: f32,
    /// Compression ratio (1.0 = none)
    pub ratio: f32,
    /// Soft knee width in dB
    pub knee_db: f32,
    /// Attack in seconds
    pub attack: f32,
    /// Release in seconds
    pub release: f32,
    /// Gain applied after compression, in dB
    #[serde(default)]
    pub makeup_db: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold_db: -18.0,
            ratio: 4.0,
            knee_db: 6.0,
            attack: 0.003,
            release: 0.25,
            makeup_db: 0.0,
        }
    }
}

impl CompressorParams {
    /// Gentle limiting for the master bus
    pub fn master() -> Self {
        Self {
            threshold_db: -6.0,
            ratio: 12.0,
            knee_db: 6.0,
            attack: 0.003,
            release: 0.25,
            makeup_db: 0.0,
        }
    }
}

/// Feed-forward peak compressor with a soft knee
pub struct Compressor {
    params: CompressorParams,
    attack_coeff: f32,
    release_coeff: f32,
    envelope_db: f32,
    enabled: bool,
}

impl Compressor {
    pub fn new(params: CompressorParams, sample_rate: f32) -> Self {
        let coeff = |seconds: f32| {
            let samples = (seconds.max(1e-4) * sample_rate).max(1.0);
            (-1.0 / samples).exp()
        };
        Self {
            params,
            attack_coeff: coeff(params.attack),
            release_coeff: coeff(params.release),
            envelope_db: -120.0,
            enabled: true,
        }
    }

    pub fn params(&self) -> CompressorParams {
        self.params
    }

    /// Static gain curve: dB of reduction for a given input level
    pub fn gain_reduction_db(&self, level_db: f32) -> f32 {
        let CompressorParams {
            threshold_db,
            ratio,
            knee_db,
            ..
        } = self.params;
        let slope = 1.0 - 1.0 / ratio.max(1.0);
        let over = level_db - threshold_db;

        if knee_db > 0.0 && over.abs() <= knee_db / 2.0 {
            let x = over + knee_db / 2.0;
            -slope * x * x / (2.0 * knee_db)
        } else if over > 0.0 {
            -slope * over
        } else {
            0.0
        }
    }
}

impl Effect for Compressor {
    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let level_db = gain_to_db(input.abs());
        let coeff = if level_db > self.envelope_db {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.envelope_db = level_db + coeff * (self.envelope_db - level_db);

        let gain_db = self.gain_reduction_db(self.envelope_db) + self.params.makeup_db;
        flush_denormals_to_zero(input * db_to_gain(gain_db))
    }

    fn reset(&mut self) {
        self.envelope_db = -120.0;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn name(&self) -> &str {
        "Compressor"
    }
}
