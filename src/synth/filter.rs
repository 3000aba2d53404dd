// Filter - State Variable Filter (Chamberlin) used as the per-note tone filter
//
// 2-pole, 12dB/octave, simultaneous LP/HP/BP/Notch outputs.
// Stable up to ~Fs/6, so the cutoff is clamped there.
//
// Reference: Hal Chamberlin, "Musical Applications of Microprocessors" (1985)

use crate::audio::dsp_utils::flush_denormals_to_zero;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterType {
    #[default]
    LowPass,
    HighPass,
    BandPass,
    Notch,
}

/// Tone filter parameters, part of an instrument profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    /// Cutoff frequency in Hz
    pub cutoff: f32,
    /// Resonance as a Q factor (0.5 - 20.0)
    pub resonance: f32,
    #[serde(default)]
    pub filter_type: FilterType,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            cutoff: 4000.0,
            resonance: 0.707,
            filter_type: FilterType::LowPass,
        }
    }
}

impl FilterParams {
    pub fn lowpass(cutoff: f32, resonance: f32) -> Self {
        Self {
            cutoff,
            resonance,
            filter_type: FilterType::LowPass,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateVariableFilter {
    params: FilterParams,
    sample_rate: f32,

    low: f32,
    band: f32,

    /// Frequency coefficient: 2 * sin(pi * fc / Fs)
    f: f32,
    /// Damping: 1 / Q
    q: f32,
}

impl StateVariableFilter {
    pub fn new(params: FilterParams, sample_rate: f32) -> Self {
        let mut filter = Self {
            params,
            sample_rate,
            low: 0.0,
            band: 0.0,
            f: 0.0,
            q: 0.0,
        };
        filter.update_coefficients();
        filter
    }

    pub fn params(&self) -> FilterParams {
        self.params
    }

    /// Effective cutoff after the stability clamp
    pub fn effective_cutoff(&self) -> f32 {
        self.params.cutoff.clamp(20.0, self.sample_rate / 6.0)
    }

    fn update_coefficients(&mut self) {
        let cutoff = self.effective_cutoff();
        self.f = 2.0 * (PI * cutoff / self.sample_rate).sin();
        let q_factor = self.params.resonance.clamp(0.5, 20.0);
        self.q = (1.0 / q_factor).clamp(0.01, 2.0);
    }

    pub fn reset(&mut self) {
        self.low = 0.0;
        self.band = 0.0;
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let high = input - self.low - self.q * self.band;
        self.band = flush_denormals_to_zero(self.band + self.f * high);
        self.low = flush_denormals_to_zero(self.low + self.f * self.band);

        match self.params.filter_type {
            FilterType::LowPass => self.low,
            FilterType::HighPass => high,
            FilterType::BandPass => self.band,
            FilterType::Notch => input - self.q * self.band,
        }
    }
}
