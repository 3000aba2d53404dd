// ADSR Envelope - scheduled onto a gain timeline
//
// The envelope is not computed per sample. At note creation it writes its
// whole shape (attack, decay, optional release) as automation events on the
// note's gain AudioParam; a stop cancels the pending events and writes a
// short release from wherever the gain currently is.
//
// Idle -> Attack -> Decay -> Sustain (optional) -> Release -> Disposed

use crate::audio::parameters::AudioParam;
use serde::{Deserialize, Serialize};

/// Exponential ramps cannot reach zero; releases stop here and then snap to 0
pub const ENVELOPE_FLOOR: f32 = 1e-3;

/// ADSR Envelope parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdsrParams {
    /// Attack time in seconds (0.001 to 5.0)
    pub attack: f32,
    /// Decay time in seconds (0.001 to 5.0)
    pub decay: f32,
    /// Sustain level relative to the peak (0.0 to 1.0)
    pub sustain: f32,
    /// Release time in seconds (0.001 to 5.0)
    pub release: f32,
}

impl AdsrParams {
    /// Create ADSR parameters with validation
    pub fn new(attack: f32, decay: f32, sustain: f32, release: f32) -> Self {
        Self {
            attack: attack.clamp(0.001, 5.0),
            decay: decay.clamp(0.001, 5.0),
            sustain: sustain.clamp(0.0, 1.0),
            release: release.clamp(0.001, 5.0),
        }
    }

    /// Percussive envelopes die out during decay and never sustain
    pub fn is_percussive(&self) -> bool {
        self.sustain <= ENVELOPE_FLOOR
    }

    /// Attack + decay + release
    pub fn natural_length(&self) -> f64 {
        (self.attack + self.decay + self.release) as f64
    }
}

impl Default for AdsrParams {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.1,
            sustain: 0.7,
            release: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopePhase {
    /// Not started yet
    Idle,
    /// Linear rise to the velocity peak
    Attack,
    /// Exponential approach to the sustain level
    Decay,
    /// Holding until stopped
    Sustain,
    /// Exponential fall to the floor
    Release,
    /// Silent, graph can be torn down
    Disposed,
}

/// Boundaries of one scheduled envelope on the shared clock
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeSchedule {
    start: f64,
    attack_end: f64,
    decay_end: f64,
    release_start: Option<f64>,
    end: Option<f64>,
    peak: f32,
    sustain_level: f32,
}

impl EnvelopeSchedule {
    /// Write the envelope onto `gain`
    ///
    /// Without a duration the note holds at its sustain level until
    /// `release` is called (percussive profiles release right after decay).
    /// With a duration, release starts `duration` seconds after `start`.
    pub fn schedule(
        gain: &mut AudioParam,
        params: &AdsrParams,
        velocity: f32,
        start: f64,
        duration: Option<f64>,
    ) -> Self {
        let velocity = velocity.clamp(0.0, 1.0);
        let attack_end = start + params.attack as f64;
        let decay_end = attack_end + params.decay as f64;
        let sustain_level = (velocity * params.sustain).max(ENVELOPE_FLOOR.min(velocity));

        gain.cancel_scheduled_values(start);
        gain.set_value_at_time(0.0, start);
        gain.linear_ramp_to_value_at_time(velocity, attack_end);
        gain.exponential_ramp_to_value_at_time(sustain_level, decay_end);

        let mut schedule = Self {
            start,
            attack_end,
            decay_end,
            release_start: None,
            end: None,
            peak: velocity,
            sustain_level,
        };

        let release_at = match duration {
            Some(duration) => Some(start + duration.max(0.0)),
            None if params.is_percussive() => Some(decay_end),
            None => None,
        };
        if let Some(at) = release_at {
            schedule.release(gain, at, params.release as f64);
        }

        schedule
    }

    /// Move into release at `at`, falling to the floor over `release_time`
    ///
    /// Pending ramps are cancelled first and the release starts from the gain
    /// the timeline holds at `at`, so there is no discontinuity. A release
    /// already in flight that ends sooner is kept. Returns the end time.
    pub fn release(&mut self, gain: &mut AudioParam, at: f64, release_time: f64) -> f64 {
        let release_time = release_time.max(0.001);
        if let (Some(started), Some(end)) = (self.release_start, self.end)
            && started <= at
            && end <= at + release_time
        {
            return end;
        }

        let at = at.max(self.start);
        let held = gain.cancel_and_hold_at_time(at);
        let end = at + release_time;
        if held > ENVELOPE_FLOOR {
            gain.exponential_ramp_to_value_at_time(ENVELOPE_FLOOR, end);
        }
        gain.set_value_at_time(0.0, end);

        self.release_start = Some(at);
        self.end = Some(end);
        end
    }

    pub fn phase_at(&self, time: f64) -> EnvelopePhase {
        if time < self.start {
            return EnvelopePhase::Idle;
        }
        if let Some(end) = self.end
            && time >= end
        {
            return EnvelopePhase::Disposed;
        }
        if let Some(release_start) = self.release_start
            && time >= release_start
        {
            return EnvelopePhase::Release;
        }
        if time < self.attack_end {
            EnvelopePhase::Attack
        } else if time < self.decay_end {
            EnvelopePhase::Decay
        } else {
            EnvelopePhase::Sustain
        }
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn attack_end(&self) -> f64 {
        self.attack_end
    }

    pub fn decay_end(&self) -> f64 {
        self.decay_end
    }

    pub fn release_start(&self) -> Option<f64> {
        self.release_start
    }

    /// Time at which the gain reaches zero, if a release is scheduled
    pub fn end(&self) -> Option<f64> {
        self.end
    }

    pub fn peak(&self) -> f32 {
        self.peak
    }

    pub fn sustain_level(&self) -> f32 {
        self.sustain_level
    }
}
