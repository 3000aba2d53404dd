// Note graph - Short-lived synthesis graph for one note
//
// oscillators -> per-oscillator gain -> EffectChain (filter, distortion,
// compressor) -> envelope gain (AudioParam) -> output gain -> dry to the
// master bus, wet send to the profile's reverb bus.
//
// Settings are snapshotted at build time: later setter calls never touch a
// note that already exists.

use super::effects::{Compressor, CompressorParams, Distortion, EffectChain, FilterEffect};
use super::envelope::{EnvelopePhase, EnvelopeSchedule};
use super::instrument::InstrumentProfile;
use super::oscillator::{Oscillator, SimpleOscillator};
use super::reverb::ReverbNode;
use crate::audio::parameters::AudioParam;
use crate::config::EngineSettings;
use crate::messaging::note::{NoteEvent, NoteId};
use std::sync::Arc;

pub struct NoteGraph {
    id: NoteId,
    instrument: String,
    oscillators: Vec<(SimpleOscillator, f32)>,
    /// 1 / sum of partial gains, keeps stacks from clipping
    stack_normalisation: f32,
    chain: EffectChain,
    gain: AudioParam,
    envelope: EnvelopeSchedule,
    output_gain: f32,
    wet_send: f32,
    reverb: Arc<ReverbNode>,
    sample_rate: f32,
}

impl NoteGraph {
    /// Build the graph and schedule its envelope starting at `start`
    pub fn build(
        id: NoteId,
        profile: &InstrumentProfile,
        event: &NoteEvent,
        reverb: Arc<ReverbNode>,
        settings: &EngineSettings,
        start: f64,
        sample_rate: f32,
    ) -> Self {
        let partials = profile.partials_within(settings.quality.partial_limit());
        let oscillators: Vec<(SimpleOscillator, f32)> = partials
            .iter()
            .map(|p| {
                (
                    SimpleOscillator::tuned(p.waveform, event.frequency * p.ratio, sample_rate),
                    p.gain,
                )
            })
            .collect();
        let gain_sum: f32 = oscillators.iter().map(|(_, g)| g).sum();

        let mut chain = EffectChain::with_capacity(3);
        chain.add_effect(Box::new(FilterEffect::new(profile.filter, sample_rate)));
        if profile.distortion > 0.0 {
            chain.add_effect(Box::new(Distortion::new(profile.distortion)));
        }
        if profile.compression {
            chain.add_effect(Box::new(Compressor::new(CompressorParams::default(), sample_rate)));
        }

        let mut gain = AudioParam::new(0.0);
        let envelope = EnvelopeSchedule::schedule(
            &mut gain,
            &profile.envelope,
            event.velocity,
            start,
            event.duration,
        );

        let wet_send = (settings.reverb_level * profile.reverb_mix * reverb.profile().wet).clamp(0.0, 1.0);

        Self {
            id,
            instrument: profile.id.clone(),
            oscillators,
            stack_normalisation: if gain_sum > 1.0 { 1.0 / gain_sum } else { 1.0 },
            chain,
            gain,
            envelope,
            output_gain: settings.master_volume.clamp(0.0, 1.0),
            wet_send,
            reverb,
            sample_rate,
        }
    }

    pub fn id(&self) -> NoteId {
        self.id
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn reverb(&self) -> &Arc<ReverbNode> {
        &self.reverb
    }

    pub fn envelope(&self) -> &EnvelopeSchedule {
        &self.envelope
    }

    pub fn gain(&self) -> &AudioParam {
        &self.gain
    }

    pub fn oscillator_count(&self) -> usize {
        self.oscillators.len()
    }

    pub fn effect_names(&self) -> Vec<&str> {
        self.chain.names()
    }

    pub fn output_gain(&self) -> f32 {
        self.output_gain
    }

    pub fn wet_send(&self) -> f32 {
        self.wet_send
    }

    pub fn phase_at(&self, time: f64) -> EnvelopePhase {
        self.envelope.phase_at(time)
    }

    pub fn is_finished(&self, time: f64) -> bool {
        self.phase_at(time) == EnvelopePhase::Disposed
    }

    /// Fast release from wherever the envelope is at `at`; returns the end time
    pub fn release(&mut self, at: f64, release_time: f64) -> f64 {
        self.envelope.release(&mut self.gain, at, release_time)
    }

    /// Add this note's output for the block starting at `start_time`
    pub fn render(&mut self, dry: &mut [f32], wet: &mut [f32], start_time: f64) {
        if self.is_finished(start_time) {
            return;
        }
        let dt = 1.0 / self.sample_rate as f64;

        for (i, (dry_out, wet_out)) in dry.iter_mut().zip(wet.iter_mut()).enumerate() {
            let mut mix = 0.0;
            for (osc, gain) in self.oscillators.iter_mut() {
                mix += osc.next_sample() * *gain;
            }
            let shaped = self.chain.process(mix * self.stack_normalisation);

            let envelope = self.gain.value_at(start_time + i as f64 * dt);
            let sample = shaped * envelope * self.output_gain;
            *dry_out += sample;
            *wet_out += sample * self.wet_send;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityTier;
    use crate::synth::instrument::InstrumentTable;
    use crate::synth::reverb::ReverbProfile;

    const SAMPLE_RATE: f32 = 48000.0;

    fn build(instrument: &str, settings: EngineSettings, duration: Option<f64>) -> NoteGraph {
        let table = InstrumentTable::with_builtins();
        let profile = table.resolve(instrument);
        let reverb = Arc::new(ReverbNode::new(ReverbProfile::resolve(&profile.reverb), SAMPLE_RATE, 0.1));
        let event = NoteEvent::new(instrument, "A4", 440.0, 0.8).with_duration(duration);
        NoteGraph::build(NoteId::new(), profile, &event, reverb, &settings, 0.0, SAMPLE_RATE)
    }

    #[test]
    fn test_quality_limits_partials() {
        let low = EngineSettings {
            quality: QualityTier::Low,
            ..Default::default()
        };
        let high = EngineSettings {
            quality: QualityTier::High,
            ..Default::default()
        };
        assert_eq!(build("organ", low, None).oscillator_count(), 1);
        assert_eq!(build("organ", EngineSettings::default(), None).oscillator_count(), 3);
        assert_eq!(build("organ", high, None).oscillator_count(), 5);
    }

    #[test]
    fn test_effect_chain_depends_on_profile() {
        let settings = EngineSettings::default();
        assert_eq!(build("flute", settings, None).effect_names(), vec!["Filter"]);
        assert_eq!(
            build("synth-lead", settings, None).effect_names(),
            vec!["Filter", "Distortion", "Compressor"]
        );
        assert_eq!(build("bass", settings, None).effect_names(), vec!["Filter", "Compressor"]);
    }

    #[test]
    fn test_settings_snapshot() {
        let settings = EngineSettings {
            master_volume: 0.5,
            reverb_level: 0.0,
            ..Default::default()
        };
        let note = build("piano", settings, None);
        assert_eq!(note.output_gain(), 0.5);
        assert_eq!(note.wet_send(), 0.0);
    }

    #[test]
    fn test_render_produces_bounded_audio() {
        let mut note = build("piano", EngineSettings::default(), None);
        let mut dry = vec![0.0; 4800];
        let mut wet = vec![0.0; 4800];
        note.render(&mut dry, &mut wet, 0.0);

        assert_eq!(dry[0], 0.0);
        let peak = dry.iter().fold(0.0f32, |m, x| m.max(x.abs()));
        assert!(peak > 0.01, "note should be audible: {}", peak);
        assert!(peak <= 1.0);
        assert!(wet.iter().zip(&dry).all(|(w, d)| w.abs() <= d.abs() + 1e-6));
    }

    #[test]
    fn test_release_silences_and_finishes() {
        let mut note = build("organ", EngineSettings::default(), None);
        assert_eq!(note.phase_at(1.0), EnvelopePhase::Sustain);
        let end = note.release(1.0, 0.08);
        assert!(note.is_finished(end));

        let mut dry = vec![0.0; 480];
        let mut wet = vec![0.0; 480];
        note.render(&mut dry, &mut wet, end + 0.01);
        assert!(dry.iter().all(|x| *x == 0.0));
    }
}
