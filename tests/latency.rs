// Integration test: Onset and stop latency, measured in rendered samples
//
// Target: a note is audible in the first block after play_note, and a
// stopped note is silent within its fast-release window whatever envelope
// phase it was in.

use gallery_audio::config::LatencyPreference;
use gallery_audio::{EngineConfig, SoundEngine};
use std::time::Instant;

const SAMPLE_RATE: u32 = 8000;
// 10 ms blocks
const BLOCK: usize = 80;

fn dry_engine() -> SoundEngine {
    let mut config = EngineConfig::offline(SAMPLE_RATE);
    // No reverb tail, so silence after a stop is exact
    config.settings.reverb_level = 0.0;
    let mut engine = SoundEngine::new(config).unwrap();
    engine.initialize();
    engine
}

fn render(engine: &mut SoundEngine, seconds: f64) -> Vec<f32> {
    let mut out = Vec::new();
    let mut block = vec![0.0f32; BLOCK];
    for _ in 0..(seconds * SAMPLE_RATE as f64 / BLOCK as f64).round() as usize {
        engine.render(&mut block).unwrap();
        engine.pump();
        out.extend_from_slice(&block);
    }
    out
}

fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |p, s| p.max(s.abs()))
}

#[test]
fn test_note_is_audible_in_first_block() {
    let mut engine = dry_engine();
    engine.play_note("organ", "A4", 440.0, 0.8, None, None).unwrap();
    let first = render(&mut engine, 0.01);
    assert!(peak(&first) > 0.0, "first block is silent");
}

#[test]
fn test_stop_silences_within_fast_release_in_every_phase() {
    // Piano: 5 ms attack, 0.8 s decay, then sustain
    for stop_after in [0.0, 0.3, 1.0] {
        let mut engine = dry_engine();
        let id = engine.play_note("piano", "A4", 440.0, 0.8, None, None).unwrap();
        render(&mut engine, stop_after);

        assert!(engine.stop_note(id), "note already gone after {stop_after}s");
        let after = render(&mut engine, 0.3);

        let window = (0.1 * SAMPLE_RATE as f64) as usize;
        assert!(
            peak(&after[window..]) < 1e-4,
            "still sounding {stop_after}s in: {}",
            peak(&after[window..])
        );
        assert_eq!(engine.active_notes(), 0);
    }
}

#[test]
fn test_play_note_processing_time() {
    let mut engine = dry_engine();
    // Warm the reverb cache; impulse synthesis happens once per profile
    engine.play_note("piano", "A4", 440.0, 0.5, Some(0.1), None).unwrap();

    let start = Instant::now();
    for i in 0..16 {
        engine
            .play_note("piano", "A4", 440.0 + i as f32, 0.5, Some(0.1), None)
            .unwrap();
    }
    let elapsed = start.elapsed();
    println!("16 note attacks: {elapsed:?}");
    assert!(elapsed.as_millis() < 500, "attacks took {elapsed:?}");
}

#[test]
fn test_latency_preferences() {
    let at_48k = |frames: u32| frames as f32 / 48_000.0 * 1000.0;
    println!("\nLatency by preference:");
    for preference in [
        LatencyPreference::Interactive,
        LatencyPreference::Balanced,
        LatencyPreference::Playback,
    ] {
        println!("  {:?} = {:.2}ms", preference, at_48k(preference.buffer_frames()));
    }

    assert!(at_48k(LatencyPreference::Interactive.buffer_frames()) <= 11.0);
    assert!(LatencyPreference::Interactive.buffer_frames() < LatencyPreference::Balanced.buffer_frames());
    assert!(LatencyPreference::Balanced.buffer_frames() < LatencyPreference::Playback.buffer_frames());

    let engine = dry_engine();
    let reported = engine.performance().output_latency_ms;
    assert!(reported > 0.0 && reported < 100.0, "reported {reported}ms");
}
