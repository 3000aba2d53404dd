// Integration test for engine configuration persistence
// Tests the complete save/load cycle and what the engine does with the result

use gallery_audio::config::{ConfigError, LatencyPreference, QualityTier};
use gallery_audio::synth::instrument::InstrumentTable;
use gallery_audio::{EngineConfig, SoundEngine};
use tempfile::TempDir;

#[test]
fn test_complete_config_persistence() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("engine.ron");

    let mut config = EngineConfig::offline(22050);
    config.settings.master_volume = 0.6;
    config.settings.reverb_level = 0.15;
    config.settings.latency = LatencyPreference::Balanced;
    config.settings.quality = QualityTier::Low;
    config.resources.max_impulse_responses = 4;
    config.peer.local_id = Some("gallery-a".to_string());
    config.midi.default_instrument = "organ".to_string();

    let mut bells = InstrumentTable::with_builtins().resolve("bells").clone();
    bells.id = "temple-bells".to_string();
    config.instruments.push(bells);

    // Parent directories are created on save
    config.save(&path).unwrap();
    assert!(path.exists());

    let loaded = EngineConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
    assert_eq!(loaded.instruments[0].id, "temple-bells");

    // The loaded configuration drives a working engine
    let mut engine = SoundEngine::new(loaded).unwrap();
    engine.initialize();
    assert_eq!(engine.local_peer_id(), "gallery-a");
    assert_eq!(engine.settings().latency, LatencyPreference::Balanced);
    engine
        .play_note("temple-bells", "C5", 523.25, 0.7, Some(0.2), None)
        .unwrap();
    assert_eq!(engine.active_notes(), 1);
}

#[test]
fn test_hand_written_config_fills_defaults() {
    let source = r#"(
        audio: (backend: Offline, sample_rate: 16000, require_gesture: false),
        midi: (enabled: false),
        peer: (remote_hold_secs: 2.5),
    )"#;
    let config = EngineConfig::from_ron_str(source).unwrap();

    assert_eq!(config.audio.sample_rate, 16000);
    assert_eq!(config.audio.render_quantum, 128);
    assert_eq!(config.peer.remote_hold_secs, 2.5);
    assert_eq!(config.resources.sweep_interval_secs, 30.0);
    assert_eq!(config.midi.default_instrument, "piano");
    assert!(config.instruments.is_empty());
}

#[test]
fn test_load_errors() {
    let temp_dir = TempDir::new().unwrap();

    let missing = EngineConfig::load(&temp_dir.path().join("absent.ron"));
    assert!(matches!(missing, Err(ConfigError::Io(_))));

    let garbled = temp_dir.path().join("garbled.ron");
    std::fs::write(&garbled, "(audio: (sample_rate: \"fast\"").unwrap();
    assert!(matches!(EngineConfig::load(&garbled), Err(ConfigError::Parse(_))));

    let out_of_range = temp_dir.path().join("loud.ron");
    std::fs::write(&out_of_range, "(settings: (master_volume: 1.5, reverb_level: 0.2))").unwrap();
    assert!(matches!(
        EngineConfig::load(&out_of_range),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn test_validation_rejects_degenerate_values() {
    let cases: Vec<Box<dyn Fn(&mut EngineConfig)>> = vec![
        Box::new(|c| c.audio.sample_rate = 1000),
        Box::new(|c| c.audio.render_quantum = 0),
        Box::new(|c| c.settings.reverb_level = -0.1),
        Box::new(|c| c.resources.max_impulse_responses = 0),
        Box::new(|c| c.resources.sweep_interval_secs = 0.0),
        Box::new(|c| c.resources.sweep_interval_secs = f64::NAN),
        Box::new(|c| c.resources.max_note_lifetime_secs = f64::INFINITY),
        Box::new(|c| c.resources.idle_threshold_secs = c.resources.max_note_lifetime_secs),
        Box::new(|c| c.resources.max_note_lifetime_secs = 59.95),
        Box::new(|c| c.resources.fast_release_secs = 5.0),
        Box::new(|c| c.peer.remote_hold_secs = 0.0),
        Box::new(|c| c.metrics_interval_secs = -1.0),
        Box::new(|c| {
            let mut silent = InstrumentTable::with_builtins().resolve("piano").clone();
            silent.partials.clear();
            c.instruments.push(silent);
        }),
    ];

    for (i, mutate) in cases.iter().enumerate() {
        let mut config = EngineConfig::offline(8000);
        mutate(&mut config);
        assert!(
            matches!(config.validate(), Err(ConfigError::Invalid(_))),
            "case {i} was accepted"
        );
    }
}

#[test]
fn test_default_path_location() {
    if let Some(path) = EngineConfig::default_path() {
        assert!(path.ends_with("gallery-audio/engine.ron"));
    }
}
