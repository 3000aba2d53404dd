use clap::{Parser, Subcommand};
use gallery_audio::engine::export::{ExportSettings, ProgressCallback, ScheduledNote, WavExporter, score_length};
use gallery_audio::midi::pitch::{note_name, note_number_to_frequency, parse_note_name};
use gallery_audio::peer::signal::{SignalMessage, SignalingRelay};
use gallery_audio::{
    EngineConfig, EngineEvent, MemoryNetwork, NoteEvent, PeerError, SoundEngine,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// Host loop period for live commands
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// Gallery Audio - sound engine for virtual instruments
#[derive(Parser, Debug)]
#[command(name = "gallery-audio")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Engine configuration (RON). Defaults to the user config file when present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List MIDI ports
    Devices,

    /// Play a short phrase on the output device, then listen to MIDI keys
    Play {
        #[arg(short, long, default_value = "piano")]
        instrument: String,

        /// Seconds to keep listening to MIDI input
        #[arg(short, long, default_value_t = 5.0)]
        listen: f64,
    },

    /// Render a phrase offline to a WAV file
    Render {
        output: PathBuf,

        #[arg(short, long, default_value = "piano")]
        instrument: String,

        #[arg(short, long, default_value_t = 44_100)]
        sample_rate: u32,

        /// 16, 24 or 32 (float)
        #[arg(short, long, default_value_t = 16)]
        bits: u16,
    },

    /// Two engines jamming over the in-memory peer transport
    Jam {
        #[arg(short, long, default_value_t = 8)]
        notes: usize,
    },

    /// Print the configuration, or write it with --write
    Config {
        #[arg(short, long)]
        write: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gallery_audio=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Could not load configuration");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Devices => list_devices(config),
        Commands::Play { instrument, listen } => play(config, &instrument, listen),
        Commands::Render {
            output,
            instrument,
            sample_rate,
            bits,
        } => render(config, &output, &instrument, sample_rate, bits),
        Commands::Jam { notes } => jam(config, notes),
        Commands::Config { write } => show_config(&config, write),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn load_config(path: Option<&Path>) -> Result<EngineConfig, gallery_audio::config::ConfigError> {
    if let Some(path) = path {
        return EngineConfig::load(path);
    }
    match EngineConfig::default_path() {
        Some(path) if path.exists() => EngineConfig::load(&path),
        _ => Ok(EngineConfig::default()),
    }
}

/// C major arpeggio up and down from middle C
fn phrase(instrument: &str) -> Vec<ScheduledNote> {
    ["C4", "E4", "G4", "C5", "G4", "E4", "C4"]
        .iter()
        .filter_map(|name| parse_note_name(name))
        .enumerate()
        .map(|(i, number)| {
            let event = NoteEvent::new(
                instrument,
                note_name(number),
                note_number_to_frequency(number) as f32,
                0.7,
            )
            .with_duration(Some(0.35));
            ScheduledNote::new(i as f64 * 0.4, event)
        })
        .collect()
}

fn list_devices(mut config: EngineConfig) -> CliResult {
    config.midi.enabled = true;
    config.midi.auto_connect = false;
    let mut engine = SoundEngine::new(config)?;
    let availability = engine.initialize();
    if availability.midi != Some(true) {
        println!("MIDI is not available on this system");
        return Ok(());
    }

    let devices = engine.midi_devices();
    if devices.is_empty() {
        println!("No MIDI ports found");
    }
    for device in devices {
        println!(
            "{:<6} {:<40} {:<16} {:?}",
            format!("{:?}", device.direction),
            device.name,
            device.manufacturer.as_deref().unwrap_or("-"),
            device.state
        );
    }
    Ok(())
}

fn play(config: EngineConfig, instrument: &str, listen: f64) -> CliResult {
    let mut engine = SoundEngine::new(config)?;
    engine
        .subscribe(|event| {
            if let EngineEvent::Notification { notification } = event {
                notification.log();
            }
        })
        .detach();

    let availability = engine.initialize();
    if availability.audio != Some(true) {
        return Err("audio output is unavailable".into());
    }
    engine.notify_gesture();

    let mut score = phrase(instrument).into_iter().peekable();
    let started = Instant::now();
    let end = score_length(&phrase(instrument)) + listen;

    while started.elapsed().as_secs_f64() < end {
        let now = started.elapsed().as_secs_f64();
        while let Some(note) = score.next_if(|note| note.at <= now) {
            engine.play_event(note.event)?;
        }
        engine.pump();
        std::thread::sleep(PUMP_INTERVAL);
    }

    let metrics = engine.performance();
    tracing::info!(
        latency_ms = metrics.output_latency_ms,
        cpu = metrics.cpu_percent,
        reverbs = metrics.cached_reverbs,
        "Session finished"
    );
    engine.dispose();
    Ok(())
}

fn render(mut config: EngineConfig, output: &Path, instrument: &str, sample_rate: u32, bits: u16) -> CliResult {
    config.audio = EngineConfig::offline(sample_rate).audio;
    config.midi.enabled = false;
    config.validate()?;

    let mut engine = SoundEngine::new(config)?;
    engine.initialize();

    let exporter = WavExporter::new(ExportSettings {
        output_path: output.to_path_buf(),
        bit_depth: bits,
        ..Default::default()
    });
    let progress: ProgressCallback = Box::new(|fraction: f32| tracing::debug!(progress = fraction, "Rendering"));
    let summary = exporter.export(&mut engine, &phrase(instrument), None, Some(progress))?;

    println!(
        "Wrote {} ({} frames, {} notes, peak {:.3})",
        summary.path.display(),
        summary.frames,
        summary.notes_played,
        summary.peak
    );
    Ok(())
}

type Mailbox = Arc<Mutex<Vec<SignalMessage>>>;

fn relay_into(mailbox: &Mailbox) -> Box<dyn SignalingRelay> {
    let mailbox = Arc::clone(mailbox);
    Box::new(move |message: SignalMessage| -> Result<(), PeerError> {
        mailbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
        Ok(())
    })
}

fn deliver(mailbox: &Mailbox, engine: &mut SoundEngine) {
    let messages: Vec<SignalMessage> = mailbox
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .drain(..)
        .collect();
    for message in messages {
        // Rejected signals are logged by the engine
        let _ = engine.handle_signal(message);
    }
}

fn jam(config: EngineConfig, notes: usize) -> CliResult {
    let network = MemoryNetwork::new();
    let engine_for = |id: &str| -> Result<SoundEngine, Box<dyn std::error::Error>> {
        let mut config = config.clone();
        config.audio = EngineConfig::offline(config.audio.sample_rate).audio;
        config.midi.enabled = false;
        config.peer.local_id = Some(id.to_string());
        let mut engine = SoundEngine::new(config)?;
        engine.initialize();
        Ok(engine)
    };

    let mut alice = engine_for("alice")?;
    let mut bob = engine_for("bob")?;
    let to_alice: Mailbox = Arc::default();
    let to_bob: Mailbox = Arc::default();
    alice.enable_webrtc(Box::new(network.factory()), relay_into(&to_bob));
    bob.enable_webrtc(Box::new(network.factory()), relay_into(&to_alice));

    let heard = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&heard);
    let _listener = bob.on_note_event(move |_, event| {
        if event.is_remote {
            sink.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(event.note.clone());
        }
    });

    alice.connect_peer("bob")?;
    let mut block = vec![0.0f32; 256];
    let mut step = |alice: &mut SoundEngine, bob: &mut SoundEngine| -> CliResult {
        deliver(&to_bob, bob);
        deliver(&to_alice, alice);
        alice.render(&mut block)?;
        alice.pump();
        bob.render(&mut block)?;
        bob.pump();
        Ok(())
    };

    for _ in 0..10 {
        step(&mut alice, &mut bob)?;
    }
    println!("alice peers: {:?}", alice.peers());

    for (i, score_note) in phrase("marimba").into_iter().cycle().take(notes).enumerate() {
        let event = score_note.event.with_user(Some(format!("alice-{i}")));
        alice.play_event(event)?;
        for _ in 0..4 {
            step(&mut alice, &mut bob)?;
        }
    }

    let heard = heard.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
    println!("bob heard {} of {} notes: {}", heard.len(), notes, heard.join(" "));
    alice.dispose();
    bob.dispose();
    Ok(())
}

fn show_config(config: &EngineConfig, write: bool) -> CliResult {
    if !write {
        println!("{}", config.to_ron_string()?);
        return Ok(());
    }
    let path = EngineConfig::default_path().ok_or("no configuration directory on this system")?;
    config.save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
