// Audio Export - Offline rendering of a note score to WAV
//
// Drives an offline SoundEngine as fast as possible: notes are started at
// block boundaries, each block is rendered then pump() runs, exactly like a
// host loop would.

use super::{EngineError, SoundEngine};
use crate::messaging::note::NoteEvent;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::{Path, PathBuf};

/// Silence kept after the last note so releases and reverb tails land in the file
const DEFAULT_TAIL_SECS: f64 = 2.0;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to write WAV file: {0}")]
    Wav(#[from] hound::Error),

    #[error("Invalid duration {0}s: must be > 0")]
    InvalidDuration(f64),

    #[error("Unsupported bit depth {0} (16, 24 or 32)")]
    UnsupportedBitDepth(u16),
}

/// A note to start `at` seconds into the render
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledNote {
    pub at: f64,
    pub event: NoteEvent,
}

impl ScheduledNote {
    pub fn new(at: f64, event: NoteEvent) -> Self {
        Self { at, event }
    }
}

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub output_path: PathBuf,
    /// 16 or 24 bit integer, 32 bit float
    pub bit_depth: u16,
    /// Mono render, duplicated when 2
    pub channels: u16,
    pub block_frames: usize,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("export.wav"),
            bit_depth: 16,
            channels: 2,
            block_frames: 128,
        }
    }
}

/// Progress callback for export (reports 0.0 to 1.0)
pub type ProgressCallback = Box<dyn FnMut(f32) + Send>;

#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub frames: usize,
    pub notes_played: usize,
    pub notes_rejected: usize,
    pub peak: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rendered {
    pub samples: Vec<f32>,
    pub notes_played: usize,
    pub notes_rejected: usize,
}

impl Rendered {
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }
}

/// Length covering every note plus the tail
pub fn score_length(score: &[ScheduledNote]) -> f64 {
    score
        .iter()
        .map(|note| note.at + note.event.duration.unwrap_or(0.0))
        .fold(0.0, f64::max)
        + DEFAULT_TAIL_SECS
}

/// Render a score into memory
pub fn render_score(
    engine: &mut SoundEngine,
    score: &[ScheduledNote],
    duration_secs: f64,
    block_frames: usize,
    mut progress: Option<&mut ProgressCallback>,
) -> Result<Rendered, ExportError> {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return Err(ExportError::InvalidDuration(duration_secs));
    }

    let sample_rate = engine.config().audio.sample_rate as f64;
    let total_frames = (duration_secs * sample_rate) as usize;
    let block_frames = block_frames.max(1);

    let mut pending: Vec<&ScheduledNote> = score.iter().collect();
    pending.sort_by(|a, b| a.at.total_cmp(&b.at));
    let mut pending = pending.into_iter().peekable();

    let mut rendered = Rendered {
        samples: Vec::with_capacity(total_frames),
        ..Default::default()
    };
    let mut block = vec![0.0f32; block_frames];
    let progress_every = sample_rate as usize;
    let mut since_progress = 0;

    while rendered.samples.len() < total_frames {
        let now = rendered.samples.len() as f64 / sample_rate;
        while let Some(note) = pending.next_if(|note| note.at <= now) {
            match engine.play_event(note.event.clone()) {
                Ok(_) => rendered.notes_played += 1,
                Err(e) => {
                    tracing::warn!(at = note.at, error = %e, "Score note rejected");
                    rendered.notes_rejected += 1;
                }
            }
        }

        let frames = block_frames.min(total_frames - rendered.samples.len());
        engine.render(&mut block[..frames])?;
        engine.pump();
        rendered.samples.extend_from_slice(&block[..frames]);

        since_progress += frames;
        if since_progress >= progress_every {
            since_progress = 0;
            if let Some(callback) = progress.as_mut() {
                callback(rendered.samples.len() as f32 / total_frames as f32);
            }
        }
    }

    if let Some(callback) = progress.as_mut() {
        callback(1.0);
    }
    Ok(rendered)
}

/// WAV exporter - renders a score to a file
pub struct WavExporter {
    settings: ExportSettings,
}

impl WavExporter {
    pub fn new(settings: ExportSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    /// Render `score` and write it out; `duration_secs` None covers the whole score
    pub fn export(
        &self,
        engine: &mut SoundEngine,
        score: &[ScheduledNote],
        duration_secs: Option<f64>,
        mut progress: Option<ProgressCallback>,
    ) -> Result<ExportSummary, ExportError> {
        let (bits, format) = match self.settings.bit_depth {
            16 | 24 => (self.settings.bit_depth, SampleFormat::Int),
            32 => (32, SampleFormat::Float),
            other => return Err(ExportError::UnsupportedBitDepth(other)),
        };

        let duration = duration_secs.unwrap_or_else(|| score_length(score));
        let sample_rate = engine.config().audio.sample_rate;
        tracing::info!(
            duration,
            sample_rate,
            notes = score.len(),
            path = %self.settings.output_path.display(),
            "Exporting audio"
        );

        let rendered = render_score(engine, score, duration, self.settings.block_frames, progress.as_mut())?;

        let spec = WavSpec {
            channels: self.settings.channels.max(1),
            sample_rate,
            bits_per_sample: bits,
            sample_format: format,
        };
        write_wav(&self.settings.output_path, spec, &rendered.samples)?;

        Ok(ExportSummary {
            path: self.settings.output_path.clone(),
            frames: rendered.samples.len(),
            notes_played: rendered.notes_played,
            notes_rejected: rendered.notes_rejected,
            peak: rendered.peak(),
        })
    }
}

fn write_wav(path: &Path, spec: WavSpec, samples: &[f32]) -> Result<(), ExportError> {
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        let sample = sample.clamp(-1.0, 1.0);
        for _ in 0..spec.channels {
            match (spec.sample_format, spec.bits_per_sample) {
                (SampleFormat::Float, _) => writer.write_sample(sample)?,
                (SampleFormat::Int, 24) => writer.write_sample((sample * 8_388_607.0) as i32)?,
                (SampleFormat::Int, _) => writer.write_sample((sample * i16::MAX as f32) as i16)?,
            }
        }
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::tempdir;

    fn engine() -> SoundEngine {
        let mut engine = SoundEngine::new(EngineConfig::offline(8000)).unwrap();
        engine.initialize();
        engine
    }

    fn score() -> Vec<ScheduledNote> {
        vec![
            ScheduledNote::new(0.0, NoteEvent::new("piano", "C4", 261.63, 0.8).with_duration(Some(0.3))),
            ScheduledNote::new(0.25, NoteEvent::new("bells", "E5", 659.26, 0.6).with_duration(Some(0.2))),
        ]
    }

    #[test]
    fn test_score_length_includes_tail() {
        assert_eq!(score_length(&[]), DEFAULT_TAIL_SECS);
        assert!((score_length(&score()) - (0.45 + DEFAULT_TAIL_SECS)).abs() < 1e-9);
    }

    #[test]
    fn test_render_score_produces_sound() {
        let mut engine = engine();
        let rendered = render_score(&mut engine, &score(), 1.0, 128, None).unwrap();
        assert_eq!(rendered.samples.len(), 8000);
        assert_eq!(rendered.notes_played, 2);
        assert!(rendered.peak() > 0.0);
        assert!(rendered.peak() <= 1.0);
    }

    #[test]
    fn test_invalid_notes_are_counted_not_fatal() {
        let mut engine = engine();
        let score = vec![ScheduledNote::new(0.0, NoteEvent::new("piano", "??", -1.0, 0.5))];
        let rendered = render_score(&mut engine, &score, 0.1, 64, None).unwrap();
        assert_eq!(rendered.notes_rejected, 1);
        assert_eq!(rendered.peak(), 0.0);
    }

    #[test]
    fn test_invalid_duration() {
        let mut engine = engine();
        assert!(matches!(
            render_score(&mut engine, &[], 0.0, 128, None),
            Err(ExportError::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_export_wav_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jam.wav");
        let exporter = WavExporter::new(ExportSettings {
            output_path: path.clone(),
            ..Default::default()
        });

        let mut engine = engine();
        let summary = exporter.export(&mut engine, &score(), Some(0.5), None).unwrap();
        assert_eq!(summary.frames, 4000);

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.len(), 8000);
    }

    #[test]
    fn test_unsupported_bit_depth() {
        let exporter = WavExporter::new(ExportSettings {
            bit_depth: 12,
            ..Default::default()
        });
        let mut engine = engine();
        assert!(matches!(
            exporter.export(&mut engine, &[], Some(0.1), None),
            Err(ExportError::UnsupportedBitDepth(12))
        ));
    }
}
