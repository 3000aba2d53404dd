// Output stream - cpal device output driving a MixGraph
//
// cpal streams are not Send on every platform (CoreAudio), so the stream is
// built, played and dropped on one dedicated thread. The owner talks to that
// thread over a control channel; the thread reports the negotiated device
// configuration back once before entering its loop.
//
// # Format Support
// The graph renders mono f32. The callback converts to the device sample
// format (f32 / i16 / u16) and duplicates into every channel.

use super::AudioError;
use super::bus::MixGraph;
use super::clock::AudioClock;
use super::metrics::CpuMonitor;
use crate::config::LatencyPreference;
use crate::connection::status::{AtomicDeviceStatus, DeviceStatus};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Largest block rendered in one pass; longer callbacks are split
const MAX_RENDER_FRAMES: usize = 4096;

/// What the render callback needs from the context
#[derive(Clone)]
pub struct RenderTarget {
    pub graph: Arc<Mutex<MixGraph>>,
    pub clock: AudioClock,
    /// False while the context is suspended or closed
    pub running: Arc<AtomicBool>,
    pub monitor: CpuMonitor,
}

/// Negotiated device configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceInfo {
    pub sample_rate: f32,
    pub channels: usize,
    pub buffer_frames: u32,
}

enum StreamControl {
    Play,
    Pause,
    Close,
}

pub struct OutputStream {
    control: mpsc::Sender<StreamControl>,
    thread: Option<JoinHandle<()>>,
    info: DeviceInfo,
    status: AtomicDeviceStatus,
}

impl OutputStream {
    /// Open the default output device
    ///
    /// `make_target` runs once the device sample rate is known and builds the
    /// graph/clock the callback renders from.
    pub fn open<F>(latency: LatencyPreference, make_target: F) -> Result<(Self, RenderTarget), AudioError>
    where
        F: FnOnce(f32) -> RenderTarget + Send + 'static,
    {
        let (control_tx, control_rx) = mpsc::channel::<StreamControl>();
        let (init_tx, init_rx) = mpsc::channel::<Result<(DeviceInfo, RenderTarget), AudioError>>();
        let status = AtomicDeviceStatus::new(DeviceStatus::Connecting);
        let thread_status = status.clone();

        let thread = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let built = build_device_stream(latency, make_target, thread_status.clone());
                let stream = match built {
                    Ok((stream, info, target)) => {
                        let _ = init_tx.send(Ok((info, target)));
                        stream
                    }
                    Err(err) => {
                        thread_status.set(DeviceStatus::Error);
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };

                while let Ok(message) = control_rx.recv() {
                    let result = match message {
                        StreamControl::Play => stream.play().map_err(|e| e.to_string()),
                        StreamControl::Pause => stream.pause().map_err(|e| e.to_string()),
                        StreamControl::Close => break,
                    };
                    if let Err(err) = result {
                        tracing::warn!(error = %err, "Audio stream control failed");
                    }
                }
                thread_status.set(DeviceStatus::Disconnected);
                tracing::debug!("Audio output thread exiting");
            })
            .map_err(|e| AudioError::Stream(format!("Failed to spawn audio thread: {}", e)))?;

        let (info, target) = init_rx
            .recv()
            .map_err(|_| AudioError::Stream("Audio thread exited during setup".to_string()))??;

        tracing::info!(
            sample_rate = info.sample_rate,
            channels = info.channels,
            buffer_frames = info.buffer_frames,
            "Audio output started"
        );

        Ok((
            Self {
                control: control_tx,
                thread: Some(thread),
                info,
                status,
            },
            target,
        ))
    }

    pub fn info(&self) -> DeviceInfo {
        self.info
    }

    pub fn status(&self) -> DeviceStatus {
        self.status.get()
    }

    pub fn play(&self) {
        let _ = self.control.send(StreamControl::Play);
    }

    pub fn pause(&self) {
        let _ = self.control.send(StreamControl::Pause);
    }

    pub fn close(&mut self) {
        let _ = self.control.send(StreamControl::Close);
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            tracing::error!("Audio output thread panicked");
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_device_stream<F>(
    latency: LatencyPreference,
    make_target: F,
    status: AtomicDeviceStatus,
) -> Result<(Stream, DeviceInfo, RenderTarget), AudioError>
where
    F: FnOnce(f32) -> RenderTarget,
{
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;

    tracing::debug!(
        device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
        "Opening audio device"
    );

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::Config(e.to_string()))?;
    let sample_format = supported.sample_format();
    let sample_rate = supported.sample_rate().0 as f32;
    let channels = supported.channels() as usize;

    let mut config: StreamConfig = supported.into();
    let buffer_frames = latency.buffer_frames();
    config.buffer_size = cpal::BufferSize::Fixed(buffer_frames);

    let target = make_target(sample_rate);

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, channels, target.clone(), status.clone()),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, channels, target.clone(), status.clone()),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, channels, target.clone(), status.clone()),
        other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }
    .or_else(|err| {
        // Some backends reject fixed buffer sizes; retry with the device default
        tracing::debug!(error = %err, "Fixed buffer size rejected, using device default");
        config.buffer_size = cpal::BufferSize::Default;
        match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, channels, target.clone(), status.clone()),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, channels, target.clone(), status.clone()),
            _ => build_stream::<u16>(&device, &config, channels, target.clone(), status.clone()),
        }
    })?;

    stream
        .play()
        .map_err(|e| AudioError::Stream(format!("Failed to start stream: {}", e)))?;
    status.set(DeviceStatus::Connected);

    Ok((
        stream,
        DeviceInfo {
            sample_rate,
            channels,
            buffer_frames,
        },
        target,
    ))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    target: RenderTarget,
    status: AtomicDeviceStatus,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let mut mono = vec![0.0f32; MAX_RENDER_FRAMES];
    let channels = channels.max(1);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                // No allocations, no blocking locks past this point
                let measure = target.monitor.start_measure();
                let total_frames = data.len() / channels;

                for chunk in data.chunks_mut(MAX_RENDER_FRAMES * channels) {
                    let frames = chunk.len() / channels;
                    let block = &mut mono[..frames];

                    if target.running.load(Ordering::Acquire) {
                        match target.graph.try_lock() {
                            Ok(mut graph) => graph.render(block, target.clock.now()),
                            Err(_) => block.fill(0.0),
                        }
                        target.clock.advance(frames);
                    } else {
                        block.fill(0.0);
                    }

                    for (frame, sample) in chunk.chunks_mut(channels).zip(block.iter()) {
                        write_mono_frame(*sample, frame);
                    }
                }

                target.monitor.end_measure(measure, total_frames);
            },
            move |err| {
                tracing::error!(error = %err, "Audio stream error");
                status.set(DeviceStatus::Error);
            },
            None,
        )
        .map_err(|e| AudioError::Stream(format!("Failed to build stream: {}", e)))
}

/// Duplicate one mono sample into every channel of an interleaved frame
#[inline]
fn write_mono_frame<T>(sample: f32, frame: &mut [T])
where
    T: Sample + FromSample<f32>,
{
    let converted: T = T::from_sample(sample);
    for slot in frame.iter_mut() {
        *slot = converted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_mono_frame_f32() {
        let mut frame = [0.0f32; 2];
        write_mono_frame(0.5, &mut frame);
        assert_eq!(frame, [0.5, 0.5]);
    }

    #[test]
    fn test_write_mono_frame_i16() {
        let mut frame = [0i16; 2];
        write_mono_frame(1.0, &mut frame);
        assert_eq!(frame, [i16::MAX, i16::MAX]);
        write_mono_frame(0.0, &mut frame);
        assert_eq!(frame, [0, 0]);
    }

    #[test]
    fn test_write_mono_frame_u16_offset_binary() {
        let mut frame = [0u16; 1];
        write_mono_frame(0.0, &mut frame);
        assert_eq!(frame[0], 32768);
    }
}
