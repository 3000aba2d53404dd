// MIDI Connection Manager - Hardware access, hot-plug monitoring, outbound control
//
// Hardware callbacks push normalised messages into a ring buffer that the
// engine drains on its tick. A monitor thread re-enumerates ports every
// `monitor_interval_ms`, mirrors them into the registry, queues the changes and
// opens newly plugged inputs when auto-connect is on.

use super::MidiError;
use super::device::{DeviceChange, DeviceRegistry, MidiDevice, PortDirection, PortState};
use super::event::{CC_ALL_NOTES_OFF, MidiMessage};
use crate::config::MidiConfig;
use crate::connection::reconnect::{BackoffPolicy, RetrySchedule, RetryStep};
use crate::connection::status::{AtomicDeviceStatus, DeviceStatus};
use crate::messaging::channels::{
    DeviceChangeConsumer, DeviceChangeProducer, MidiConsumer, MidiProducer, create_device_channel,
    create_midi_channel,
};
use midir::{Ignore, MidiInput as MidirInput, MidiInputConnection, MidiOutput as MidirOutput, MidiOutputConnection};
use ringbuf::traits::{Consumer, Producer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

const CLIENT_NAME: &str = "gallery-audio";
const MIDI_QUEUE_CAPACITY: usize = 1024;
const DEVICE_QUEUE_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable handle pushing messages into the engine's MIDI queue
///
/// Used by the hardware callbacks, and by software sources such as an
/// on-screen keyboard.
#[derive(Clone)]
pub struct MidiSender {
    producer: Arc<Mutex<MidiProducer>>,
    dropped: Arc<AtomicU64>,
}

impl MidiSender {
    /// Parse and enqueue a raw packet; false when ignored or the queue is full
    pub fn send_bytes(&self, bytes: &[u8], timestamp_us: u64) -> bool {
        match MidiMessage::parse(bytes, timestamp_us) {
            Some(message) => self.send(message),
            None => false,
        }
    }

    /// Never blocks: a contended or full queue drops the message
    pub fn send(&self, message: MidiMessage) -> bool {
        let pushed = match self.producer.try_lock() {
            Ok(mut tx) => tx.try_push(message).is_ok(),
            Err(_) => false,
        };
        if !pushed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        pushed
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Destination for outbound messages
pub trait MidiSink: Send {
    fn name(&self) -> &str;
    fn send(&mut self, bytes: &[u8]) -> Result<(), MidiError>;
}

struct HardwareOutput {
    name: String,
    connection: MidiOutputConnection,
}

impl MidiSink for HardwareOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), MidiError> {
        self.connection
            .send(bytes)
            .map_err(|e| MidiError::Send(format!("{}: {}", self.name, e)))
    }
}

/// State shared with the monitor thread
struct Shared {
    registry: Mutex<DeviceRegistry>,
    inputs: Mutex<HashMap<String, MidiInputConnection<()>>>,
    device_tx: Mutex<DeviceChangeProducer>,
    sender: MidiSender,
    status: AtomicDeviceStatus,
}

impl Shared {
    fn publish_changes(&self, changes: &[DeviceChange]) {
        let mut tx = lock(&self.device_tx);
        for change in changes {
            let device = change.device();
            match change {
                DeviceChange::Connected(_) => {
                    tracing::info!(device = %device.name, direction = ?device.direction, "MIDI device connected")
                }
                DeviceChange::Disconnected(_) => {
                    tracing::info!(device = %device.name, direction = ?device.direction, "MIDI device disconnected")
                }
            }
            if tx.try_push(change.clone()).is_err() {
                tracing::warn!(device = %device.name, "Device change queue full, change dropped");
            }
        }
    }

    fn refresh_status(&self) {
        let connected = !lock(&self.inputs).is_empty();
        self.status.set(if connected {
            DeviceStatus::Connected
        } else {
            DeviceStatus::Disconnected
        });
    }

    /// Enumerate, sync the registry and close inputs whose port vanished
    fn rescan(&self) -> Result<Vec<DeviceChange>, MidiError> {
        let snapshot = scan_ports()?;
        let changes = lock(&self.registry).sync(snapshot);

        for change in &changes {
            if let DeviceChange::Disconnected(device) = change
                && device.direction == PortDirection::Input
                && let Some(connection) = lock(&self.inputs).remove(&device.id)
            {
                connection.close();
            }
        }
        self.publish_changes(&changes);
        self.refresh_status();
        Ok(changes)
    }

    fn open_input(&self, device: &MidiDevice) -> Result<(), MidiError> {
        if lock(&self.inputs).contains_key(&device.id) {
            return Ok(());
        }
        self.status.set(DeviceStatus::Connecting);

        let mut midi_in = MidirInput::new(CLIENT_NAME).map_err(init_error)?;
        midi_in.ignore(Ignore::All);

        let ports = midi_in.ports();
        let Some(port) = ports
            .iter()
            .find(|p| midi_in.port_name(p).map(|name| name == device.name).unwrap_or(false))
        else {
            self.refresh_status();
            return Err(MidiError::PortUnavailable(device.name.clone()));
        };

        let sender = self.sender.clone();
        let connection = midi_in.connect(
            port,
            "gallery-audio-input",
            move |timestamp, bytes, _| {
                // Runs on midir's thread; never blocks
                sender.send_bytes(bytes, timestamp);
            },
            (),
        );

        match connection {
            Ok(connection) => {
                lock(&self.inputs).insert(device.id.clone(), connection);
                lock(&self.registry).set_state(&device.id, PortState::Open);
                self.status.set(DeviceStatus::Connected);
                tracing::info!(device = %device.name, "MIDI input opened");
                Ok(())
            }
            Err(e) => {
                self.refresh_status();
                Err(MidiError::Connect(format!("{}: {}", device.name, e)))
            }
        }
    }

    fn close_input(&self, id: &str) -> bool {
        let removed = lock(&self.inputs).remove(id);
        match removed {
            Some(connection) => {
                connection.close();
                lock(&self.registry).set_state(id, PortState::Available);
                self.refresh_status();
                true
            }
            None => false,
        }
    }

    fn close_all(&self) {
        let connections: Vec<_> = lock(&self.inputs).drain().collect();
        for (_, connection) in connections {
            connection.close();
        }
        self.status.set(DeviceStatus::Disconnected);
    }
}

/// midir reports init failures as text only
fn init_error(error: impl std::fmt::Display) -> MidiError {
    let message = error.to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") {
        MidiError::PermissionDenied(message)
    } else {
        MidiError::Unsupported(message)
    }
}

fn scan_ports() -> Result<Vec<MidiDevice>, MidiError> {
    let midi_in = MidirInput::new(CLIENT_NAME).map_err(init_error)?;
    let midi_out = MidirOutput::new(CLIENT_NAME).map_err(init_error)?;

    let mut devices = Vec::new();
    for port in midi_in.ports() {
        if let Ok(name) = midi_in.port_name(&port) {
            devices.push(MidiDevice::new(name, PortDirection::Input));
        }
    }
    for port in midi_out.ports() {
        if let Ok(name) = midi_out.port_name(&port) {
            devices.push(MidiDevice::new(name, PortDirection::Output));
        }
    }
    Ok(devices)
}

struct Monitor {
    stop_tx: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

pub struct MidiManager {
    config: MidiConfig,
    shared: Arc<Shared>,
    midi_rx: MidiConsumer,
    device_rx: DeviceChangeConsumer,
    output: Option<Box<dyn MidiSink>>,
    monitor: Option<Monitor>,
    /// None until initialize() ran
    available: Option<bool>,
    closed: bool,
}

impl MidiManager {
    pub fn new(config: MidiConfig) -> Self {
        let (midi_tx, midi_rx) = create_midi_channel(MIDI_QUEUE_CAPACITY);
        let (device_tx, device_rx) = create_device_channel(DEVICE_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            registry: Mutex::new(DeviceRegistry::new()),
            inputs: Mutex::new(HashMap::new()),
            device_tx: Mutex::new(device_tx),
            sender: MidiSender {
                producer: Arc::new(Mutex::new(midi_tx)),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            status: AtomicDeviceStatus::default(),
        });
        Self {
            config,
            shared,
            midi_rx,
            device_rx,
            output: None,
            monitor: None,
            available: None,
            closed: false,
        }
    }

    /// Request hardware access
    ///
    /// Returns false when MIDI is disabled or the platform refuses; the
    /// manager then stays inert for the rest of the session. Repeated calls
    /// return the first answer.
    pub fn initialize(&mut self) -> bool {
        if let Some(available) = self.available {
            return available;
        }
        if !self.config.enabled || self.closed {
            self.available = Some(false);
            return false;
        }

        let changes = match self.shared.rescan() {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!(error = %e, "MIDI unavailable, continuing without it");
                self.shared.status.set(DeviceStatus::Error);
                self.available = Some(false);
                return false;
            }
        };

        if self.config.auto_connect {
            for change in &changes {
                if let DeviceChange::Connected(device) = change
                    && device.direction == PortDirection::Input
                    && let Err(e) = self.shared.open_input(device)
                {
                    tracing::warn!(device = %device.name, error = %e, "Could not open MIDI input");
                }
            }
        }

        self.monitor = spawn_monitor_thread(
            Arc::clone(&self.shared),
            Duration::from_millis(self.config.monitor_interval_ms.max(10)),
            self.config.auto_connect,
        );
        self.available = Some(true);
        tracing::info!(devices = lock(&self.shared.registry).len(), "MIDI initialised");
        true
    }

    pub fn is_available(&self) -> Option<bool> {
        self.available
    }

    pub fn is_inert(&self) -> bool {
        self.available == Some(false) || self.closed
    }

    pub fn status(&self) -> DeviceStatus {
        self.shared.status.get()
    }

    pub fn sender(&self) -> MidiSender {
        self.shared.sender.clone()
    }

    pub fn devices(&self) -> Vec<MidiDevice> {
        lock(&self.shared.registry).devices()
    }

    fn ensure_live(&self) -> Result<(), MidiError> {
        if self.is_inert() { Err(MidiError::Inert) } else { Ok(()) }
    }

    fn find_device(&self, name: &str, direction: PortDirection) -> Result<MidiDevice, MidiError> {
        let registry = lock(&self.shared.registry);
        let found = match direction {
            PortDirection::Input => registry.inputs().find(|d| d.name == name).cloned(),
            PortDirection::Output => registry.outputs().find(|d| d.name == name).cloned(),
        };
        found.ok_or_else(|| MidiError::PortUnavailable(name.to_string()))
    }

    pub fn connect_input(&self, name: &str) -> Result<(), MidiError> {
        self.ensure_live()?;
        let device = self.find_device(name, PortDirection::Input)?;
        self.shared.open_input(&device)
    }

    pub fn disconnect_input(&self, name: &str) -> bool {
        match self.find_device(name, PortDirection::Input) {
            Ok(device) => self.shared.close_input(&device.id),
            Err(_) => false,
        }
    }

    pub fn open_inputs(&self) -> usize {
        lock(&self.shared.inputs).len()
    }

    /// Select the output port used by send_note / stop_note / all_notes_off
    ///
    /// `None` picks the first output the registry knows.
    pub fn open_output(&mut self, name: Option<&str>) -> Result<(), MidiError> {
        self.ensure_live()?;
        let device = match name {
            Some(name) => self.find_device(name, PortDirection::Output)?,
            None => lock(&self.shared.registry)
                .outputs()
                .next()
                .cloned()
                .ok_or_else(|| MidiError::PortUnavailable("no output ports".to_string()))?,
        };

        let midi_out = MidirOutput::new(CLIENT_NAME).map_err(init_error)?;
        let ports = midi_out.ports();
        let port = ports
            .iter()
            .find(|p| midi_out.port_name(p).map(|n| n == device.name).unwrap_or(false))
            .ok_or_else(|| MidiError::PortUnavailable(device.name.clone()))?;
        let connection = midi_out
            .connect(port, "gallery-audio-output")
            .map_err(|e| MidiError::Connect(format!("{}: {}", device.name, e)))?;

        lock(&self.shared.registry).set_state(&device.id, PortState::Open);
        tracing::info!(device = %device.name, "MIDI output opened");
        self.output = Some(Box::new(HardwareOutput {
            name: device.name,
            connection,
        }));
        Ok(())
    }

    /// Route outbound messages to a custom sink
    pub fn set_output(&mut self, sink: Box<dyn MidiSink>) {
        self.output = Some(sink);
    }

    pub fn close_output(&mut self) -> bool {
        self.output.take().is_some()
    }

    pub fn output_name(&self) -> Option<&str> {
        self.output.as_deref().map(|sink| sink.name())
    }

    fn send_message(&mut self, message: MidiMessage) -> Result<(), MidiError> {
        let sink = self
            .output
            .as_mut()
            .ok_or_else(|| MidiError::PortUnavailable("no output port selected".to_string()))?;
        sink.send(&message.to_bytes())
    }

    pub fn send_note(&mut self, note: u8, velocity: u8, channel: u8) -> Result<(), MidiError> {
        self.send_message(MidiMessage::note_on(channel, note.min(127), velocity.clamp(1, 127)))
    }

    pub fn stop_note(&mut self, note: u8, channel: u8) -> Result<(), MidiError> {
        self.send_message(MidiMessage::note_off(channel, note.min(127)))
    }

    /// CC 123 on every channel
    pub fn all_notes_off(&mut self) -> Result<(), MidiError> {
        for channel in 0..16 {
            self.send_message(MidiMessage::control_change(channel, CC_ALL_NOTES_OFF, 0))?;
        }
        Ok(())
    }

    pub fn drain_messages(&mut self) -> Vec<MidiMessage> {
        self.midi_rx.pop_iter().collect()
    }

    pub fn drain_device_changes(&mut self) -> Vec<DeviceChange> {
        self.device_rx.pop_iter().collect()
    }

    /// Stop monitoring and release every port; idempotent
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.stop_tx.send(());
            if monitor.handle.join().is_err() {
                tracing::error!("MIDI monitor thread panicked");
            }
        }
        self.shared.close_all();
        self.output = None;
        lock(&self.shared.registry).clear();
        tracing::debug!("MIDI manager closed");
    }
}

impl Drop for MidiManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Thread de monitoring: re-enumerates ports and retries failed opens with back-off
fn spawn_monitor_thread(shared: Arc<Shared>, interval: Duration, auto_connect: bool) -> Option<Monitor> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let handle = thread::Builder::new()
        .name("midi-monitor".to_string())
        .spawn(move || {
            let mut pending: HashMap<String, (MidiDevice, RetrySchedule)> = HashMap::new();

            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                let changes = match shared.rescan() {
                    Ok(changes) => changes,
                    Err(e) => {
                        tracing::debug!(error = %e, "MIDI rescan failed");
                        continue;
                    }
                };

                for change in changes {
                    match change {
                        DeviceChange::Connected(device) if auto_connect && device.direction == PortDirection::Input => {
                            pending.insert(
                                device.id.clone(),
                                (device, RetrySchedule::immediate(BackoffPolicy::midi(), Instant::now())),
                            );
                        }
                        DeviceChange::Disconnected(device) => {
                            pending.remove(&device.id);
                        }
                        _ => {}
                    }
                }

                let now = Instant::now();
                pending.retain(|_, (device, schedule)| match schedule.poll(now) {
                    RetryStep::Wait => true,
                    RetryStep::Attempt(attempt) => match shared.open_input(device) {
                        Ok(()) => false,
                        Err(e) => {
                            tracing::debug!(
                                device = %device.name,
                                attempt,
                                error = %e,
                                "MIDI input open failed, will retry"
                            );
                            true
                        }
                    },
                    RetryStep::Exhausted => {
                        tracing::warn!(device = %device.name, "Giving up on MIDI input");
                        false
                    }
                });
            }
        });

    match handle {
        Ok(handle) => Some(Monitor { stop_tx, handle }),
        Err(e) => {
            // Device list then stays as enumerated by initialize()
            tracing::warn!(error = %e, "Could not spawn MIDI monitor thread");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl MidiSink for RecordingSink {
        fn name(&self) -> &str {
            "recorder"
        }

        fn send(&mut self, bytes: &[u8]) -> Result<(), MidiError> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    fn disabled() -> MidiManager {
        MidiManager::new(MidiConfig {
            enabled: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_disabled_manager_is_inert() {
        let mut manager = disabled();
        assert_eq!(manager.is_available(), None);
        assert!(!manager.initialize());
        assert!(!manager.initialize());
        assert!(manager.is_inert());
        assert_eq!(manager.connect_input("anything"), Err(MidiError::Inert));
        assert!(manager.devices().is_empty());
    }

    #[test]
    fn test_sender_feeds_queue() {
        let mut manager = disabled();
        let sender = manager.sender();
        assert!(sender.send_bytes(&[0x90, 60, 100], 5));
        assert!(!sender.send_bytes(&[0xF8], 6));
        assert!(sender.send_bytes(&[0x90, 60, 0], 7));

        let messages = manager.drain_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].timestamp_us, 5);
        assert!(manager.drain_messages().is_empty());
    }

    #[test]
    fn test_full_queue_counts_drops() {
        let manager = disabled();
        let sender = manager.sender();
        for _ in 0..MIDI_QUEUE_CAPACITY {
            assert!(sender.send(MidiMessage::note_on(0, 60, 1)));
        }
        assert!(!sender.send(MidiMessage::note_on(0, 60, 1)));
        assert_eq!(sender.dropped(), 1);
    }

    #[test]
    fn test_outbound_without_port_is_reported() {
        let mut manager = disabled();
        assert!(matches!(manager.send_note(60, 100, 0), Err(MidiError::PortUnavailable(_))));
        assert!(matches!(manager.all_notes_off(), Err(MidiError::PortUnavailable(_))));
    }

    #[test]
    fn test_outbound_messages() {
        let mut manager = disabled();
        let sent = Arc::new(Mutex::new(Vec::new()));
        manager.set_output(Box::new(RecordingSink { sent: sent.clone() }));
        assert_eq!(manager.output_name(), Some("recorder"));

        manager.send_note(60, 100, 1).unwrap();
        manager.stop_note(60, 1).unwrap();
        manager.all_notes_off().unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0], vec![0x91, 60, 100]);
        assert_eq!(sent[1], vec![0x81, 60, 0]);
        assert_eq!(sent.len(), 2 + 16);
        assert_eq!(sent[2], vec![0xB0, 123, 0]);
        assert_eq!(sent[17], vec![0xBF, 123, 0]);
    }

    #[test]
    fn test_init_errors_are_classified() {
        assert!(matches!(init_error("ALSA: permission denied"), MidiError::PermissionDenied(_)));
        assert!(matches!(init_error("no backend"), MidiError::Unsupported(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut manager = disabled();
        manager.close();
        manager.close();
        assert!(manager.is_inert());
        assert!(!manager.close_output());
    }
}
