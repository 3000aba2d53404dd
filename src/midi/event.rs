// MIDI messages - Raw 3-byte packets normalised into typed messages

use serde::Serialize;

/// Sustain pedal controller
pub const CC_SUSTAIN: u8 = 64;
/// All Notes Off controller
pub const CC_ALL_NOTES_OFF: u8 = 123;

const PITCH_BEND_CENTER: i32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MidiEvent {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8, velocity: u8 },
    ControlChange { controller: u8, value: u8 },
    /// Signed unit range: -1.0 (full down) .. 1.0 (full up)
    PitchBend { value: f32 },
}

/// Normalised message with its channel and source timestamp
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MidiMessage {
    #[serde(flatten)]
    pub event: MidiEvent,
    /// 0-15
    pub channel: u8,
    /// Microseconds, as reported by the port
    pub timestamp_us: u64,
}

/// 14-bit bend value (0..=16383) to -1.0..=1.0, exactly 0 at the center
pub fn pitch_bend_to_unit(raw: u16) -> f32 {
    let offset = raw.min(16383) as i32 - PITCH_BEND_CENTER;
    if offset < 0 {
        offset as f32 / PITCH_BEND_CENTER as f32
    } else {
        offset as f32 / (PITCH_BEND_CENTER - 1) as f32
    }
}

/// Inverse of `pitch_bend_to_unit`
pub fn unit_to_pitch_bend(value: f32) -> u16 {
    let value = value.clamp(-1.0, 1.0);
    let offset = if value < 0.0 {
        (value * PITCH_BEND_CENTER as f32).round() as i32
    } else {
        (value * (PITCH_BEND_CENTER - 1) as f32).round() as i32
    };
    (PITCH_BEND_CENTER + offset) as u16
}

/// MIDI velocity (0-127) to 0.0-1.0
pub fn velocity_to_unit(velocity: u8) -> f32 {
    velocity.min(127) as f32 / 127.0
}

impl MidiMessage {
    /// Parse a raw packet
    ///
    /// Returns None for anything that is not a complete note-on, note-off,
    /// control-change or pitch-bend message. A note-on with velocity 0 is a
    /// note-off.
    pub fn parse(bytes: &[u8], timestamp_us: u64) -> Option<Self> {
        let (&status, data) = bytes.split_first()?;
        if status & 0x80 == 0 || data.len() < 2 {
            return None;
        }
        let (data1, data2) = (data[0], data[1]);
        if data1 > 0x7F || data2 > 0x7F {
            return None;
        }

        let event = match status & 0xF0 {
            0x90 if data2 == 0 => MidiEvent::NoteOff {
                note: data1,
                velocity: 0,
            },
            0x90 => MidiEvent::NoteOn {
                note: data1,
                velocity: data2,
            },
            0x80 => MidiEvent::NoteOff {
                note: data1,
                velocity: data2,
            },
            0xB0 => MidiEvent::ControlChange {
                controller: data1,
                value: data2,
            },
            0xE0 => {
                let raw = ((data2 as u16) << 7) | data1 as u16;
                MidiEvent::PitchBend {
                    value: pitch_bend_to_unit(raw),
                }
            }
            _ => return None,
        };

        Some(Self {
            event,
            channel: status & 0x0F,
            timestamp_us,
        })
    }

    /// Raw packet for an output port
    pub fn to_bytes(&self) -> [u8; 3] {
        let channel = self.channel & 0x0F;
        match self.event {
            MidiEvent::NoteOn { note, velocity } => [0x90 | channel, note & 0x7F, velocity & 0x7F],
            MidiEvent::NoteOff { note, velocity } => [0x80 | channel, note & 0x7F, velocity & 0x7F],
            MidiEvent::ControlChange { controller, value } => {
                [0xB0 | channel, controller & 0x7F, value & 0x7F]
            }
            MidiEvent::PitchBend { value } => {
                let raw = unit_to_pitch_bend(value);
                [0xE0 | channel, (raw & 0x7F) as u8, ((raw >> 7) & 0x7F) as u8]
            }
        }
    }

    /// Velocity 0 gives a note-off, as on the wire
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        let event = if velocity == 0 {
            MidiEvent::NoteOff { note, velocity: 0 }
        } else {
            MidiEvent::NoteOn { note, velocity }
        };
        Self {
            event,
            channel,
            timestamp_us: 0,
        }
    }

    pub fn note_off(channel: u8, note: u8) -> Self {
        Self {
            event: MidiEvent::NoteOff { note, velocity: 0 },
            channel,
            timestamp_us: 0,
        }
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self {
            event: MidiEvent::ControlChange { controller, value },
            channel,
            timestamp_us: 0,
        }
    }
}
