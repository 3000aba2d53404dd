// MIDI Input - Turns normalised messages into note starts and stops
//
// Tracks held keys per channel and the sustain pedal. While the pedal is down
// a note-off only marks the key; the stop is emitted when the pedal lifts.

use super::event::{CC_ALL_NOTES_OFF, CC_SUSTAIN, MidiEvent, MidiMessage, velocity_to_unit};
use std::collections::BTreeSet;

/// (channel, note)
pub type KeyId = (u8, u8);

#[derive(Debug, Clone, PartialEq)]
pub enum NoteAction {
    Start { key: KeyId, velocity: f32 },
    Stop { key: KeyId },
    /// Controller or bend passed through for visualisation
    Control { channel: u8, controller: u8, value: u8 },
    Bend { channel: u8, value: f32 },
}

#[derive(Debug, Default)]
pub struct NoteTracker {
    held: BTreeSet<KeyId>,
    sustained: BTreeSet<KeyId>,
    pedal: [bool; 16],
}

impl NoteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, message: &MidiMessage) -> Vec<NoteAction> {
        let channel = message.channel & 0x0F;
        let mut actions = Vec::new();

        match message.event {
            MidiEvent::NoteOn { note, velocity } => {
                let key = (channel, note);
                // Retrigger: the previous sounding note on this key stops first
                if self.held.remove(&key) | self.sustained.remove(&key) {
                    actions.push(NoteAction::Stop { key });
                }
                self.held.insert(key);
                actions.push(NoteAction::Start {
                    key,
                    velocity: velocity_to_unit(velocity),
                });
            }
            MidiEvent::NoteOff { note, .. } => {
                let key = (channel, note);
                if self.held.remove(&key) {
                    if self.pedal[channel as usize] {
                        self.sustained.insert(key);
                    } else {
                        actions.push(NoteAction::Stop { key });
                    }
                }
            }
            MidiEvent::ControlChange {
                controller: CC_SUSTAIN,
                value,
            } => {
                let down = value >= 64;
                self.pedal[channel as usize] = down;
                if !down {
                    let released: Vec<KeyId> = self
                        .sustained
                        .iter()
                        .filter(|(ch, _)| *ch == channel)
                        .copied()
                        .collect();
                    for key in released {
                        self.sustained.remove(&key);
                        actions.push(NoteAction::Stop { key });
                    }
                }
                actions.push(NoteAction::Control {
                    channel,
                    controller: CC_SUSTAIN,
                    value,
                });
            }
            MidiEvent::ControlChange {
                controller: CC_ALL_NOTES_OFF,
                value,
            } => {
                let keys: Vec<KeyId> = self
                    .held
                    .iter()
                    .chain(self.sustained.iter())
                    .filter(|(ch, _)| *ch == channel)
                    .copied()
                    .collect();
                for key in keys {
                    self.held.remove(&key);
                    self.sustained.remove(&key);
                    actions.push(NoteAction::Stop { key });
                }
                actions.push(NoteAction::Control {
                    channel,
                    controller: CC_ALL_NOTES_OFF,
                    value,
                });
            }
            MidiEvent::ControlChange { controller, value } => {
                actions.push(NoteAction::Control {
                    channel,
                    controller,
                    value,
                });
            }
            MidiEvent::PitchBend { value } => {
                actions.push(NoteAction::Bend { channel, value });
            }
        }
        actions
    }

    /// Forget a key whose note ended on its own
    pub fn forget(&mut self, key: KeyId) {
        self.held.remove(&key);
        self.sustained.remove(&key);
    }

    pub fn sounding(&self) -> usize {
        self.held.len() + self.sustained.len()
    }

    pub fn is_sustain_down(&self, channel: u8) -> bool {
        self.pedal[(channel & 0x0F) as usize]
    }

    pub fn reset(&mut self) {
        self.held.clear();
        self.sustained.clear();
        self.pedal = [false; 16];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8]) -> MidiMessage {
        MidiMessage::parse(bytes, 0).unwrap()
    }

    #[test]
    fn test_note_on_then_off() {
        let mut tracker = NoteTracker::new();
        let actions = tracker.process(&parse(&[0x90, 60, 127]));
        assert_eq!(
            actions,
            vec![NoteAction::Start {
                key: (0, 60),
                velocity: 1.0
            }]
        );
        assert_eq!(tracker.process(&parse(&[0x80, 60, 0])), vec![NoteAction::Stop { key: (0, 60) }]);
        assert_eq!(tracker.sounding(), 0);
    }

    #[test]
    fn test_velocity_zero_note_on_stops() {
        let mut tracker = NoteTracker::new();
        tracker.process(&parse(&[0x90, 60, 90]));
        assert_eq!(tracker.process(&parse(&[0x90, 60, 0])), vec![NoteAction::Stop { key: (0, 60) }]);
    }

    #[test]
    fn test_stray_note_off_is_ignored() {
        let mut tracker = NoteTracker::new();
        assert!(tracker.process(&parse(&[0x80, 61, 0])).is_empty());
    }

    #[test]
    fn test_retrigger_stops_previous() {
        let mut tracker = NoteTracker::new();
        tracker.process(&parse(&[0x90, 60, 90]));
        let actions = tracker.process(&parse(&[0x90, 60, 90]));
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], NoteAction::Stop { key: (0, 60) });
        assert!(matches!(actions[1], NoteAction::Start { key: (0, 60), .. }));
        assert_eq!(tracker.sounding(), 1);
    }

    #[test]
    fn test_sustain_defers_note_off() {
        let mut tracker = NoteTracker::new();
        tracker.process(&parse(&[0xB0, CC_SUSTAIN, 127]));
        assert!(tracker.is_sustain_down(0));

        tracker.process(&parse(&[0x90, 60, 90]));
        tracker.process(&parse(&[0x90, 64, 90]));
        assert!(tracker.process(&parse(&[0x80, 60, 0])).is_empty());
        assert!(tracker.process(&parse(&[0x80, 64, 0])).is_empty());
        assert_eq!(tracker.sounding(), 2);

        let actions = tracker.process(&parse(&[0xB0, CC_SUSTAIN, 0]));
        let stops: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, NoteAction::Stop { .. }))
            .collect();
        assert_eq!(stops.len(), 2);
        assert_eq!(tracker.sounding(), 0);
    }

    #[test]
    fn test_sustain_is_per_channel() {
        let mut tracker = NoteTracker::new();
        tracker.process(&parse(&[0xB1, CC_SUSTAIN, 127]));
        tracker.process(&parse(&[0x90, 60, 90]));
        assert_eq!(tracker.process(&parse(&[0x80, 60, 0])), vec![NoteAction::Stop { key: (0, 60) }]);
    }

    #[test]
    fn test_all_notes_off() {
        let mut tracker = NoteTracker::new();
        tracker.process(&parse(&[0xB0, CC_SUSTAIN, 127]));
        tracker.process(&parse(&[0x90, 60, 90]));
        tracker.process(&parse(&[0x80, 60, 0]));
        tracker.process(&parse(&[0x90, 67, 90]));
        tracker.process(&parse(&[0x92, 50, 90]));

        let actions = tracker.process(&parse(&[0xB0, CC_ALL_NOTES_OFF, 0]));
        let stops = actions
            .iter()
            .filter(|a| matches!(a, NoteAction::Stop { .. }))
            .count();
        assert_eq!(stops, 2);
        assert_eq!(tracker.sounding(), 1);
    }

    #[test]
    fn test_controls_and_bend_pass_through() {
        let mut tracker = NoteTracker::new();
        assert_eq!(
            tracker.process(&parse(&[0xB3, 1, 42])),
            vec![NoteAction::Control {
                channel: 3,
                controller: 1,
                value: 42
            }]
        );
        assert_eq!(
            tracker.process(&parse(&[0xE0, 0x00, 0x40])),
            vec![NoteAction::Bend { channel: 0, value: 0.0 }]
        );
    }
}
