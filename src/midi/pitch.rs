// Pitch - Equal temperament conversions referenced to A4 = 440 Hz

const A4_NOTE: f64 = 69.0;
const A4_FREQUENCY: f64 = 440.0;

const NOTE_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

/// freq = 440 * 2^((n - 69) / 12)
pub fn note_number_to_frequency(note: u8) -> f64 {
    A4_FREQUENCY * 2f64.powf((note as f64 - A4_NOTE) / 12.0)
}

/// Fractional note number for a frequency (inverse of `note_number_to_frequency`)
pub fn frequency_to_note_number(frequency: f64) -> f64 {
    A4_NOTE + 12.0 * (frequency / A4_FREQUENCY).log2()
}

/// Scientific pitch name, middle C (60) is "C4"
pub fn note_name(note: u8) -> String {
    let octave = note as i32 / 12 - 1;
    format!("{}{}", NOTE_NAMES[note as usize % 12], octave)
}

/// Parse "A4", "C#3", "Eb5" or "C-1" into a MIDI note number
pub fn parse_note_name(name: &str) -> Option<u8> {
    let name = name.trim();
    let mut chars = name.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let base: i32 = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };

    let rest = chars.as_str();
    let (accidental, octave) = match rest.chars().next() {
        Some('#') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest),
    };

    let octave: i32 = octave.parse().ok()?;
    let note = (octave + 1) * 12 + base + accidental;
    u8::try_from(note).ok().filter(|n| *n <= 127)
}
