// NoteEvent - Normalised description of one sound trigger
//
// Every source (UI call, MIDI hardware, remote peer) produces the same
// NoteEvent and feeds the same play path. The JSON form is what travels over
// peer data channels; the remote flag never leaves the process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Handle to one active note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NoteId(Uuid);

impl NoteId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NoteId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a note left the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// Envelope completed on its own
    Natural,
    /// Explicit stop (stop_note / stop_all_notes / MIDI note-off)
    Stopped,
    /// Hit the lifetime ceiling
    Timeout,
    /// Collected by the idle sweep after its timer never fired
    Swept,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid {field}: {value}")]
pub struct InvalidParameter {
    pub field: &'static str,
    pub value: f64,
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Wall-clock milliseconds, strictly increasing within this process
pub fn monotonic_timestamp_ms() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let previous = LAST_TIMESTAMP
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    now.max(previous + 1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteEvent {
    pub instrument: String,
    /// Note name, e.g. "A4"
    pub note: String,
    /// Hz, must be > 0
    pub frequency: f32,
    /// 0.0 - 1.0
    pub velocity: f32,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Seconds; None holds the note until stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Arrived over a peer link
    #[serde(skip)]
    pub is_remote: bool,
}

impl NoteEvent {
    pub fn new(
        instrument: impl Into<String>,
        note: impl Into<String>,
        frequency: f32,
        velocity: f32,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            note: note.into(),
            frequency,
            velocity,
            timestamp: monotonic_timestamp_ms(),
            duration: None,
            user_id: None,
            is_remote: false,
        }
    }

    pub fn with_duration(mut self, duration: Option<f64>) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn validate(&self) -> Result<(), InvalidParameter> {
        if !self.frequency.is_finite() || self.frequency <= 0.0 {
            return Err(InvalidParameter {
                field: "frequency",
                value: self.frequency as f64,
            });
        }
        if !self.velocity.is_finite() || !(0.0..=1.0).contains(&self.velocity) {
            return Err(InvalidParameter {
                field: "velocity",
                value: self.velocity as f64,
            });
        }
        if let Some(duration) = self.duration
            && (!duration.is_finite() || duration < 0.0)
        {
            return Err(InvalidParameter {
                field: "duration",
                value: duration,
            });
        }
        Ok(())
    }

    /// Encode for a peer data channel
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a peer payload; the result is tagged as remote
    pub fn from_wire(payload: &str) -> Result<Self, serde_json::Error> {
        let mut event: Self = serde_json::from_str(payload)?;
        event.is_remote = true;
        Ok(event)
    }
}
