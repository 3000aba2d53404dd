// Synthesis engine - Builds a note graph per attack and retires it
//
// Cleanup runs on two independent paths:
// - maintain(): per-note completion timers (envelope end) and the hard
//   lifetime ceiling, driven by the facade's tick
// - the resource manager's idle sweep, which reports notes whose registry
//   entry went stale so the facade can dispose() them
//
// Envelope ends are context time. The ceiling and the sweep run on context
// uptime, which keeps counting while the context is suspended. No graph is
// built unless the context is running.
//
// Lock order is always resources -> graph, never the reverse.

use super::instrument::{InstrumentBackend, InstrumentTable};
use super::note::NoteGraph;
use crate::audio::AudioError;
use crate::audio::context::{AudioContext, ContextState};
use crate::audio::resources::{ResourceKey, SharedResources, lock_resources};
use crate::config::EngineSettings;
use crate::messaging::note::{NoteEvent, NoteId, StopReason};
use std::collections::HashMap;
use std::sync::Arc;

/// Bookkeeping for one note in the graph
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveNote {
    pub id: NoteId,
    pub instrument: String,
    pub note: String,
    pub started_at: f64,
    /// Context uptime at attack, for the lifetime ceiling
    pub started_uptime: f64,
    /// Envelope end once a release is scheduled
    pub ends_at: Option<f64>,
    pub stopped: bool,
    pub timed_out: bool,
}

pub struct SynthesisEngine {
    resources: SharedResources,
    instruments: InstrumentTable,
    settings: EngineSettings,
    fast_release: f64,
    max_lifetime: f64,
    active: HashMap<NoteId, ActiveNote>,
}

impl SynthesisEngine {
    pub fn new(resources: SharedResources, instruments: InstrumentTable, settings: EngineSettings) -> Self {
        let (fast_release, max_lifetime) = {
            let resources = lock_resources(&resources);
            let limits = resources.limits();
            (limits.fast_release_secs, limits.max_note_lifetime_secs)
        };
        Self {
            resources,
            instruments,
            settings,
            fast_release,
            max_lifetime,
            active: HashMap::new(),
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn instruments(&self) -> &InstrumentTable {
        &self.instruments
    }

    pub fn active(&self, id: NoteId) -> Option<&ActiveNote> {
        self.active.get(&id)
    }

    pub fn active_ids(&self) -> Vec<NoteId> {
        self.active.keys().copied().collect()
    }

    fn context(&self) -> Option<Arc<AudioContext>> {
        lock_resources(&self.resources).context()
    }

    /// Remove a note's graph and registry entry
    fn retire(&mut self, context: &AudioContext, id: NoteId) {
        context.graph().remove_note(id);
        lock_resources(&self.resources).forget(&ResourceKey::Note(id));
        self.active.remove(&id);
    }
}

impl InstrumentBackend for SynthesisEngine {
    fn attack(&mut self, event: &NoteEvent) -> Result<NoteId, AudioError> {
        let profile = self.instruments.resolve(&event.instrument);

        let (context, reverb) = {
            let mut resources = lock_resources(&self.resources);
            let context = resources.get_context()?;
            match context.state() {
                ContextState::Running => {}
                ContextState::Suspended => return Err(AudioError::Suspended),
                ContextState::Closed => return Err(AudioError::Closed),
            }
            let reverb = resources.get_reverb(&profile.reverb)?;
            (context, reverb)
        };

        // Bus state is allocated before the graph lock is taken
        let prepared = (!context.graph().has_reverb_bus(&reverb)).then(|| reverb.convolver());

        let now = context.now();
        let id = NoteId::new();
        let note = NoteGraph::build(
            id,
            profile,
            event,
            reverb,
            &self.settings,
            now,
            context.sample_rate(),
        );
        let ends_at = note.envelope().end();

        let started_uptime = {
            let mut resources = lock_resources(&self.resources);
            let uptime = resources.uptime();
            resources.touch(ResourceKey::Note(id), uptime);
            uptime
        };
        let unused = match prepared {
            Some(convolver) => context.graph().add_note_with(note, convolver),
            None => {
                context.graph().add_note(note);
                None
            }
        };
        drop(unused);

        tracing::debug!(
            note_id = %id,
            instrument = %profile.id,
            frequency = event.frequency,
            velocity = event.velocity,
            remote = event.is_remote,
            "Note attack"
        );

        self.active.insert(
            id,
            ActiveNote {
                id,
                instrument: profile.id.clone(),
                note: event.note.clone(),
                started_at: now,
                started_uptime,
                ends_at,
                stopped: false,
                timed_out: false,
            },
        );
        Ok(id)
    }

    fn release(&mut self, id: NoteId) -> bool {
        if !self.active.contains_key(&id) {
            return false;
        }
        let Some(context) = self.context() else {
            return false;
        };
        let now = context.now();

        let end = context
            .graph()
            .note_mut(id)
            .map(|note| note.release(now, self.fast_release));

        match (end, self.active.get_mut(&id)) {
            (Some(end), Some(active)) => {
                active.ends_at = Some(end);
                active.stopped = true;
                lock_resources(&self.resources).touch_now(ResourceKey::Note(id));
                true
            }
            _ => {
                // Graph lost the note already; drop the bookkeeping
                self.active.remove(&id);
                false
            }
        }
    }

    fn release_all(&mut self) -> usize {
        let ids: Vec<NoteId> = self
            .active
            .values()
            .filter(|note| !note.stopped)
            .map(|note| note.id)
            .collect();
        ids.into_iter().filter(|id| self.release(*id)).count()
    }

    fn dispose(&mut self, id: NoteId) -> bool {
        let known = self.active.contains_key(&id);
        match self.context() {
            Some(context) => self.retire(&context, id),
            None => {
                self.active.remove(&id);
            }
        }
        known
    }

    fn active_notes(&self) -> usize {
        self.active.len()
    }

    fn maintain(&mut self, now: f64) -> Vec<(NoteId, StopReason)> {
        let Some(context) = self.context() else {
            return Vec::new();
        };
        let running = context.state() == ContextState::Running;
        let uptime = context.uptime();

        let overdue: Vec<NoteId> = self
            .active
            .values()
            .filter(|note| !note.stopped && uptime - note.started_uptime >= self.max_lifetime)
            .map(|note| note.id)
            .collect();
        for id in overdue {
            tracing::debug!(note_id = %id, running, "Note hit lifetime ceiling");
            if running {
                if self.release(id)
                    && let Some(active) = self.active.get_mut(&id)
                {
                    active.timed_out = true;
                }
            } else if let Some(active) = self.active.get_mut(&id) {
                // No render to play a release ramp; retired below
                active.stopped = true;
                active.timed_out = true;
            }
        }

        let finished: Vec<(NoteId, StopReason)> = self
            .active
            .values()
            .filter(|note| (note.timed_out && !running) || note.ends_at.is_some_and(|end| now >= end))
            .map(|note| {
                let reason = if note.timed_out {
                    StopReason::Timeout
                } else if note.stopped {
                    StopReason::Stopped
                } else {
                    StopReason::Natural
                };
                (note.id, reason)
            })
            .collect();

        for (id, _) in &finished {
            self.retire(&context, *id);
        }
        finished
    }

    fn update_settings(&mut self, settings: EngineSettings) {
        self.settings = settings;
    }
}
