// Mix graph - Notes fan into a shared master bus and per-profile reverb buses
//
// The graph is owned by the AudioContext behind a mutex. The render side
// locks it with try_lock (silence on contention), the control side adds,
// releases and removes notes. Notes only ever add into the shared buses;
// removing a note never touches a bus. A bus's convolver can be built by the
// caller before locking, see add_note_with().
//
// Per render quantum:
//   notes -> dry buffer ─────────────────────────┐
//         -> wet buffer per reverb bus -> conv ──┴-> master bus -> out

use super::dsp_utils::{flush_denormals_to_zero, soft_clip};
use crate::messaging::note::NoteId;
use crate::synth::effects::{Compressor, CompressorParams, Effect};
use crate::synth::note::NoteGraph;
use crate::synth::reverb::{Convolver, ReverbNode};
use std::sync::Arc;

/// Fixed gain before the master compressor
pub const MASTER_HEADROOM: f32 = 0.5;

/// Headroom gain -> compressor -> soft clip
pub struct MasterBus {
    headroom: f32,
    compressor: Compressor,
}

impl MasterBus {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            headroom: MASTER_HEADROOM,
            compressor: Compressor::new(CompressorParams::master(), sample_rate),
        }
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let sample = self.compressor.process(input * self.headroom);
        soft_clip(flush_denormals_to_zero(sample))
    }
}

/// Convolution state for one shared reverb node
pub struct ReverbBus {
    node: Arc<ReverbNode>,
    convolver: Convolver,
    send: Vec<f32>,
    output: Vec<f32>,
}

impl ReverbBus {
    fn new(node: Arc<ReverbNode>, convolver: Convolver, quantum: usize) -> Self {
        Self {
            node,
            convolver,
            send: vec![0.0; quantum],
            output: vec![0.0; quantum],
        }
    }

    pub fn id(&self) -> &str {
        self.node.id()
    }
}

pub struct MixGraph {
    sample_rate: f32,
    quantum: usize,
    notes: Vec<NoteGraph>,
    reverb_buses: Vec<ReverbBus>,
    master: MasterBus,
    dry: Vec<f32>,
}

impl MixGraph {
    pub fn new(sample_rate: f32, quantum: usize) -> Self {
        let quantum = quantum.max(1);
        Self {
            sample_rate,
            quantum,
            notes: Vec::with_capacity(64),
            reverb_buses: Vec::new(),
            master: MasterBus::new(sample_rate),
            dry: vec![0.0; quantum],
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Connect a note, creating the bus for its reverb node if needed
    pub fn add_note(&mut self, note: NoteGraph) {
        self.connect(note, None);
    }

    /// Connect a note with a convolver prepared outside the lock
    ///
    /// The convolver becomes the note's reverb bus if none exists yet.
    /// Otherwise it is handed back so the caller frees it after unlocking.
    pub fn add_note_with(&mut self, note: NoteGraph, convolver: Convolver) -> Option<Convolver> {
        self.connect(note, Some(convolver))
    }

    /// True if notes sending to `node` already have a bus
    pub fn has_reverb_bus(&self, node: &Arc<ReverbNode>) -> bool {
        self.reverb_buses.iter().any(|bus| Arc::ptr_eq(&bus.node, node))
    }

    fn connect(&mut self, note: NoteGraph, prepared: Option<Convolver>) -> Option<Convolver> {
        let node = note.reverb();
        let unused = if self.has_reverb_bus(node) {
            prepared
        } else {
            let convolver = match prepared {
                Some(convolver) if Arc::ptr_eq(convolver.kernel(), node.kernel()) => convolver,
                _ => node.convolver(),
            };
            self.reverb_buses
                .push(ReverbBus::new(Arc::clone(node), convolver, self.quantum));
            None
        };
        self.notes.push(note);
        unused
    }

    /// Disconnect a note's own nodes
    pub fn remove_note(&mut self, id: NoteId) -> Option<NoteGraph> {
        let index = self.notes.iter().position(|n| n.id() == id)?;
        Some(self.notes.swap_remove(index))
    }

    pub fn note_mut(&mut self, id: NoteId) -> Option<&mut NoteGraph> {
        self.notes.iter_mut().find(|n| n.id() == id)
    }

    pub fn note(&self, id: NoteId) -> Option<&NoteGraph> {
        self.notes.iter().find(|n| n.id() == id)
    }

    pub fn note_ids(&self) -> Vec<NoteId> {
        self.notes.iter().map(NoteGraph::id).collect()
    }

    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    pub fn reverb_bus_count(&self) -> usize {
        self.reverb_buses.len()
    }

    pub fn reverb_bus_ids(&self) -> Vec<&str> {
        self.reverb_buses.iter().map(ReverbBus::id).collect()
    }

    /// Render mono output for the block starting at `start_time`
    pub fn render(&mut self, out: &mut [f32], start_time: f64) {
        let dt = 1.0 / self.sample_rate as f64;
        let mut offset = 0;
        while offset < out.len() {
            let frames = (out.len() - offset).min(self.quantum);
            let block_time = start_time + offset as f64 * dt;
            self.render_quantum(&mut out[offset..offset + frames], block_time);
            offset += frames;
        }
    }

    fn render_quantum(&mut self, out: &mut [f32], start_time: f64) {
        let frames = out.len();
        self.dry[..frames].fill(0.0);
        for bus in self.reverb_buses.iter_mut() {
            bus.send[..frames].fill(0.0);
        }

        for note in self.notes.iter_mut() {
            if let Some(bus) = self
                .reverb_buses
                .iter_mut()
                .find(|bus| Arc::ptr_eq(&bus.node, note.reverb()))
            {
                note.render(&mut self.dry[..frames], &mut bus.send[..frames], start_time);
            }
        }

        for bus in self.reverb_buses.iter_mut() {
            bus.convolver
                .process(&bus.send[..frames], &mut bus.output[..frames]);
            for (dry, wet) in self.dry[..frames].iter_mut().zip(&bus.output[..frames]) {
                *dry += *wet;
            }
        }

        for (y, x) in out.iter_mut().zip(&self.dry[..frames]) {
            *y = self.master.process(*x);
        }

        // Buses with no note and a fully decayed tail are dropped
        let notes = &self.notes;
        self.reverb_buses.retain(|bus| {
            !bus.convolver.is_idle() || notes.iter().any(|n| Arc::ptr_eq(n.reverb(), &bus.node))
        });
    }
}
