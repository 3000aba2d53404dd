// Module synthèse - Per-note graphs, instrument table and reverb

pub mod effects;
pub mod engine;
pub mod envelope;
pub mod filter;
pub mod instrument;
pub mod note;
pub mod oscillator;
pub mod reverb;
