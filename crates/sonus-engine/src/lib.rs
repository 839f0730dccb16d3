//! sonus-engine: voice, source, listener, effect-slot graph and the
//! mixer core (components F, G, H, J, L of the spec).

mod context;
mod listener;
mod slot;
mod source;
mod update;
mod voice;

pub use context::{Context, HrtfRenderer, PostProcess, DEFAULT_MAX_VOICES};
pub use listener::Listener;
pub use slot::{Bypass, EffectGraph, EffectInstance, EffectSlot, SlotTarget};
pub use source::{Cursor, SendParams, Source, SourceParams, SourceState, MAX_SENDS};
pub use update::UpdateChannel;
pub use voice::{Voice, VoiceOutcome};
