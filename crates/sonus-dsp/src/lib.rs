//! sonus-dsp: per-voice resampling, direct-path filtering, and gain
//! ramping (component E of the spec, plus the filter/ramp primitives F
//! relies on).

mod filter;
mod ramp;
mod resampler;

pub use filter::{BiquadCoeffs, BiquadState};
pub use ramp::GainRamp;
pub use resampler::{Resampler, ResamplerKind};
