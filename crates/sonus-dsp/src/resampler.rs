//! Per-voice sample-rate conversion (component E, spec §4.E).
//!
//! State is a fixed-point fractional phase plus `left`-context history
//! samples per channel, matching the spec's "fixed-point phase / N-1
//! history samples" description. The lookahead ("right") context a kernel
//! needs is the caller's responsibility each call — that's exactly the
//! "virtual contiguous view spanning tail-of-previous + current +
//! head-of-next buffer" §4.E asks the voice to assemble, since which
//! samples sit there changes every buffer-queue boundary and can't be
//! cached as resampler state the way the left-context history can.

use std::f32::consts::PI;

/// Selectable resampling kernel (spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResamplerKind {
    Nearest,
    Linear,
    Cubic4,
    Fir12,
    Fir24,
}

impl ResamplerKind {
    /// `(left, right)` taps of context a kernel sample needs around the
    /// integer base index.
    const fn context(self) -> (usize, usize) {
        match self {
            ResamplerKind::Nearest => (0, 1),
            ResamplerKind::Linear => (0, 1),
            ResamplerKind::Cubic4 => (1, 2),
            ResamplerKind::Fir12 => (6, 6),
            ResamplerKind::Fir24 => (12, 12),
        }
    }
}

const MAX_LEFT: usize = 12;

fn kernel_sample(kind: ResamplerKind, get: impl Fn(isize) -> f32, frac: f32) -> f32 {
    match kind {
        ResamplerKind::Nearest => {
            if frac < 0.5 {
                get(0)
            } else {
                get(1)
            }
        }
        ResamplerKind::Linear => {
            let a = get(0);
            let b = get(1);
            a + (b - a) * frac
        }
        ResamplerKind::Cubic4 => {
            // Catmull-Rom through get(-1), get(0), get(1), get(2).
            let p0 = get(-1);
            let p1 = get(0);
            let p2 = get(1);
            let p3 = get(2);
            let t = frac;
            let t2 = t * t;
            let t3 = t2 * t;
            0.5 * ((2.0 * p1)
                + (-p0 + p2) * t
                + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
                + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3)
        }
        ResamplerKind::Fir12 | ResamplerKind::Fir24 => {
            let (left, right) = kind.context();
            let n_taps = (left + right) as f32;
            let mut acc = 0.0f32;
            for i in -(left as isize)..(right as isize) {
                let x = i as f32 - frac;
                let sinc = if x.abs() < 1e-6 { 1.0 } else { (PI * x).sin() / (PI * x) };
                let pos = (i + left as isize) as f32 / (n_taps - 1.0);
                let window = 0.42 - 0.5 * (2.0 * PI * pos).cos() + 0.08 * (4.0 * PI * pos).cos();
                acc += get(i) * sinc * window;
            }
            acc
        }
    }
}

/// Multi-channel resampler instance for a single voice.
pub struct Resampler {
    kind: ResamplerKind,
    channels: usize,
    /// Q32 fractional phase, shared across channels (one time axis).
    phase: u32,
    step_int: usize,
    step_frac: u32,
    /// Per-channel left-context history, length `kind.context().0`.
    histories: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(kind: ResamplerKind, channels: usize) -> Self {
        let (left, _right) = kind.context();
        Self {
            kind,
            channels,
            phase: 0,
            step_int: 1,
            step_frac: 0,
            histories: vec![vec![0.0; left]; channels],
        }
    }

    /// Recompute `step = (source_rate * pitch) / device_rate` in fixed
    /// point (spec §4.F step 2). Phase and history are left untouched so
    /// rate changes are smooth, not a hard reset.
    pub fn set_rate(&mut self, source_rate: f64, device_rate: f64, pitch: f64) {
        let ratio = (source_rate * pitch) / device_rate;
        let step_int = ratio.floor().max(0.0) as usize;
        let mut frac_scaled = ((ratio - ratio.floor()) * (u32::MAX as f64 + 1.0)).round() as u64;
        let mut step_int = step_int;
        if frac_scaled > u32::MAX as u64 {
            step_int += 1;
            frac_scaled = 0;
        }
        self.step_int = step_int;
        self.step_frac = frac_scaled as u32;
    }

    pub fn reset(&mut self) {
        self.phase = 0;
        for h in &mut self.histories {
            h.iter_mut().for_each(|s| *s = 0.0);
        }
    }

    /// Kernel half-width that must be supplied as lookahead in each
    /// channel's `inputs` slice beyond the frames expected to be consumed.
    pub fn lookahead(&self) -> usize {
        self.kind.context().1
    }

    /// Produce up to `outputs[_].len()` samples per channel from `inputs`,
    /// advancing the shared phase in lockstep across channels. Returns how
    /// many input frames were consumed (spec §4.E contract).
    pub fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> usize {
        assert_eq!(inputs.len(), self.channels);
        assert_eq!(outputs.len(), self.channels);
        let out_len = outputs.first().map_or(0, |o| o.len());
        let (left, right) = self.kind.context();
        let max_input_len = inputs.iter().map(|s| s.len()).min().unwrap_or(0);

        let mut base = 0usize;
        let mut produced = 0usize;
        let mut phase = self.phase;

        while produced < out_len {
            if base + right >= max_input_len {
                break;
            }
            let frac = phase as f32 / (u32::MAX as f32 + 1.0);
            for c in 0..self.channels {
                let history = &self.histories[c];
                let input = inputs[c];
                let get = |offset: isize| -> f32 {
                    let j = base as isize + offset;
                    if j < 0 {
                        let hidx = left as isize + j;
                        if hidx >= 0 { history[hidx as usize] } else { 0.0 }
                    } else {
                        *input.get(j as usize).unwrap_or(&0.0)
                    }
                };
                outputs[c][produced] = kernel_sample(self.kind, get, frac);
            }
            let (new_frac, carry) = phase.overflowing_add(self.step_frac);
            phase = new_frac;
            base += self.step_int + carry as usize;
            produced += 1;
        }

        self.phase = phase;
        let consumed = base.min(max_input_len);

        let mut new_hist = [0.0f32; MAX_LEFT];
        for c in 0..self.channels {
            let history = &self.histories[c];
            let input = inputs[c];
            for (k, slot) in new_hist.iter_mut().take(left).enumerate() {
                let j = consumed as isize - left as isize + k as isize;
                *slot = if j < 0 {
                    let hidx = left as isize + j;
                    if hidx >= 0 { history[hidx as usize] } else { 0.0 }
                } else {
                    *input.get(j as usize).unwrap_or(&0.0)
                };
            }
            self.histories[c][..left].copy_from_slice(&new_hist[..left]);
        }

        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_pitch_linear_reproduces_input() {
        let mut r = Resampler::new(ResamplerKind::Linear, 1);
        r.set_rate(48000.0, 48000.0, 1.0);
        let input = [0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0, 0.0, 0.0];
        let mut out = vec![0.0f32; 5];
        let consumed = r.process(&[&input], &mut [&mut out]);
        assert_eq!(consumed, 5);
        for (o, expected) in out.iter().zip([0.0, 1.0, 2.0, 3.0, 4.0]) {
            assert!((o - expected).abs() < 1e-4, "{o} vs {expected}");
        }
    }

    #[test]
    fn double_pitch_consumes_roughly_twice_the_frames() {
        let mut r = Resampler::new(ResamplerKind::Linear, 1);
        r.set_rate(48000.0, 48000.0, 2.0);
        let input: Vec<f32> = (0..40).map(|i| i as f32).collect();
        let mut out = vec![0.0f32; 10];
        let consumed = r.process(&[&input], &mut [&mut out]);
        // 10 output frames at step 2.0 consume ~20 input frames (+/-1 for
        // fixed-point rounding), matching the spec §8 property 8 bound.
        assert!((consumed as i64 - 20).abs() <= 1);
    }

    #[test]
    fn nearest_picks_closest_sample() {
        let mut r = Resampler::new(ResamplerKind::Nearest, 1);
        r.set_rate(44100.0, 44100.0, 1.0);
        let input = [10.0f32, 20.0, 30.0, 0.0];
        let mut out = [0.0f32; 2];
        r.process(&[&input], &mut [&mut out]);
        assert_eq!(out, [10.0, 20.0]);
    }

    #[test]
    fn fir_kernels_report_lookahead_and_consume_within_bounds() {
        let mut r = Resampler::new(ResamplerKind::Fir12, 2);
        r.set_rate(48000.0, 44100.0, 1.0);
        assert_eq!(r.lookahead(), 6);
        let ch0: Vec<f32> = (0..64).map(|i| (i as f32 * 0.1).sin()).collect();
        let ch1: Vec<f32> = (0..64).map(|i| (i as f32 * 0.2).cos()).collect();
        let mut out0 = vec![0.0f32; 20];
        let mut out1 = vec![0.0f32; 20];
        let consumed = r.process(&[&ch0, &ch1], &mut [&mut out0, &mut out1]);
        assert!(consumed <= 64);
        assert!(out0.iter().all(|v| v.is_finite()));
    }
}
