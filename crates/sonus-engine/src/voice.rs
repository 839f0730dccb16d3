//! The mixer's private per-active-source state (component F, spec §4.F):
//! resampler state, per-output-channel gain ramps, direct-path filter
//! state and the buffer-queue cursor. One instance is allocated per
//! Playing source and retired when the source stops, rewinds, or drains
//! its queue.

use sonus_core::{Buffer, Id, Registry};
use sonus_dsp::{BiquadCoeffs, BiquadState, GainRamp, Resampler, ResamplerKind};
use sonus_spatial::{pan, ListenerFrame, PanTarget, PannerInput};

use crate::source::{Cursor, SourceParams};

/// Outcome of mixing one period for a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceOutcome {
    /// Keep the voice; playback continues next period.
    Continue,
    /// The queue drained with no loop active; the Context should retire
    /// this voice and transition the source to Stopped (spec §4.F step 9).
    Retire,
}

pub struct Voice {
    channels: usize,
    resampler: Resampler,
    filters: Vec<BiquadState>,
    /// `gain_ramps[input_channel][output_channel]`: the voice's
    /// per-(input-channel × output-channel) gain matrix (spec §3 Voice
    /// attribute, spec §4.F step 7).
    gain_ramps: Vec<Vec<GainRamp>>,
    send_gain_ramps: Vec<GainRamp>,
    pending_stop: bool,
    /// Scratch per-channel input window, reused every period to avoid
    /// per-period allocation on the mixer thread after warm-up.
    scratch_input: Vec<Vec<f32>>,
    scratch_resampled: Vec<Vec<f32>>,
}

impl Voice {
    pub fn new(kind: ResamplerKind, channels: usize, num_output_channels: usize, num_sends: usize) -> Self {
        Self {
            channels,
            resampler: Resampler::new(kind, channels),
            filters: vec![BiquadState::default(); channels],
            gain_ramps: (0..channels).map(|_| vec![GainRamp::new(0.0); num_output_channels]).collect(),
            send_gain_ramps: vec![GainRamp::new(0.0); num_sends],
            pending_stop: false,
            scratch_input: vec![Vec::new(); channels],
            scratch_resampled: vec![Vec::new(); channels],
        }
    }

    pub fn pending_stop(&self) -> bool {
        self.pending_stop
    }

    /// Mix one period for this voice (spec §4.F steps 1-8): fetch frames
    /// from the buffer queue handling end-of-buffer/looping, resample,
    /// direct-path filter, pan into `dry_mix`, and accumulate into any
    /// active sends.
    #[allow(clippy::too_many_arguments)]
    pub fn mix_period(
        &mut self,
        cursor: Cursor,
        queue: &[Id],
        registry: &Registry<Buffer>,
        params: &SourceParams,
        listener: &ListenerFrame,
        pan_target: PanTarget,
        device_rate: f64,
        period_frames: usize,
        dry_mix: &mut [Vec<f32>],
        send_outputs: &mut [Vec<f32>],
    ) -> (Cursor, VoiceOutcome) {
        if queue.is_empty() {
            self.pending_stop = true;
            return (cursor, VoiceOutcome::Retire);
        }

        let current_id = queue[cursor.queue_index.min(queue.len() - 1)];
        let source_rate = registry.with(current_id, |b| b.frequency()).unwrap_or(device_rate as u32) as f64;
        self.resampler.set_rate(source_rate, device_rate, params.pitch.max(1e-4) as f64);
        let lookahead = self.resampler.lookahead();

        // A conservative over-estimate of how many source frames could be
        // needed to fill `period_frames` output frames at this step; the
        // resampler reports exactly how many it actually consumed.
        let step = (source_rate * params.pitch.max(1e-4) as f64 / device_rate).max(0.0);
        let need = (period_frames as f64 * step).ceil() as usize + lookahead + 1;

        let looping = params.looping && queue.len() == 1;
        let mut new_cursor = cursor;
        let mut drained = false;

        for ch in 0..self.channels {
            let window = &mut self.scratch_input[ch];
            window.clear();
            gather_window(registry, queue, cursor, ch, need, looping, window, &mut drained);
        }

        let mut outputs: Vec<&mut [f32]> = Vec::with_capacity(self.channels);
        for ch in 0..self.channels {
            let buf = &mut self.scratch_resampled[ch];
            buf.clear();
            buf.resize(period_frames, 0.0);
        }
        for buf in &mut self.scratch_resampled {
            outputs.push(buf.as_mut_slice());
        }
        let inputs: Vec<&[f32]> = self.scratch_input.iter().map(|v| v.as_slice()).collect();
        let consumed = self.resampler.process(&inputs, &mut outputs);

        new_cursor = advance_cursor(registry, queue, cursor, consumed, looping, &mut self.pending_stop, &mut drained);

        // Direct-path filter (step 6) and pan/send accumulation (steps 7-8).
        let panner_input = PannerInput {
            source_position: params.position,
            source_direction: params.direction,
            relative_to_listener: params.relative_to_listener,
            gain: params.gain,
            min_gain: params.min_gain,
            max_gain: params.max_gain,
            cone: params.cone,
            distance: params.distance,
            stereo_angles: params.stereo_angles,
        };
        let panned = pan(&panner_input, listener, pan_target, self.channels);
        let hf_gain = panned.hf_gain.min(params.direct_gain_hf);
        let coeffs = BiquadCoeffs::from_hf_gain(hf_gain, device_rate as f32);

        for (ch, filter) in self.filters.iter_mut().enumerate() {
            let samples = &mut self.scratch_resampled[ch];
            for s in samples.iter_mut() {
                *s = filter.process(&coeffs, *s);
            }
        }

        // Multiply-accumulate each input channel through its own row of the
        // gain matrix (spec §4.F step 7) rather than collapsing the voice's
        // channels to mono before panning.
        let out_channels = dry_mix.len();
        for in_ch in 0..self.channels {
            let Some(row) = self.gain_ramps.get_mut(in_ch) else { continue };
            let gains_row = panned.gains.get(in_ch);
            for (out_ch, ramp) in row.iter_mut().enumerate().take(out_channels) {
                let target = gains_row.and_then(|r| r.get(out_ch)).copied().unwrap_or(0.0);
                ramp.set_target(target, period_frames as u32);
            }
        }
        for frame in 0..period_frames {
            for in_ch in 0..self.channels {
                let sample = self.scratch_resampled[in_ch][frame];
                let Some(row) = self.gain_ramps.get_mut(in_ch) else { continue };
                for out_ch in 0..out_channels.min(row.len()) {
                    let g = row[out_ch].next();
                    dry_mix[out_ch][frame] += sample * g;
                }
            }
        }

        for (i, send) in params.sends.iter().enumerate() {
            if send.slot.is_none() || i >= self.send_gain_ramps.len() || i >= send_outputs.len() {
                continue;
            }
            let gain_hf = send.gain_hf.clamp(0.0, 1.0);
            self.send_gain_ramps[i].set_target(send.gain, period_frames as u32);
            let out = &mut send_outputs[i];
            out.clear();
            out.resize(period_frames, 0.0);
            for (frame_idx, sample) in out.iter_mut().enumerate() {
                let g = self.send_gain_ramps[i].next();
                let mono: f32 = (0..self.channels).map(|ch| self.scratch_resampled[ch][frame_idx]).sum::<f32>()
                    / self.channels.max(1) as f32;
                *sample = mono * g * gain_hf;
            }
        }

        if drained && !looping {
            self.pending_stop = true;
        }

        if self.pending_stop {
            (new_cursor, VoiceOutcome::Retire)
        } else {
            (new_cursor, VoiceOutcome::Continue)
        }
    }
}

/// Fill `window` with up to `need` contiguous samples for `channel`
/// starting at `cursor`, crossing at most one buffer boundary (spec
/// §4.E's "virtual contiguous view"): the tail of the current buffer
/// followed by the head of the next queued buffer, or the loop start of
/// the same buffer when looping. Sets `drained` if the queue has no more
/// material past the current buffer and is not looping.
fn gather_window(
    registry: &Registry<Buffer>,
    queue: &[Id],
    cursor: Cursor,
    channel: usize,
    need: usize,
    looping: bool,
    window: &mut Vec<f32>,
    drained: &mut bool,
) {
    let idx = cursor.queue_index.min(queue.len() - 1);
    let current_id = queue[idx];
    let current_len = registry.with(current_id, |b| b.sample_length()).unwrap_or(0);
    let loop_end = if looping {
        registry.with(current_id, |b| b.loop_points().end).unwrap_or(current_len)
    } else {
        current_len
    };
    let wrap_at = if looping { loop_end } else { current_len };
    let remaining = wrap_at.saturating_sub(cursor.frame_offset as usize);
    let take_now = remaining.min(need);

    registry.with(current_id, |b| b.read_frames_f32(cursor.frame_offset as usize, take_now, channel, window));

    let mut have = window.len();
    if have < need {
        if idx + 1 < queue.len() {
            let next_id = queue[idx + 1];
            let mut tail = Vec::new();
            registry.with(next_id, |b| b.read_frames_f32(0, need - have, channel, &mut tail));
            window.extend_from_slice(&tail);
        } else if looping {
            let loop_start = registry.with(current_id, |b| b.loop_points().start).unwrap_or(0);
            let mut tail = Vec::new();
            registry.with(current_id, |b| b.read_frames_f32(loop_start, need - have, channel, &mut tail));
            window.extend_from_slice(&tail);
        } else {
            *drained = true;
            window.resize(need, 0.0);
        }
    }
    have = window.len();
    if have < need {
        window.resize(need, 0.0);
    }
}

/// Advance the cursor by `consumed` source frames, crossing into the next
/// queued buffer or wrapping to the loop start as `gather_window` did.
fn advance_cursor(
    registry: &Registry<Buffer>,
    queue: &[Id],
    cursor: Cursor,
    consumed: usize,
    looping: bool,
    pending_stop: &mut bool,
    drained: &mut bool,
) -> Cursor {
    let idx = cursor.queue_index.min(queue.len() - 1);
    let current_id = queue[idx];
    let current_len = registry.with(current_id, |b| b.sample_length()).unwrap_or(0);
    let loop_end = if looping {
        registry.with(current_id, |b| b.loop_points().end).unwrap_or(current_len)
    } else {
        current_len
    };
    let wrap_at = if looping { loop_end } else { current_len };
    let new_offset = cursor.frame_offset as usize + consumed;

    if new_offset < wrap_at {
        return Cursor { queue_index: idx, frame_offset: new_offset as u64 };
    }

    let overflow = new_offset - wrap_at;
    if idx + 1 < queue.len() {
        Cursor { queue_index: idx + 1, frame_offset: overflow as u64 }
    } else if looping {
        let loop_start = registry.with(current_id, |b| b.loop_points().start).unwrap_or(0);
        Cursor { queue_index: idx, frame_offset: (loop_start + overflow) as u64 }
    } else {
        *drained = true;
        *pending_stop = true;
        Cursor { queue_index: idx, frame_offset: current_len as u64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonus_core::{AccessFlags, ChannelLayout, Format, SampleType};
    use sonus_spatial::{AmbisonicOrder, ListenerFrame};

    fn mono_buffer(frames: usize, value_fn: impl Fn(usize) -> i16) -> Buffer {
        let mut data = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            data.extend_from_slice(&value_fn(i).to_le_bytes());
        }
        let buf = Buffer::empty();
        buf.upload(Format::new(ChannelLayout::Mono, SampleType::I16), &data, 44100, 0, AccessFlags::NONE)
            .unwrap();
        buf
    }

    #[test]
    fn voice_retires_when_nonlooping_queue_drains() {
        let registry = Registry::new();
        let id = registry.insert(mono_buffer(16, |_| 1000));
        let mut voice = Voice::new(ResamplerKind::Linear, 1, 2, 0);
        let params = SourceParams { looping: false, ..SourceParams::default() };
        let listener = ListenerFrame::default();
        let mut dry_mix = vec![vec![0.0f32; 64]; 2];
        let mut cursor = Cursor::default();
        let mut outcome = VoiceOutcome::Continue;
        for _ in 0..10 {
            let (next, o) = voice.mix_period(
                cursor,
                &[id],
                &registry,
                &params,
                &listener,
                PanTarget::Stereo,
                44100.0,
                64,
                &mut dry_mix,
                &mut [],
            );
            cursor = next;
            outcome = o;
            if outcome == VoiceOutcome::Retire {
                break;
            }
        }
        assert_eq!(outcome, VoiceOutcome::Retire);
    }

    #[test]
    fn voice_loops_indefinitely_when_looping_flag_set() {
        let registry = Registry::new();
        let id = registry.insert(mono_buffer(16, |_| 1000));
        let mut voice = Voice::new(ResamplerKind::Linear, 1, 2, 0);
        let params = SourceParams { looping: true, ..SourceParams::default() };
        let listener = ListenerFrame::default();
        let mut dry_mix = vec![vec![0.0f32; 64]; 2];
        let mut cursor = Cursor::default();
        let mut outcome = VoiceOutcome::Continue;
        for _ in 0..20 {
            let (next, o) = voice.mix_period(
                cursor,
                &[id],
                &registry,
                &params,
                &listener,
                PanTarget::Stereo,
                44100.0,
                64,
                &mut dry_mix,
                &mut [],
            );
            cursor = next;
            outcome = o;
        }
        assert_eq!(outcome, VoiceOutcome::Continue);
    }

    #[test]
    fn voice_wraps_at_custom_loop_end_not_buffer_length() {
        let registry = Registry::new();
        let buffer = mono_buffer(16, |i| i as i16);
        buffer.set_loop_points(sonus_core::LoopPoints { start: 0, end: 8 }).unwrap();
        let id = registry.insert(buffer);
        let mut voice = Voice::new(ResamplerKind::Linear, 1, 2, 0);
        let params = SourceParams { looping: true, ..SourceParams::default() };
        let listener = ListenerFrame::default();
        let mut dry_mix = vec![vec![0.0f32; 4]; 2];
        let mut cursor = Cursor::default();
        let mut max_offset_seen = 0u64;
        for _ in 0..40 {
            let (next, _) = voice.mix_period(
                cursor,
                &[id],
                &registry,
                &params,
                &listener,
                PanTarget::Stereo,
                44100.0,
                4,
                &mut dry_mix,
                &mut [],
            );
            cursor = next;
            max_offset_seen = max_offset_seen.max(cursor.frame_offset);
        }
        assert!(max_offset_seen < 8, "cursor advanced past the custom loop end: {max_offset_seen}");
    }

    #[test]
    fn ambisonic_target_writes_into_four_dry_mix_channels() {
        let registry = Registry::new();
        let id = registry.insert(mono_buffer(256, |i| ((i % 100) as i16) * 100));
        let mut voice = Voice::new(ResamplerKind::Linear, 1, 4, 0);
        let params = SourceParams::default();
        let listener = ListenerFrame::default();
        let mut dry_mix = vec![vec![0.0f32; 64]; 4];
        voice.mix_period(
            Cursor::default(),
            &[id],
            &registry,
            &params,
            &listener,
            PanTarget::Ambisonic(AmbisonicOrder::First),
            44100.0,
            64,
            &mut dry_mix,
            &mut [],
        );
        assert!(dry_mix.iter().any(|ch| ch.iter().any(|&s| s != 0.0)));
    }
}
