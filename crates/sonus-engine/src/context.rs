//! Context (mixer core, component H, spec §4.H): owns the voice array,
//! drives one mixing period end to end, and hands retired sources back
//! to the API side for state finalization.

use std::sync::Arc;

use sonus_core::{Buffer, Id, Registry, SonusError, SonusResult};
use sonus_dsp::ResamplerKind;
use sonus_spatial::{AmbisonicDecoder, AmbisonicOrder, HrtfDataset, PanTarget, PartitionedConvolver, SpeakerDirection};

use crate::listener::Listener;
use crate::slot::EffectGraph;
use crate::source::{Source, SourceState, MAX_SENDS};
use crate::voice::{Voice, VoiceOutcome};

/// How the context's internal mix is turned into the final output buffer
/// (spec §4.H step 5, §4.I).
pub enum PostProcess {
    /// The internal mix already is the final stereo output.
    DirectStereo,
    /// Ambisonic internal mix, decoded to an arbitrary speaker layout.
    Ambisonic { order: AmbisonicOrder, decoder: AmbisonicDecoder },
    /// Ambisonic internal mix, rendered to stereo via per-virtual-speaker
    /// HRIR convolution (spec §4.I).
    Hrtf(Box<HrtfRenderer>),
}

impl PostProcess {
    fn pan_target(&self) -> PanTarget {
        match self {
            PostProcess::DirectStereo => PanTarget::Stereo,
            PostProcess::Ambisonic { order, .. } => PanTarget::Ambisonic(*order),
            PostProcess::Hrtf(r) => PanTarget::Ambisonic(r.order),
        }
    }

    fn internal_channels(&self) -> usize {
        match self {
            PostProcess::DirectStereo => 2,
            PostProcess::Ambisonic { order, .. } => order.channel_count(),
            PostProcess::Hrtf(r) => r.order.channel_count(),
        }
    }
}

/// Decodes a first/second/third-order Ambisonic internal mix to a ring of
/// virtual speakers, then convolves each speaker's signal with that
/// direction's measured HRIR and sums into a stereo pair (spec §4.I:
/// "each Ambisonic channel is convolved with a pre-computed
/// direction-independent virtual-speaker HRIR").
pub struct HrtfRenderer {
    order: AmbisonicOrder,
    decoder: AmbisonicDecoder,
    left: Vec<PartitionedConvolver>,
    right: Vec<PartitionedConvolver>,
    block: usize,
}

/// Evenly spaced virtual speaker ring used to decode the Ambisonic mix
/// before per-direction HRIR convolution.
fn virtual_speaker_ring(count: usize) -> Vec<SpeakerDirection> {
    (0..count)
        .map(|i| SpeakerDirection { azimuth_deg: i as f32 * 360.0 / count as f32, elevation_deg: 0.0 })
        .collect()
}

impl HrtfRenderer {
    pub fn new(dataset: &HrtfDataset, order: AmbisonicOrder, block: usize) -> Self {
        let speakers = virtual_speaker_ring(8);
        let decoder = AmbisonicDecoder::new(order, &speakers);
        let mut left = Vec::with_capacity(speakers.len());
        let mut right = Vec::with_capacity(speakers.len());
        for speaker in &speakers {
            let measurement = dataset.nearest(speaker.azimuth_deg, speaker.elevation_deg);
            let (l, r) = match measurement {
                Some(m) => (m.left.clone(), m.right.clone()),
                None => (vec![0.0; block], vec![0.0; block]),
            };
            left.push(PartitionedConvolver::new(&l, block));
            right.push(PartitionedConvolver::new(&r, block));
        }
        Self { order, decoder, left, right, block }
    }

    fn render(&mut self, ambisonic: &[Vec<f32>], out_left: &mut [f32], out_right: &mut [f32]) {
        let Ok(speaker_signals) = self.decoder.decode(ambisonic) else { return };
        out_left.iter_mut().for_each(|s| *s = 0.0);
        out_right.iter_mut().for_each(|s| *s = 0.0);
        let mut scratch_l = vec![0.0f32; self.block];
        let mut scratch_r = vec![0.0f32; self.block];
        for (i, signal) in speaker_signals.iter().enumerate() {
            if i >= self.left.len() {
                break;
            }
            let mut padded = signal.clone();
            padded.resize(self.block, 0.0);
            self.left[i].process(&padded, &mut scratch_l);
            self.right[i].process(&padded, &mut scratch_r);
            for f in 0..out_left.len().min(self.block) {
                out_left[f] += scratch_l[f];
                out_right[f] += scratch_r[f];
            }
        }
    }
}

struct VoiceSlot {
    source_id: Id,
    voice: Voice,
}

/// Hard cap on simultaneously active voices (spec §4.H: "a fixed array
/// sized at context creation").
pub const DEFAULT_MAX_VOICES: usize = 256;

pub struct Context {
    buffers: Arc<Registry<Buffer>>,
    /// Shared with the owning `Device` (spec §5: application threads must
    /// be able to create/play/pause/stop sources without taking any lock
    /// the mixer callback holds). `Registry`'s own ops are `&self`, so this
    /// `Arc` clone lets `Device` act on sources directly — the mixer only
    /// needs it for the per-period voice-bind scan in `mix`.
    sources: Arc<Registry<Arc<Source>>>,
    pub listener: Listener,
    pub effects: EffectGraph,
    voices: Vec<Option<VoiceSlot>>,
    device_rate: f64,
    post: PostProcess,
    output_channels: usize,
    dry_mix: Vec<Vec<f32>>,
    send_scratch: Vec<Vec<f32>>,
    resampler_kind: ResamplerKind,
}

impl Context {
    pub fn new(
        buffers: Arc<Registry<Buffer>>,
        sources: Arc<Registry<Arc<Source>>>,
        device_rate: f64,
        output_channels: usize,
        post: PostProcess,
        max_voices: usize,
    ) -> Self {
        let internal_channels = post.internal_channels();
        Self {
            buffers,
            sources,
            listener: Listener::new(),
            effects: EffectGraph::new(),
            voices: (0..max_voices.max(1)).map(|_| None).collect(),
            device_rate,
            post,
            output_channels,
            dry_mix: vec![Vec::new(); internal_channels],
            send_scratch: (0..MAX_SENDS).map(|_| Vec::new()).collect(),
            resampler_kind: ResamplerKind::Linear,
        }
    }

    pub fn set_resampler_kind(&mut self, kind: ResamplerKind) {
        self.resampler_kind = kind;
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Swap the post-process stage, e.g. for HRTF re-selection or an
    /// Ambisonic order change at `reset` time (spec §4.K). Resizes the
    /// internal dry mix to match the new stage's channel count; existing
    /// voices keep playing and simply start writing into the resized mix
    /// on the next period.
    pub fn set_post(&mut self, post: PostProcess) {
        self.dry_mix = vec![Vec::new(); post.internal_channels()];
        self.post = post;
    }

    pub fn set_output_channels(&mut self, output_channels: usize) {
        self.output_channels = output_channels;
    }

    /// Structural ops below (`create_source`/`delete_source`/`source`/
    /// `play`) take `&self`, not `&mut self`: `Registry` and `Source` are
    /// internally synchronized, so these never need the exclusive access
    /// that binding a voice slot does. An application thread calling
    /// `Device::play` never has to contend for the same lock the mixer
    /// callback holds (spec §5) — see `mix`'s voice-bind scan below, which
    /// is the only place `bind_voice` still runs.
    pub fn create_source(&self) -> Id {
        self.sources.insert(Arc::new(Source::new(self.buffers.clone())))
    }

    pub fn source(&self, id: Id) -> Option<Arc<Source>> {
        self.sources.with(id, |s| s.clone())
    }

    /// Fails if the source is Playing or Paused (spec §4.G "delete").
    pub fn delete_source(&self, id: Id) -> SonusResult<()> {
        let can_delete = self.sources.with(id, |s| s.can_delete());
        match can_delete {
            Some(true) => {
                self.sources.remove(id);
                Ok(())
            }
            Some(false) => Err(SonusError::InvalidOperation("source is Playing or Paused".into())),
            None => Err(SonusError::InvalidName(format!("no such source: {id:?}"))),
        }
    }

    /// `play` (spec §4.F/§4.G): transitions the source's own state machine.
    /// Voice binding happens lazily, inside `mix`, on the next period.
    pub fn play(&self, id: Id) -> SonusResult<()> {
        let source = self
            .sources
            .with(id, |s| s.clone())
            .ok_or_else(|| SonusError::InvalidName(format!("no such source: {id:?}")))?;
        source.play()
    }

    /// Bind a free voice slot to `id` if it doesn't already have one; fails
    /// silently if no slot is free (spec §4.H: "allocating a voice fails
    /// silently ... if no slots are free").
    fn bind_voice(&mut self, id: Id) {
        if self.voices.iter().flatten().any(|v| v.source_id == id) {
            return;
        }
        let Some(slot_index) = self.voices.iter().position(|s| s.is_none()) else { return };
        let channels = self
            .sources
            .with(id, |s| s.queued_buffers())
            .and_then(|q| q.first().copied())
            .and_then(|b| self.buffers.with(b, |buf| buf.channels()))
            .unwrap_or(1);
        self.voices[slot_index] = Some(VoiceSlot {
            source_id: id,
            voice: Voice::new(self.resampler_kind, channels.max(1), self.dry_mix.len(), MAX_SENDS),
        });
    }

    /// Run one mixing period, writing interleaved `f32` samples for
    /// `output_channels` into `output` (length `frame_count *
    /// output_channels`). Returns the set of sources retired this period.
    pub fn mix(&mut self, output: &mut [f32], frame_count: usize) -> Vec<Id> {
        self.listener.publish_if_dirty();

        // Bind a voice to any source that transitioned to Playing since
        // the last period. Done here rather than at `play()` time so
        // application threads calling `play`/`pause`/`stop`/`rewind` never
        // touch the voice array the mixer owns (spec §4.H, §5).
        for id in self.sources.ids() {
            if self.sources.with(id, |s| s.state()) == Some(SourceState::Playing) {
                self.bind_voice(id);
            }
        }

        for ch in &mut self.dry_mix {
            ch.clear();
            ch.resize(frame_count, 0.0);
        }
        self.effects.clear_inputs(frame_count);

        let listener_frame = self.listener.frame();
        let pan_target = self.post.pan_target();
        let buffers = self.buffers.clone();
        let mut retired = Vec::new();

        for slot in self.voices.iter_mut() {
            let Some(vs) = slot else { continue };
            let Some(source) = self.sources.with(vs.source_id, |s| s.clone()) else {
                retired.push(vs.source_id);
                *slot = None;
                continue;
            };
            source.publish_if_dirty();
            if source.state() != SourceState::Playing {
                retired.push(vs.source_id);
                *slot = None;
                continue;
            }

            let params = source.snapshot();
            let queue = source.queued_buffers();
            let cursor = source.cursor();

            for s in &mut self.send_scratch {
                s.clear();
            }
            let (next_cursor, outcome) = vs.voice.mix_period(
                cursor,
                &queue,
                &buffers,
                &params,
                &listener_frame,
                pan_target,
                self.device_rate,
                frame_count,
                &mut self.dry_mix,
                &mut self.send_scratch,
            );
            source.set_cursor(next_cursor);
            // Mark each queue slot the mixer has fully crossed as processed
            // as soon as it crosses, not only once the whole queue drains —
            // otherwise `unqueue_buffers` stays rejected for every
            // already-finished buffer until the last one in the queue ends
            // (spec §4.G, Scenario S2).
            if next_cursor.queue_index > cursor.queue_index {
                source.mark_processed(next_cursor.queue_index - cursor.queue_index);
            }
            for (i, send) in params.sends.iter().enumerate() {
                if let Some(slot_id) = send.slot {
                    if let Some(contribution) = self.send_scratch.get(i) {
                        if !contribution.is_empty() {
                            self.effects.with_mut(slot_id, |s| s.accumulate_input(contribution));
                        }
                    }
                }
            }

            if outcome == VoiceOutcome::Retire {
                // Whatever the incremental crossing above didn't already
                // cover (the final buffer, which a full drain leaves
                // `next_cursor.queue_index` still pointing at rather than
                // advancing past) is processed too.
                let remaining = queue.len().saturating_sub(next_cursor.queue_index);
                source.mark_processed(remaining);
                let _ = source.stop();
                retired.push(vs.source_id);
                *slot = None;
            }
        }

        self.effects.process_all(&mut self.dry_mix);

        match &mut self.post {
            PostProcess::DirectStereo => {
                for frame in 0..frame_count {
                    for ch in 0..self.output_channels {
                        let src = self.dry_mix.get(ch).map(|c| c[frame]).unwrap_or(0.0);
                        if let Some(dst) = output.get_mut(frame * self.output_channels + ch) {
                            *dst = src;
                        }
                    }
                }
            }
            PostProcess::Ambisonic { decoder, .. } => {
                if let Ok(speakers) = decoder.decode(&self.dry_mix) {
                    for frame in 0..frame_count {
                        for ch in 0..self.output_channels {
                            let src = speakers.get(ch).map(|c| c[frame]).unwrap_or(0.0);
                            if let Some(dst) = output.get_mut(frame * self.output_channels + ch) {
                                *dst = src;
                            }
                        }
                    }
                }
            }
            PostProcess::Hrtf(renderer) => {
                let mut left = vec![0.0f32; frame_count];
                let mut right = vec![0.0f32; frame_count];
                renderer.render(&self.dry_mix, &mut left, &mut right);
                for frame in 0..frame_count {
                    if let Some(dst) = output.get_mut(frame * self.output_channels) {
                        *dst = left[frame];
                    }
                    if self.output_channels > 1 {
                        if let Some(dst) = output.get_mut(frame * self.output_channels + 1) {
                            *dst = right[frame];
                        }
                    }
                }
            }
        }

        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonus_core::AccessFlags;
    use sonus_core::{ChannelLayout, Format, SampleType};

    fn mono_buffer(frames: usize) -> Buffer {
        let data = vec![0u8; frames * 2];
        let buf = Buffer::empty();
        buf.upload(Format::new(ChannelLayout::Mono, SampleType::I16), &data, 44100, 0, AccessFlags::NONE)
            .unwrap();
        buf
    }

    #[test]
    fn playing_source_produces_output_without_panicking() {
        let buffers = Arc::new(Registry::new());
        let id = buffers.insert(mono_buffer(4096));
        let mut ctx = Context::new(buffers.clone(), Arc::new(Registry::new()), 44100.0, 2, PostProcess::DirectStereo, 8);
        let source_id = ctx.create_source();
        let source = ctx.source(source_id).unwrap();
        source.queue_buffers(&[id]).unwrap();
        ctx.play(source_id).unwrap();

        let mut output = vec![0.0f32; 64 * 2];
        let retired = ctx.mix(&mut output, 64);
        assert!(retired.is_empty());
        assert!(output.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn stopping_a_source_retires_its_voice_next_period() {
        let buffers = Arc::new(Registry::new());
        let id = buffers.insert(mono_buffer(4096));
        let mut ctx = Context::new(buffers.clone(), Arc::new(Registry::new()), 44100.0, 2, PostProcess::DirectStereo, 8);
        let source_id = ctx.create_source();
        let source = ctx.source(source_id).unwrap();
        source.queue_buffers(&[id]).unwrap();
        ctx.play(source_id).unwrap();

        let mut output = vec![0.0f32; 64 * 2];
        ctx.mix(&mut output, 64);
        source.stop().unwrap();
        let retired = ctx.mix(&mut output, 64);
        assert_eq!(retired, vec![source_id]);
    }

    #[test]
    fn mid_queue_buffer_crossing_marks_exactly_that_buffer_processed() {
        let buffers = Arc::new(Registry::new());
        let a = buffers.insert(mono_buffer(64));
        let b = buffers.insert(mono_buffer(64));
        let c = buffers.insert(mono_buffer(64));
        let mut ctx = Context::new(buffers.clone(), Arc::new(Registry::new()), 44100.0, 2, PostProcess::DirectStereo, 8);
        let source_id = ctx.create_source();
        let source = ctx.source(source_id).unwrap();
        source.queue_buffers(&[a, b, c]).unwrap();
        ctx.play(source_id).unwrap();

        // Unity sample rate and pitch consume exactly `period_frames`
        // source frames per period, so one 64-frame period exactly drains
        // the first of three 64-frame buffers without touching the rest.
        assert!(source.unqueue_buffers(1).is_err());
        let mut output = vec![0.0f32; 64 * 2];
        let retired = ctx.mix(&mut output, 64);
        assert!(retired.is_empty());

        assert!(source.unqueue_buffers(2).is_err());
        let unqueued = source.unqueue_buffers(1).unwrap();
        assert_eq!(unqueued, vec![a]);
        assert_eq!(source.queued_buffers(), vec![b, c]);
    }

    #[test]
    fn voice_allocation_fails_silently_once_slots_are_exhausted() {
        let buffers = Arc::new(Registry::new());
        let id = buffers.insert(mono_buffer(4096));
        let mut ctx = Context::new(buffers.clone(), Arc::new(Registry::new()), 44100.0, 2, PostProcess::DirectStereo, 1);
        let a = ctx.create_source();
        let b = ctx.create_source();
        ctx.source(a).unwrap().queue_buffers(&[id]).unwrap();
        ctx.source(b).unwrap().queue_buffers(&[id]).unwrap();
        ctx.play(a).unwrap();
        ctx.play(b).unwrap();
        assert_eq!(ctx.voices.iter().flatten().count(), 1);
        assert_eq!(ctx.source(b).unwrap().state(), SourceState::Playing);
    }
}
