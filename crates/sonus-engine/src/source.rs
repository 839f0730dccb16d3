//! Application-visible sound emitter (component G, spec §3 Source, §4.G):
//! owns the buffer queue and publishes spatial/gain parameters to the
//! mixer through the update protocol (component L).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use sonus_core::{Buffer, Id, Registry, SonusError, SonusResult};
use sonus_spatial::{ConeParams, DistanceModel, DistanceParams, Vec3};

use crate::update::UpdateChannel;

pub const MAX_SENDS: usize = 4;

/// One auxiliary send: destination effect slot, send gain and its own
/// HF-rolloff gain (spec §3: "an array of (auxiliary-send filter,
/// effect-slot reference) pairs").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendParams {
    pub slot: Option<Id>,
    pub gain: f32,
    pub gain_hf: f32,
}

impl Default for SendParams {
    fn default() -> Self {
        Self { slot: None, gain: 1.0, gain_hf: 1.0 }
    }
}

/// Everything the mixer needs about a source for one mixing period,
/// published as a single atomic snapshot (spec §4.L).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceParams {
    pub position: Vec3,
    pub velocity: Vec3,
    pub direction: Vec3,
    pub gain: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    pub distance: DistanceParams,
    pub cone: ConeParams,
    pub relative_to_listener: bool,
    pub pitch: f32,
    pub looping: bool,
    pub direct_gain_hf: f32,
    pub sends: [SendParams; MAX_SENDS],
    /// Azimuth offsets (degrees) applied to a stereo source's left/right
    /// channels (spec §3/§6 Source property `stereo_angles`); `None`
    /// leaves a stereo source panned as a single point source.
    pub stereo_angles: Option<[f32; 2]>,
}

impl Default for SourceParams {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            velocity: Vec3::zeros(),
            direction: Vec3::zeros(),
            gain: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            distance: DistanceParams {
                model: DistanceModel::Inverse { clamped: false },
                rolloff_factor: 1.0,
                reference_distance: 1.0,
                max_distance: f32::MAX,
            },
            cone: ConeParams::default(),
            relative_to_listener: false,
            pitch: 1.0,
            looping: false,
            direct_gain_hf: 1.0,
            sends: [SendParams::default(); MAX_SENDS],
            stereo_angles: Some([-30.0, 30.0]),
        }
    }
}

/// Source-state machine (spec §4.F "Source-state machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SourceState {
    Initial = 0,
    Playing = 1,
    Paused = 2,
    Stopped = 3,
}

impl SourceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SourceState::Playing,
            2 => SourceState::Paused,
            3 => SourceState::Stopped,
            _ => SourceState::Initial,
        }
    }
}

/// The mixer's snapshot of where playback is in the queue: `(queue-index,
/// frame-offset)` (spec §3 Source: "current-play cursor").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub queue_index: usize,
    pub frame_offset: u64,
}

/// An application-visible sound emitter.
pub struct Source {
    state: AtomicU8,
    params: UpdateChannel<SourceParams>,
    registry: Arc<Registry<Buffer>>,
    queue: Mutex<VecDeque<Id>>,
    cursor: Mutex<Cursor>,
    /// Count of leading queue entries the mixer has fully consumed and
    /// that are therefore eligible for `unqueue` (spec §4.G).
    processed: AtomicUsize,
}

impl Source {
    pub fn new(registry: Arc<Registry<Buffer>>) -> Self {
        Self {
            state: AtomicU8::new(SourceState::Initial as u8),
            params: UpdateChannel::new(SourceParams::default()),
            registry,
            queue: Mutex::new(VecDeque::new()),
            cursor: Mutex::new(Cursor::default()),
            processed: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn stage(&self, edit: impl FnOnce(&mut SourceParams)) {
        self.params.stage(edit);
    }

    pub fn publish_if_dirty(&self) -> bool {
        self.params.publish_if_dirty()
    }

    pub fn snapshot(&self) -> SourceParams {
        self.params.snapshot()
    }

    pub fn cursor(&self) -> Cursor {
        *self.cursor.lock()
    }

    /// Called by the Context after mixing a period to record where the
    /// voice left off.
    pub fn set_cursor(&self, cursor: Cursor) {
        *self.cursor.lock() = cursor;
    }

    pub fn queued_buffers(&self) -> Vec<Id> {
        self.queue.lock().iter().copied().collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Called by the Context when the mixer has fully drained another
    /// leading buffer.
    pub fn mark_processed(&self, count: usize) {
        self.processed.fetch_add(count, Ordering::AcqRel);
    }

    /// `queueBuffers` (spec §4.G): first queued buffer fixes the source's
    /// format; later buffers must match channels/sample type/alignment.
    pub fn queue_buffers(&self, ids: &[Id]) -> SonusResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut queue = self.queue.lock();
        let reference = match queue.front() {
            Some(&first_id) => Some(
                self.registry
                    .with(first_id, |b| (b.format(), b.unpack_block_alignment()))
                    .ok_or_else(|| SonusError::InvalidName("queued buffer no longer exists".into()))?,
            ),
            None => None,
        };

        let mut to_add = Vec::with_capacity(ids.len());
        let mut established = reference;
        for &id in ids {
            let (format, align) = self
                .registry
                .with(id, |b| (b.format(), b.unpack_block_alignment()))
                .ok_or_else(|| SonusError::InvalidName(format!("no such buffer: {id:?}")))?;
            match established {
                None => established = Some((format, align)),
                Some((expected_format, expected_align)) => {
                    let alignment_mismatch = format.sample_type.is_block_compressed() && align != expected_align;
                    if format != expected_format || alignment_mismatch {
                        return Err(SonusError::InvalidOperation(
                            "queued buffer format does not match the source's established format"
                                .into(),
                        ));
                    }
                }
            }
            to_add.push(id);
        }

        for &id in &to_add {
            self.registry.with(id, |b| b.add_ref());
            queue.push_back(id);
        }
        Ok(())
    }

    /// `unqueueBuffers`: only buffers the mixer has already fully
    /// consumed may be removed (spec §4.G).
    pub fn unqueue_buffers(&self, count: usize) -> SonusResult<Vec<Id>> {
        let processed = self.processed.load(Ordering::Acquire);
        if count > processed {
            return Err(SonusError::InvalidValue(
                "unqueue count exceeds buffers processed by the mixer".into(),
            ));
        }
        let mut queue = self.queue.lock();
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(id) = queue.pop_front() {
                self.registry.with(id, |b| b.release_ref());
                out.push(id);
            }
        }
        self.processed.fetch_sub(count, Ordering::AcqRel);
        let mut cursor = self.cursor.lock();
        cursor.queue_index = cursor.queue_index.saturating_sub(count);
        Ok(out)
    }

    /// `play` (spec §4.F state table): restarts an already-Playing source
    /// from its current cursor without interruption; resets the cursor to
    /// the head of the queue when starting from Stopped.
    pub fn play(&self) -> SonusResult<()> {
        match self.state() {
            SourceState::Playing => Ok(()),
            SourceState::Stopped => {
                *self.cursor.lock() = Cursor::default();
                self.processed.store(0, Ordering::Release);
                self.set_state(SourceState::Playing);
                Ok(())
            }
            SourceState::Initial | SourceState::Paused => {
                self.set_state(SourceState::Playing);
                Ok(())
            }
        }
    }

    pub fn pause(&self) -> SonusResult<()> {
        match self.state() {
            SourceState::Playing => {
                self.set_state(SourceState::Paused);
                Ok(())
            }
            other => Err(SonusError::InvalidOperation(format!("cannot pause from {other:?}"))),
        }
    }

    pub fn stop(&self) -> SonusResult<()> {
        match self.state() {
            SourceState::Playing | SourceState::Paused => {
                self.set_state(SourceState::Stopped);
                Ok(())
            }
            SourceState::Initial | SourceState::Stopped => Ok(()),
        }
    }

    /// `rewind`: resets the cursor; retires any in-flight voice (the
    /// Context observes the Initial state transition and tears down the
    /// voice on the next period).
    pub fn rewind(&self) -> SonusResult<()> {
        *self.cursor.lock() = Cursor::default();
        self.processed.store(0, Ordering::Release);
        self.set_state(SourceState::Initial);
        Ok(())
    }

    /// Fails if the source is Playing or Paused (spec §4.G "delete").
    pub fn can_delete(&self) -> bool {
        matches!(self.state(), SourceState::Initial | SourceState::Stopped)
    }

    /// Bytes per source frame, taken from the head of the queue — every
    /// queued buffer shares one format once established (`queue_buffers`
    /// enforces this), so the first entry speaks for the whole queue.
    fn bytes_per_frame(&self) -> u64 {
        self.queue
            .lock()
            .front()
            .and_then(|&id| self.registry.with(id, |b| (b.bits_per_sample() as u64 / 8) * b.channels() as u64))
            .unwrap_or(0)
    }

    fn frequency(&self) -> u32 {
        self.queue.lock().front().and_then(|&id| self.registry.with(id, |b| b.frequency())).unwrap_or(0)
    }

    /// `sample_offset` (get): total source frames played from the head of
    /// the queue up to the current cursor (spec §3/§6).
    pub fn sample_offset(&self) -> u64 {
        let cursor = self.cursor();
        let queue = self.queue.lock();
        let mut total = 0u64;
        for (i, &id) in queue.iter().enumerate() {
            if i >= cursor.queue_index {
                break;
            }
            total += self.registry.with(id, |b| b.sample_length() as u64).unwrap_or(0);
        }
        total + cursor.frame_offset
    }

    /// `byte_offset` (get): `sample_offset` expressed in bytes at the
    /// queue's established format (spec §3/§6).
    pub fn byte_offset(&self) -> u64 {
        self.sample_offset() * self.bytes_per_frame()
    }

    /// `sec_offset` (get): `sample_offset` expressed in seconds at the
    /// queue's established sample rate (spec §3/§6).
    pub fn sec_offset(&self) -> f64 {
        let rate = self.frequency();
        if rate == 0 {
            0.0
        } else {
            self.sample_offset() as f64 / rate as f64
        }
    }

    /// `sample_offset` (set): repositions the cursor to `frames` source
    /// frames from the head of the queue, clamped to the end of the last
    /// queued buffer if `frames` overruns the queue's total length.
    pub fn set_sample_offset(&self, frames: u64) -> SonusResult<()> {
        let queue = self.queue.lock();
        if queue.is_empty() {
            return Err(SonusError::InvalidOperation("source has no queued buffers".into()));
        }
        let mut remaining = frames;
        let mut cursor = Cursor { queue_index: queue.len() - 1, frame_offset: 0 };
        for (i, &id) in queue.iter().enumerate() {
            let len = self.registry.with(id, |b| b.sample_length() as u64).unwrap_or(0);
            if remaining < len {
                cursor = Cursor { queue_index: i, frame_offset: remaining };
                break;
            }
            remaining -= len;
            cursor = Cursor { queue_index: i, frame_offset: len };
        }
        drop(queue);
        self.set_cursor(cursor);
        Ok(())
    }

    /// `byte_offset` (set).
    pub fn set_byte_offset(&self, bytes: u64) -> SonusResult<()> {
        let bytes_per_frame = self.bytes_per_frame();
        if bytes_per_frame == 0 {
            return Err(SonusError::InvalidOperation("source has no queued buffers".into()));
        }
        self.set_sample_offset(bytes / bytes_per_frame)
    }

    /// `sec_offset` (set).
    pub fn set_sec_offset(&self, seconds: f64) -> SonusResult<()> {
        let rate = self.frequency();
        if rate == 0 {
            return Err(SonusError::InvalidOperation("source has no queued buffers".into()));
        }
        self.set_sample_offset((seconds.max(0.0) * rate as f64) as u64)
    }
}

impl std::fmt::Debug for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceState::Initial => "Initial",
            SourceState::Playing => "Playing",
            SourceState::Paused => "Paused",
            SourceState::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}
