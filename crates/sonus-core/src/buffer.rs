//! Buffer object: PCM storage, format metadata, mapping, loop points
//! (component C, spec §3, §4.C).

use parking_lot::RwLock;

use crate::convert::{
    block_shape, convert_internal, decode_alaw, decode_ima4_block, decode_msadpcm_block,
    decode_ulaw, i16_to_f32,
};
use crate::error::{SonusError, SonusResult};
use crate::sample::{Format, InternalFormat, SampleType};

/// Round a byte count up to the buffer's 16-byte storage alignment
/// (spec §3: "rounded up to 16").
const fn round_up_16(n: usize) -> usize {
    (n + 15) & !15
}

/// Read/write access requested at upload time and honored by `map`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessFlags {
    pub read: bool,
    pub write: bool,
}

impl AccessFlags {
    pub const NONE: Self = Self { read: false, write: false };
    pub const READ: Self = Self { read: true, write: false };
    pub const WRITE: Self = Self { read: false, write: true };
    pub const READ_WRITE: Self = Self { read: true, write: true };
}

/// Loop points as a half-open frame range `[start, end)` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPoints {
    pub start: usize,
    pub end: usize,
}

struct BufferInner {
    format: Format,
    internal_format: InternalFormat,
    rate: u32,
    data: Vec<u8>,
    length_frames: usize,
    loop_points: LoopPoints,
    unpack_align: u32,
    pack_align: u32,
    upload_access: AccessFlags,
    mapped: bool,
    /// Count of source-queue slots currently referencing this buffer. A
    /// buffer cannot be deleted, mapped, or have its loop points changed
    /// while this is nonzero (spec §4.C, §8 property 2).
    ref_count: usize,
}

/// A contiguous, 16-byte-aligned PCM buffer with one internal sample type
/// and one channel configuration (spec §3).
pub struct Buffer {
    inner: RwLock<BufferInner>,
}

impl Buffer {
    /// An empty buffer with no data uploaded yet (post-`gen`, pre-`bufferData`).
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(BufferInner {
                format: Format::new(crate::sample::ChannelLayout::Mono, SampleType::I16),
                internal_format: InternalFormat::I16,
                rate: 0,
                data: Vec::new(),
                length_frames: 0,
                loop_points: LoopPoints { start: 0, end: 0 },
                unpack_align: 0,
                pack_align: 0,
                upload_access: AccessFlags::NONE,
                mapped: false,
                ref_count: 0,
            }),
        }
    }

    /// `bufferData`: decompose `format`, validate alignment/frame counts,
    /// convert into internal storage, reset loop points to `[0, length)`
    /// (spec §4.C).
    pub fn upload(
        &self,
        format: Format,
        data: &[u8],
        rate: u32,
        requested_align: u32,
        access: AccessFlags,
    ) -> SonusResult<()> {
        let mut inner = self.inner.write();
        if inner.ref_count > 0 || inner.mapped {
            return Err(SonusError::InvalidOperation(
                "buffer is referenced by a voice or currently mapped".into(),
            ));
        }
        if rate == 0 {
            return Err(SonusError::InvalidValue("sample rate must be nonzero".into()));
        }

        let align = sanitize_alignment(format.sample_type, requested_align)?;
        let (decoded, length_frames) = decode_to_internal(format, data, align)?;

        inner.format = format;
        inner.internal_format = format.sample_type.internal_format();
        inner.rate = rate;
        inner.data = decoded;
        inner.length_frames = length_frames;
        inner.loop_points = LoopPoints { start: 0, end: length_frames };
        inner.unpack_align = align;
        inner.pack_align = align;
        inner.upload_access = access;
        Ok(())
    }

    /// `bufferSubData`: partial replacement; format/channels/alignment/type
    /// must match the original upload, and the byte range must be whole
    /// blocks (spec §4.C).
    pub fn sub_data(&self, format: Format, data: &[u8], offset_frames: usize) -> SonusResult<()> {
        let mut inner = self.inner.write();
        if inner.ref_count > 0 || inner.mapped {
            return Err(SonusError::InvalidOperation(
                "buffer is referenced by a voice or currently mapped".into(),
            ));
        }
        if format != inner.format {
            return Err(SonusError::InvalidOperation(
                "sub_data format must match original upload".into(),
            ));
        }
        let align = inner.unpack_align;
        let (decoded, frame_count) = decode_to_internal(format, data, align)?;
        if offset_frames + frame_count > inner.length_frames {
            return Err(SonusError::InvalidValue("sub_data range exceeds buffer length".into()));
        }
        let internal_bytes = internal_frame_stride(inner.internal_format, format);
        let start = offset_frames * internal_bytes;
        inner.data[start..start + decoded.len()].copy_from_slice(&decoded);
        Ok(())
    }

    /// `mapBuffer`: requires the requested access to have been granted at
    /// upload and no voice currently referencing the buffer; write-only
    /// regions are pre-filled with `0x55` (spec §4.C).
    pub fn map(
        &self,
        offset: usize,
        length: usize,
        access: AccessFlags,
    ) -> SonusResult<MappedRegion<'_>> {
        let mut guard = self.inner.write();
        if guard.ref_count > 0 {
            return Err(SonusError::InvalidOperation(
                "cannot map a buffer referenced by a voice".into(),
            ));
        }
        if guard.mapped {
            return Err(SonusError::InvalidOperation("buffer is already mapped".into()));
        }
        if (access.read && !guard.upload_access.read) || (access.write && !guard.upload_access.write)
        {
            return Err(SonusError::InvalidOperation(
                "requested access was not granted at upload".into(),
            ));
        }
        if offset + length > guard.data.len() {
            return Err(SonusError::InvalidValue("map range exceeds buffer storage".into()));
        }
        if access.write && !access.read {
            guard.data[offset..offset + length].fill(0x55);
        }
        guard.mapped = true;
        Ok(MappedRegion { guard, offset, length })
    }

    // ─────────────────────────── properties ───────────────────────────

    pub fn frequency(&self) -> u32 {
        self.inner.read().rate
    }

    pub fn channels(&self) -> usize {
        self.inner.read().format.channels.channel_count()
    }

    pub fn bits_per_sample(&self) -> u32 {
        match self.inner.read().internal_format {
            InternalFormat::I8 => 8,
            InternalFormat::I16 => 16,
            InternalFormat::F32 => 32,
        }
    }

    pub fn sample_length(&self) -> usize {
        self.inner.read().length_frames
    }

    pub fn byte_length(&self) -> usize {
        self.inner.read().data.len()
    }

    pub fn internal_format(&self) -> InternalFormat {
        self.inner.read().internal_format
    }

    pub fn format(&self) -> Format {
        self.inner.read().format
    }

    pub fn loop_points(&self) -> LoopPoints {
        self.inner.read().loop_points
    }

    /// `AL_LOOP_POINTS`-style setter: validated against sample length,
    /// rejected while any voice references the buffer (spec §4.C).
    pub fn set_loop_points(&self, points: LoopPoints) -> SonusResult<()> {
        let mut inner = self.inner.write();
        if inner.ref_count > 0 {
            return Err(SonusError::InvalidOperation(
                "cannot change loop points of a buffer referenced by a voice".into(),
            ));
        }
        if !(points.start < points.end && points.end <= inner.length_frames) {
            return Err(SonusError::InvalidValue("loop points out of range".into()));
        }
        inner.loop_points = points;
        Ok(())
    }

    pub fn unpack_block_alignment(&self) -> u32 {
        self.inner.read().unpack_align
    }

    pub fn pack_block_alignment(&self) -> u32 {
        self.inner.read().pack_align
    }

    /// Read-only access to internal f32 samples for a channel over
    /// `[start_frame, start_frame + count)`, used by the resampler/voice
    /// (component E/F) while the buffer is shared-immutable.
    pub fn read_frames_f32(&self, start_frame: usize, count: usize, channel: usize, out: &mut Vec<f32>) {
        let inner = self.inner.read();
        out.clear();
        let channels = inner.format.channels.channel_count();
        match inner.internal_format {
            InternalFormat::F32 => {
                for f in 0..count {
                    let frame = start_frame + f;
                    if frame >= inner.length_frames {
                        out.push(0.0);
                        continue;
                    }
                    let idx = (frame * channels + channel) * 4;
                    let bytes = [
                        inner.data[idx],
                        inner.data[idx + 1],
                        inner.data[idx + 2],
                        inner.data[idx + 3],
                    ];
                    out.push(f32::from_le_bytes(bytes));
                }
            }
            InternalFormat::I16 => {
                for f in 0..count {
                    let frame = start_frame + f;
                    if frame >= inner.length_frames {
                        out.push(0.0);
                        continue;
                    }
                    let idx = (frame * channels + channel) * 2;
                    let bytes = [inner.data[idx], inner.data[idx + 1]];
                    out.push(i16_to_f32(i16::from_le_bytes(bytes)));
                }
            }
            InternalFormat::I8 => {
                for f in 0..count {
                    let frame = start_frame + f;
                    if frame >= inner.length_frames {
                        out.push(0.0);
                        continue;
                    }
                    let idx = frame * channels + channel;
                    out.push(i16_to_f32(crate::convert::u8_to_i16(inner.data[idx])));
                }
            }
        }
    }

    // ─────────────────────────── reference counting ───────────────────

    /// Called when a source queues this buffer (spec §4.G: "each queued
    /// buffer increments that buffer's reference count").
    pub fn add_ref(&self) {
        self.inner.write().ref_count += 1;
    }

    /// Called when a source unqueues this buffer.
    pub fn release_ref(&self) {
        let mut inner = self.inner.write();
        inner.ref_count = inner.ref_count.saturating_sub(1);
    }

    pub fn ref_count(&self) -> usize {
        self.inner.read().ref_count
    }

    pub fn is_in_use(&self) -> bool {
        self.ref_count() > 0
    }
}

/// An exclusive view into a buffer's raw storage, held for the map's
/// lifetime (spec §4.C: "Holds the buffer's rwlock in exclusive mode").
/// Dropping it is the unmap; the type system prevents unmapping a buffer
/// that was never mapped, which is why there is no separate fallible
/// `unmap` call here (see DESIGN.md open-question resolution).
pub struct MappedRegion<'a> {
    guard: parking_lot::RwLockWriteGuard<'a, BufferInner>,
    offset: usize,
    length: usize,
}

impl std::ops::Deref for MappedRegion<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard.data[self.offset..self.offset + self.length]
    }
}

impl std::ops::DerefMut for MappedRegion<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard.data[self.offset..self.offset + self.length]
    }
}

impl Drop for MappedRegion<'_> {
    fn drop(&mut self) {
        self.guard.mapped = false;
    }
}

fn sanitize_alignment(ty: SampleType, requested: u32) -> SonusResult<u32> {
    if requested == 0 {
        return Ok(ty.default_alignment());
    }
    if ty.validate_alignment(requested) {
        Ok(requested)
    } else {
        Err(SonusError::InvalidValue(format!(
            "alignment {requested} invalid for {ty:?}"
        )))
    }
}

fn internal_frame_stride(internal: InternalFormat, format: Format) -> usize {
    let per_sample = match internal {
        InternalFormat::I8 => 1,
        InternalFormat::I16 => 2,
        InternalFormat::F32 => 4,
    };
    per_sample * format.channels.channel_count()
}

/// Decode application-supplied `data` for `format` into internal storage,
/// returning `(bytes, frame_count)` with `bytes.len()` rounded up to 16.
fn decode_to_internal(format: Format, data: &[u8], align: u32) -> SonusResult<(Vec<u8>, usize)> {
    let channels = format.channels.channel_count();
    let internal = format.sample_type.internal_format();

    if format.sample_type.is_block_compressed() {
        let (block_bytes, block_frames) = block_shape(format.sample_type, align)
            .expect("block_shape is Some for block-compressed types");
        let stride = block_bytes * channels;
        if stride == 0 || data.len() % stride != 0 {
            return Err(SonusError::InvalidValue(
                "data size is not a whole number of aligned blocks".into(),
            ));
        }
        let num_blocks = data.len() / stride;
        let frame_count = num_blocks * block_frames;
        let mut planar: Vec<Vec<i16>> = vec![Vec::with_capacity(frame_count); channels];
        for b in 0..num_blocks {
            for (ch, planar_ch) in planar.iter_mut().enumerate() {
                let start = b * stride + ch * block_bytes;
                let block = &data[start..start + block_bytes];
                match format.sample_type {
                    SampleType::Ima4 => decode_ima4_block(block, block_frames, planar_ch),
                    SampleType::MsAdpcm => decode_msadpcm_block(block, block_frames, planar_ch),
                    _ => unreachable!(),
                }
            }
        }
        let mut interleaved_f32 = Vec::with_capacity(frame_count * channels);
        for f in 0..frame_count {
            for planar_ch in &planar {
                interleaved_f32.push(i16_to_f32(planar_ch[f]));
            }
        }
        let mut out = Vec::new();
        convert_internal(&interleaved_f32, internal, &mut out);
        let padded_len = round_up_16(out.len());
        out.resize(padded_len, 0);
        return Ok((out, frame_count));
    }

    if matches!(format.sample_type, SampleType::MuLaw | SampleType::ALaw) {
        let mut decoded = Vec::new();
        if format.sample_type == SampleType::MuLaw {
            decode_ulaw(data, &mut decoded);
        } else {
            decode_alaw(data, &mut decoded);
        }
        if decoded.len() % channels != 0 {
            return Err(SonusError::InvalidValue(
                "data size is not a whole number of frames".into(),
            ));
        }
        let frame_count = decoded.len() / channels;
        let as_f32: Vec<f32> = decoded.into_iter().map(i16_to_f32).collect();
        let mut out = Vec::new();
        convert_internal(&as_f32, internal, &mut out);
        let padded_len = round_up_16(out.len());
        out.resize(padded_len, 0);
        return Ok((out, frame_count));
    }

    let src_bytes = format
        .sample_type
        .uncompressed_sample_bytes()
        .expect("handled block-compressed and law-encoded types above");
    let stride = src_bytes * channels;
    if stride == 0 || data.len() % stride != 0 {
        return Err(SonusError::InvalidValue(
            "data size is not a whole number of frames".into(),
        ));
    }
    let frame_count = data.len() / stride;
    let sample_count = frame_count * channels;
    let mut as_f32 = Vec::with_capacity(sample_count);
    for i in 0..sample_count {
        let idx = i * src_bytes;
        let sample = match format.sample_type {
            SampleType::U8 => i16_to_f32(crate::convert::u8_to_i16(data[idx])),
            SampleType::I16 => i16_to_f32(i16::from_le_bytes([data[idx], data[idx + 1]])),
            SampleType::F32 => f32::from_le_bytes([
                data[idx],
                data[idx + 1],
                data[idx + 2],
                data[idx + 3],
            ]),
            SampleType::F64 => f64::from_le_bytes([
                data[idx],
                data[idx + 1],
                data[idx + 2],
                data[idx + 3],
                data[idx + 4],
                data[idx + 5],
                data[idx + 6],
                data[idx + 7],
            ]) as f32,
            SampleType::I32 => {
                i32::from_le_bytes([data[idx], data[idx + 1], data[idx + 2], data[idx + 3]]) as f32
                    / i32::MAX as f32
            }
            SampleType::U32 => {
                let v = u32::from_le_bytes([data[idx], data[idx + 1], data[idx + 2], data[idx + 3]]);
                (v as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32
            }
            SampleType::MuLaw | SampleType::ALaw | SampleType::Ima4 | SampleType::MsAdpcm => {
                unreachable!("handled above")
            }
        };
        as_f32.push(sample);
    }
    let mut out = Vec::new();
    convert_internal(&as_f32, internal, &mut out);
    let padded_len = round_up_16(out.len());
    out.resize(padded_len, 0);
    Ok((out, frame_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::ChannelLayout;

    fn mono_i16_sine(len: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(len * 2);
        for n in 0..len {
            let s = (std::f32::consts::TAU * 1000.0 * n as f32 / 44100.0).sin() * 32767.0;
            data.extend_from_slice(&(s as i16).to_le_bytes());
        }
        data
    }

    #[test]
    fn upload_sets_length_and_default_loop_points() {
        let buf = Buffer::empty();
        let data = mono_i16_sine(44100);
        buf.upload(
            Format::new(ChannelLayout::Mono, SampleType::I16),
            &data,
            44100,
            0,
            AccessFlags::NONE,
        )
        .unwrap();
        assert_eq!(buf.sample_length(), 44100);
        assert_eq!(buf.loop_points(), LoopPoints { start: 0, end: 44100 });
        assert_eq!(buf.byte_length() % 16, 0);
    }

    #[test]
    fn upload_rejects_partial_frame() {
        let buf = Buffer::empty();
        buf.upload(
            Format::new(ChannelLayout::Stereo, SampleType::I16),
            &[0, 0, 0], // 3 bytes, not a whole stereo i16 frame (needs 4)
            44100,
            0,
            AccessFlags::NONE,
        )
        .unwrap_err();
    }

    #[test]
    fn delete_rejected_while_referenced() {
        let buf = Buffer::empty();
        let data = mono_i16_sine(100);
        buf.upload(
            Format::new(ChannelLayout::Mono, SampleType::I16),
            &data,
            44100,
            0,
            AccessFlags::NONE,
        )
        .unwrap();
        buf.add_ref();
        assert!(buf.is_in_use());
        assert!(buf
            .upload(
                Format::new(ChannelLayout::Mono, SampleType::I16),
                &data,
                44100,
                0,
                AccessFlags::NONE
            )
            .is_err());
        buf.release_ref();
        assert!(!buf.is_in_use());
    }

    #[test]
    fn map_prefills_write_only_region_with_0x55() {
        let buf = Buffer::empty();
        let data = mono_i16_sine(100);
        buf.upload(
            Format::new(ChannelLayout::Mono, SampleType::I16),
            &data,
            44100,
            0,
            AccessFlags::WRITE,
        )
        .unwrap();
        let len = buf.byte_length();
        {
            let region = buf.map(0, len, AccessFlags::WRITE).unwrap();
            assert!(region.iter().all(|&b| b == 0x55));
        }
        // mapped flag cleared after the region drops
        let _region2 = buf.map(0, len, AccessFlags::WRITE).unwrap();
    }

    #[test]
    fn ima4_round_trip_shapes_frames_exactly() {
        let align = 65u32;
        let (block_bytes, block_frames) = block_shape(SampleType::Ima4, align).unwrap();
        let num_blocks = 4;
        let mut data = vec![0u8; block_bytes * num_blocks];
        for b in 0..num_blocks {
            data[b * block_bytes + 2] = 10; // valid step index
        }
        let buf = Buffer::empty();
        buf.upload(
            Format::new(ChannelLayout::Mono, SampleType::Ima4),
            &data,
            44100,
            align,
            AccessFlags::NONE,
        )
        .unwrap();
        assert_eq!(buf.sample_length(), block_frames * num_blocks);
    }
}
