//! HRTF dataset loading and partitioned-overlap-save convolution (spec
//! §4.I / §6): binary HRIR measurement sets, looked up by direction and
//! convolved against a per-voice Ambisonic-decoded virtual-speaker feed
//! to produce binaural stereo output.

use std::collections::VecDeque;
use std::sync::Arc;

use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::error::{SpatialError, SpatialResult};

const MAGIC: &[u8; 8] = b"MinPHR03";

/// One distance "shell" of measurements (spec §6: "per-field
/// `{distance(u16·mm), elevation-count(u8), azimuth-count(u8)[n]}`").
#[derive(Debug, Clone)]
pub struct HrtfField {
    pub distance_mm: u16,
    pub azimuth_counts: Vec<u8>,
}

/// A single measured HRIR pair (left, right ear impulse responses).
#[derive(Debug, Clone)]
pub struct HrirMeasurement {
    pub azimuth_deg: f32,
    pub elevation_deg: f32,
    pub left: Vec<f32>,
    pub right: Vec<f32>,
    pub delay_left: u8,
    pub delay_right: u8,
}

/// A parsed HRTF dataset (spec §6 "HRTF binary file").
#[derive(Debug, Clone)]
pub struct HrtfDataset {
    pub sample_rate: u32,
    pub hrir_length: usize,
    pub fields: Vec<HrtfField>,
    pub measurements: Vec<HrirMeasurement>,
}

fn read_u8(data: &[u8], pos: &mut usize) -> SpatialResult<u8> {
    let v = *data.get(*pos).ok_or_else(|| SpatialError::MalformedDataset("truncated (u8)".into()))?;
    *pos += 1;
    Ok(v)
}

fn read_u16(data: &[u8], pos: &mut usize) -> SpatialResult<u16> {
    let bytes = data
        .get(*pos..*pos + 2)
        .ok_or_else(|| SpatialError::MalformedDataset("truncated (u16)".into()))?;
    *pos += 2;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], pos: &mut usize) -> SpatialResult<u32> {
    let bytes = data
        .get(*pos..*pos + 4)
        .ok_or_else(|| SpatialError::MalformedDataset("truncated (u32)".into()))?;
    *pos += 4;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_i16(data: &[u8], pos: &mut usize) -> SpatialResult<i16> {
    Ok(read_u16(data, pos)? as i16)
}

impl HrtfDataset {
    /// Parse a little-endian binary HRTF dataset. Validates the
    /// invariants spec §6 lists: elevations ∈ [5..181], azimuths ∈
    /// [1..255], distances ∈ [0.05..2.5 m], sample rate ∈ [32000..96000],
    /// HRIR points ∈ [16..8192] and a multiple of 8.
    pub fn parse(data: &[u8]) -> SpatialResult<Self> {
        let mut pos = 0usize;
        let magic = data
            .get(0..8)
            .ok_or_else(|| SpatialError::MalformedDataset("truncated magic".into()))?;
        if magic != MAGIC {
            return Err(SpatialError::MalformedDataset("bad magic".into()));
        }
        pos += 8;

        let sample_rate = read_u32(data, &mut pos)?;
        if !(32_000..=96_000).contains(&sample_rate) {
            return Err(SpatialError::FieldOutOfRange { what: "sample_rate", value: sample_rate as i64 });
        }

        let _channel_type = read_u8(data, &mut pos)?;
        let hrir_length = read_u16(data, &mut pos)? as usize;
        if !(16..=8192).contains(&hrir_length) || hrir_length % 8 != 0 {
            return Err(SpatialError::FieldOutOfRange { what: "hrir_length", value: hrir_length as i64 });
        }

        let field_count = read_u8(data, &mut pos)?;
        let mut fields = Vec::with_capacity(field_count as usize);
        let mut elevation_counts = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let distance_mm = read_u16(data, &mut pos)?;
            let distance_m = distance_mm as f32 / 1000.0;
            if !(0.05..=2.5).contains(&distance_m) {
                return Err(SpatialError::FieldOutOfRange { what: "distance_mm", value: distance_mm as i64 });
            }
            let elevation_count = read_u8(data, &mut pos)?;
            if !(5..=181).contains(&elevation_count) {
                return Err(SpatialError::FieldOutOfRange { what: "elevation_count", value: elevation_count as i64 });
            }
            let mut azimuth_counts = Vec::with_capacity(elevation_count as usize);
            for _ in 0..elevation_count {
                let az = read_u8(data, &mut pos)?;
                if !(1..=255).contains(&az) {
                    return Err(SpatialError::FieldOutOfRange { what: "azimuth_count", value: az as i64 });
                }
                azimuth_counts.push(az);
            }
            elevation_counts.push(elevation_count);
            fields.push(HrtfField { distance_mm, azimuth_counts });
        }

        let mut measurements = Vec::new();
        for field in &fields {
            let n_el = field.azimuth_counts.len();
            for (el_idx, &az_count) in field.azimuth_counts.iter().enumerate() {
                let elevation_deg = -90.0 + 180.0 * el_idx as f32 / (n_el.max(1) - 1).max(1) as f32;
                for az_idx in 0..az_count {
                    let azimuth_deg = -180.0 + 360.0 * az_idx as f32 / az_count.max(1) as f32;
                    let mut left = Vec::with_capacity(hrir_length);
                    let mut right = Vec::with_capacity(hrir_length);
                    for _ in 0..hrir_length {
                        left.push(read_i16(data, &mut pos)? as f32 / 32768.0);
                    }
                    for _ in 0..hrir_length {
                        right.push(read_i16(data, &mut pos)? as f32 / 32768.0);
                    }
                    measurements.push(HrirMeasurement {
                        azimuth_deg,
                        elevation_deg,
                        left,
                        right,
                        delay_left: 0,
                        delay_right: 0,
                    });
                }
            }
        }

        for m in measurements.iter_mut() {
            m.delay_left = read_u8(data, &mut pos)?;
            m.delay_right = read_u8(data, &mut pos)?;
        }

        Ok(Self { sample_rate, hrir_length, fields, measurements })
    }

    /// Nearest measurement by angular distance, ignoring field (distance)
    /// selection beyond picking the first field — multi-distance HRTF
    /// sets are rare and the spec does not define how a source's own
    /// distance should select among them.
    pub fn nearest(&self, azimuth_deg: f32, elevation_deg: f32) -> Option<&HrirMeasurement> {
        self.measurements.iter().min_by(|a, b| {
            let da = angular_distance(azimuth_deg, elevation_deg, a.azimuth_deg, a.elevation_deg);
            let db = angular_distance(azimuth_deg, elevation_deg, b.azimuth_deg, b.elevation_deg);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

fn angular_distance(az1: f32, el1: f32, az2: f32, el2: f32) -> f32 {
    let daz = (az1 - az2).to_radians();
    let del = (el1 - el2).to_radians();
    (daz * daz + del * del).sqrt()
}

/// Uniform-partitioned, overlap-save frequency-domain convolver for one
/// impulse response and one mono channel (spec §4.I: "convolution uses a
/// partitioned-overlap-save FFT kernel sized to the HRIR length").
pub struct PartitionedConvolver {
    block: usize,
    fft_len: usize,
    filter_spectra: Vec<Vec<Complex32>>,
    history: VecDeque<Vec<Complex32>>,
    input_buffer: Vec<f32>,
    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    scratch_time: Vec<f32>,
}

impl PartitionedConvolver {
    /// `block` is the mixing-period frame count; `impulse_response` is
    /// partitioned into `ceil(len / block)` segments of `block` samples
    /// each.
    pub fn new(impulse_response: &[f32], block: usize) -> Self {
        let block = block.max(1);
        let fft_len = block * 2;
        let mut planner = RealFftPlanner::<f32>::new();
        let r2c = planner.plan_fft_forward(fft_len);
        let c2r = planner.plan_fft_inverse(fft_len);

        let num_partitions = impulse_response.len().div_ceil(block).max(1);
        let mut filter_spectra = Vec::with_capacity(num_partitions);
        for p in 0..num_partitions {
            let start = p * block;
            let end = (start + block).min(impulse_response.len());
            let mut padded = vec![0.0f32; fft_len];
            if start < end {
                padded[..end - start].copy_from_slice(&impulse_response[start..end]);
            }
            let mut spectrum = r2c.make_output_vec();
            let mut scratch = padded;
            r2c.process(&mut scratch, &mut spectrum).expect("fixed-size real FFT");
            filter_spectra.push(spectrum);
        }

        let history = VecDeque::with_capacity(num_partitions);

        Self {
            block,
            fft_len,
            filter_spectra,
            history,
            input_buffer: vec![0.0; fft_len],
            r2c,
            c2r,
            scratch_time: vec![0.0; fft_len],
        }
    }

    pub fn block_size(&self) -> usize {
        self.block
    }

    /// Feed one block of `block_size()` input samples, returning the same
    /// number of convolved output samples (overlap-save: the aliased
    /// first half of the inverse transform is discarded every call).
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), self.block);
        debug_assert_eq!(output.len(), self.block);

        self.input_buffer.copy_within(self.block.., 0);
        self.input_buffer[self.block..].copy_from_slice(input);

        let mut spectrum = self.r2c.make_output_vec();
        let mut scratch = self.input_buffer.clone();
        self.r2c.process(&mut scratch, &mut spectrum).expect("fixed-size real FFT");

        if self.history.len() == self.filter_spectra.len() {
            self.history.pop_back();
        }
        self.history.push_front(spectrum);

        let mut accum = vec![Complex32::new(0.0, 0.0); self.fft_len / 2 + 1];
        for (hist, filt) in self.history.iter().zip(self.filter_spectra.iter()) {
            for (a, (h, f)) in accum.iter_mut().zip(hist.iter().zip(filt.iter())) {
                *a += *h * *f;
            }
        }

        self.c2r.process(&mut accum, &mut self.scratch_time).expect("fixed-size inverse real FFT");
        let norm = 1.0 / self.fft_len as f32;
        for (o, t) in output.iter_mut().zip(self.scratch_time[self.block..].iter()) {
            *o = t * norm;
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.input_buffer.iter_mut().for_each(|s| *s = 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dataset_bytes() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&48_000u32.to_le_bytes());
        data.push(1); // channel_type
        data.extend_from_slice(&16u16.to_le_bytes()); // hrir_length
        data.push(1); // field_count
        data.extend_from_slice(&1000u16.to_le_bytes()); // distance_mm
        data.push(1); // elevation_count
        data.push(4); // azimuth_count for that elevation

        for _ in 0..4 {
            for _ in 0..16 {
                data.extend_from_slice(&1000i16.to_le_bytes()); // left
            }
            for _ in 0..16 {
                data.extend_from_slice(&(-1000i16).to_le_bytes()); // right
            }
        }
        for _ in 0..4 {
            data.push(0); // delay_left
            data.push(0); // delay_right
        }
        data
    }

    #[test]
    fn parses_well_formed_dataset() {
        let dataset = HrtfDataset::parse(&sample_dataset_bytes()).unwrap();
        assert_eq!(dataset.sample_rate, 48_000);
        assert_eq!(dataset.hrir_length, 16);
        assert_eq!(dataset.measurements.len(), 4);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_dataset_bytes();
        bytes[0] = b'X';
        assert!(HrtfDataset::parse(&bytes).is_err());
    }

    #[test]
    fn nearest_measurement_picks_closest_direction() {
        let dataset = HrtfDataset::parse(&sample_dataset_bytes()).unwrap();
        let found = dataset.nearest(0.0, 0.0).unwrap();
        assert!(dataset.measurements.iter().any(|m| m.azimuth_deg == found.azimuth_deg));
    }

    #[test]
    fn convolver_reproduces_impulse_response_for_unit_impulse_input() {
        let ir = vec![1.0f32, 0.5, 0.25, 0.0, 0.0, 0.0, 0.0, 0.0];
        let block = 4;
        let mut conv = PartitionedConvolver::new(&ir, block);
        let mut input = vec![0.0f32; block];
        input[0] = 1.0;
        let mut output = vec![0.0f32; block];
        conv.process(&input, &mut output);
        assert!((output[0] - 1.0).abs() < 1e-3);
        assert!((output[1] - 0.5).abs() < 1e-3);
        assert!((output[2] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn convolver_output_is_always_finite_across_many_blocks() {
        let ir: Vec<f32> = (0..37).map(|i| (-(i as f32) * 0.1).exp()).collect();
        let block = 8;
        let mut conv = PartitionedConvolver::new(&ir, block);
        let mut output = vec![0.0f32; block];
        for b in 0..20 {
            let input: Vec<f32> = (0..block).map(|i| ((b * block + i) as f32 * 0.3).sin()).collect();
            conv.process(&input, &mut output);
            assert!(output.iter().all(|v| v.is_finite()));
        }
    }
}
