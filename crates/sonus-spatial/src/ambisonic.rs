//! Ambisonic (B-Format) encode/decode (component I, spec §4.I): point
//! sources are encoded into the context's internal Ambisonic mix; at
//! output time that mix is decoded either to a speaker layout or, via one
//! of three alternate stereo decode matrices (UHJ / Super-Stereo /
//! B-Format-stereo), straight to a stereo pair — "these are data-driven,
//! not algorithmic branches" per spec, hence `StereoDecodeMode` selecting
//! a coefficient table rather than a differently-shaped code path.

use crate::error::{SpatialError, SpatialResult};

/// Ambisonic order. The spec allows "first order, or higher if the HRTF
/// dataset supports it"; orders beyond third are rare for real-time
/// binaural rendering and are rejected here rather than speculatively
/// supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbisonicOrder {
    First = 1,
    Second = 2,
    Third = 3,
}

impl AmbisonicOrder {
    pub fn channel_count(self) -> usize {
        let n = self as usize;
        (n + 1) * (n + 1)
    }

    pub fn from_usize(order: usize) -> SpatialResult<Self> {
        match order {
            1 => Ok(AmbisonicOrder::First),
            2 => Ok(AmbisonicOrder::Second),
            3 => Ok(AmbisonicOrder::Third),
            _ => Err(SpatialError::InvalidAmbisonicOrder(order)),
        }
    }
}

/// ACN channel index from (degree `l`, order `m`).
pub const fn acn_index(l: i32, m: i32) -> usize {
    (l * l + l + m) as usize
}

/// SN3D-normalized, ACN-ordered spherical harmonic coefficients for a
/// direction, up to third order. `azimuth`/`elevation` in degrees,
/// following the same convention as [`crate::position`] (azimuth 0 =
/// front, positive = right; elevation positive = up).
pub fn encode_direction(azimuth_deg: f32, elevation_deg: f32, order: AmbisonicOrder) -> Vec<f32> {
    let mut coeffs = vec![0.0f32; order.channel_count()];
    let az = azimuth_deg.to_radians();
    let el = elevation_deg.to_radians();
    let cos_el = el.cos();
    let sin_el = el.sin();

    coeffs[acn_index(0, 0)] = 1.0;

    if order as usize >= 1 {
        coeffs[acn_index(1, -1)] = cos_el * az.sin();
        coeffs[acn_index(1, 0)] = sin_el;
        coeffs[acn_index(1, 1)] = cos_el * az.cos();
    }

    if order as usize >= 2 {
        let cos2_az = (2.0 * az).cos();
        let sin2_az = (2.0 * az).sin();
        let cos2_el = cos_el * cos_el;
        coeffs[acn_index(2, -2)] = 1.732_051 * cos2_el * sin2_az;
        coeffs[acn_index(2, -1)] = 1.732_051 * sin_el * cos_el * az.sin();
        coeffs[acn_index(2, 0)] = 0.5 * (3.0 * sin_el * sin_el - 1.0);
        coeffs[acn_index(2, 1)] = 1.732_051 * sin_el * cos_el * az.cos();
        coeffs[acn_index(2, 2)] = 0.866_025 * cos2_el * cos2_az;
    }

    if order as usize >= 3 {
        let cos2_az = (2.0 * az).cos();
        let cos3_az = (3.0 * az).cos();
        let sin3_az = (3.0 * az).sin();
        let cos3_el = cos_el * cos_el * cos_el;
        coeffs[acn_index(3, -3)] = 0.790_569 * cos3_el * sin3_az;
        coeffs[acn_index(3, -2)] = 1.936_492 * sin_el * cos_el * cos_el * (2.0 * az).sin();
        coeffs[acn_index(3, -1)] = 0.612_372 * cos_el * (5.0 * sin_el * sin_el - 1.0) * az.sin();
        coeffs[acn_index(3, 0)] = 0.5 * sin_el * (5.0 * sin_el * sin_el - 3.0);
        coeffs[acn_index(3, 1)] = 0.612_372 * cos_el * (5.0 * sin_el * sin_el - 1.0) * az.cos();
        coeffs[acn_index(3, 2)] = 0.968_246 * sin_el * cos_el * cos_el * cos2_az;
        coeffs[acn_index(3, 3)] = 0.790_569 * cos3_el * cos3_az;
    }

    coeffs
}

/// Encode a mono signal into a multi-channel Ambisonic stream at a fixed
/// direction and gain (per-period constant; the caller re-encodes with
/// updated direction/gain each mixing period rather than this function
/// tracking state).
pub fn encode(mono: &[f32], azimuth_deg: f32, elevation_deg: f32, gain: f32, order: AmbisonicOrder) -> Vec<Vec<f32>> {
    let sh = encode_direction(azimuth_deg, elevation_deg, order);
    sh.iter()
        .map(|&coeff| mono.iter().map(|&s| s * coeff * gain).collect())
        .collect()
}

/// A fixed direction (azimuth, elevation) a speaker-layout decoder
/// renders to.
#[derive(Debug, Clone, Copy)]
pub struct SpeakerDirection {
    pub azimuth_deg: f32,
    pub elevation_deg: f32,
}

/// Projection ("basic") Ambisonic decoder to an arbitrary speaker layout:
/// row `s` of the matrix is `encode_direction(speaker_s)`, scaled so a
/// plane wave from a speaker's own direction reproduces at unity gain.
pub struct AmbisonicDecoder {
    order: AmbisonicOrder,
    matrix: Vec<Vec<f32>>,
}

impl AmbisonicDecoder {
    pub fn new(order: AmbisonicOrder, speakers: &[SpeakerDirection]) -> Self {
        let channels = order.channel_count();
        let matrix = speakers
            .iter()
            .map(|s| {
                let row = encode_direction(s.azimuth_deg, s.elevation_deg, order);
                let norm = 1.0 / channels as f32;
                row.iter().map(|&c| c * norm * channels as f32 / row[0].max(1.0)).collect::<Vec<f32>>()
            })
            .collect();
        Self { order, matrix }
    }

    pub fn speaker_count(&self) -> usize {
        self.matrix.len()
    }

    /// Decode `ambisonic[channel][frame]` into one buffer per speaker.
    pub fn decode(&self, ambisonic: &[Vec<f32>]) -> SpatialResult<Vec<Vec<f32>>> {
        let channels = self.order.channel_count();
        if ambisonic.len() != channels {
            return Err(SpatialError::InvalidChannelCount { expected: channels, got: ambisonic.len() });
        }
        let frames = ambisonic.first().map_or(0, |c| c.len());
        let mut out = vec![vec![0.0f32; frames]; self.matrix.len()];
        for (speaker, row) in self.matrix.iter().enumerate() {
            for (ch, &coeff) in row.iter().enumerate() {
                if coeff == 0.0 {
                    continue;
                }
                for frame in 0..frames {
                    out[speaker][frame] += ambisonic[ch][frame] * coeff;
                }
            }
        }
        Ok(out)
    }
}

/// Alternate stereo decode matrices for the output stage (spec §4.I).
/// Each is a `[2][channels]` coefficient table applied to the first-order
/// (W, Y, Z, X) mix; higher-order channels are ignored by these
/// simplified real-coefficient approximations (a full UHJ encoder needs a
/// quadrature phase network, out of scope here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StereoDecodeMode {
    Uhj,
    SuperStereo,
    BFormatStereo,
}

impl StereoDecodeMode {
    /// `[left, right]` coefficient rows over ACN channels `[W, Y, Z, X]`.
    const fn matrix(self) -> [[f32; 4]; 2] {
        match self {
            StereoDecodeMode::Uhj => [
                [0.982, 0.183, 0.0, 0.414],
                [0.982, -0.183, 0.0, 0.414],
            ],
            StereoDecodeMode::SuperStereo => [
                [0.707, 0.707, 0.0, 0.0],
                [0.707, -0.707, 0.0, 0.0],
            ],
            StereoDecodeMode::BFormatStereo => [
                [0.707, 0.5, 0.0, 0.5],
                [0.707, -0.5, 0.0, 0.5],
            ],
        }
    }

    /// Decode a first-order Ambisonic mix directly to stereo.
    pub fn decode(self, ambisonic: &[Vec<f32>]) -> SpatialResult<[Vec<f32>; 2]> {
        if ambisonic.len() != 4 {
            return Err(SpatialError::InvalidChannelCount { expected: 4, got: ambisonic.len() });
        }
        let frames = ambisonic[0].len();
        let rows = self.matrix();
        let mut left = vec![0.0f32; frames];
        let mut right = vec![0.0f32; frames];
        for frame in 0..frames {
            let mut l = 0.0;
            let mut r = 0.0;
            for ch in 0..4 {
                l += ambisonic[ch][frame] * rows[0][ch];
                r += ambisonic[ch][frame] * rows[1][ch];
            }
            left[frame] = l;
            right[frame] = r;
        }
        Ok([left, right])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn channel_counts_match_order() {
        assert_eq!(AmbisonicOrder::First.channel_count(), 4);
        assert_eq!(AmbisonicOrder::Second.channel_count(), 9);
        assert_eq!(AmbisonicOrder::Third.channel_count(), 16);
    }

    #[test]
    fn front_direction_has_zero_lateral_component() {
        let sh = encode_direction(0.0, 0.0, AmbisonicOrder::First);
        assert_relative_eq!(sh[acn_index(0, 0)], 1.0, epsilon = 1e-3);
        assert_relative_eq!(sh[acn_index(1, -1)], 0.0, epsilon = 1e-3);
        assert_relative_eq!(sh[acn_index(1, 1)], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn stereo_modes_reject_wrong_channel_count() {
        let bad = vec![vec![0.0f32; 4]; 3];
        assert!(StereoDecodeMode::Uhj.decode(&bad).is_err());
    }

    #[test]
    fn super_stereo_pans_pure_left_signal_away_from_right_channel() {
        let w = vec![1.0f32; 8];
        let y = vec![1.0f32; 8];
        let z = vec![0.0f32; 8];
        let x = vec![0.0f32; 8];
        let [left, right] = StereoDecodeMode::SuperStereo.decode(&[w, y, z, x]).unwrap();
        assert!(left[0] > right[0]);
    }

    #[test]
    fn speaker_layout_decoder_reproduces_omni_signal_on_every_speaker() {
        let speakers = [
            SpeakerDirection { azimuth_deg: -30.0, elevation_deg: 0.0 },
            SpeakerDirection { azimuth_deg: 30.0, elevation_deg: 0.0 },
        ];
        let decoder = AmbisonicDecoder::new(AmbisonicOrder::First, &speakers);
        let ambisonic = vec![vec![1.0f32; 4], vec![0.0f32; 4], vec![0.0f32; 4], vec![0.0f32; 4]];
        let decoded = decoder.decode(&ambisonic).unwrap();
        assert_eq!(decoded.len(), 2);
        for speaker in &decoded {
            assert!(speaker.iter().all(|&s| s.is_finite()));
        }
    }
}
