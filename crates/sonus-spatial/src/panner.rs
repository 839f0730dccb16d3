//! Panner (component I, spec §4.I): turns a per-period snapshot of source
//! geometry, listener transform and distance model into (a) a target
//! gain vector over the context's internal mix and (b) a single HF
//! filter coefficient standing in for air absorption and cone
//! attenuation, consumed by the voice's direct-path biquad
//! ([`sonus_dsp::BiquadCoeffs::from_hf_gain`]).

use crate::ambisonic::{encode_direction, AmbisonicOrder};
use crate::distance::DistanceParams;
use crate::position::{ListenerFrame, Vec3};

/// Sound cone parameters (spec §3 Source: "cone inner/outer angles and
/// outer gain").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConeParams {
    pub inner_angle_deg: f32,
    pub outer_angle_deg: f32,
    pub outer_gain: f32,
}

impl Default for ConeParams {
    fn default() -> Self {
        Self { inner_angle_deg: 360.0, outer_angle_deg: 360.0, outer_gain: 1.0 }
    }
}

impl ConeParams {
    /// Gain multiplier for the angle (degrees) between the source's
    /// facing direction and the vector toward the listener. Omnidirectional
    /// when `direction` supplied by the caller is zero.
    fn attenuation(&self, angle_deg: f32) -> f32 {
        let inner = self.inner_angle_deg.clamp(0.0, 360.0) * 0.5;
        let outer = self.outer_angle_deg.clamp(inner * 2.0, 360.0) * 0.5;
        if angle_deg <= inner {
            1.0
        } else if angle_deg >= outer || outer <= inner {
            self.outer_gain
        } else {
            let t = (angle_deg - inner) / (outer - inner);
            1.0 + (self.outer_gain - 1.0) * t
        }
    }
}

/// The output layout a panner instance is producing gains for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanTarget {
    /// Equal-power two-channel pan.
    Stereo,
    /// First-order Ambisonic internal mix (W, Y, Z, X), decoded later by
    /// [`crate::ambisonic`] or HRTF-convolved by [`crate::hrtf`].
    Ambisonic(AmbisonicOrder),
}

/// Everything the panner needs for one source, for one mixing period.
#[derive(Debug, Clone, Copy)]
pub struct PannerInput {
    pub source_position: Vec3,
    /// World-space facing direction; zero means omnidirectional (cone
    /// attenuation is skipped).
    pub source_direction: Vec3,
    pub relative_to_listener: bool,
    pub gain: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    pub cone: ConeParams,
    pub distance: DistanceParams,
    /// Per-channel azimuth offsets (degrees) applied to a stereo source's
    /// left/right channels before panning (spec §3 Source property
    /// `stereo_angles`); ignored for any other input channel count.
    pub stereo_angles: Option<[f32; 2]>,
}

/// Panner output for one source, one period: `gains[input_channel]` is the
/// gain row over the context's internal mix for that input channel (spec
/// §4.F step 7's "per-output-channel gain vector", one per input channel —
/// spec §3's Voice attribute "per-output-channel gain matrix").
#[derive(Debug, Clone)]
pub struct PannerOutput {
    pub gains: Vec<Vec<f32>>,
    pub hf_gain: f32,
}

/// Compute `(listener-space position, distance)` for a source, handling
/// the relative-to-listener flag (spec §3: "relative-to-listener flag").
fn listener_space_position(input: &PannerInput, listener: &ListenerFrame) -> (Vec3, f32) {
    let local = if input.relative_to_listener {
        input.source_position * listener.meters_per_unit
    } else {
        listener.to_listener_space(input.source_position)
    };
    let distance = local.norm();
    (local, distance)
}

fn azimuth_elevation(local: Vec3) -> (f32, f32) {
    let distance = local.norm();
    if distance < 1e-8 {
        return (0.0, 0.0);
    }
    let azimuth = local.x.atan2(local.z).to_degrees();
    let elevation = (local.y / distance).clamp(-1.0, 1.0).asin().to_degrees();
    (azimuth, elevation)
}

/// Equal-power two-channel pan law, azimuth clamped to the front
/// hemisphere (sources behind the listener collapse to the nearest
/// side rather than reversing left/right).
fn stereo_gains(azimuth_deg: f32) -> [f32; 2] {
    let clamped = azimuth_deg.clamp(-90.0, 90.0);
    let pan = (clamped + 90.0) / 180.0;
    let angle = pan * std::f32::consts::FRAC_PI_2;
    [angle.cos(), angle.sin()]
}

/// Produce the per-input-channel gain matrix and HF coefficient for one
/// source this period. `input_channels` is the voice's source channel
/// count (spec §3 Voice: "per-output-channel gain matrix"); a mono source
/// gets one gain row, a stereo source gets two — offset in azimuth by
/// `stereo_angles` when set — and any other channel count falls back to
/// panning every channel identically (no per-channel spread defined for
/// it).
pub fn pan(input: &PannerInput, listener: &ListenerFrame, target: PanTarget, input_channels: usize) -> PannerOutput {
    let (local, distance) = listener_space_position(input, listener);
    let (azimuth, elevation) = azimuth_elevation(local);

    let distance_gain = input.distance.attenuation(distance);
    let cone_angle = if input.source_direction.norm_squared() > 1e-12 {
        let to_listener = -local.normalize();
        let dir = input.source_direction.normalize();
        dir.dot(&to_listener).clamp(-1.0, 1.0).acos().to_degrees()
    } else {
        0.0
    };
    let cone_gain = input.cone.attenuation(cone_angle);

    let gain = (input.gain * distance_gain * cone_gain * listener.gain)
        .clamp(input.min_gain, input.max_gain);

    let channel_count = input_channels.max(1);
    let channel_azimuths: Vec<f32> = match (channel_count, input.stereo_angles) {
        (2, Some(angles)) => vec![azimuth + angles[0], azimuth + angles[1]],
        _ => vec![azimuth; channel_count],
    };

    let gains: Vec<Vec<f32>> = channel_azimuths
        .iter()
        .map(|&az| match target {
            PanTarget::Stereo => stereo_gains(az).iter().map(|&g| g * gain).collect(),
            PanTarget::Ambisonic(order) => {
                encode_direction(az, elevation, order).iter().map(|&c| c * gain).collect()
            }
        })
        .collect();

    // Cone attenuation doubles as the HF rolloff driver in the absence of
    // a modeled air-absorption coefficient per spec §4.I's unspecified
    // "algorithm"; distance adds a shallow additional rolloff.
    let distance_hf = (1.0 - (distance * 0.01)).clamp(0.3, 1.0);
    let hf_gain = (cone_gain * distance_hf).clamp(0.0, 1.0);

    PannerOutput { gains, hf_gain }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn input() -> PannerInput {
        PannerInput {
            source_position: Vec3::new(0.0, 1.0, 0.0),
            source_direction: Vec3::zeros(),
            relative_to_listener: false,
            gain: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            cone: ConeParams::default(),
            distance: DistanceParams {
                model: crate::distance::DistanceModel::Inverse { clamped: false },
                rolloff_factor: 1.0,
                reference_distance: 1.0,
                max_distance: 100.0,
            },
            stereo_angles: None,
        }
    }

    #[test]
    fn source_dead_ahead_pans_equally_between_stereo_channels() {
        let listener = ListenerFrame::default();
        let out = pan(&input(), &listener, PanTarget::Stereo, 1);
        assert_relative_eq!(out.gains[0][0], out.gains[0][1], epsilon = 1e-3);
    }

    #[test]
    fn source_to_the_right_favors_right_channel() {
        let mut i = input();
        i.source_position = Vec3::new(3.0, 1.0, 0.0);
        let listener = ListenerFrame::default();
        let out = pan(&i, &listener, PanTarget::Stereo, 1);
        assert!(out.gains[0][1] > out.gains[0][0]);
    }

    #[test]
    fn omnidirectional_source_has_no_cone_attenuation() {
        let listener = ListenerFrame::default();
        let out = pan(&input(), &listener, PanTarget::Stereo, 1);
        assert!(out.hf_gain > 0.9);
    }

    #[test]
    fn ambisonic_target_produces_first_order_channel_count() {
        let listener = ListenerFrame::default();
        let out = pan(&input(), &listener, PanTarget::Ambisonic(AmbisonicOrder::First), 1);
        assert_eq!(out.gains[0].len(), 4);
    }

    #[test]
    fn stereo_angles_spread_the_two_input_channels_apart() {
        let mut i = input();
        i.stereo_angles = Some([-30.0, 30.0]);
        let listener = ListenerFrame::default();
        let out = pan(&i, &listener, PanTarget::Stereo, 2);
        assert_eq!(out.gains.len(), 2);
        // Channel 0 is offset left, channel 1 right: channel 0's gain row
        // should favor the left output more than channel 1's row does.
        assert!(out.gains[0][0] > out.gains[1][0]);
        assert!(out.gains[1][1] > out.gains[0][1]);
    }
}
