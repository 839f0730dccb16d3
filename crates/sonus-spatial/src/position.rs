//! Position, velocity and orientation vectors shared by sources and the
//! listener (spec §3 Source / Listener).

use nalgebra::Vector3;

/// A point or direction in listener-space, right-handed: +x right, +y
/// front, +z up, matching the orientation convention `Orientation` below
/// composes its basis from.
pub type Vec3 = Vector3<f32>;

/// Listener orientation expressed as `(at, up)` vectors, per spec §3
/// ("orientation (at/up vectors)") rather than Euler angles, since that's
/// the form the world→listener transform and the panner both consume
/// directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub at: Vec3,
    pub up: Vec3,
}

impl Orientation {
    pub fn new(at: Vec3, up: Vec3) -> Self {
        Self { at, up }
    }

    /// Facing +y with +z up.
    pub fn forward() -> Self {
        Self { at: Vec3::new(0.0, 1.0, 0.0), up: Vec3::new(0.0, 0.0, 1.0) }
    }

    /// Right-handed basis `(right, up, at)` built from the `at`/`up` pair
    /// via Gram-Schmidt, tolerant of an `up` that isn't exactly orthogonal
    /// to `at`.
    pub fn basis(&self) -> (Vec3, Vec3, Vec3) {
        let at = safe_normalize(self.at, Vec3::new(0.0, 1.0, 0.0));
        let up_raw = self.up - at * self.up.dot(&at);
        let up = safe_normalize(up_raw, Vec3::new(0.0, 0.0, 1.0));
        let right = safe_normalize(at.cross(&up), Vec3::new(1.0, 0.0, 0.0));
        (right, up, at)
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Self::forward()
    }
}

fn safe_normalize(v: Vec3, fallback: Vec3) -> Vec3 {
    let mag = v.norm();
    if mag < 1e-8 {
        fallback
    } else {
        v / mag
    }
}

/// The listener's world→listener-space rigid transform for one mixing
/// period (spec §3 Listener: "used only to compose the world→listener
/// transform each mixing period").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerFrame {
    pub position: Vec3,
    pub velocity: Vec3,
    pub orientation: Orientation,
    pub gain: f32,
    pub meters_per_unit: f32,
}

impl ListenerFrame {
    /// Transform a world-space position into listener-relative
    /// right/up/at coordinates scaled by `meters_per_unit`.
    pub fn to_listener_space(&self, world_pos: Vec3) -> Vec3 {
        let (right, up, at) = self.orientation.basis();
        let rel = (world_pos - self.position) * self.meters_per_unit;
        Vec3::new(rel.dot(&right), rel.dot(&up), rel.dot(&at))
    }
}

impl Default for ListenerFrame {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            velocity: Vec3::zeros(),
            orientation: Orientation::forward(),
            gain: 1.0,
            meters_per_unit: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn forward_basis_is_axis_aligned() {
        let (right, up, at) = Orientation::forward().basis();
        assert_relative_eq!(right, Vec3::new(1.0, 0.0, 0.0), epsilon = 1e-5);
        assert_relative_eq!(up, Vec3::new(0.0, 0.0, 1.0), epsilon = 1e-5);
        assert_relative_eq!(at, Vec3::new(0.0, 1.0, 0.0), epsilon = 1e-5);
    }

    #[test]
    fn listener_space_places_source_directly_ahead_on_at_axis() {
        let listener = ListenerFrame::default();
        let local = listener.to_listener_space(Vec3::new(0.0, 5.0, 0.0));
        assert_relative_eq!(local.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(local.z, 5.0, epsilon = 1e-5);
    }

    #[test]
    fn degenerate_up_falls_back_to_orthogonal_default() {
        let o = Orientation::new(Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 1.0, 0.0));
        let (right, up, at) = o.basis();
        assert_relative_eq!(right.dot(&at), 0.0, epsilon = 1e-4);
        assert_relative_eq!(up.dot(&at), 0.0, epsilon = 1e-4);
    }
}
