//! The single per-context listener entity (spec §3 Listener), published
//! to the mixer through the same update protocol (§4.L) sources use.

use sonus_spatial::{ListenerFrame, Orientation, Vec3};

use crate::update::UpdateChannel;

/// Application-facing listener handle. property get/set for
/// `{position, velocity, orientation(at+up), gain, meters_per_unit}`
/// (spec §6).
pub struct Listener {
    channel: UpdateChannel<ListenerFrame>,
}

impl Listener {
    pub fn new() -> Self {
        Self { channel: UpdateChannel::new(ListenerFrame::default()) }
    }

    pub fn set_position(&self, position: Vec3) {
        self.channel.stage(|f| f.position = position);
    }

    pub fn set_velocity(&self, velocity: Vec3) {
        self.channel.stage(|f| f.velocity = velocity);
    }

    pub fn set_orientation(&self, orientation: Orientation) {
        self.channel.stage(|f| f.orientation = orientation);
    }

    pub fn set_gain(&self, gain: f32) {
        self.channel.stage(|f| f.gain = gain.max(0.0));
    }

    pub fn set_meters_per_unit(&self, meters_per_unit: f32) {
        self.channel.stage(|f| f.meters_per_unit = meters_per_unit.max(1e-6));
    }

    pub fn position(&self) -> Vec3 {
        self.channel.snapshot().position
    }

    pub fn gain(&self) -> f32 {
        self.channel.snapshot().gain
    }

    /// Drain the dirty flag and publish a coherent snapshot; called once
    /// per mixing period by the Context before voices are processed.
    pub fn publish_if_dirty(&self) -> bool {
        self.channel.publish_if_dirty()
    }

    /// The mixer-visible frame for this period.
    pub fn frame(&self) -> ListenerFrame {
        self.channel.snapshot()
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_update_is_visible_only_after_publish() {
        let listener = Listener::new();
        listener.set_position(Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(listener.position(), Vec3::zeros());
        listener.publish_if_dirty();
        assert_eq!(listener.position(), Vec3::new(1.0, 2.0, 3.0));
    }
}
