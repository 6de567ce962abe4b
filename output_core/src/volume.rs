//! Per-device volume.
//!
//! Devices expose their output volume on different elements: some on the main
//! element, others only per channel. There is no portable way to know which in
//! advance, so reads and writes walk [`VOLUME_ADDRESSINGS`] in order and the
//! first addressing that works wins.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::HalError;
use crate::hal::{AudioObjectId, Scope, element, selector, status};
use crate::property::PropertyAccessor;
use crate::utils::clamp_level;

/// Level recorded for a device whose volume cannot be read.
pub const UNREADABLE_VOLUME_DEFAULT: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeChannel {
    Main,
    Left,
    Right,
}

impl VolumeChannel {
    pub const fn element(self) -> u32 {
        match self {
            VolumeChannel::Main => element::MAIN,
            VolumeChannel::Left => element::LEFT,
            VolumeChannel::Right => element::RIGHT,
        }
    }
}

/// Order in which volume addressings are attempted.
pub const VOLUME_ADDRESSINGS: [VolumeChannel; 3] =
    [VolumeChannel::Main, VolumeChannel::Left, VolumeChannel::Right];

/// Reads and writes the output volume of real devices.
#[derive(Clone)]
pub struct VolumeControl {
    props: PropertyAccessor,
}

impl VolumeControl {
    pub fn new(props: PropertyAccessor) -> Self {
        Self { props }
    }

    /// First readable volume level, if any addressing has one.
    pub fn read(&self, device: AudioObjectId) -> Option<f32> {
        VOLUME_ADDRESSINGS.iter().find_map(|channel| {
            self.props
                .get::<f32>(device, selector::VOLUME_SCALAR, Scope::Output, channel.element())
                .ok()
        })
    }

    /// Write `level` to the first addressing that accepts it. When none does, the
    /// last failure is returned.
    pub fn write(&self, device: AudioObjectId, level: f32) -> Result<VolumeChannel, HalError> {
        let level = clamp_level(level);
        let mut last_error = HalError::PropertyOperationFailed(status::UNKNOWN_PROPERTY);
        for channel in VOLUME_ADDRESSINGS {
            match self.props.set(
                device,
                selector::VOLUME_SCALAR,
                Scope::Output,
                channel.element(),
                level,
            ) {
                Ok(()) => return Ok(channel),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

/// Volume level per device UID.
///
/// Entries are never removed: a device that disconnects keeps its level for when
/// it comes back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeTable(BTreeMap<String, f32>);

impl VolumeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uid: &str) -> Option<f32> {
        self.0.get(uid).copied()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.0.contains_key(uid)
    }

    /// Record a level, clamped to `[0, 1]`. Returns the stored value.
    pub fn set(&mut self, uid: &str, level: f32) -> f32 {
        let level = clamp_level(level);
        self.0.insert(uid.to_string(), level);
        level
    }

    /// Insert a level for a device seen for the first time. Existing entries are
    /// kept; returns true when an entry was added.
    pub fn seed(&mut self, uid: &str, level: f32) -> bool {
        if self.contains(uid) {
            return false;
        }
        self.set(uid, level);
        true
    }

    pub fn as_map(&self) -> &BTreeMap<String, f32> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimulatedHardware};
    use std::sync::Arc;

    fn control() -> (Arc<SimulatedHardware>, VolumeControl) {
        let hw = Arc::new(SimulatedHardware::new());
        let vc = VolumeControl::new(PropertyAccessor::new(hw.clone()));
        (hw, vc)
    }

    #[test]
    fn writes_main_element_first() {
        let (hw, vc) = control();
        let id = hw.add_device(
            SimDevice::output("a", "A").with_volume_elements(&[
                (element::MAIN, 0.2),
                (element::LEFT, 0.2),
            ]),
        );
        assert_eq!(vc.write(id, 0.8), Ok(VolumeChannel::Main));
        assert_eq!(hw.volume("a", element::MAIN), Some(0.8));
        assert_eq!(hw.volume("a", element::LEFT), Some(0.2));
    }

    #[test]
    fn falls_back_to_channel_elements() {
        let (hw, vc) = control();
        let id = hw.add_device(
            SimDevice::output("bt", "Headphones").with_volume_elements(&[(element::RIGHT, 0.4)]),
        );
        assert_eq!(vc.read(id), Some(0.4));
        assert_eq!(vc.write(id, 1.5), Ok(VolumeChannel::Right));
        assert_eq!(hw.volume("bt", element::RIGHT), Some(1.0));
    }

    #[test]
    fn reports_when_no_addressing_works() {
        let (hw, vc) = control();
        let id = hw.add_device(SimDevice::output("hdmi", "HDMI").with_volume_elements(&[]));
        assert_eq!(vc.read(id), None);
        assert_eq!(
            vc.write(id, 0.3),
            Err(HalError::PropertyOperationFailed(status::UNKNOWN_PROPERTY))
        );
    }

    #[test]
    fn seed_never_overwrites() {
        let mut table = VolumeTable::new();
        assert!(table.seed("a", 0.4));
        table.set("a", 0.7);
        assert!(!table.seed("a", 0.1));
        assert_eq!(table.get("a"), Some(0.7));
        assert_eq!(table.set("b", 3.0), 1.0);
        assert_eq!(table.len(), 2);
    }
}
