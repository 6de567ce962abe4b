//! Output device discovery.
//!
//! The directory walks every object the HAL knows, builds a [`Device`] for each
//! one with a readable UID, keeps those with at least one output channel, and
//! hides the virtual devices this application creates. It never mutates
//! hardware state, so it can be called as often as needed.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::HalError;
use crate::hal::{AudioHardware, AudioObjectId, SYSTEM_OBJECT, Scope, element, selector};
use crate::property::{ChannelLayout, ObjectList, PropertyAccessor};

/// An audio endpoint as seen during one directory scan.
///
/// Identity is the `uid`: two values with the same `uid` are the same device even
/// when their `id` differs (a reconnected device gets a new handle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Transient handle, valid until the next scan.
    pub id: AudioObjectId,
    pub uid: String,
    pub name: String,
    pub is_output: bool,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

#[derive(Clone)]
pub struct DeviceDirectory {
    props: PropertyAccessor,
    virtual_device_name: String,
}

impl DeviceDirectory {
    /// `virtual_device_name` is the display name of the devices this application
    /// creates; devices carrying it are never listed.
    pub fn new(hardware: Arc<dyn AudioHardware>, virtual_device_name: impl Into<String>) -> Self {
        Self {
            props: PropertyAccessor::new(hardware),
            virtual_device_name: virtual_device_name.into(),
        }
    }

    /// All output-capable devices, except the ones whose UID starts with
    /// `excluding_uid_prefix` or whose name marks them as our own virtual device.
    /// The order is whatever the HAL reports.
    pub fn list_output_devices(&self, excluding_uid_prefix: &str) -> Result<Vec<Device>, HalError> {
        let devices = self
            .all_devices()?
            .into_iter()
            .filter(|d| d.is_output)
            .filter(|d| !self.is_own_device(d, excluding_uid_prefix))
            .collect();
        Ok(devices)
    }

    /// Every device with a readable UID, output-capable or not.
    pub fn all_devices(&self) -> Result<Vec<Device>, HalError> {
        let ObjectList(ids) = self.props.get_global(SYSTEM_OBJECT, selector::DEVICES)?;
        Ok(ids.into_iter().filter_map(|id| self.read_device(id)).collect())
    }

    /// Handle of the current system default output.
    pub fn default_output(&self) -> Result<AudioObjectId, HalError> {
        self.props
            .get_global(SYSTEM_OBJECT, selector::DEFAULT_OUTPUT_DEVICE)
    }

    /// Current handle of the device with this UID, whatever kind of device it is.
    pub fn find_by_uid(&self, uid: &str) -> Result<Option<AudioObjectId>, HalError> {
        Ok(self
            .all_devices()?
            .into_iter()
            .find(|d| d.uid == uid)
            .map(|d| d.id))
    }

    /// Read the UID of one object, if it has one.
    pub fn uid_of(&self, id: AudioObjectId) -> Option<String> {
        self.props.get_global(id, selector::DEVICE_UID).ok()
    }

    /// Number of output channels, 0 when the device has none or cannot be probed.
    pub fn output_channel_count(&self, id: AudioObjectId) -> u32 {
        self.props
            .get::<ChannelLayout>(id, selector::STREAM_CONFIGURATION, Scope::Output, element::MAIN)
            .map(|layout| layout.total_channels())
            .unwrap_or(0)
    }

    fn read_device(&self, id: AudioObjectId) -> Option<Device> {
        let uid = match self.uid_of(id) {
            Some(uid) => uid,
            None => {
                log::debug!("skipping object {}: no readable UID", id);
                return None;
            }
        };
        let name = self
            .props
            .get_global::<String>(id, selector::NAME)
            .unwrap_or_else(|_| uid.clone());
        let channels = self.output_channel_count(id);
        log::debug!(
            "found device {} uid={} name={:?} output_channels={}",
            id,
            uid,
            name,
            channels
        );
        Some(Device {
            id,
            uid,
            name,
            is_output: channels > 0,
        })
    }

    fn is_own_device(&self, device: &Device, uid_prefix: &str) -> bool {
        (!uid_prefix.is_empty() && device.uid.starts_with(uid_prefix))
            || device.name.starts_with(&self.virtual_device_name)
    }
}
