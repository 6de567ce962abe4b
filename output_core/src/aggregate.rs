//! Virtual multi-output device construction.
//!
//! A virtual device mirrors one signal to every sub-device. The first device is
//! the clock master; every other sub-device runs with drift compensation so
//! independently clocked outputs (Bluetooth in particular) do not slowly drift
//! apart.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceDirectory};
use crate::error::HalError;
use crate::hal::{
    AggregateDescription, AggregateMode, AudioHardware, AudioObjectId, SYSTEM_OBJECT,
    SubDeviceDescription, selector,
};
use crate::property::PropertyAccessor;

/// A live virtual device created by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    pub id: AudioObjectId,
    pub uid: String,
    pub master_uid: String,
    /// Sub-device UIDs, master first.
    pub members: Vec<String>,
}

pub struct VirtualOutputBuilder {
    hardware: Arc<dyn AudioHardware>,
    props: PropertyAccessor,
    name: String,
    private: bool,
    settle_delay: Duration,
}

impl VirtualOutputBuilder {
    pub fn new(
        hardware: Arc<dyn AudioHardware>,
        name: impl Into<String>,
        private: bool,
        settle_delay: Duration,
    ) -> Self {
        Self {
            props: PropertyAccessor::new(hardware.clone()),
            hardware,
            name: name.into(),
            private,
            settle_delay,
        }
    }

    /// The description `create_multi_output` hands to the HAL.
    pub fn describe(&self, devices: &[Device], uid: &str) -> Result<AggregateDescription, HalError> {
        if devices.len() < 2 {
            return Err(HalError::InvalidConfiguration(format!(
                "a virtual output needs at least 2 devices, got {}",
                devices.len()
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = devices.iter().find(|d| !seen.insert(d.uid.as_str())) {
            return Err(HalError::InvalidConfiguration(format!(
                "device {} listed twice",
                dup.uid
            )));
        }

        let sub_devices = devices
            .iter()
            .enumerate()
            .map(|(i, d)| SubDeviceDescription {
                uid: d.uid.clone(),
                drift_compensation: i > 0,
            })
            .collect();

        Ok(AggregateDescription {
            name: self.name.clone(),
            uid: uid.to_string(),
            sub_devices,
            master_uid: devices[0].uid.clone(),
            mode: AggregateMode::Mirrored,
            private: self.private,
        })
    }

    /// Build a virtual device mirroring to `devices`, `devices[0]` being the master.
    ///
    /// Blocks for the settling delay after a successful create: the HAL registers the
    /// new device asynchronously and rejects it as default output until it has.
    pub fn create_multi_output(
        &self,
        devices: &[Device],
        uid: &str,
    ) -> Result<VirtualDevice, HalError> {
        let description = self.describe(devices, uid)?;
        let id = self.hardware.create_aggregate(&description)?;
        log::info!(
            "created virtual device {} ({}) with {} sub-devices, master {}",
            id,
            uid,
            description.sub_devices.len(),
            description.master_uid
        );
        if !self.settle_delay.is_zero() {
            std::thread::sleep(self.settle_delay);
        }
        Ok(VirtualDevice {
            id,
            uid: description.uid,
            master_uid: description.master_uid,
            members: description.sub_devices.into_iter().map(|s| s.uid).collect(),
        })
    }

    /// Best-effort teardown. A device that is already gone is only logged.
    pub fn destroy(&self, id: AudioObjectId) {
        match self.hardware.destroy_aggregate(id) {
            Ok(()) => log::info!("destroyed virtual device {}", id),
            Err(e) => log::warn!("destroying virtual device {} failed: {}", id, e),
        }
    }

    /// Point the system default output at `id`.
    pub fn set_default_output(&self, id: AudioObjectId) -> Result<(), HalError> {
        self.props
            .set_global(SYSTEM_OBJECT, selector::DEFAULT_OUTPUT_DEVICE, id)?;
        log::info!("default output set to {}", id);
        Ok(())
    }

    /// Destroy virtual devices left behind by an earlier run, i.e. every device whose
    /// UID starts with `uid_prefix`. Returns how many were destroyed.
    pub fn reclaim_stale(&self, directory: &DeviceDirectory, uid_prefix: &str) -> usize {
        if uid_prefix.is_empty() {
            return 0;
        }
        let devices = match directory.all_devices() {
            Ok(d) => d,
            Err(e) => {
                log::warn!("cannot scan for stale virtual devices: {}", e);
                return 0;
            }
        };
        let mut reclaimed = 0;
        for device in devices.iter().filter(|d| d.uid.starts_with(uid_prefix)) {
            match self.hardware.destroy_aggregate(device.id) {
                Ok(()) => {
                    log::info!("reclaimed stale virtual device {} ({})", device.id, device.uid);
                    reclaimed += 1;
                }
                Err(e) => log::warn!("cannot reclaim {} ({}): {}", device.id, device.uid, e),
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::status;
    use crate::sim::{SimDevice, SimulatedHardware};

    const UID: &str = "io.multiout.virtual-output";

    fn setup(uids: &[&str]) -> (Arc<SimulatedHardware>, VirtualOutputBuilder, Vec<Device>) {
        let hw = Arc::new(SimulatedHardware::new());
        for uid in uids {
            hw.add_device(SimDevice::output(uid, &uid.to_uppercase()));
        }
        let dir = DeviceDirectory::new(hw.clone(), "Multi-Output");
        let devices = dir.list_output_devices("io.multiout.").unwrap();
        let builder = VirtualOutputBuilder::new(hw.clone(), "Multi-Output", false, Duration::ZERO);
        (hw, builder, devices)
    }

    #[test]
    fn first_device_is_master_without_drift() {
        let (hw, builder, devices) = setup(&["a", "b", "c"]);
        let vd = builder.create_multi_output(&devices, UID).unwrap();
        assert_eq!(vd.master_uid, "a");
        assert_eq!(vd.members, vec!["a", "b", "c"]);

        let aggregates = hw.aggregates();
        assert_eq!(aggregates.len(), 1);
        let (id, desc) = &aggregates[0];
        assert_eq!(*id, vd.id);
        assert_eq!(desc.mode, AggregateMode::Mirrored);
        let drift: Vec<bool> = desc.sub_devices.iter().map(|s| s.drift_compensation).collect();
        assert_eq!(drift, vec![false, true, true]);
    }

    #[test]
    fn needs_two_devices() {
        let (hw, builder, devices) = setup(&["a"]);
        assert!(matches!(
            builder.create_multi_output(&devices, UID),
            Err(HalError::InvalidConfiguration(_))
        ));
        assert!(hw.aggregates().is_empty());
    }

    #[test]
    fn duplicate_members_are_rejected() {
        let (_hw, builder, devices) = setup(&["a"]);
        let twice = vec![devices[0].clone(), devices[0].clone()];
        assert!(matches!(
            builder.describe(&twice, UID),
            Err(HalError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn creation_failure_is_typed() {
        let (hw, builder, devices) = setup(&["a", "b"]);
        hw.fail_aggregate_creation(Some(status::UNSPECIFIED));
        assert_eq!(
            builder.create_multi_output(&devices, UID),
            Err(HalError::AggregateCreationFailed(status::UNSPECIFIED))
        );
    }

    #[test]
    fn destroy_twice_is_harmless() {
        let (hw, builder, devices) = setup(&["a", "b"]);
        let vd = builder.create_multi_output(&devices, UID).unwrap();
        builder.destroy(vd.id);
        builder.destroy(vd.id);
        assert!(hw.aggregates().is_empty());
    }

    #[test]
    fn reclaims_leftovers_by_prefix() {
        let (hw, builder, devices) = setup(&["a", "b"]);
        builder.create_multi_output(&devices, UID).unwrap();
        let dir = DeviceDirectory::new(hw.clone(), "Multi-Output");
        assert_eq!(builder.reclaim_stale(&dir, "io.multiout."), 1);
        assert!(hw.aggregates().is_empty());
        assert_eq!(builder.reclaim_stale(&dir, "io.multiout."), 0);
    }
}
