//! Selection, volume and virtual-device lifecycle.
//!
//! `OutputOrchestrator` is the only component that mutates hardware state. It
//! lives on the control thread (see
//! [`ControlWorker`](crate::control_worker::ControlWorker)) and every change
//! reaches it as a closure run on that thread.
//!
//! Any change in selection membership goes through [`OutputOrchestrator::apply_selection`],
//! which always destroys the current virtual device before doing anything else,
//! so at most one virtual device exists at any time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::{VirtualDevice, VirtualOutputBuilder};
use crate::device::{Device, DeviceDirectory};
use crate::error::HalError;
use crate::hal::{AudioHardware, AudioObjectId, status};
use crate::property::PropertyAccessor;
use crate::volume::{UNREADABLE_VOLUME_DEFAULT, VolumeChannel, VolumeControl, VolumeTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputState {
    #[default]
    Idle,
    SingleDeviceActive,
    MultiDeviceActive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub virtual_device_name: String,
    pub virtual_device_uid: String,
    pub uid_prefix: String,
    pub private: bool,
    pub settle_delay: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&config::Config::default())
    }
}

impl From<&config::Config> for OrchestratorSettings {
    fn from(cfg: &config::Config) -> Self {
        Self {
            virtual_device_name: cfg.virtual_device.name.clone(),
            virtual_device_uid: cfg.virtual_device.uid.clone(),
            uid_prefix: cfg.virtual_device.uid_prefix.clone(),
            private: cfg.virtual_device.private,
            settle_delay: Duration::from_millis(cfg.general.settle_delay_ms),
        }
    }
}

/// Read-only view published after every operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSnapshot {
    pub devices: Vec<Device>,
    pub selection: Vec<Device>,
    pub volumes: BTreeMap<String, f32>,
    pub is_sharing: bool,
    pub state: OutputState,
    pub virtual_device: Option<VirtualDevice>,
    pub last_error: Option<String>,
}

/// The default output found before this process first changed it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SavedDefault {
    id: AudioObjectId,
    uid: Option<String>,
}

pub struct OutputOrchestrator {
    settings: OrchestratorSettings,
    directory: DeviceDirectory,
    builder: VirtualOutputBuilder,
    volume: VolumeControl,

    devices: Vec<Device>,
    selection: Vec<Device>,
    volumes: VolumeTable,
    virtual_device: Option<VirtualDevice>,
    saved_default: Option<SavedDefault>,
    state: OutputState,
    last_error: Option<String>,
}

impl OutputOrchestrator {
    pub fn new(hardware: Arc<dyn AudioHardware>, settings: OrchestratorSettings) -> Self {
        let directory = DeviceDirectory::new(hardware.clone(), &settings.virtual_device_name);
        let builder = VirtualOutputBuilder::new(
            hardware.clone(),
            &settings.virtual_device_name,
            settings.private,
            settings.settle_delay,
        );
        let volume = VolumeControl::new(PropertyAccessor::new(hardware));
        Self {
            settings,
            directory,
            builder,
            volume,
            devices: Vec::new(),
            selection: Vec::new(),
            volumes: VolumeTable::new(),
            virtual_device: None,
            saved_default: None,
            state: OutputState::Idle,
            last_error: None,
        }
    }

    /// Remove virtual devices a crashed earlier run left behind, then scan devices.
    pub fn start(&mut self) {
        let reclaimed = self
            .builder
            .reclaim_stale(&self.directory, &self.settings.uid_prefix);
        if reclaimed > 0 {
            log::info!("reclaimed {} stale virtual device(s)", reclaimed);
        }
        self.refresh();
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn selection(&self) -> &[Device] {
        &self.selection
    }

    pub fn volumes(&self) -> &VolumeTable {
        &self.volumes
    }

    pub fn state(&self) -> OutputState {
        self.state
    }

    pub fn is_sharing(&self) -> bool {
        self.state != OutputState::Idle
    }

    pub fn virtual_device(&self) -> Option<&VirtualDevice> {
        self.virtual_device.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn snapshot(&self) -> OutputSnapshot {
        OutputSnapshot {
            devices: self.devices.clone(),
            selection: self.selection.clone(),
            volumes: self.volumes.as_map().clone(),
            is_sharing: self.is_sharing(),
            state: self.state,
            virtual_device: self.virtual_device.clone(),
            last_error: self.last_error.clone(),
        }
    }

    /// Add `device` to the selection, or remove it if a device with the same UID is
    /// already selected, then re-run the transition rule.
    pub fn toggle_selection(&mut self, device: &Device) -> OutputState {
        if let Some(pos) = self.selection.iter().position(|d| d.uid == device.uid) {
            let removed = self.selection.remove(pos);
            log::info!("deselected {} ({})", removed.name, removed.uid);
        } else {
            // Always select the directory's copy so the handle is current.
            match self.devices.iter().find(|d| d.uid == device.uid) {
                Some(current) => {
                    log::info!("selected {} ({})", current.name, current.uid);
                    self.selection.push(current.clone());
                }
                None => {
                    log::warn!("cannot select {}: not an available output", device.uid);
                    return self.state;
                }
            }
        }
        self.apply_selection()
    }

    /// Record a volume for `device` and push it to the live device. The table keeps
    /// the new level even when the hardware write fails.
    pub fn set_volume(&mut self, device: &Device, level: f32) -> Result<VolumeChannel, HalError> {
        let level = self.volumes.set(&device.uid, level);
        let Some(id) = self.current_id(&device.uid) else {
            log::debug!("{} is not connected, volume {} kept for later", device.uid, level);
            return Err(HalError::PropertyOperationFailed(status::BAD_OBJECT));
        };
        self.volume.write(id, level).inspect_err(|e| {
            log::warn!("cannot set volume of {} to {}: {}", device.uid, level, e);
        })
    }

    /// Rescan devices. Disconnected devices fall out of the selection, first-seen
    /// devices get a volume entry, and the transition rule runs when the selection
    /// size changed.
    pub fn refresh(&mut self) {
        let fresh = match self.directory.list_output_devices(&self.settings.uid_prefix) {
            Ok(devices) => devices,
            Err(e) => {
                log::warn!("device refresh failed, keeping previous state: {}", e);
                return;
            }
        };

        for device in &fresh {
            if !self.volumes.contains(&device.uid) {
                let level = self.volume.read(device.id).unwrap_or(UNREADABLE_VOLUME_DEFAULT);
                self.volumes.seed(&device.uid, level);
                log::debug!("seeded volume of {} with {}", device.uid, level);
            }
        }

        let before = self.selection.len();
        self.selection = self
            .selection
            .iter()
            .filter_map(|s| fresh.iter().find(|d| d.uid == s.uid).cloned())
            .collect();
        self.devices = fresh;

        if self.selection.len() != before {
            log::info!(
                "selection shrank from {} to {} after refresh",
                before,
                self.selection.len()
            );
            self.apply_selection();
        }
    }

    /// The transition rule. Tears down the virtual device, then routes output
    /// according to the current selection. Safe to call repeatedly.
    pub fn apply_selection(&mut self) -> OutputState {
        self.teardown_virtual_device();

        let result = match self.selection.len() {
            0 => {
                self.restore_saved_default();
                Ok(OutputState::Idle)
            }
            1 => self.activate_single().map(|_| OutputState::SingleDeviceActive),
            _ => self.activate_multi().map(|_| OutputState::MultiDeviceActive),
        };

        match result {
            Ok(state) => {
                self.state = state;
                self.last_error = None;
            }
            Err(e) => {
                log::warn!("routing to {} device(s) failed: {}", self.selection.len(), e);
                self.teardown_virtual_device();
                self.restore_saved_default();
                self.state = OutputState::Idle;
                self.last_error = Some(e.to_string());
            }
        }
        log::info!("output state: {:?}", self.state);
        self.state
    }

    /// Destroy the virtual device and put back the original default output,
    /// whatever the current state.
    pub fn shutdown(&mut self) {
        log::info!("shutting down output routing");
        self.teardown_virtual_device();
        self.restore_saved_default();
        self.state = OutputState::Idle;
    }

    fn activate_single(&mut self) -> Result<(), HalError> {
        self.capture_saved_default();
        let device = &self.selection[0];
        self.builder.set_default_output(device.id)
    }

    fn activate_multi(&mut self) -> Result<(), HalError> {
        self.capture_saved_default();
        let vd = self
            .builder
            .create_multi_output(&self.selection, &self.settings.virtual_device_uid)?;
        let id = vd.id;
        self.virtual_device = Some(vd);
        self.builder.set_default_output(id)?;
        self.reapply_volumes();
        Ok(())
    }

    /// A new virtual device does not carry the members' volumes over.
    fn reapply_volumes(&self) {
        for device in &self.selection {
            let Some(level) = self.volumes.get(&device.uid) else {
                continue;
            };
            if let Err(e) = self.volume.write(device.id, level) {
                log::warn!("cannot restore volume of {}: {}", device.uid, e);
            }
        }
    }

    fn teardown_virtual_device(&mut self) {
        if let Some(vd) = self.virtual_device.take() {
            self.builder.destroy(vd.id);
        }
    }

    fn capture_saved_default(&mut self) {
        if self.saved_default.is_some() {
            return;
        }
        match self.directory.default_output() {
            Ok(id) => {
                let uid = self.directory.uid_of(id);
                log::info!("saved default output {} ({:?})", id, uid);
                self.saved_default = Some(SavedDefault { id, uid });
            }
            Err(e) => log::warn!("cannot read the default output to save it: {}", e),
        }
    }

    fn restore_saved_default(&mut self) {
        let Some(saved) = self.saved_default.clone() else {
            return;
        };
        // The device may have reconnected under a new handle since it was saved.
        let id = saved
            .uid
            .as_deref()
            .and_then(|uid| self.directory.find_by_uid(uid).ok().flatten())
            .unwrap_or(saved.id);
        if let Err(e) = self.builder.set_default_output(id) {
            log::warn!("cannot restore default output {}: {}", id, e);
        }
    }

    fn current_id(&self, uid: &str) -> Option<AudioObjectId> {
        self.devices.iter().find(|d| d.uid == uid).map(|d| d.id)
    }
}

impl Drop for OutputOrchestrator {
    fn drop(&mut self) {
        // Idle without a virtual device means shutdown already ran or nothing was routed.
        if self.state != OutputState::Idle || self.virtual_device.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::element;
    use crate::sim::{SimDevice, SimulatedHardware};
    use std::collections::HashSet;

    const VIRTUAL_UID: &str = "io.multiout.virtual-output";

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            settle_delay: Duration::ZERO,
            ..OrchestratorSettings::default()
        }
    }

    /// A machine with built-in speakers (the default) plus two extra outputs.
    fn setup() -> (Arc<SimulatedHardware>, OutputOrchestrator) {
        let hw = Arc::new(SimulatedHardware::new());
        hw.add_device(SimDevice::output("builtin", "MacBook Speakers"));
        hw.add_device(SimDevice::output("a", "Device A"));
        hw.add_device(
            SimDevice::output("b", "Device B").with_volume_elements(&[
                (element::LEFT, 0.3),
                (element::RIGHT, 0.3),
            ]),
        );
        let mut orch = OutputOrchestrator::new(hw.clone(), settings());
        orch.start();
        (hw, orch)
    }

    fn device(orch: &OutputOrchestrator, uid: &str) -> Device {
        orch.devices()
            .iter()
            .find(|d| d.uid == uid)
            .cloned()
            .expect("device present")
    }

    #[test]
    fn single_selection_sets_default_directly() {
        let (hw, mut orch) = setup();
        let a = device(&orch, "a");
        assert_eq!(orch.toggle_selection(&a), OutputState::SingleDeviceActive);
        assert_eq!(hw.default_output(), a.id);
        assert!(hw.aggregates().is_empty());
        assert!(orch.is_sharing());
    }

    #[test]
    fn two_devices_build_virtual_output() {
        let (hw, mut orch) = setup();
        let a = device(&orch, "a");
        let b = device(&orch, "b");
        orch.toggle_selection(&a);
        assert_eq!(orch.toggle_selection(&b), OutputState::MultiDeviceActive);

        let aggregates = hw.aggregates();
        assert_eq!(aggregates.len(), 1);
        let (id, desc) = &aggregates[0];
        assert_eq!(hw.default_output(), *id);
        assert_eq!(desc.master_uid, "a");
        let subs: Vec<(&str, bool)> = desc
            .sub_devices
            .iter()
            .map(|s| (s.uid.as_str(), s.drift_compensation))
            .collect();
        assert_eq!(subs, vec![("a", false), ("b", true)]);
        assert_eq!(orch.virtual_device().map(|v| v.id), Some(*id));
    }

    #[test]
    fn sub_devices_match_selection_for_any_size() {
        let (hw, mut orch) = setup();
        for uid in ["b", "builtin", "a"] {
            let d = device(&orch, uid);
            orch.toggle_selection(&d);
        }
        let aggregates = hw.aggregates();
        assert_eq!(aggregates.len(), 1);
        let desc = &aggregates[0].1;
        let got: HashSet<&str> = desc.sub_devices.iter().map(|s| s.uid.as_str()).collect();
        assert_eq!(got, HashSet::from(["a", "b", "builtin"]));
        for sub in &desc.sub_devices {
            assert_eq!(sub.drift_compensation, sub.uid != "b");
        }
    }

    #[test]
    fn disconnect_drops_back_to_single_device() {
        let (hw, mut orch) = setup();
        let a = device(&orch, "a");
        let b = device(&orch, "b");
        orch.toggle_selection(&a);
        orch.toggle_selection(&b);

        hw.remove_device("b");
        orch.refresh();

        assert_eq!(orch.state(), OutputState::SingleDeviceActive);
        assert!(hw.aggregates().is_empty());
        assert_eq!(hw.default_output(), a.id);
        assert_eq!(orch.selection(), &[a][..]);
    }

    #[test]
    fn empty_selection_restores_saved_default() {
        let (hw, mut orch) = setup();
        let original = hw.default_output();
        let a = device(&orch, "a");
        let b = device(&orch, "b");
        orch.toggle_selection(&a);
        orch.toggle_selection(&b);
        orch.toggle_selection(&a);
        orch.toggle_selection(&b);

        assert_eq!(orch.state(), OutputState::Idle);
        assert!(!orch.is_sharing());
        assert!(hw.aggregates().is_empty());
        assert_eq!(hw.default_output(), original);
    }

    #[test]
    fn saved_default_is_captured_once() {
        let (hw, mut orch) = setup();
        let a = device(&orch, "a");
        let b = device(&orch, "b");
        orch.toggle_selection(&a);
        // The default is A now; growing the selection must not save A.
        orch.toggle_selection(&b);
        orch.toggle_selection(&a);
        orch.toggle_selection(&b);
        assert_eq!(orch.state(), OutputState::Idle);
        assert_eq!(hw.default_output_uid().as_deref(), Some("builtin"));
    }

    #[test]
    fn saved_default_follows_reconnected_device() {
        let (hw, mut orch) = setup();
        let a = device(&orch, "a");
        orch.toggle_selection(&a);

        hw.remove_device("builtin");
        hw.add_device(SimDevice::output("builtin", "MacBook Speakers"));
        orch.refresh();
        orch.toggle_selection(&a);

        assert_eq!(hw.default_output_uid().as_deref(), Some("builtin"));
    }

    #[test]
    fn apply_selection_is_idempotent() {
        let (hw, mut orch) = setup();
        let a = device(&orch, "a");
        let b = device(&orch, "b");
        orch.toggle_selection(&a);
        orch.toggle_selection(&b);

        let first = orch.snapshot();
        orch.apply_selection();
        let second = orch.snapshot();

        assert_eq!(hw.aggregates().len(), 1);
        assert_eq!(first.selection, second.selection);
        assert_eq!(first.state, second.state);
        assert_eq!(hw.default_output(), second.virtual_device.as_ref().unwrap().id);
    }

    #[test]
    fn selection_survives_reconnect_with_new_handle() {
        let (hw, mut orch) = setup();
        let a = device(&orch, "a");
        orch.toggle_selection(&a);

        hw.remove_device("a");
        let new_id = hw.add_device(SimDevice::output("a", "Device A"));
        orch.refresh();

        assert_ne!(a.id, new_id);
        assert_eq!(orch.selection().len(), 1);
        assert_eq!(orch.selection()[0].uid, "a");
        assert_eq!(orch.selection()[0].id, new_id);
    }

    #[test]
    fn refresh_with_same_members_keeps_virtual_device() {
        let (hw, mut orch) = setup();
        let a = device(&orch, "a");
        let b = device(&orch, "b");
        orch.toggle_selection(&a);
        orch.toggle_selection(&b);
        let before = orch.virtual_device().map(|v| v.id).expect("virtual device");

        orch.refresh();
        assert_eq!(orch.virtual_device().map(|v| v.id), Some(before));
        assert_eq!(hw.aggregates().len(), 1);

        // A member coming back under a new handle is still the same member.
        hw.remove_device("b");
        let new_b = hw.add_device(SimDevice::output("b", "Device B"));
        orch.refresh();
        assert_eq!(orch.state(), OutputState::MultiDeviceActive);
        assert_eq!(orch.virtual_device().map(|v| v.id), Some(before));
        assert_eq!(hw.aggregates().len(), 1);
        assert_eq!(hw.default_output(), before);
        assert_eq!(orch.selection()[1].id, new_b);
    }

    #[test]
    fn drop_restores_default_from_single_device() {
        let (hw, mut orch) = setup();
        let original = hw.default_output_uid();
        let a = device(&orch, "a");
        orch.toggle_selection(&a);
        assert_eq!(hw.default_output_uid().as_deref(), Some("a"));

        drop(orch);
        assert_eq!(hw.default_output_uid(), original);
    }

    #[test]
    fn drop_after_shutdown_does_nothing_more() {
        let (hw, mut orch) = setup();
        let a = device(&orch, "a");
        orch.toggle_selection(&a);
        orch.shutdown();

        // Someone else picks an output after we let go of it.
        let b = hw.id_of("b").expect("b connected");
        PropertyAccessor::new(hw.clone())
            .set_global(
                crate::hal::SYSTEM_OBJECT,
                crate::hal::selector::DEFAULT_OUTPUT_DEVICE,
                b,
            )
            .unwrap();
        drop(orch);
        assert_eq!(hw.default_output_uid().as_deref(), Some("b"));
    }

    #[test]
    fn refresh_keeps_user_volume() {
        let (_hw, mut orch) = setup();
        let a = device(&orch, "a");
        assert_eq!(orch.volumes().get("a"), Some(0.5));
        orch.set_volume(&a, 0.7).unwrap();
        orch.refresh();
        assert_eq!(orch.volumes().get("a"), Some(0.7));
    }

    #[test]
    fn volume_entries_outlive_disconnects() {
        let (hw, mut orch) = setup();
        let b = device(&orch, "b");
        assert_eq!(orch.volumes().get("b"), Some(0.3));
        hw.remove_device("b");
        orch.refresh();
        assert!(orch.set_volume(&b, 0.9).is_err());
        assert_eq!(orch.volumes().get("b"), Some(0.9));

        hw.add_device(SimDevice::output("b", "Device B"));
        orch.refresh();
        assert_eq!(orch.volumes().get("b"), Some(0.9));
    }

    #[test]
    fn set_volume_clamps_and_pushes_to_device() {
        let (hw, mut orch) = setup();
        let b = device(&orch, "b");
        assert_eq!(orch.set_volume(&b, 1.4), Ok(VolumeChannel::Left));
        assert_eq!(orch.volumes().get("b"), Some(1.0));
        assert_eq!(hw.volume("b", element::LEFT), Some(1.0));
    }

    #[test]
    fn virtual_device_gets_member_volumes() {
        let (hw, mut orch) = setup();
        let a = device(&orch, "a");
        let b = device(&orch, "b");
        orch.set_volume(&a, 0.25).unwrap();
        orch.set_volume(&b, 0.75).unwrap();
        // Someone else changes the hardware level behind our back.
        PropertyAccessor::new(hw.clone())
            .set(
                a.id,
                crate::hal::selector::VOLUME_SCALAR,
                crate::hal::Scope::Output,
                element::MAIN,
                0.9f32,
            )
            .unwrap();

        orch.toggle_selection(&a);
        orch.toggle_selection(&b);
        assert_eq!(hw.volume("a", element::MAIN), Some(0.25));
        assert_eq!(hw.volume("b", element::LEFT), Some(0.75));
    }

    #[test]
    fn creation_failure_keeps_selection() {
        let (hw, mut orch) = setup();
        let original = hw.default_output();
        let a = device(&orch, "a");
        let b = device(&orch, "b");
        orch.toggle_selection(&a);
        hw.fail_aggregate_creation(Some(status::UNSPECIFIED));
        assert_eq!(orch.toggle_selection(&b), OutputState::Idle);

        assert!(!orch.is_sharing());
        assert_eq!(orch.selection().len(), 2);
        assert!(orch.last_error().is_some());
        assert_eq!(hw.default_output(), original);

        // The user retries once the HAL cooperates again.
        hw.fail_aggregate_creation(None);
        assert_eq!(orch.apply_selection(), OutputState::MultiDeviceActive);
        assert!(orch.last_error().is_none());
    }

    #[test]
    fn rejected_default_destroys_new_virtual_device() {
        let (hw, mut orch) = setup();
        let a = device(&orch, "a");
        let b = device(&orch, "b");
        orch.toggle_selection(&a);
        hw.reject_default_output(Some(status::ILLEGAL_OPERATION));
        assert_eq!(orch.toggle_selection(&b), OutputState::Idle);
        assert!(hw.aggregates().is_empty());
        assert!(orch.virtual_device().is_none());
    }

    #[test]
    fn unknown_device_cannot_be_selected() {
        let (_hw, mut orch) = setup();
        let ghost = Device {
            id: 9999,
            uid: "ghost".to_string(),
            name: "Ghost".to_string(),
            is_output: true,
        };
        assert_eq!(orch.toggle_selection(&ghost), OutputState::Idle);
        assert!(orch.selection().is_empty());
    }

    #[test]
    fn shutdown_cleans_up_from_any_state() {
        let (hw, mut orch) = setup();
        let original = hw.default_output();
        let a = device(&orch, "a");
        let b = device(&orch, "b");
        orch.toggle_selection(&a);
        orch.toggle_selection(&b);

        orch.shutdown();
        assert!(hw.aggregates().is_empty());
        assert_eq!(hw.default_output(), original);
        assert_eq!(orch.state(), OutputState::Idle);
    }

    #[test]
    fn start_reclaims_stale_virtual_device() {
        let hw = Arc::new(SimulatedHardware::new());
        hw.add_device(SimDevice::output("a", "A"));
        hw.add_device(SimDevice::output("b", "B"));
        {
            let mut crashed = OutputOrchestrator::new(hw.clone(), settings());
            crashed.start();
            let (a, b) = (device(&crashed, "a"), device(&crashed, "b"));
            crashed.toggle_selection(&a);
            crashed.toggle_selection(&b);
            // Simulate a crash: skip Drop so the virtual device stays behind.
            std::mem::forget(crashed);
        }
        assert_eq!(hw.aggregates().len(), 1);

        let mut orch = OutputOrchestrator::new(hw.clone(), settings());
        orch.start();
        assert!(hw.aggregates().is_empty());
        assert!(orch.devices().iter().all(|d| d.uid != VIRTUAL_UID));
    }
}
