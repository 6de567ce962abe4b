//! In-memory audio hardware.
//!
//! `SimulatedHardware` behaves like a small HAL: a system object owning a device
//! list and a default-output pointer, devices with UID/name/stream/volume
//! properties, aggregate creation and destruction, and change listeners. Devices
//! get a fresh handle every time they are (re)connected, like real hardware does.
//! Failure injection hooks let tests exercise the error paths.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::error::HalError;
use crate::hal::{
    AggregateDescription, AudioHardware, AudioObjectId, ListenerId, OsStatus, PropertyAddress,
    PropertyListener, PropertyValue, SYSTEM_OBJECT, Scope, UNKNOWN_OBJECT, ValueKind, element,
    selector, status,
};

/// Blueprint of a simulated device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub uid: Option<String>,
    pub name: String,
    pub output_channels: Vec<u32>,
    /// Elements that expose an output volume control, with their initial level.
    pub volume_elements: Vec<(u32, f32)>,
}

impl SimDevice {
    /// A stereo output with a volume control on the main element.
    pub fn output(uid: &str, name: &str) -> Self {
        Self {
            uid: Some(uid.to_string()),
            name: name.to_string(),
            output_channels: vec![2],
            volume_elements: vec![(element::MAIN, 0.5)],
        }
    }

    pub fn input_only(uid: &str, name: &str) -> Self {
        Self {
            output_channels: Vec::new(),
            volume_elements: Vec::new(),
            ..Self::output(uid, name)
        }
    }

    pub fn with_volume_elements(mut self, elements: &[(u32, f32)]) -> Self {
        self.volume_elements = elements.to_vec();
        self
    }

    pub fn without_uid(mut self) -> Self {
        self.uid = None;
        self
    }
}

struct SimObject {
    device: SimDevice,
    aggregate: Option<AggregateDescription>,
}

struct ListenerEntry {
    object: AudioObjectId,
    selector: u32,
    listener: PropertyListener,
}

struct SimState {
    next_id: AudioObjectId,
    objects: BTreeMap<AudioObjectId, SimObject>,
    default_output: AudioObjectId,
    listeners: HashMap<ListenerId, ListenerEntry>,
    next_listener: ListenerId,
    create_failure: Option<OsStatus>,
    default_failure: Option<OsStatus>,
    remove_listener_failure: Option<OsStatus>,
}

pub struct SimulatedHardware {
    state: Mutex<SimState>,
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_id: 100,
                objects: BTreeMap::new(),
                default_output: UNKNOWN_OBJECT,
                listeners: HashMap::new(),
                next_listener: 1,
                create_failure: None,
                default_failure: None,
                remove_listener_failure: None,
            }),
        }
    }

    /// Connect a device. The first output device becomes the default output.
    pub fn add_device(&self, device: SimDevice) -> AudioObjectId {
        let (id, default_changed) = {
            let mut st = self.state.lock();
            let id = st.next_id;
            st.next_id += 1;
            let is_output = !device.output_channels.is_empty();
            st.objects.insert(
                id,
                SimObject {
                    device,
                    aggregate: None,
                },
            );
            let default_changed = is_output && st.default_output == UNKNOWN_OBJECT;
            if default_changed {
                st.default_output = id;
            }
            (id, default_changed)
        };
        self.notify(SYSTEM_OBJECT, selector::DEVICES);
        if default_changed {
            self.notify(SYSTEM_OBJECT, selector::DEFAULT_OUTPUT_DEVICE);
        }
        id
    }

    /// Disconnect the device with this UID. Returns false if it was not connected.
    pub fn remove_device(&self, uid: &str) -> bool {
        let removed = {
            let mut st = self.state.lock();
            match find_uid(&st, uid) {
                Some(id) => Some(remove_object(&mut st, id)),
                None => None,
            }
        };
        match removed {
            Some(default_changed) => {
                self.notify(SYSTEM_OBJECT, selector::DEVICES);
                if default_changed {
                    self.notify(SYSTEM_OBJECT, selector::DEFAULT_OUTPUT_DEVICE);
                }
                true
            }
            None => false,
        }
    }

    pub fn id_of(&self, uid: &str) -> Option<AudioObjectId> {
        find_uid(&self.state.lock(), uid)
    }

    pub fn default_output(&self) -> AudioObjectId {
        self.state.lock().default_output
    }

    pub fn default_output_uid(&self) -> Option<String> {
        let st = self.state.lock();
        st.objects
            .get(&st.default_output)
            .and_then(|o| o.device.uid.clone())
    }

    /// Live aggregates, in creation order.
    pub fn aggregates(&self) -> Vec<(AudioObjectId, AggregateDescription)> {
        self.state
            .lock()
            .objects
            .iter()
            .filter_map(|(id, o)| o.aggregate.clone().map(|a| (*id, a)))
            .collect()
    }

    pub fn volume(&self, uid: &str, element: u32) -> Option<f32> {
        let st = self.state.lock();
        let id = find_uid(&st, uid)?;
        st.objects[&id]
            .device
            .volume_elements
            .iter()
            .find(|(e, _)| *e == element)
            .map(|(_, v)| *v)
    }

    /// Make every following aggregate creation fail with `status`, or succeed again with `None`.
    pub fn fail_aggregate_creation(&self, status: Option<OsStatus>) {
        self.state.lock().create_failure = status;
    }

    /// Make every following default-output assignment fail with `status`.
    pub fn reject_default_output(&self, status: Option<OsStatus>) {
        self.state.lock().default_failure = status;
    }

    /// Make every following listener removal fail with `status`. The listener stays
    /// registered and keeps firing, like a HAL that refused the removal.
    pub fn fail_listener_removal(&self, status: Option<OsStatus>) {
        self.state.lock().remove_listener_failure = status;
    }

    fn notify(&self, object: AudioObjectId, selector: u32) {
        // Collected first so listeners can call back into the HAL.
        let listeners: Vec<PropertyListener> = self
            .state
            .lock()
            .listeners
            .values()
            .filter(|l| l.object == object && l.selector == selector)
            .map(|l| l.listener.clone())
            .collect();
        for l in listeners {
            l();
        }
    }
}

fn find_uid(st: &SimState, uid: &str) -> Option<AudioObjectId> {
    st.objects
        .iter()
        .find(|(_, o)| o.device.uid.as_deref() == Some(uid))
        .map(|(id, _)| *id)
}

/// Remove an object, moving the default output elsewhere if needed.
/// Returns true when the default output changed.
fn remove_object(st: &mut SimState, id: AudioObjectId) -> bool {
    st.objects.remove(&id);
    if st.default_output != id {
        return false;
    }
    st.default_output = st
        .objects
        .iter()
        .find(|(_, o)| o.aggregate.is_none() && !o.device.output_channels.is_empty())
        .map(|(id, _)| *id)
        .unwrap_or(UNKNOWN_OBJECT);
    true
}

fn unknown() -> HalError {
    HalError::PropertyOperationFailed(status::UNKNOWN_PROPERTY)
}

fn bad_object() -> HalError {
    HalError::PropertyOperationFailed(status::BAD_OBJECT)
}

impl AudioHardware for SimulatedHardware {
    fn get_property(
        &self,
        object: AudioObjectId,
        address: &PropertyAddress,
        kind: ValueKind,
    ) -> Result<PropertyValue, HalError> {
        let st = self.state.lock();
        let value = if object == SYSTEM_OBJECT {
            match address.selector {
                selector::DEVICES => PropertyValue::ObjectList(st.objects.keys().copied().collect()),
                selector::DEFAULT_OUTPUT_DEVICE => PropertyValue::U32(st.default_output),
                _ => return Err(unknown()),
            }
        } else {
            let obj = st.objects.get(&object).ok_or_else(bad_object)?;
            let dev = &obj.device;
            match (address.selector, address.scope) {
                (selector::DEVICE_UID, _) => {
                    PropertyValue::String(dev.uid.clone().ok_or_else(unknown)?)
                }
                (selector::NAME, _) => PropertyValue::String(dev.name.clone()),
                (selector::STREAM_CONFIGURATION, Scope::Output) => {
                    PropertyValue::ChannelLayout(dev.output_channels.clone())
                }
                (selector::STREAM_CONFIGURATION, _) => PropertyValue::ChannelLayout(Vec::new()),
                (selector::VOLUME_SCALAR, Scope::Output) => dev
                    .volume_elements
                    .iter()
                    .find(|(e, _)| *e == address.element)
                    .map(|(_, v)| PropertyValue::F32(*v))
                    .ok_or_else(unknown)?,
                _ => return Err(unknown()),
            }
        };
        if value.kind() != kind {
            return Err(HalError::PropertyOperationFailed(status::BAD_PROPERTY_SIZE));
        }
        Ok(value)
    }

    fn set_property(
        &self,
        object: AudioObjectId,
        address: &PropertyAddress,
        value: &PropertyValue,
    ) -> Result<(), HalError> {
        let mut default_changed = false;
        {
            let mut st = self.state.lock();
            if object == SYSTEM_OBJECT {
                match (address.selector, value) {
                    (selector::DEFAULT_OUTPUT_DEVICE, PropertyValue::U32(id)) => {
                        if let Some(s) = st.default_failure {
                            return Err(HalError::PropertyOperationFailed(s));
                        }
                        let target = st.objects.get(id).ok_or_else(bad_object)?;
                        if target.device.output_channels.is_empty() {
                            return Err(HalError::PropertyOperationFailed(
                                status::ILLEGAL_OPERATION,
                            ));
                        }
                        default_changed = st.default_output != *id;
                        st.default_output = *id;
                    }
                    (selector::DEFAULT_OUTPUT_DEVICE, _) => {
                        return Err(HalError::PropertyOperationFailed(
                            status::BAD_PROPERTY_SIZE,
                        ));
                    }
                    _ => return Err(unknown()),
                }
            } else {
                let obj = st.objects.get_mut(&object).ok_or_else(bad_object)?;
                match (address.selector, address.scope, value) {
                    (selector::VOLUME_SCALAR, Scope::Output, PropertyValue::F32(level)) => {
                        let slot = obj
                            .device
                            .volume_elements
                            .iter_mut()
                            .find(|(e, _)| *e == address.element)
                            .ok_or_else(unknown)?;
                        slot.1 = level.clamp(0.0, 1.0);
                    }
                    (selector::VOLUME_SCALAR, Scope::Output, _) => {
                        return Err(HalError::PropertyOperationFailed(
                            status::BAD_PROPERTY_SIZE,
                        ));
                    }
                    _ => return Err(unknown()),
                }
            }
        }
        if default_changed {
            self.notify(SYSTEM_OBJECT, selector::DEFAULT_OUTPUT_DEVICE);
        }
        Ok(())
    }

    fn create_aggregate(
        &self,
        description: &AggregateDescription,
    ) -> Result<AudioObjectId, HalError> {
        let id = {
            let mut st = self.state.lock();
            if let Some(s) = st.create_failure {
                return Err(HalError::AggregateCreationFailed(s));
            }
            if find_uid(&st, &description.uid).is_some() {
                return Err(HalError::AggregateCreationFailed(status::ILLEGAL_OPERATION));
            }
            let mut channels = 0;
            for sub in &description.sub_devices {
                let sub_id = find_uid(&st, &sub.uid)
                    .ok_or(HalError::AggregateCreationFailed(status::BAD_OBJECT))?;
                channels = channels.max(st.objects[&sub_id].device.output_channels.iter().sum::<u32>());
            }
            let id = st.next_id;
            st.next_id += 1;
            st.objects.insert(
                id,
                SimObject {
                    device: SimDevice {
                        uid: Some(description.uid.clone()),
                        name: description.name.clone(),
                        output_channels: vec![channels],
                        // Multi-output devices have no volume control of their own.
                        volume_elements: Vec::new(),
                    },
                    aggregate: Some(description.clone()),
                },
            );
            id
        };
        self.notify(SYSTEM_OBJECT, selector::DEVICES);
        Ok(id)
    }

    fn destroy_aggregate(&self, device: AudioObjectId) -> Result<(), HalError> {
        let default_changed = {
            let mut st = self.state.lock();
            let is_aggregate = st.objects.get(&device).map(|o| o.aggregate.is_some());
            match is_aggregate {
                Some(true) => remove_object(&mut st, device),
                Some(false) => {
                    return Err(HalError::PropertyOperationFailed(
                        status::ILLEGAL_OPERATION,
                    ));
                }
                None => return Err(bad_object()),
            }
        };
        self.notify(SYSTEM_OBJECT, selector::DEVICES);
        if default_changed {
            self.notify(SYSTEM_OBJECT, selector::DEFAULT_OUTPUT_DEVICE);
        }
        Ok(())
    }

    fn add_listener(
        &self,
        object: AudioObjectId,
        address: &PropertyAddress,
        listener: PropertyListener,
    ) -> Result<ListenerId, HalError> {
        let mut st = self.state.lock();
        if object != SYSTEM_OBJECT && !st.objects.contains_key(&object) {
            return Err(bad_object());
        }
        let id = st.next_listener;
        st.next_listener += 1;
        st.listeners.insert(
            id,
            ListenerEntry {
                object,
                selector: address.selector,
                listener,
            },
        );
        Ok(id)
    }

    fn remove_listener(&self, id: ListenerId) -> Result<(), HalError> {
        let mut st = self.state.lock();
        if let Some(status) = st.remove_listener_failure {
            return Err(HalError::PropertyOperationFailed(status));
        }
        st.listeners
            .remove(&id)
            .map(|_| ())
            .ok_or(HalError::PropertyOperationFailed(status::ILLEGAL_OPERATION))
    }
}
