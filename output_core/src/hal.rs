//! The hardware abstraction seam.
//!
//! Everything above this module talks to the audio hardware only through the
//! [`AudioHardware`] trait: property reads and writes addressed by a
//! selector/scope/element triple, creation and destruction of aggregate devices,
//! and property change listeners. On macOS the trait is backed by CoreAudio
//! (`crate::coreaudio`); everywhere else, and in tests, by
//! [`SimulatedHardware`](crate::sim::SimulatedHardware).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::HalError;
use crate::utils::fourcc;

/// Transient numeric handle of a HAL object. Only valid until the next directory scan.
pub type AudioObjectId = u32;

pub type OsStatus = i32;

/// The system object, owner of the device list and the default-output pointer.
pub const SYSTEM_OBJECT: AudioObjectId = 1;

pub const UNKNOWN_OBJECT: AudioObjectId = 0;

/// Property selectors used by this crate.
pub mod selector {
    use super::fourcc;

    /// `kAudioHardwarePropertyDevices`
    pub const DEVICES: u32 = fourcc(b"dev#");
    /// `kAudioHardwarePropertyDefaultOutputDevice`
    pub const DEFAULT_OUTPUT_DEVICE: u32 = fourcc(b"dOut");
    /// `kAudioDevicePropertyDeviceUID`
    pub const DEVICE_UID: u32 = fourcc(b"uid ");
    /// `kAudioObjectPropertyName`
    pub const NAME: u32 = fourcc(b"lnam");
    /// `kAudioDevicePropertyStreamConfiguration`
    pub const STREAM_CONFIGURATION: u32 = fourcc(b"slay");
    /// `kAudioDevicePropertyVolumeScalar`
    pub const VOLUME_SCALAR: u32 = fourcc(b"volm");
}

/// HAL status codes this crate produces or reacts to.
pub mod status {
    use super::{OsStatus, fourcc};

    pub const OK: OsStatus = 0;
    pub const UNSPECIFIED: OsStatus = fourcc(b"what") as OsStatus;
    pub const UNKNOWN_PROPERTY: OsStatus = fourcc(b"who?") as OsStatus;
    pub const BAD_PROPERTY_SIZE: OsStatus = fourcc(b"!siz") as OsStatus;
    pub const ILLEGAL_OPERATION: OsStatus = fourcc(b"nope") as OsStatus;
    pub const BAD_OBJECT: OsStatus = fourcc(b"!obj") as OsStatus;
    pub const UNSUPPORTED_OPERATION: OsStatus = fourcc(b"unop") as OsStatus;
}

/// Property elements. `MAIN` addresses the object as a whole; channels start at 1.
pub mod element {
    pub const MAIN: u32 = 0;
    pub const LEFT: u32 = 1;
    pub const RIGHT: u32 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Scope {
    #[default]
    Global,
    Input,
    Output,
}

impl Scope {
    pub const fn code(self) -> u32 {
        match self {
            Scope::Global => fourcc(b"glob"),
            Scope::Input => fourcc(b"inpt"),
            Scope::Output => fourcc(b"outp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyAddress {
    pub selector: u32,
    pub scope: Scope,
    pub element: u32,
}

impl PropertyAddress {
    pub const fn new(selector: u32, scope: Scope, element: u32) -> Self {
        Self {
            selector,
            scope,
            element,
        }
    }

    /// Global scope, main element.
    pub const fn global(selector: u32) -> Self {
        Self::new(selector, Scope::Global, element::MAIN)
    }
}

/// Shape of a property value, requested by the reader so the backend knows how
/// to decode the raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    U32,
    F32,
    F64,
    String,
    ObjectList,
    ChannelLayout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    U32(u32),
    F32(f32),
    F64(f64),
    String(String),
    ObjectList(Vec<AudioObjectId>),
    /// Channel count of each stream, as decoded from a buffer-list property.
    ChannelLayout(Vec<u32>),
}

impl PropertyValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            PropertyValue::U32(_) => ValueKind::U32,
            PropertyValue::F32(_) => ValueKind::F32,
            PropertyValue::F64(_) => ValueKind::F64,
            PropertyValue::String(_) => ValueKind::String,
            PropertyValue::ObjectList(_) => ValueKind::ObjectList,
            PropertyValue::ChannelLayout(_) => ValueKind::ChannelLayout,
        }
    }
}

/// How an aggregate combines its sub-devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateMode {
    /// Every sub-device plays the same signal.
    Mirrored,
    /// Sub-device channels are concatenated into one wide device.
    Stacked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDeviceDescription {
    pub uid: String,
    pub drift_compensation: bool,
}

/// Everything the HAL needs to build an aggregate device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDescription {
    pub name: String,
    pub uid: String,
    pub sub_devices: Vec<SubDeviceDescription>,
    /// Clock source of the aggregate.
    pub master_uid: String,
    pub mode: AggregateMode,
    /// Private aggregates are only visible to the creating process.
    pub private: bool,
}

pub type PropertyListener = Arc<dyn Fn() + Send + Sync>;

pub type ListenerId = u64;

/// The operating system's audio hardware layer.
///
/// Implementations must be callable from any thread. None of the methods retry;
/// a non-success status is returned to the caller as is.
pub trait AudioHardware: Send + Sync {
    fn get_property(
        &self,
        object: AudioObjectId,
        address: &PropertyAddress,
        kind: ValueKind,
    ) -> Result<PropertyValue, HalError>;

    fn set_property(
        &self,
        object: AudioObjectId,
        address: &PropertyAddress,
        value: &PropertyValue,
    ) -> Result<(), HalError>;

    /// Build an aggregate device. Failures map to [`HalError::AggregateCreationFailed`].
    fn create_aggregate(&self, description: &AggregateDescription)
    -> Result<AudioObjectId, HalError>;

    fn destroy_aggregate(&self, device: AudioObjectId) -> Result<(), HalError>;

    /// Call `listener` whenever the property at `address` changes. The listener may
    /// run on a HAL notification thread and must not block.
    fn add_listener(
        &self,
        object: AudioObjectId,
        address: &PropertyAddress,
        listener: PropertyListener,
    ) -> Result<ListenerId, HalError>;

    fn remove_listener(&self, id: ListenerId) -> Result<(), HalError>;
}
