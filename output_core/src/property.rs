//! Typed property access on top of the raw HAL seam.
//!
//! [`PropertyAccessor::get`] and [`PropertyAccessor::set`] address a property by
//! selector, scope and element; the `_global` variants fill in global scope and the
//! main element for callers that don't need per-channel addressing. Failures are
//! returned as they come, the caller decides whether they matter.

use std::sync::Arc;

use crate::error::HalError;
use crate::hal::{
    AudioHardware, AudioObjectId, PropertyAddress, PropertyValue, Scope, ValueKind, element,
    status,
};

/// Handles of HAL objects, e.g. the system's device list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectList(pub Vec<AudioObjectId>);

/// Channel count of every stream in one scope of a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelLayout(pub Vec<u32>);

impl ChannelLayout {
    pub fn total_channels(&self) -> u32 {
        self.0.iter().sum()
    }
}

/// A Rust type that can be read from or written to a HAL property.
pub trait PropertyType: Sized {
    const KIND: ValueKind;

    fn from_value(value: PropertyValue) -> Option<Self>;

    fn into_value(self) -> PropertyValue;
}

macro_rules! scalar_property {
    ($ty:ty, $variant:ident) => {
        impl PropertyType for $ty {
            const KIND: ValueKind = ValueKind::$variant;

            fn from_value(value: PropertyValue) -> Option<Self> {
                match value {
                    PropertyValue::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn into_value(self) -> PropertyValue {
                PropertyValue::$variant(self)
            }
        }
    };
}

scalar_property!(u32, U32);
scalar_property!(f32, F32);
scalar_property!(f64, F64);
scalar_property!(String, String);

impl PropertyType for ObjectList {
    const KIND: ValueKind = ValueKind::ObjectList;

    fn from_value(value: PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::ObjectList(v) => Some(ObjectList(v)),
            _ => None,
        }
    }

    fn into_value(self) -> PropertyValue {
        PropertyValue::ObjectList(self.0)
    }
}

impl PropertyType for ChannelLayout {
    const KIND: ValueKind = ValueKind::ChannelLayout;

    fn from_value(value: PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::ChannelLayout(v) => Some(ChannelLayout(v)),
            _ => None,
        }
    }

    fn into_value(self) -> PropertyValue {
        PropertyValue::ChannelLayout(self.0)
    }
}

#[derive(Clone)]
pub struct PropertyAccessor {
    hardware: Arc<dyn AudioHardware>,
}

impl PropertyAccessor {
    pub fn new(hardware: Arc<dyn AudioHardware>) -> Self {
        Self { hardware }
    }

    pub fn hardware(&self) -> &Arc<dyn AudioHardware> {
        &self.hardware
    }

    /// Read a property. A value of an unexpected shape is reported as
    /// `PropertyOperationFailed(BAD_PROPERTY_SIZE)`.
    pub fn get<T: PropertyType>(
        &self,
        object: AudioObjectId,
        selector: u32,
        scope: Scope,
        element: u32,
    ) -> Result<T, HalError> {
        let address = PropertyAddress::new(selector, scope, element);
        let value = self.hardware.get_property(object, &address, T::KIND)?;
        T::from_value(value).ok_or(HalError::PropertyOperationFailed(
            status::BAD_PROPERTY_SIZE,
        ))
    }

    pub fn set<T: PropertyType>(
        &self,
        object: AudioObjectId,
        selector: u32,
        scope: Scope,
        element: u32,
        value: T,
    ) -> Result<(), HalError> {
        let address = PropertyAddress::new(selector, scope, element);
        self.hardware
            .set_property(object, &address, &value.into_value())
    }

    pub fn get_global<T: PropertyType>(
        &self,
        object: AudioObjectId,
        selector: u32,
    ) -> Result<T, HalError> {
        self.get(object, selector, Scope::Global, element::MAIN)
    }

    pub fn set_global<T: PropertyType>(
        &self,
        object: AudioObjectId,
        selector: u32,
        value: T,
    ) -> Result<(), HalError> {
        self.set(object, selector, Scope::Global, element::MAIN, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{SYSTEM_OBJECT, selector};
    use crate::sim::{SimDevice, SimulatedHardware};

    fn accessor() -> (Arc<SimulatedHardware>, PropertyAccessor) {
        let hw = Arc::new(SimulatedHardware::new());
        let props = PropertyAccessor::new(hw.clone());
        (hw, props)
    }

    #[test]
    fn reads_strings_and_lists() {
        let (hw, props) = accessor();
        let id = hw.add_device(SimDevice::output("spk-1", "Desk Speakers"));

        let uid: String = props.get_global(id, selector::DEVICE_UID).unwrap();
        assert_eq!(uid, "spk-1");

        let devices: ObjectList = props.get_global(SYSTEM_OBJECT, selector::DEVICES).unwrap();
        assert_eq!(devices.0, vec![id]);

        let layout: ChannelLayout = props
            .get(id, selector::STREAM_CONFIGURATION, Scope::Output, element::MAIN)
            .unwrap();
        assert_eq!(layout.total_channels(), 2);
    }

    #[test]
    fn wrong_kind_is_a_size_error() {
        let (hw, props) = accessor();
        hw.add_device(SimDevice::output("spk-1", "Desk Speakers"));
        let res: Result<String, _> =
            props.get_global(SYSTEM_OBJECT, selector::DEFAULT_OUTPUT_DEVICE);
        assert_eq!(
            res,
            Err(HalError::PropertyOperationFailed(status::BAD_PROPERTY_SIZE))
        );
    }

    #[test]
    fn missing_element_surfaces_status() {
        let (hw, props) = accessor();
        let id = hw.add_device(SimDevice::output("spk-1", "Desk Speakers"));
        let err = props
            .set(id, selector::VOLUME_SCALAR, Scope::Output, element::LEFT, 0.3f32)
            .unwrap_err();
        assert_eq!(err, HalError::PropertyOperationFailed(status::UNKNOWN_PROPERTY));

        props
            .set(id, selector::VOLUME_SCALAR, Scope::Output, element::MAIN, 0.3f32)
            .unwrap();
        let level: f32 = props
            .get(id, selector::VOLUME_SCALAR, Scope::Output, element::MAIN)
            .unwrap();
        assert!((level - 0.3).abs() < f32::EPSILON);
    }
}
