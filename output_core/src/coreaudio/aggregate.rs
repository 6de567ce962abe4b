//! Aggregate device creation through `AudioHardwareCreateAggregateDevice`.

use core_foundation::array::CFArray;
use core_foundation::base::{CFType, TCFType};
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use coreaudio_sys::{AudioHardwareCreateAggregateDevice, AudioHardwareDestroyAggregateDevice, AudioObjectID};

use crate::error::HalError;
use crate::hal::{AggregateDescription, AggregateMode, AudioObjectId, status};

const NAME_KEY: &str = "name";
const UID_KEY: &str = "uid";
const SUB_DEVICE_LIST_KEY: &str = "subdevices";
const MAIN_SUB_DEVICE_KEY: &str = "master";
const IS_STACKED_KEY: &str = "stacked";
const IS_PRIVATE_KEY: &str = "private";

const SUB_DEVICE_UID_KEY: &str = "uid";
const SUB_DEVICE_DRIFT_KEY: &str = "drift";

/// Value of the `stacked` key. A multi-output device is what the HAL calls a
/// stacked aggregate: each sub-device receives the same output streams.
pub(super) fn stacked_flag(mode: AggregateMode) -> i32 {
    match mode {
        AggregateMode::Mirrored => 1,
        AggregateMode::Stacked => 0,
    }
}

fn pair(key: &str, value: CFType) -> (CFType, CFType) {
    (CFString::new(key).as_CFType(), value)
}

fn flag(value: bool) -> CFType {
    CFNumber::from(value as i32).as_CFType()
}

pub(super) fn description_dict(description: &AggregateDescription) -> CFDictionary<CFType, CFType> {
    let sub_devices: Vec<CFDictionary<CFType, CFType>> = description
        .sub_devices
        .iter()
        .map(|sub| {
            CFDictionary::from_CFType_pairs(&[
                pair(SUB_DEVICE_UID_KEY, CFString::new(&sub.uid).as_CFType()),
                pair(SUB_DEVICE_DRIFT_KEY, flag(sub.drift_compensation)),
            ])
        })
        .collect();
    let sub_devices = CFArray::from_CFTypes(&sub_devices);

    CFDictionary::from_CFType_pairs(&[
        pair(NAME_KEY, CFString::new(&description.name).as_CFType()),
        pair(UID_KEY, CFString::new(&description.uid).as_CFType()),
        pair(SUB_DEVICE_LIST_KEY, sub_devices.as_CFType()),
        pair(
            MAIN_SUB_DEVICE_KEY,
            CFString::new(&description.master_uid).as_CFType(),
        ),
        pair(
            IS_STACKED_KEY,
            CFNumber::from(stacked_flag(description.mode)).as_CFType(),
        ),
        pair(IS_PRIVATE_KEY, flag(description.private)),
    ])
}

pub(super) fn create(description: &AggregateDescription) -> Result<AudioObjectId, HalError> {
    let dict = description_dict(description);
    let mut id: AudioObjectID = 0;
    let status = unsafe {
        AudioHardwareCreateAggregateDevice(
            dict.as_concrete_TypeRef() as coreaudio_sys::CFDictionaryRef,
            &mut id,
        )
    };
    if status != status::OK {
        return Err(HalError::AggregateCreationFailed(status));
    }
    if id == 0 {
        return Err(HalError::AggregateCreationFailed(status::UNSPECIFIED));
    }
    Ok(id as AudioObjectId)
}

pub(super) fn destroy(device: AudioObjectId) -> Result<(), HalError> {
    let status = unsafe { AudioHardwareDestroyAggregateDevice(device as AudioObjectID) };
    if status != status::OK {
        return Err(HalError::PropertyOperationFailed(status));
    }
    Ok(())
}
