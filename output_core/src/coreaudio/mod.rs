//! CoreAudio HAL backend.
//!
//! Implements [`AudioHardware`] on top of the `AudioObject*` property API.
//! Values are decoded according to the [`ValueKind`] the caller asks for; the
//! HAL itself is untyped and only checks sizes.

mod aggregate;
mod listener;

use std::ffi::c_void;
use std::mem;
use std::ptr;

use core_foundation::base::TCFType;
use core_foundation::string::{CFString, CFStringRef};
use coreaudio_sys::{
    AudioBuffer, AudioBufferList, AudioObjectGetPropertyData, AudioObjectGetPropertyDataSize,
    AudioObjectID, AudioObjectPropertyAddress, AudioObjectSetPropertyData,
};

use crate::error::HalError;
use crate::hal::{
    AggregateDescription, AudioHardware, AudioObjectId, ListenerId, OsStatus, PropertyAddress,
    PropertyListener, PropertyValue, ValueKind, status,
};

use listener::ListenerRegistry;

/// The system's audio hardware, as seen through CoreAudio.
#[derive(Default)]
pub struct CoreAudioHardware {
    listeners: ListenerRegistry,
}

impl CoreAudioHardware {
    pub fn new() -> Self {
        Self::default()
    }
}

fn raw_address(address: &PropertyAddress) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: address.selector,
        mScope: address.scope.code(),
        mElement: address.element,
    }
}

fn check(status: OsStatus) -> Result<(), HalError> {
    if status == status::OK {
        Ok(())
    } else {
        Err(HalError::PropertyOperationFailed(status))
    }
}

/// Read a fixed-size plain value.
fn read_plain<T: Copy + Default>(
    object: AudioObjectId,
    address: &AudioObjectPropertyAddress,
) -> Result<T, HalError> {
    let mut value = T::default();
    let mut size = mem::size_of::<T>() as u32;
    let status = unsafe {
        AudioObjectGetPropertyData(
            object as AudioObjectID,
            address,
            0,
            ptr::null(),
            &mut size,
            &mut value as *mut T as *mut c_void,
        )
    };
    check(status)?;
    if size as usize != mem::size_of::<T>() {
        return Err(HalError::PropertyOperationFailed(status::BAD_PROPERTY_SIZE));
    }
    Ok(value)
}

fn write_plain<T: Copy>(
    object: AudioObjectId,
    address: &AudioObjectPropertyAddress,
    value: T,
) -> Result<(), HalError> {
    let status = unsafe {
        AudioObjectSetPropertyData(
            object as AudioObjectID,
            address,
            0,
            ptr::null(),
            mem::size_of::<T>() as u32,
            &value as *const T as *const c_void,
        )
    };
    check(status)
}

fn data_size(object: AudioObjectId, address: &AudioObjectPropertyAddress) -> Result<u32, HalError> {
    let mut size = 0u32;
    let status = unsafe {
        AudioObjectGetPropertyDataSize(object as AudioObjectID, address, 0, ptr::null(), &mut size)
    };
    check(status)?;
    Ok(size)
}

fn read_string(
    object: AudioObjectId,
    address: &AudioObjectPropertyAddress,
) -> Result<String, HalError> {
    let mut string_ref: CFStringRef = ptr::null();
    let mut size = mem::size_of::<CFStringRef>() as u32;
    let status = unsafe {
        AudioObjectGetPropertyData(
            object as AudioObjectID,
            address,
            0,
            ptr::null(),
            &mut size,
            &mut string_ref as *mut CFStringRef as *mut c_void,
        )
    };
    check(status)?;
    if string_ref.is_null() {
        return Err(HalError::PropertyOperationFailed(status::UNKNOWN_PROPERTY));
    }
    // String properties are returned retained; the wrapper releases on drop.
    let string = unsafe { CFString::wrap_under_create_rule(string_ref) };
    Ok(string.to_string())
}

fn read_object_list(
    object: AudioObjectId,
    address: &AudioObjectPropertyAddress,
) -> Result<Vec<AudioObjectId>, HalError> {
    let size = data_size(object, address)?;
    let count = size as usize / mem::size_of::<AudioObjectID>();
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut ids: Vec<AudioObjectID> = vec![0; count];
    let mut size = (count * mem::size_of::<AudioObjectID>()) as u32;
    let status = unsafe {
        AudioObjectGetPropertyData(
            object as AudioObjectID,
            address,
            0,
            ptr::null(),
            &mut size,
            ids.as_mut_ptr() as *mut c_void,
        )
    };
    check(status)?;
    // The list can shrink between the two calls.
    ids.truncate(size as usize / mem::size_of::<AudioObjectID>());
    Ok(ids.into_iter().map(|id| id as AudioObjectId).collect())
}

/// Decode a stream configuration (an `AudioBufferList`) into per-stream channel counts.
fn read_channel_layout(
    object: AudioObjectId,
    address: &AudioObjectPropertyAddress,
) -> Result<Vec<u32>, HalError> {
    let size = data_size(object, address)?;
    if (size as usize) < mem::size_of::<u32>() {
        return Ok(Vec::new());
    }
    // u64 storage keeps the buffer list suitably aligned.
    let mut storage: Vec<u64> = vec![0; (size as usize).div_ceil(mem::size_of::<u64>())];
    let mut size = size;
    let status = unsafe {
        AudioObjectGetPropertyData(
            object as AudioObjectID,
            address,
            0,
            ptr::null(),
            &mut size,
            storage.as_mut_ptr() as *mut c_void,
        )
    };
    check(status)?;

    let base = storage.as_ptr() as *const u8;
    let header = mem::offset_of!(AudioBufferList, mBuffers);
    let declared = unsafe { (*(base as *const AudioBufferList)).mNumberBuffers } as usize;
    let fits = (size as usize).saturating_sub(header) / mem::size_of::<AudioBuffer>();
    let count = declared.min(fits);
    let buffers = unsafe {
        std::slice::from_raw_parts(base.add(header) as *const AudioBuffer, count)
    };
    Ok(buffers.iter().map(|b| b.mNumberChannels).collect())
}

impl AudioHardware for CoreAudioHardware {
    fn get_property(
        &self,
        object: AudioObjectId,
        address: &PropertyAddress,
        kind: ValueKind,
    ) -> Result<PropertyValue, HalError> {
        let raw = raw_address(address);
        let value = match kind {
            ValueKind::U32 => PropertyValue::U32(read_plain::<u32>(object, &raw)?),
            ValueKind::F32 => PropertyValue::F32(read_plain::<f32>(object, &raw)?),
            ValueKind::F64 => PropertyValue::F64(read_plain::<f64>(object, &raw)?),
            ValueKind::String => PropertyValue::String(read_string(object, &raw)?),
            ValueKind::ObjectList => PropertyValue::ObjectList(read_object_list(object, &raw)?),
            ValueKind::ChannelLayout => {
                PropertyValue::ChannelLayout(read_channel_layout(object, &raw)?)
            }
        };
        Ok(value)
    }

    fn set_property(
        &self,
        object: AudioObjectId,
        address: &PropertyAddress,
        value: &PropertyValue,
    ) -> Result<(), HalError> {
        let raw = raw_address(address);
        match value {
            PropertyValue::U32(v) => write_plain(object, &raw, *v),
            PropertyValue::F32(v) => write_plain(object, &raw, *v),
            PropertyValue::F64(v) => write_plain(object, &raw, *v),
            PropertyValue::String(s) => {
                let string = CFString::new(s);
                write_plain(object, &raw, string.as_concrete_TypeRef())
            }
            PropertyValue::ObjectList(_) | PropertyValue::ChannelLayout(_) => Err(
                HalError::PropertyOperationFailed(status::UNSUPPORTED_OPERATION),
            ),
        }
    }

    fn create_aggregate(
        &self,
        description: &AggregateDescription,
    ) -> Result<AudioObjectId, HalError> {
        aggregate::create(description)
    }

    fn destroy_aggregate(&self, device: AudioObjectId) -> Result<(), HalError> {
        aggregate::destroy(device)
    }

    fn add_listener(
        &self,
        object: AudioObjectId,
        address: &PropertyAddress,
        listener: PropertyListener,
    ) -> Result<ListenerId, HalError> {
        self.listeners.add(object, raw_address(address), listener)
    }

    fn remove_listener(&self, id: ListenerId) -> Result<(), HalError> {
        self.listeners.remove(id)
    }
}
