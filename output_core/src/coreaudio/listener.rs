//! Property listener registrations.
//!
//! CoreAudio takes a C callback plus an opaque pointer. Each registration owns a
//! boxed slot holding the Rust closure; the slot's address is the opaque pointer,
//! and it stays alive until the listener has been removed from the HAL.

use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};

use coreaudio_sys::{
    AudioObjectAddPropertyListener, AudioObjectID, AudioObjectPropertyAddress,
    AudioObjectRemovePropertyListener, OSStatus, UInt32,
};
use parking_lot::Mutex;

use crate::error::HalError;
use crate::hal::{AudioObjectId, ListenerId, PropertyListener, status};

struct Slot {
    listener: PropertyListener,
}

struct Registration {
    object: AudioObjectID,
    address: AudioObjectPropertyAddress,
    slot: Box<Slot>,
}

impl Registration {
    fn client_data(&self) -> *mut c_void {
        &*self.slot as *const Slot as *mut c_void
    }
}

pub(super) struct ListenerRegistry {
    next_id: AtomicU64,
    registrations: Mutex<HashMap<ListenerId, Registration>>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            registrations: Mutex::new(HashMap::new()),
        }
    }
}

unsafe extern "C" fn dispatch(
    _object: AudioObjectID,
    _count: UInt32,
    _addresses: *const AudioObjectPropertyAddress,
    client_data: *mut c_void,
) -> OSStatus {
    if client_data.is_null() {
        return status::OK;
    }
    let slot = unsafe { &*(client_data as *const Slot) };
    // Unwinding into the HAL's thread is undefined behaviour.
    if catch_unwind(AssertUnwindSafe(|| (slot.listener)())).is_err() {
        log::error!("property listener panicked");
    }
    status::OK
}

impl ListenerRegistry {
    pub(super) fn add(
        &self,
        object: AudioObjectId,
        address: AudioObjectPropertyAddress,
        listener: PropertyListener,
    ) -> Result<ListenerId, HalError> {
        let registration = Registration {
            object: object as AudioObjectID,
            address,
            slot: Box::new(Slot { listener }),
        };
        let status = unsafe {
            AudioObjectAddPropertyListener(
                registration.object,
                &registration.address,
                Some(dispatch),
                registration.client_data(),
            )
        };
        if status != status::OK {
            return Err(HalError::PropertyOperationFailed(status));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations.lock().insert(id, registration);
        Ok(id)
    }

    pub(super) fn remove(&self, id: ListenerId) -> Result<(), HalError> {
        let registration = self
            .registrations
            .lock()
            .remove(&id)
            .ok_or(HalError::PropertyOperationFailed(status::ILLEGAL_OPERATION))?;
        let status = unsafe {
            AudioObjectRemovePropertyListener(
                registration.object,
                &registration.address,
                Some(dispatch),
                registration.client_data(),
            )
        };
        if status != status::OK {
            // Still registered with the HAL: the slot must outlive it.
            log::warn!("listener {} could not be removed: {}", id, status);
            std::mem::forget(registration);
            return Err(HalError::PropertyOperationFailed(status));
        }
        Ok(())
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        let ids: Vec<ListenerId> = self.registrations.lock().keys().copied().collect();
        for id in ids {
            let _ = self.remove(id);
        }
    }
}
