//! Audio device change watcher.
//!
//! Registers HAL listeners on the system device list and on the default
//! output pointer, and forwards each notification as a [`DeviceEvent`] through a
//! channel. The watcher never touches routing state itself: consumers are
//! expected to turn `Changed` into a refresh request on the control thread.

use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Weak};

use crate::hal::{
    AudioHardware, AudioObjectId, ListenerId, PropertyAddress, SYSTEM_OBJECT, selector,
};
use crate::property::PropertyAccessor;

/// Notification that the device list or the default output changed.
///
/// # Example
///
/// ```no_run
/// use output_core::device_watcher::{DeviceEvent, DeviceWatcher};
/// # fn demo(hw: std::sync::Arc<dyn output_core::hal::AudioHardware>) -> anyhow::Result<()> {
/// let (mut watcher, rx) = DeviceWatcher::start(hw)?;
/// if let Ok(evt) = rx.recv() {
///     match evt {
///         DeviceEvent::DefaultChanged(id) => println!("default output is now {:?}", id),
///         DeviceEvent::Changed => println!("device list changed"),
///     }
/// }
/// watcher.stop();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Devices were added or removed. Rescan to get details.
    Changed,
    /// The default output changed; carries the new default if it could be read.
    DefaultChanged(Option<AudioObjectId>),
}

/// Handle for the device watcher. Drop it or call `stop()` to unregister the listeners.
pub struct DeviceWatcher {
    hardware: Arc<dyn AudioHardware>,
    listeners: Vec<ListenerId>,
}

impl DeviceWatcher {
    /// Register the listeners and return the watcher handle with the event receiver.
    ///
    /// An initial `DefaultChanged` event carrying the current default output is sent
    /// right away so consumers can start from a known state.
    ///
    /// # Errors
    /// Returns an error if a listener cannot be registered. Listeners registered
    /// before the failure are removed again.
    pub fn start(hardware: Arc<dyn AudioHardware>) -> Result<(DeviceWatcher, Receiver<DeviceEvent>)> {
        let (event_tx, event_rx) = mpsc::channel::<DeviceEvent>();
        let mut watcher = DeviceWatcher {
            hardware: hardware.clone(),
            listeners: Vec::new(),
        };

        let tx = event_tx.clone();
        let id = hardware
            .add_listener(
                SYSTEM_OBJECT,
                &PropertyAddress::global(selector::DEVICES),
                Arc::new(move || {
                    let _ = tx.send(DeviceEvent::Changed);
                }),
            )
            .context("registering device list listener")?;
        watcher.listeners.push(id);

        // The listener must not keep the hardware alive: the hardware owns it.
        let weak = Arc::downgrade(&hardware);
        let tx = event_tx.clone();
        let id = hardware
            .add_listener(
                SYSTEM_OBJECT,
                &PropertyAddress::global(selector::DEFAULT_OUTPUT_DEVICE),
                Arc::new(move || {
                    let _ = tx.send(DeviceEvent::DefaultChanged(current_default(&weak)));
                }),
            )
            .context("registering default output listener")?;
        watcher.listeners.push(id);

        let _ = event_tx.send(DeviceEvent::DefaultChanged(read_default(hardware)));

        Ok((watcher, event_rx))
    }

    /// Unregister every listener. No events are sent afterwards.
    ///
    /// Returns `false` when the HAL refused to remove a listener. That listener
    /// keeps its sender, so the event channel stays open and a thread draining it
    /// (see [`forward_events`]) will not finish on its own.
    ///
    /// # Note
    /// This method is idempotent and safe to call multiple times.
    pub fn stop(&mut self) -> bool {
        let mut clean = true;
        for id in self.listeners.drain(..) {
            if let Err(e) = self.hardware.remove_listener(id) {
                log::warn!("removing device listener {} failed: {}", id, e);
                clean = false;
            }
        }
        clean
    }

    pub fn is_running(&self) -> bool {
        !self.listeners.is_empty()
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn current_default(hardware: &Weak<dyn AudioHardware>) -> Option<AudioObjectId> {
    read_default(hardware.upgrade()?)
}

fn read_default(hardware: Arc<dyn AudioHardware>) -> Option<AudioObjectId> {
    PropertyAccessor::new(hardware)
        .get_global(SYSTEM_OBJECT, selector::DEFAULT_OUTPUT_DEVICE)
        .ok()
}

/// Forward watcher events to `on_change` on a plain thread until the watcher is
/// stopped and its channel closes.
pub fn forward_events<F>(rx: Receiver<DeviceEvent>, on_change: F) -> Result<std::thread::JoinHandle<()>>
where
    F: Fn(DeviceEvent) + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name("device-events".to_string())
        .spawn(move || {
            while let Ok(evt) = rx.recv() {
                log::debug!("device event: {:?}", evt);
                on_change(evt);
            }
        })?;
    Ok(handle)
}
