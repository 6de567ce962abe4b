pub mod aggregate;
pub mod control_worker;
#[cfg(target_os = "macos")]
pub mod coreaudio;
pub mod device;
pub mod device_watcher;
pub mod error;
pub mod hal;
pub mod orchestrator;
pub mod property;
pub mod sim;
pub mod utils;
pub mod volume;

pub use aggregate::{VirtualDevice, VirtualOutputBuilder};
pub use control_worker::{ControlWorker, spawn_refresh_timer};
#[cfg(target_os = "macos")]
pub use coreaudio::CoreAudioHardware;
pub use device::{Device, DeviceDirectory};
pub use device_watcher::{DeviceEvent, DeviceWatcher};
pub use error::HalError;
pub use hal::{AudioHardware, AudioObjectId};
pub use orchestrator::{OrchestratorSettings, OutputOrchestrator, OutputSnapshot, OutputState};
pub use property::PropertyAccessor;
pub use sim::{SimDevice, SimulatedHardware};
pub use volume::{VolumeChannel, VolumeControl, VolumeTable};
