use output_core::{OutputSnapshot, OutputState};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Serialize)]
pub struct DeviceRow {
    pub index: usize,
    pub uid: String,
    pub name: String,
    pub selected: bool,
    pub volume: Option<f32>,
}

impl fmt::Display for DeviceRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.selected { "x" } else { " " };
        let volume = match self.volume {
            Some(v) => format!("{:>3.0}%", v * 100.0),
            None => "   -".to_string(),
        };
        write!(f, "{:>2}. [{}] {} {} ({})", self.index, mark, volume, self.name, self.uid)
    }
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub state: OutputState,
    pub is_sharing: bool,
    pub selected: Vec<String>,
    pub virtual_device: Option<String>,
    pub last_error: Option<String>,
    pub devices: Vec<DeviceRow>,
}

impl StatusView {
    pub fn from_snapshot(snapshot: &OutputSnapshot) -> Self {
        let devices = snapshot
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| DeviceRow {
                index: i + 1,
                uid: d.uid.clone(),
                name: d.name.clone(),
                selected: snapshot.selection.iter().any(|s| s.uid == d.uid),
                volume: snapshot.volumes.get(&d.uid).copied(),
            })
            .collect();
        Self {
            state: snapshot.state,
            is_sharing: snapshot.is_sharing,
            selected: snapshot.selection.iter().map(|d| d.name.clone()).collect(),
            virtual_device: snapshot.virtual_device.as_ref().map(|v| v.uid.clone()),
            last_error: snapshot.last_error.clone(),
            devices,
        }
    }
}

impl fmt::Display for StatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            OutputState::Idle => "idle",
            OutputState::SingleDeviceActive => "single device",
            OutputState::MultiDeviceActive => "multi-output",
        };
        write!(f, "state: {}", state)?;
        if !self.selected.is_empty() {
            write!(f, "\nplaying on: {}", self.selected.join(", "))?;
        }
        if let Some(uid) = &self.virtual_device {
            write!(f, "\nvirtual device: {}", uid)?;
        }
        if let Some(err) = &self.last_error {
            write!(f, "\nlast error: {}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use output_core::Device;

    #[test]
    fn marks_selected_devices() {
        let a = Device {
            id: 1,
            uid: "a".to_string(),
            name: "Speakers".to_string(),
            is_output: true,
        };
        let b = Device {
            id: 2,
            uid: "b".to_string(),
            name: "Headphones".to_string(),
            is_output: true,
        };
        let snapshot = OutputSnapshot {
            devices: vec![a.clone(), b],
            selection: vec![a],
            volumes: [("a".to_string(), 0.7)].into_iter().collect(),
            is_sharing: true,
            state: OutputState::SingleDeviceActive,
            ..OutputSnapshot::default()
        };
        let view = StatusView::from_snapshot(&snapshot);
        assert_eq!(view.devices[0].to_string(), " 1. [x]  70% Speakers (a)");
        assert_eq!(view.devices[1].to_string(), " 2. [ ]    - Headphones (b)");
        assert_eq!(view.to_string(), "state: single device\nplaying on: Speakers");
    }
}
