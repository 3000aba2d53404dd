// Gestion des devices MIDI - Local mirror of the platform's port list

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortState {
    /// Present on the system, not opened by us
    Available,
    /// Opened by us
    Open,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MidiDevice {
    /// Stable within a session: direction plus port name
    pub id: String,
    pub name: String,
    pub manufacturer: Option<String>,
    pub direction: PortDirection,
    pub state: PortState,
}

impl MidiDevice {
    pub fn new(name: impl Into<String>, direction: PortDirection) -> Self {
        let name = name.into();
        Self {
            id: device_id(&name, direction),
            manufacturer: manufacturer_from_name(&name),
            name,
            direction,
            state: PortState::Available,
        }
    }
}

pub fn device_id(name: &str, direction: PortDirection) -> String {
    match direction {
        PortDirection::Input => format!("in:{}", name),
        PortDirection::Output => format!("out:{}", name),
    }
}

/// midir exposes only the port name; most drivers prefix it with the vendor
/// ("Roland A-49", "Arturia KeyStep 37:Arturia KeyStep 37 MIDI 1 20:0").
fn manufacturer_from_name(name: &str) -> Option<String> {
    let first = name.split([' ', ':']).next()?.trim();
    if first.is_empty() || first.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(first.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "kebab-case")]
pub enum DeviceChange {
    Connected(MidiDevice),
    Disconnected(MidiDevice),
}

impl DeviceChange {
    pub fn device(&self) -> &MidiDevice {
        match self {
            DeviceChange::Connected(device) | DeviceChange::Disconnected(device) => device,
        }
    }
}

/// Registry of known ports
///
/// Fed with full enumeration snapshots; the diff against the previous
/// snapshot becomes the hot-plug notifications.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, MidiDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the known port set, returning what appeared and disappeared
    pub fn sync(&mut self, snapshot: Vec<MidiDevice>) -> Vec<DeviceChange> {
        let mut changes = Vec::new();
        let mut seen = BTreeMap::new();

        for device in snapshot {
            if seen.contains_key(&device.id) {
                // Two ports with the same name: keep the first
                continue;
            }
            match self.devices.get(&device.id) {
                Some(known) if known.state != PortState::Disconnected => {
                    seen.insert(device.id.clone(), known.clone());
                }
                _ => {
                    changes.push(DeviceChange::Connected(device.clone()));
                    seen.insert(device.id.clone(), device);
                }
            }
        }

        for (id, mut device) in std::mem::take(&mut self.devices) {
            if !seen.contains_key(&id) && device.state != PortState::Disconnected {
                device.state = PortState::Disconnected;
                changes.push(DeviceChange::Disconnected(device));
            }
        }

        self.devices = seen;
        changes
    }

    pub fn set_state(&mut self, id: &str, state: PortState) -> bool {
        match self.devices.get_mut(id) {
            Some(device) => {
                device.state = state;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&MidiDevice> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> Vec<MidiDevice> {
        self.devices.values().cloned().collect()
    }

    pub fn inputs(&self) -> impl Iterator<Item = &MidiDevice> {
        self.devices
            .values()
            .filter(|d| d.direction == PortDirection::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &MidiDevice> {
        self.devices
            .values()
            .filter(|d| d.direction == PortDirection::Output)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str) -> MidiDevice {
        MidiDevice::new(name, PortDirection::Input)
    }

    #[test]
    fn test_initial_sync_reports_everything() {
        let mut registry = DeviceRegistry::new();
        let changes = registry.sync(vec![input("Keystep"), MidiDevice::new("Synth", PortDirection::Output)]);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| matches!(c, DeviceChange::Connected(_))));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.inputs().count(), 1);
        assert_eq!(registry.outputs().count(), 1);
    }

    #[test]
    fn test_unchanged_snapshot_is_quiet() {
        let mut registry = DeviceRegistry::new();
        registry.sync(vec![input("Keystep")]);
        assert!(registry.sync(vec![input("Keystep")]).is_empty());
    }

    #[test]
    fn test_hot_plug_and_unplug() {
        let mut registry = DeviceRegistry::new();
        registry.sync(vec![input("Keystep")]);

        let changes = registry.sync(vec![input("Keystep"), input("Launchkey")]);
        assert_eq!(changes, vec![DeviceChange::Connected(input("Launchkey"))]);

        let changes = registry.sync(vec![input("Launchkey")]);
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            DeviceChange::Disconnected(device) => {
                assert_eq!(device.name, "Keystep");
                assert_eq!(device.state, PortState::Disconnected);
            }
            other => panic!("unexpected change {:?}", other),
        }
        assert!(registry.get("in:Keystep").is_none());
    }

    #[test]
    fn test_open_state_survives_resync() {
        let mut registry = DeviceRegistry::new();
        registry.sync(vec![input("Keystep")]);
        assert!(registry.set_state("in:Keystep", PortState::Open));
        registry.sync(vec![input("Keystep")]);
        assert_eq!(registry.get("in:Keystep").unwrap().state, PortState::Open);
        assert!(!registry.set_state("in:Nope", PortState::Open));
    }

    #[test]
    fn test_duplicate_names_collapse() {
        let mut registry = DeviceRegistry::new();
        let changes = registry.sync(vec![input("Dup"), input("Dup")]);
        assert_eq!(changes.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_manufacturer_guess() {
        assert_eq!(input("Roland A-49").manufacturer.as_deref(), Some("Roland"));
        assert_eq!(input("Arturia:KeyStep").manufacturer.as_deref(), Some("Arturia"));
        assert_eq!(input("14:0").manufacturer, None);
        assert_eq!(input("").manufacturer, None);
    }

    #[test]
    fn test_ids_depend_on_direction() {
        let a = MidiDevice::new("X", PortDirection::Input);
        let b = MidiDevice::new("X", PortDirection::Output);
        assert_ne!(a.id, b.id);
    }
}
