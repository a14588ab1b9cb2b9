// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The device registry answers "is this a device we know about?".  The
//! engine consults it while holding the graph, so lookups must never block
//! on I/O.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use protocol::types::DeviceId;
use protocol::types::IdentityKey;
use protocol::types::RegisteredDevice;

use crate::errors::TopodError;
use crate::normalize::canonical_key;
use crate::types::TopodResult;

pub trait Registry: Send + Sync {
    fn get(&self, id: &DeviceId) -> Option<RegisteredDevice>;

    /// Find the registered device carrying any of `keys`, trying them in
    /// order.
    fn lookup(&self, keys: &[IdentityKey]) -> Option<RegisteredDevice>;

    fn upsert(&self, device: RegisteredDevice) -> TopodResult<()>;

    fn remove(&self, id: &DeviceId) -> Option<RegisteredDevice>;

    fn list(&self) -> Vec<RegisteredDevice>;
}

/// A registry held entirely in memory, optionally seeded from a JSON file
/// containing an array of devices.
#[derive(Default)]
pub struct InMemoryRegistry {
    devices: Mutex<BTreeMap<DeviceId, RegisteredDevice>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> TopodResult<Self> {
        let data = std::fs::read_to_string(path)?;
        let seed: Vec<RegisteredDevice> = serde_json::from_str(&data)?;
        let registry = InMemoryRegistry::new();
        for device in seed {
            registry.upsert(device)?;
        }
        Ok(registry)
    }
}

impl Registry for InMemoryRegistry {
    fn get(&self, id: &DeviceId) -> Option<RegisteredDevice> {
        self.devices.lock().unwrap().get(id).cloned()
    }

    fn lookup(&self, keys: &[IdentityKey]) -> Option<RegisteredDevice> {
        let devices = self.devices.lock().unwrap();
        keys.iter().find_map(|key| {
            devices
                .values()
                .find(|d| d.identity_keys.contains(key))
                .cloned()
        })
    }

    fn upsert(&self, mut device: RegisteredDevice) -> TopodResult<()> {
        let id = device.id.as_str();
        if id.trim().is_empty() || id.starts_with("shadow:") {
            return Err(TopodError::Invalid(format!(
                "{id:?} is not a valid registry id"
            )));
        }
        device.identity_keys = std::mem::take(&mut device.identity_keys)
            .into_iter()
            .map(canonical_key)
            .collect();
        if device.identity_keys.iter().any(|k| match k {
            IdentityKey::ChassisId(s) | IdentityKey::SystemName(s) => {
                s.is_empty()
            }
            IdentityKey::ManagementIp(_) => false,
        }) {
            return Err(TopodError::Invalid(format!(
                "{id} has an empty identity key"
            )));
        }
        let mut devices = self.devices.lock().unwrap();
        for other in devices.values().filter(|d| d.id != device.id) {
            if let Some(key) =
                other.identity_keys.intersection(&device.identity_keys).next()
            {
                return Err(TopodError::Exists(format!(
                    "{key} is already registered to {}",
                    other.id
                )));
            }
        }
        devices.insert(device.id.clone(), device);
        Ok(())
    }

    fn remove(&self, id: &DeviceId) -> Option<RegisteredDevice> {
        self.devices.lock().unwrap().remove(id)
    }

    fn list(&self) -> Vec<RegisteredDevice> {
        self.devices.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(id: &str, keys: &[IdentityKey]) -> RegisteredDevice {
        RegisteredDevice {
            id: id.into(),
            name: None,
            identity_keys: keys.iter().cloned().collect(),
        }
    }

    #[test]
    fn test_lookup_priority() {
        let r = InMemoryRegistry::new();
        let ip = IdentityKey::ManagementIp("10.0.0.2".parse().unwrap());
        let name = IdentityKey::SystemName("sw2".into());
        r.upsert(reg("sw2", &[ip.clone()])).unwrap();
        r.upsert(reg("other", &[name.clone()])).unwrap();

        let found = r.lookup(&[ip.clone(), name.clone()]).unwrap();
        assert_eq!(found.id.as_str(), "sw2");
        let found = r.lookup(&[name, ip]).unwrap();
        assert_eq!(found.id.as_str(), "other");
        assert!(r.lookup(&[IdentityKey::ChassisId("x".into())]).is_none());
    }

    #[test]
    fn test_upsert_rules() {
        let r = InMemoryRegistry::new();
        let key = IdentityKey::ChassisId("aa:bb".into());
        r.upsert(reg("r2", &[IdentityKey::ChassisId(" AA:BB".into())]))
            .unwrap();
        assert!(r.get(&"r2".into()).unwrap().identity_keys.contains(&key));
        // Updating the same entry is fine
        r.upsert(reg("r2", &[key.clone()])).unwrap();
        assert!(matches!(
            r.upsert(reg("r3", &[key])),
            Err(TopodError::Exists(_))
        ));
        assert!(matches!(
            r.upsert(reg("shadow:chassis/aa:bb", &[])),
            Err(TopodError::Invalid(_))
        ));
        assert_eq!(r.list().len(), 1);
        assert!(r.remove(&"r2".into()).is_some());
        assert!(r.get(&"r2".into()).is_none());
    }

    #[test]
    fn test_load() {
        let path = std::env::temp_dir()
            .join(format!("topod-registry-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"[{"id": "r1", "name": "edge",
                 "identity_keys": [{"kind": "chassis_id", "value": "r1-id"}]}]"#,
        )
        .unwrap();
        let r = InMemoryRegistry::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let r1 = r.get(&"r1".into()).unwrap();
        assert_eq!(r1.name.as_deref(), Some("edge"));
        assert!(r1
            .identity_keys
            .contains(&IdentityKey::ChassisId("r1-id".into())));
    }
}
