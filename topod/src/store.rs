// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The graph store owns every device, link and tombstone.  It is keyed by
//! stable ids rather than references, so merges and removals are index
//! updates.  The store maintains its indexes but makes no policy decisions:
//! those belong to the identity resolver, the merge engine and the sweeper.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::TopodError;
use crate::link_key::LinkKey;
use crate::types::TopodResult;
use protocol::types::Device;
use protocol::types::DeviceId;
use protocol::types::Endpoint;
use protocol::types::EngineCounters;
use protocol::types::IdentityKey;
use protocol::types::Link;
use protocol::types::LinkStatus;
use protocol::types::RemovalReason;
use protocol::types::Tombstone;

/// An immutable, point-in-time copy of the store.  This is what readers see
/// and what gets written to the state file.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GraphSnapshot {
    /// Incremented by the engine each time it publishes a snapshot
    pub seq: u64,
    pub generated_at: DateTime<Utc>,
    pub devices: Vec<Device>,
    pub links: Vec<Link>,
    /// Ids absorbed by identity merges, mapped to the surviving device
    pub aliases: BTreeMap<DeviceId, DeviceId>,
    pub tombstones: Vec<Tombstone>,
    pub counters: EngineCounters,
}

pub struct GraphStore {
    devices: BTreeMap<DeviceId, Device>,
    identity_index: BTreeMap<IdentityKey, DeviceId>,
    aliases: BTreeMap<DeviceId, DeviceId>,
    links: BTreeMap<Uuid, Link>,
    // Links terminating on each known port
    port_index: BTreeMap<Endpoint, BTreeSet<Uuid>>,
    tombstones: VecDeque<Tombstone>,
    tombstone_capacity: usize,
    pub counters: EngineCounters,
}

impl GraphStore {
    pub fn new(tombstone_capacity: usize) -> Self {
        GraphStore {
            devices: BTreeMap::new(),
            identity_index: BTreeMap::new(),
            aliases: BTreeMap::new(),
            links: BTreeMap::new(),
            port_index: BTreeMap::new(),
            tombstones: VecDeque::new(),
            tombstone_capacity,
            counters: EngineCounters::default(),
        }
    }

    /// Map a device id, possibly one absorbed by an earlier merge, to the id
    /// of the device that currently carries it.
    pub fn resolve_id(&self, id: &DeviceId) -> Option<DeviceId> {
        if self.devices.contains_key(id) {
            Some(id.clone())
        } else {
            self.aliases.get(id).cloned()
        }
    }

    /// True if `id` names a device or an alias.
    pub fn id_in_use(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id) || self.aliases.contains_key(id)
    }

    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.resolve_id(id).and_then(|id| self.devices.get(&id))
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// The device currently known by `key`, if any.
    pub fn owner(&self, key: &IdentityKey) -> Option<&DeviceId> {
        self.identity_index.get(key)
    }

    /// Insert or replace a device, re-indexing its identity keys.
    ///
    /// Panics if one of its keys already belongs to a different device:
    /// callers must merge the two devices first.
    pub fn upsert_device(&mut self, device: Device) {
        for key in &device.identity_keys {
            if let Some(owner) = self.identity_index.get(key) {
                if *owner != device.id {
                    panic!(
                        "invariant violation: {key} belongs to both {owner} \
                         and {}",
                        device.id
                    );
                }
            }
        }
        if let Some(old) = self.devices.get(&device.id) {
            for key in old.identity_keys.difference(&device.identity_keys) {
                self.identity_index.remove(key);
            }
        }
        for key in &device.identity_keys {
            self.identity_index.insert(key.clone(), device.id.clone());
        }
        self.devices.insert(device.id.clone(), device);
    }

    /// Add an identity key to an existing device.  Returns false if it was
    /// already present.
    pub fn add_identity_key(&mut self, id: &DeviceId, key: IdentityKey) -> bool {
        let Some(mut device) = self.devices.get(id).cloned() else {
            panic!("invariant violation: no device {id}");
        };
        if !device.identity_keys.insert(key) {
            return false;
        }
        self.upsert_device(device);
        true
    }

    pub fn touch_device(&mut self, id: &DeviceId, at: DateTime<Utc>) {
        if let Some(d) = self.devices.get_mut(id) {
            d.touch(at);
        }
    }

    /// Remove a device and un-index its identity keys.  Links and aliases
    /// are left alone.
    pub fn remove_device(&mut self, id: &DeviceId) -> Option<Device> {
        let device = self.devices.remove(id)?;
        for key in &device.identity_keys {
            self.identity_index.remove(key);
        }
        Some(device)
    }

    /// Forget every alias leading to `id`.
    pub fn drop_aliases_to(&mut self, id: &DeviceId) {
        self.aliases.retain(|_, target| target != id);
    }

    /// Record that `from` has been absorbed into `to`.  Aliases that pointed
    /// at `from` are redirected, so every alias resolves in a single step.
    pub fn add_alias(&mut self, from: DeviceId, to: DeviceId) {
        for target in self.aliases.values_mut() {
            if *target == from {
                *target = to.clone();
            }
        }
        self.aliases.insert(from, to);
    }

    pub fn link(&self, id: &Uuid) -> Option<&Link> {
        self.links.get(id)
    }

    /// Mutable access to a link.  The endpoints must not be changed, since
    /// they determine the link's id; re-key by removing and re-inserting.
    pub fn link_mut(&mut self, id: &Uuid) -> Option<&mut Link> {
        self.links.get_mut(id)
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn link_ids(&self) -> Vec<Uuid> {
        self.links.keys().copied().collect()
    }

    /// Ids of every link that terminates on the given known port.
    pub fn links_at(&self, endpoint: &Endpoint) -> Vec<Uuid> {
        self.port_index
            .get(endpoint)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ids of every link with an end on the given device.
    pub fn links_of(&self, device: &DeviceId) -> Vec<Uuid> {
        self.links
            .values()
            .filter(|l| l.touches(device))
            .map(|l| l.id)
            .collect()
    }

    /// Add a new link.
    ///
    /// Panics if a link with the same canonical key already exists, or if
    /// the link's id was not derived from its endpoints: either means the
    /// merge logic has lost track of the graph.
    pub fn insert_link(&mut self, link: Link) {
        let expected = LinkKey::of_link(&link).id();
        if link.id != expected {
            panic!(
                "invariant violation: link {} has id {}, expected {expected}",
                link, link.id
            );
        }
        if self.links.contains_key(&link.id) {
            panic!("invariant violation: duplicate link {link}");
        }
        for e in link.endpoints() {
            if !e.is_wildcard() {
                self.port_index.entry(e.clone()).or_default().insert(link.id);
            }
        }
        self.links.insert(link.id, link);
    }

    /// Replace a link in place, or add it if it is new.
    pub fn upsert_link(&mut self, link: Link) {
        match self.links.get_mut(&link.id) {
            Some(old) => {
                assert!(
                    old.endpoint_a == link.endpoint_a
                        && old.endpoint_b == link.endpoint_b,
                    "invariant violation: link {} changed endpoints",
                    link.id
                );
                *old = link;
            }
            None => self.insert_link(link),
        }
    }

    pub fn remove_link(&mut self, id: &Uuid) -> Option<Link> {
        let link = self.links.remove(id)?;
        for e in link.endpoints() {
            if let Some(ids) = self.port_index.get_mut(e) {
                ids.remove(id);
                if ids.is_empty() {
                    self.port_index.remove(e);
                }
            }
        }
        Some(link)
    }

    /// Move a link that has left the serving graph into the tombstone log.
    pub fn tombstone(
        &mut self,
        mut link: Link,
        reason: RemovalReason,
        removed_at: DateTime<Utc>,
    ) {
        link.status = LinkStatus::Removed;
        self.tombstones.push_back(Tombstone {
            link,
            removed_at,
            reason,
        });
        while self.tombstones.len() > self.tombstone_capacity {
            self.tombstones.pop_front();
        }
    }

    /// Drop tombstones recorded before `cutoff`.  Returns the number dropped.
    pub fn prune_tombstones(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|t| t.removed_at >= cutoff);
        before - self.tombstones.len()
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &Tombstone> {
        self.tombstones.iter()
    }

    pub fn snapshot(&self, seq: u64, generated_at: DateTime<Utc>) -> GraphSnapshot {
        GraphSnapshot {
            seq,
            generated_at,
            devices: self.devices.values().cloned().collect(),
            links: self.links.values().cloned().collect(),
            aliases: self.aliases.clone(),
            tombstones: self.tombstones.iter().cloned().collect(),
            counters: self.counters.clone(),
        }
    }

    /// Rebuild a store from a snapshot, refusing one that violates any of
    /// the store's invariants.
    pub fn restore(
        snapshot: GraphSnapshot,
        tombstone_capacity: usize,
    ) -> TopodResult<GraphStore> {
        let invalid = |msg: String| TopodError::Invalid(msg);
        let mut store = GraphStore::new(tombstone_capacity);

        for device in snapshot.devices {
            if store.devices.contains_key(&device.id) {
                return Err(invalid(format!("duplicate device {}", device.id)));
            }
            for key in &device.identity_keys {
                if let Some(owner) = store.identity_index.get(key) {
                    return Err(invalid(format!(
                        "{key} belongs to both {owner} and {}",
                        device.id
                    )));
                }
            }
            store.upsert_device(device);
        }
        for (from, to) in snapshot.aliases {
            if store.devices.contains_key(&from)
                || !store.devices.contains_key(&to)
            {
                return Err(invalid(format!("bad alias {from} -> {to}")));
            }
            store.aliases.insert(from, to);
        }
        for link in snapshot.links {
            if store.links.contains_key(&link.id) {
                return Err(invalid(format!("duplicate link {}", link.id)));
            }
            if link.id != LinkKey::of_link(&link).id() {
                return Err(invalid(format!("link {} has a foreign id", link.id)));
            }
            store.insert_link(link);
        }
        store.check_invariants().map_err(invalid)?;

        store.tombstones = snapshot.tombstones.into_iter().collect();
        while store.tombstones.len() > tombstone_capacity {
            store.tombstones.pop_front();
        }
        store.counters = snapshot.counters;
        Ok(store)
    }

    /// Verify every structural invariant of the graph.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (key, id) in &self.identity_index {
            match self.devices.get(id) {
                Some(d) if d.identity_keys.contains(key) => {}
                _ => return Err(format!("{key} indexed to {id} in error")),
            }
        }
        for d in self.devices.values() {
            for key in &d.identity_keys {
                if self.identity_index.get(key) != Some(&d.id) {
                    return Err(format!("{key} of {} is not indexed", d.id));
                }
            }
        }
        for (from, to) in &self.aliases {
            if self.devices.contains_key(from) || !self.devices.contains_key(to)
            {
                return Err(format!("bad alias {from} -> {to}"));
            }
        }

        let mut confirmed_ports = BTreeMap::new();
        for link in self.links.values() {
            if link.id != LinkKey::of_link(link).id() {
                return Err(format!("link {} has a foreign id", link.id));
            }
            if link.endpoint_a.device_id == link.endpoint_b.device_id {
                return Err(format!("link {link} is a self-loop"));
            }
            if !(0.0..=1.0).contains(&link.confidence) {
                return Err(format!("link {link} has confidence out of range"));
            }
            match link.status {
                LinkStatus::Removed => {
                    return Err(format!("removed link {link} is still live"))
                }
                LinkStatus::Confirmed if link.is_wildcard() => {
                    return Err(format!("wildcard link {link} is confirmed"))
                }
                _ => {}
            }
            for e in link.endpoints() {
                if !self.devices.contains_key(&e.device_id) {
                    return Err(format!("link {link} dangles at {e}"));
                }
                if e.is_wildcard() {
                    continue;
                }
                if !self
                    .port_index
                    .get(e)
                    .is_some_and(|ids| ids.contains(&link.id))
                {
                    return Err(format!("port {e} of {link} is not indexed"));
                }
                if link.status == LinkStatus::Confirmed {
                    if let Some(other) = confirmed_ports.insert(e, link.id) {
                        return Err(format!(
                            "port {e} is in confirmed links {other} and {}",
                            link.id
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(secs)
    }

    pub fn device(id: &str, keys: &[IdentityKey]) -> Device {
        let mut d = Device::new(DeviceId::from(id), false, t(0));
        d.identity_keys = keys.iter().cloned().collect();
        d
    }

    pub fn link(a: &str, pa: &str, b: &str, pb: Option<&str>) -> Link {
        let key = LinkKey::build(&a.into(), pa, &b.into(), pb);
        let id = key.id();
        let (endpoint_a, endpoint_b) = key.into_endpoints();
        Link {
            id,
            endpoint_a,
            endpoint_b,
            link_type: Default::default(),
            confidence: 0.3,
            confirming_collectors: BTreeMap::new(),
            reporting_devices: BTreeMap::new(),
            status: LinkStatus::Provisional,
            first_seen_at: t(0),
            last_seen_at: t(0),
            confirmed_at: None,
        }
    }

    fn chassis(c: &str) -> IdentityKey {
        IdentityKey::ChassisId(c.into())
    }

    fn two_routers() -> GraphStore {
        let mut store = GraphStore::new(4);
        store.upsert_device(device("r1", &[chassis("r1-id")]));
        store.upsert_device(device("r2", &[chassis("aa:bb")]));
        store
    }

    #[test]
    fn test_identity_index() {
        let mut store = two_routers();
        assert_eq!(store.owner(&chassis("aa:bb")), Some(&"r2".into()));
        let name = IdentityKey::SystemName("core".into());
        assert!(store.add_identity_key(&"r2".into(), name.clone()));
        assert!(!store.add_identity_key(&"r2".into(), name.clone()));
        assert_eq!(store.owner(&name), Some(&"r2".into()));

        // Replacing a device drops keys it no longer carries
        store.upsert_device(device("r2", &[chassis("aa:bb")]));
        assert_eq!(store.owner(&name), None);
        store.check_invariants().unwrap();

        store.remove_device(&"r2".into()).unwrap();
        assert_eq!(store.owner(&chassis("aa:bb")), None);
        store.check_invariants().unwrap();
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn test_shared_key_panics() {
        let mut store = two_routers();
        store.upsert_device(device("r3", &[chassis("aa:bb")]));
    }

    #[test]
    #[should_panic(expected = "duplicate link")]
    fn test_duplicate_link_panics() {
        let mut store = two_routers();
        store.insert_link(link("r1", "Gi0/1", "r2", Some("Eth1/1")));
        store.insert_link(link("r2", "Eth1/1", "r1", Some("Gi0/1")));
    }

    #[test]
    fn test_port_index() {
        let mut store = two_routers();
        let l = link("r1", "Gi0/1", "r2", Some("Eth1/1"));
        let w = link("r1", "Gi0/1", "r2", None);
        store.insert_link(l.clone());
        store.insert_link(w.clone());
        let port = Endpoint::new("r1".into(), Some("Gi0/1".into()));
        let mut at = store.links_at(&port);
        at.sort();
        let mut want = vec![l.id, w.id];
        want.sort();
        assert_eq!(at, want);
        assert_eq!(store.links_of(&"r2".into()).len(), 2);

        store.remove_link(&l.id).unwrap();
        assert_eq!(store.links_at(&port), vec![w.id]);
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_aliases_resolve_in_one_step() {
        let mut store = two_routers();
        store.upsert_device(device("r3", &[]));
        store.remove_device(&"r1".into());
        store.add_alias("r1".into(), "r2".into());
        store.remove_device(&"r2".into());
        store.add_alias("r2".into(), "r3".into());
        assert_eq!(store.resolve_id(&"r1".into()), Some("r3".into()));
        assert_eq!(store.resolve_id(&"r2".into()), Some("r3".into()));
        assert!(store.id_in_use(&"r1".into()));
        store.check_invariants().unwrap();

        store.drop_aliases_to(&"r3".into());
        assert_eq!(store.resolve_id(&"r1".into()), None);
        assert_eq!(store.device(&"r3".into()).unwrap().id.as_str(), "r3");
    }

    #[test]
    fn test_tombstones_bounded() {
        let mut store = two_routers();
        for i in 0..6 {
            let l = link("r1", &format!("p{i}"), "r2", None);
            store.tombstone(l, RemovalReason::Expired, t(i));
        }
        let kept: Vec<_> = store.tombstones().map(|t| t.removed_at).collect();
        assert_eq!(kept, vec![t(2), t(3), t(4), t(5)]);
        assert!(store.tombstones().all(|t| t.link.status == LinkStatus::Removed));
        assert_eq!(store.prune_tombstones(t(4)), 2);
        assert_eq!(store.tombstones().count(), 2);
    }

    #[test]
    fn test_confirmed_port_invariant() {
        let mut store = two_routers();
        store.upsert_device(device("r3", &[]));
        let mut a = link("r1", "Gi0/1", "r2", Some("Eth1/1"));
        let mut b = link("r1", "Gi0/1", "r3", Some("Eth9"));
        a.status = LinkStatus::Confirmed;
        b.status = LinkStatus::Confirmed;
        store.insert_link(a);
        store.insert_link(b.clone());
        assert!(store.check_invariants().is_err());
        b.status = LinkStatus::Conflicted;
        store.upsert_link(b);
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_restore() {
        let mut store = two_routers();
        store.insert_link(link("r1", "Gi0/1", "r2", Some("Eth1/1")));
        store.counters.links_created_total = 1;
        let snap = store.snapshot(7, t(10));
        let restored = GraphStore::restore(snap.clone(), 4).unwrap();
        assert_eq!(restored.snapshot(7, t(10)), snap);

        // A link pointing at a device that does not exist
        let mut bad = snap.clone();
        bad.devices.retain(|d| d.id.as_str() != "r2");
        assert!(matches!(
            GraphStore::restore(bad, 4),
            Err(TopodError::Invalid(_))
        ));

        // Two devices claiming the same key
        let mut bad = snap.clone();
        bad.devices.push(device("r9", &[chassis("aa:bb")]));
        assert!(matches!(
            GraphStore::restore(bad, 4),
            Err(TopodError::Invalid(_))
        ));

        // A link whose id does not match its endpoints
        let mut bad = snap;
        bad.links[0].id = Uuid::nil();
        assert!(matches!(
            GraphStore::restore(bad, 4),
            Err(TopodError::Invalid(_))
        ));
    }
}
