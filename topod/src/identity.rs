// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Mapping the two ends of an observation onto devices in the graph.

use std::cmp::Ordering;

use chrono::DateTime;
use chrono::Utc;
use slog::info;
use slog::o;
use slog::warn;

use crate::link_key::LinkKey;
use crate::merge;
use crate::normalize::NeighborObservation;
use crate::registry::Registry;
use crate::store::GraphStore;
use crate::types::EngineConfig;
use protocol::types::Device;
use protocol::types::DeviceId;
use protocol::types::IdentityKey;
use protocol::types::LinkStatus;
use protocol::types::RegisteredDevice;
use protocol::types::RejectReason;
use protocol::types::RejectedObservation;
use protocol::types::RemovalReason;

/// The outcome of asking a single matcher about an observation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchResult {
    /// The device already known by `key`
    Matched { device: DeviceId, key: IdentityKey },
    NoMatch,
}

/// One way of recognizing the remote end of an observation.
pub trait Matcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// The identity key this matcher would use for the observation's remote
    /// end, if the observation carries one.
    fn key(&self, obs: &NeighborObservation) -> Option<IdentityKey>;

    fn matches(&self, store: &GraphStore, obs: &NeighborObservation) -> MatchResult {
        let Some(key) = self.key(obs) else {
            return MatchResult::NoMatch;
        };
        match store.owner(&key) {
            Some(device) => MatchResult::Matched {
                device: device.clone(),
                key,
            },
            None => MatchResult::NoMatch,
        }
    }
}

pub struct ChassisMatcher;

impl Matcher for ChassisMatcher {
    fn name(&self) -> &'static str {
        "chassis-id"
    }

    fn key(&self, obs: &NeighborObservation) -> Option<IdentityKey> {
        obs.remote_chassis_id.clone().map(IdentityKey::ChassisId)
    }
}

pub struct IpMatcher;

impl Matcher for IpMatcher {
    fn name(&self) -> &'static str {
        "management-ip"
    }

    fn key(&self, obs: &NeighborObservation) -> Option<IdentityKey> {
        obs.remote_ip.map(IdentityKey::ManagementIp)
    }
}

/// System names are the weakest signal, so this matcher runs last.
pub struct NameMatcher;

impl Matcher for NameMatcher {
    fn name(&self) -> &'static str {
        "system-name"
    }

    fn key(&self, obs: &NeighborObservation) -> Option<IdentityKey> {
        obs.remote_system_name.clone().map(IdentityKey::SystemName)
    }
}

// The order in which devices are preferred as the survivor of a merge:
// registered before shadow, then oldest, then lowest id.
fn survivor_order(a: &Device, b: &Device) -> Ordering {
    (a.is_shadow, a.first_seen_at, &a.id).cmp(&(
        b.is_shadow,
        b.first_seen_at,
        &b.id,
    ))
}

pub struct IdentityResolver {
    matchers: Vec<Box<dyn Matcher>>,
    log: slog::Logger,
}

impl IdentityResolver {
    pub fn new(log: &slog::Logger) -> Self {
        Self::with_matchers(
            vec![
                Box::new(ChassisMatcher),
                Box::new(IpMatcher),
                Box::new(NameMatcher),
            ],
            log,
        )
    }

    /// Build a resolver that tries `matchers` in order, first match winning.
    pub fn with_matchers(
        matchers: Vec<Box<dyn Matcher>>,
        log: &slog::Logger,
    ) -> Self {
        IdentityResolver {
            matchers,
            log: log.new(o!("unit" => "identity")),
        }
    }

    /// Resolve the reporting and remote devices of an observation, creating
    /// a shadow device for an unknown remote end.  Returns the ids of the
    /// local and remote devices.
    pub fn resolve(
        &self,
        cfg: &EngineConfig,
        store: &mut GraphStore,
        registry: &dyn Registry,
        obs: &NeighborObservation,
    ) -> Result<(DeviceId, DeviceId), RejectedObservation> {
        let at = obs.observed_at;
        let self_reference = || {
            RejectedObservation::with_detail(
                RejectReason::SelfReference,
                &obs.local_device_id,
            )
        };

        let local = match store.resolve_id(&obs.local_device_id) {
            Some(id) => id,
            None => match registry.get(&obs.local_device_id) {
                Some(entry) => self.adopt_registered(cfg, store, &entry, at),
                None => {
                    return Err(RejectedObservation::with_detail(
                        RejectReason::UnknownLocalDevice,
                        &obs.local_device_id,
                    ))
                }
            },
        };
        store.touch_device(&local, at);

        let keys = obs.remote_keys();
        if keys.iter().any(|k| store.owner(k) == Some(&local)) {
            return Err(self_reference());
        }

        let first = self.matchers.iter().find_map(|m| {
            match m.matches(store, obs) {
                MatchResult::Matched { device, key } => {
                    slog::trace!(self.log, "matched {device} by {key}";
                        "matcher" => m.name());
                    Some(device)
                }
                MatchResult::NoMatch => None,
            }
        });
        let mut remote = match first {
            Some(id) => id,
            None => match registry.lookup(&keys) {
                Some(entry) => self.adopt_registered(cfg, store, &entry, at),
                None => self.create_shadow(store, &keys, at),
            },
        };
        if remote == local {
            return Err(self_reference());
        }

        // Every key in the report now belongs to the remote device, which
        // may prove that two devices are one and the same.
        for key in keys {
            match store.owner(&key).cloned() {
                Some(owner) if owner == remote => {}
                Some(owner) => {
                    remote = self.merge_devices(cfg, store, &remote, &owner, at);
                }
                None => {
                    store.add_identity_key(&remote, key.clone());
                    info!(self.log, "learned {key} for {remote}");
                }
            }
        }

        // Give the registry a chance to vouch for a shadow device.
        if let Some(device) = store.device(&remote) {
            if device.is_shadow {
                let known: Vec<IdentityKey> =
                    device.identity_keys.iter().cloned().collect();
                if let Some(entry) = registry.lookup(&known) {
                    remote = self.adopt_registered(cfg, store, &entry, at);
                }
            }
        }
        // A merge along the way may have absorbed the reporting device.
        let local = store.resolve_id(&local).unwrap_or(local);
        if remote == local {
            return Err(self_reference());
        }
        store.touch_device(&remote, at);
        Ok((local, remote))
    }

    fn create_shadow(
        &self,
        store: &mut GraphStore,
        keys: &[IdentityKey],
        at: DateTime<Utc>,
    ) -> DeviceId {
        let Some(strongest) = keys.first() else {
            panic!("invariant violation: remote end without identity keys");
        };
        let base = DeviceId::shadow(strongest);
        let mut id = base.clone();
        let mut n = 1;
        while store.id_in_use(&id) {
            n += 1;
            id = DeviceId::new(format!("{base}#{n}"));
        }
        store.upsert_device(Device::new(id.clone(), true, at));
        store.counters.shadow_devices_created_total += 1;
        info!(self.log, "created shadow device {id}");
        id
    }

    /// Bring a registry entry into the graph: create or update the real
    /// device carrying the registry's id, and fold in every device that
    /// shares one of its identity keys.  Returns the id of the device that
    /// now represents the entry.
    pub fn adopt_registered(
        &self,
        cfg: &EngineConfig,
        store: &mut GraphStore,
        entry: &RegisteredDevice,
        at: DateTime<Utc>,
    ) -> DeviceId {
        let mut target = match store.device(&entry.id).cloned() {
            Some(mut device) => {
                if device.is_shadow {
                    info!(self.log, "promoting {} to a registered device", device.id);
                }
                device.is_shadow = false;
                if entry.name.is_some() {
                    device.name = entry.name.clone();
                }
                let id = device.id.clone();
                store.upsert_device(device);
                id
            }
            None => {
                let mut device = Device::new(entry.id.clone(), false, at);
                device.name = entry.name.clone();
                store.upsert_device(device);
                info!(self.log, "added registered device {}", entry.id);
                entry.id.clone()
            }
        };

        for key in &entry.identity_keys {
            match store.owner(key).cloned() {
                Some(owner) if owner == target => {}
                Some(owner) => {
                    target = self.merge_devices(cfg, store, &target, &owner, at);
                }
                None => {
                    store.add_identity_key(&target, key.clone());
                }
            }
        }
        target
    }

    /// Merge two devices that have been proven to be the same.  The
    /// survivor keeps its id and gains the other's identity keys and links;
    /// the absorbed id remains resolvable as an alias.  Returns the id of
    /// the survivor.
    pub fn merge_devices(
        &self,
        cfg: &EngineConfig,
        store: &mut GraphStore,
        x: &DeviceId,
        y: &DeviceId,
        at: DateTime<Utc>,
    ) -> DeviceId {
        let (Some(dx), Some(dy)) =
            (store.device(x).cloned(), store.device(y).cloned())
        else {
            panic!("invariant violation: merging unknown devices {x} and {y}");
        };
        if dx.id == dy.id {
            return dx.id;
        }
        let (mut survivor, absorbed) = match survivor_order(&dx, &dy) {
            Ordering::Greater => (dy, dx),
            _ => (dx, dy),
        };

        store.remove_device(&absorbed.id);
        survivor
            .identity_keys
            .extend(absorbed.identity_keys.iter().cloned());
        survivor.first_seen_at = survivor.first_seen_at.min(absorbed.first_seen_at);
        survivor.last_seen_at = survivor.last_seen_at.max(absorbed.last_seen_at);
        if survivor.name.is_none() {
            survivor.name = absorbed.name.clone();
        }
        store.upsert_device(survivor.clone());
        store.add_alias(absorbed.id.clone(), survivor.id.clone());
        store.counters.identity_merges_total += 1;
        warn!(self.log, "identity conflict: {} is the same device as {}",
            absorbed.id, survivor.id;
            "keys" => survivor.identity_keys.len());

        self.rehome_links(cfg, store, &absorbed.id, &survivor.id, at);
        survivor.id
    }

    // Move every link of `from` over to `to`.  Links that now duplicate an
    // existing link are folded into it; links that now loop back onto a
    // single device are retired.
    fn rehome_links(
        &self,
        cfg: &EngineConfig,
        store: &mut GraphStore,
        from: &DeviceId,
        to: &DeviceId,
        at: DateTime<Utc>,
    ) {
        let mut moved = Vec::new();
        for id in store.links_of(from) {
            let Some(mut link) = store.remove_link(&id) else {
                continue;
            };
            for e in [&mut link.endpoint_a, &mut link.endpoint_b] {
                if e.device_id == *from {
                    e.device_id = to.clone();
                }
            }
            if let Some(t) = link.reporting_devices.remove(from) {
                let seen = link.reporting_devices.entry(to.clone()).or_insert(t);
                *seen = (*seen).max(t);
            }

            let key = LinkKey::of_link(&link);
            if key.is_self_loop() {
                info!(self.log, "retiring self-looped link {link}");
                store.tombstone(link, RemovalReason::SelfLoop, at);
                store.counters.links_removed_total += 1;
                continue;
            }
            link.id = key.id();
            let (a, b) = key.into_endpoints();
            link.endpoint_a = a;
            link.endpoint_b = b;

            match store.link(&link.id).cloned() {
                Some(mut existing) => {
                    merge::fold_links(&mut existing, &link);
                    if existing.is_wildcard()
                        && existing.status == LinkStatus::Confirmed
                    {
                        existing.status = LinkStatus::Provisional;
                    }
                    moved.push(existing.id);
                    store.upsert_link(existing);
                }
                None => {
                    moved.push(link.id);
                    store.insert_link(link);
                }
            }
        }
        for id in moved {
            merge::settle_port_conflicts(cfg, store, &self.log, id, at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::tests::log;
    use crate::registry::InMemoryRegistry;
    use crate::store::tests::device;
    use crate::store::tests::link;
    use crate::store::tests::t;
    use protocol::types::LinkType;

    fn obs(local: &str) -> NeighborObservation {
        NeighborObservation {
            collector_id: "c1".into(),
            observed_at: t(0),
            local_device_id: local.into(),
            local_port: "Gi0/1".into(),
            remote_chassis_id: None,
            remote_system_name: None,
            remote_ip: None,
            remote_port: Some("Eth1/1".into()),
            link_type: LinkType::Physical,
        }
    }

    fn chassis(c: &str) -> IdentityKey {
        IdentityKey::ChassisId(c.into())
    }

    fn ip(a: &str) -> IdentityKey {
        IdentityKey::ManagementIp(a.parse().unwrap())
    }

    fn setup() -> (IdentityResolver, GraphStore, InMemoryRegistry) {
        let mut store = GraphStore::new(16);
        store.upsert_device(device("r1", &[chassis("r1-id")]));
        (IdentityResolver::new(&log()), store, InMemoryRegistry::new())
    }

    #[test]
    fn test_unknown_local_device() {
        let (res, mut store, reg) = setup();
        let mut o = obs("r9");
        o.remote_chassis_id = Some("aa:bb".into());
        let err = res
            .resolve(&EngineConfig::default(), &mut store, &reg, &o)
            .unwrap_err();
        assert_eq!(err.reason, RejectReason::UnknownLocalDevice);
        assert!(store.device(&"shadow:chassis/aa:bb".into()).is_none());

        // ... unless the registry knows it
        reg.upsert(RegisteredDevice {
            id: "r9".into(),
            name: Some("edge-9".into()),
            identity_keys: [chassis("r9-id")].into(),
        })
        .unwrap();
        let (local, _) = res
            .resolve(&EngineConfig::default(), &mut store, &reg, &o)
            .unwrap();
        assert_eq!(local.as_str(), "r9");
        assert!(!store.device(&local).unwrap().is_shadow);
    }

    #[test]
    fn test_shadow_created_and_extended() {
        let (res, mut store, reg) = setup();
        let cfg = EngineConfig::default();
        let mut o = obs("r1");
        o.remote_ip = Some("10.0.0.9".parse().unwrap());
        let (_, remote) = res.resolve(&cfg, &mut store, &reg, &o).unwrap();
        assert_eq!(remote.as_str(), "shadow:ip/10.0.0.9");
        assert!(store.device(&remote).unwrap().is_shadow);
        assert_eq!(store.counters.shadow_devices_created_total, 1);

        // Learning the chassis id later extends the shadow in place
        o.remote_chassis_id = Some("aa:bb".into());
        let (_, again) = res.resolve(&cfg, &mut store, &reg, &o).unwrap();
        assert_eq!(again, remote);
        assert_eq!(store.owner(&chassis("aa:bb")), Some(&remote));
        assert_eq!(store.counters.shadow_devices_created_total, 1);
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_chassis_match_wins() {
        let (res, mut store, reg) = setup();
        let mut sw = device("sw1", &[chassis("aa:bb")]);
        sw.first_seen_at = t(-100);
        store.upsert_device(sw);
        let mut other = device("sw2", &[ip("10.0.0.9")]);
        other.is_shadow = true;
        store.upsert_device(other);
        store.upsert_device(device("r3", &[]));
        store.insert_link(link("sw2", "x", "r3", Some("y")));

        let mut o = obs("r1");
        o.remote_chassis_id = Some("aa:bb".into());
        o.remote_ip = Some("10.0.0.9".parse().unwrap());
        let (_, remote) = res
            .resolve(&EngineConfig::default(), &mut store, &reg, &o)
            .unwrap();
        assert_eq!(remote.as_str(), "sw1");

        // The shadow carrying the IP has been merged into sw1
        assert_eq!(store.resolve_id(&"sw2".into()), Some("sw1".into()));
        assert_eq!(store.owner(&ip("10.0.0.9")), Some(&"sw1".into()));
        assert_eq!(store.counters.identity_merges_total, 1);
        let moved = store.links().next().unwrap();
        assert!(moved.touches(&"sw1".into()));
        assert_eq!(moved.id, LinkKey::of_link(moved).id());
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_self_reference() {
        let (res, mut store, reg) = setup();
        let mut o = obs("r1");
        o.remote_chassis_id = Some("r1-id".into());
        let err = res
            .resolve(&EngineConfig::default(), &mut store, &reg, &o)
            .unwrap_err();
        assert_eq!(err.reason, RejectReason::SelfReference);
    }

    #[test]
    fn test_registry_promotes_shadow() {
        let (res, mut store, reg) = setup();
        let cfg = EngineConfig::default();
        let mut o = obs("r1");
        o.remote_ip = Some("10.0.0.9".parse().unwrap());
        let (_, shadow) = res.resolve(&cfg, &mut store, &reg, &o).unwrap();

        let entry = RegisteredDevice {
            id: "core-1".into(),
            name: Some("core".into()),
            identity_keys: [ip("10.0.0.9")].into(),
        };
        let id = res.adopt_registered(&cfg, &mut store, &entry, t(10));
        assert_eq!(id.as_str(), "core-1");
        let core = store.device(&shadow).unwrap();
        assert_eq!(core.id, id);
        assert!(!core.is_shadow);
        assert_eq!(core.name.as_deref(), Some("core"));
        assert_eq!(core.first_seen_at, t(0));
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_registry_consulted_for_unknown_remote() {
        let (res, mut store, reg) = setup();
        reg.upsert(RegisteredDevice {
            id: "r2".into(),
            name: None,
            identity_keys: [chassis("aa:bb")].into(),
        })
        .unwrap();
        let mut o = obs("r1");
        o.remote_chassis_id = Some("aa:bb".into());
        o.remote_system_name = Some("r2.example".into());
        let (_, remote) = res
            .resolve(&EngineConfig::default(), &mut store, &reg, &o)
            .unwrap();
        assert_eq!(remote.as_str(), "r2");
        assert_eq!(store.counters.shadow_devices_created_total, 0);
        let keys = &store.device(&remote).unwrap().identity_keys;
        assert!(keys.contains(&IdentityKey::SystemName("r2.example".into())));
    }

    #[test]
    fn test_merge_retires_self_loops_and_folds_duplicates() {
        let (res, mut store, _) = setup();
        let cfg = EngineConfig::default();
        let mut a = device("shadow:a", &[ip("10.0.0.1")]);
        a.is_shadow = true;
        let mut b = device("shadow:b", &[ip("10.0.0.2")]);
        b.is_shadow = true;
        b.first_seen_at = t(5);
        store.upsert_device(a);
        store.upsert_device(b);

        // A link between the two devices that turn out to be one
        store.insert_link(link("shadow:a", "p1", "shadow:b", Some("p2")));
        // The same r1 port, seen against each of them
        let mut x = link("r1", "Gi0/1", "shadow:a", Some("e1"));
        x.confirming_collectors.insert("c1".into(), t(0));
        let mut y = link("r1", "Gi0/1", "shadow:b", Some("e1"));
        y.confirming_collectors.insert("c2".into(), t(1));
        y.confidence = 0.6;
        store.insert_link(x);
        store.insert_link(y);

        let survivor =
            res.merge_devices(&cfg, &mut store, &"shadow:b".into(), &"shadow:a".into(), t(10));
        assert_eq!(survivor.as_str(), "shadow:a");
        assert_eq!(store.links().count(), 1);
        let folded = store.links().next().unwrap();
        assert_eq!(folded.confirming_collectors.len(), 2);
        assert_eq!(folded.confidence, 0.6);
        let tomb = store.tombstones().next().unwrap();
        assert_eq!(tomb.reason, RemovalReason::SelfLoop);
        store.check_invariants().unwrap();
    }
}
