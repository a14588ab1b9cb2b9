// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Read-only views over a published snapshot.  Nothing in here touches the
//! engine, so queries never wait behind ingest.

use std::collections::BTreeSet;

use protocol::types::Device;
use protocol::types::DeviceId;
use protocol::types::Link;
use protocol::types::LinkStatus;
use protocol::types::LinkType;
use protocol::types::SnapshotFilter;
use protocol::types::Tombstone;
use protocol::types::TopologyGraph;
use protocol::types::TopologyStats;

use crate::merge::round_confidence;
use crate::store::GraphSnapshot;

/// Map a possibly-merged device id onto the device that now carries it.
pub fn resolve_id<'a>(
    snap: &'a GraphSnapshot,
    id: &'a DeviceId,
) -> &'a DeviceId {
    snap.aliases.get(id).unwrap_or(id)
}

pub fn device(snap: &GraphSnapshot, id: &DeviceId) -> Option<Device> {
    let id = resolve_id(snap, id);
    snap.devices.iter().find(|d| &d.id == id).cloned()
}

fn wanted(link: &Link, filter: &SnapshotFilter) -> bool {
    match link.status {
        LinkStatus::Provisional | LinkStatus::Confirmed => true,
        LinkStatus::Stale => filter.include_stale,
        LinkStatus::Conflicted => filter.include_conflicted,
        LinkStatus::Removed => false,
    }
}

/// Build the graph served to clients.  Stale and conflicted links are only
/// included when asked for.  When the filter names a device, the result is
/// limited to that device, its links, and the devices at their far ends.
pub fn topology(snap: &GraphSnapshot, filter: &SnapshotFilter) -> TopologyGraph {
    let focus = filter.device_id.as_ref().map(|id| resolve_id(snap, id));
    let links: Vec<Link> = snap
        .links
        .iter()
        .filter(|l| wanted(l, filter))
        .filter(|l| focus.map_or(true, |id| l.touches(id)))
        .cloned()
        .collect();

    let devices = match focus {
        None => snap.devices.clone(),
        Some(id) => {
            let mut keep: BTreeSet<&DeviceId> = links
                .iter()
                .flat_map(|l| [&l.endpoint_a.device_id, &l.endpoint_b.device_id])
                .collect();
            keep.insert(id);
            snap.devices
                .iter()
                .filter(|d| keep.contains(&d.id))
                .cloned()
                .collect()
        }
    };

    TopologyGraph {
        generated_at: snap.generated_at,
        devices,
        links,
        stats: stats(snap),
    }
}

pub fn stats(snap: &GraphSnapshot) -> TopologyStats {
    let mut s = TopologyStats {
        devices_total: snap.devices.len(),
        shadow_devices: snap.devices.iter().filter(|d| d.is_shadow).count(),
        links_total: snap.links.len(),
        tombstones: snap.tombstones.len(),
        counters: snap.counters.clone(),
        ..Default::default()
    };

    let mut served = 0;
    let mut total = 0.0;
    for link in &snap.links {
        match link.status {
            LinkStatus::Provisional => s.by_status.provisional += 1,
            LinkStatus::Confirmed => s.by_status.confirmed += 1,
            LinkStatus::Conflicted => s.by_status.conflicted += 1,
            LinkStatus::Stale => s.by_status.stale += 1,
            LinkStatus::Removed => {}
        }
        match link.link_type {
            LinkType::Physical => s.by_type.physical += 1,
            LinkType::Logical => s.by_type.logical += 1,
        }
        if matches!(link.status, LinkStatus::Provisional | LinkStatus::Confirmed)
        {
            served += 1;
            total += link.confidence;
        }
    }
    if served > 0 {
        s.average_confidence = round_confidence(total / served as f64);
    }
    s
}

/// The tombstone log, most recent removal first.
pub fn tombstones(snap: &GraphSnapshot, limit: Option<usize>) -> Vec<Tombstone> {
    snap.tombstones
        .iter()
        .rev()
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::device as new_device;
    use crate::store::tests::link;
    use crate::store::tests::t;
    use crate::store::GraphStore;
    use protocol::types::RemovalReason;

    fn snapshot() -> GraphSnapshot {
        let mut store = GraphStore::new(16);
        for id in ["r1", "r2", "r3", "r4"] {
            store.upsert_device(new_device(id, &[]));
        }
        let mut statuses = [
            (link("r1", "Gi0/1", "r2", Some("Eth1")), LinkStatus::Confirmed, 0.9),
            (link("r1", "Gi0/2", "r3", Some("Eth1")), LinkStatus::Provisional, 0.3),
            (link("r2", "Eth2", "r3", Some("Eth2")), LinkStatus::Stale, 0.6),
            (link("r3", "Eth3", "r4", Some("Eth3")), LinkStatus::Conflicted, 0.6),
        ];
        for (l, status, confidence) in statuses.iter_mut() {
            l.status = *status;
            l.confidence = *confidence;
        }
        statuses[1].0.link_type = LinkType::Logical;
        for (l, ..) in statuses {
            store.insert_link(l);
        }
        let gone = link("r2", "Eth9", "r4", Some("Eth9"));
        store.tombstone(gone, RemovalReason::Expired, t(1));
        store.add_alias("old-r1".into(), "r1".into());
        store.snapshot(7, t(10))
    }

    #[test]
    fn test_default_filter() {
        let snap = snapshot();
        let g = topology(&snap, &SnapshotFilter::default());
        assert_eq!(g.links.len(), 2);
        assert!(g
            .links
            .iter()
            .all(|l| matches!(
                l.status,
                LinkStatus::Confirmed | LinkStatus::Provisional
            )));
        assert_eq!(g.devices.len(), 4);

        let g = topology(
            &snap,
            &SnapshotFilter {
                include_stale: true,
                include_conflicted: true,
                device_id: None,
            },
        );
        assert_eq!(g.links.len(), 4);
    }

    #[test]
    fn test_device_filter_follows_aliases() {
        let snap = snapshot();
        let g = topology(
            &snap,
            &SnapshotFilter {
                device_id: Some("old-r1".into()),
                ..Default::default()
            },
        );
        let ids: Vec<&str> = g.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
        assert_eq!(g.links.len(), 2);

        let g = topology(
            &snap,
            &SnapshotFilter {
                device_id: Some("r4".into()),
                ..Default::default()
            },
        );
        let ids: Vec<&str> = g.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["r4"]);
        assert!(g.links.is_empty());
    }

    #[test]
    fn test_stats() {
        let s = stats(&snapshot());
        assert_eq!(s.devices_total, 4);
        assert_eq!(s.links_total, 4);
        assert_eq!(s.by_status.confirmed, 1);
        assert_eq!(s.by_status.provisional, 1);
        assert_eq!(s.by_status.stale, 1);
        assert_eq!(s.by_status.conflicted, 1);
        assert_eq!(s.by_type.logical, 1);
        assert_eq!(s.by_type.physical, 3);
        assert_eq!(s.average_confidence, 0.6);
        assert_eq!(s.tombstones, 1);
    }

    #[test]
    fn test_device_lookup() {
        let snap = snapshot();
        assert_eq!(device(&snap, &"old-r1".into()).unwrap().id.as_str(), "r1");
        assert!(device(&snap, &"r9".into()).is_none());
        assert_eq!(tombstones(&snap, Some(5)).len(), 1);
        assert!(tombstones(&snap, Some(0)).is_empty());
    }
}
