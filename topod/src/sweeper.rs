// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Aging links that are no longer being reported.  The sweep itself is a
//! pure state transition applied by the engine; the task in this module only
//! decides when to ask for one.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use slog::debug;
use slog::error;
use slog::info;

use crate::engine::EngineHandle;
use crate::merge::round_confidence;
use crate::store::GraphStore;
use crate::types::delta;
use crate::types::EngineConfig;
use protocol::types::LinkStatus;
use protocol::types::RemovalReason;

/// What a single sweep changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub staled: usize,
    pub removed: usize,
    pub decayed: usize,
    pub tombstones_pruned: usize,
}

pub fn sweep(
    cfg: &EngineConfig,
    store: &mut GraphStore,
    log: &slog::Logger,
    now: DateTime<Utc>,
) -> SweepReport {
    let mut report = SweepReport::default();
    let ttl_stale = delta(cfg.ttl_stale);
    let ttl_remove = delta(cfg.ttl_remove);

    for id in store.link_ids() {
        let Some(link) = store.link_mut(&id) else {
            continue;
        };
        let silent = now.signed_duration_since(link.last_seen_at);

        match link.status {
            LinkStatus::Provisional
            | LinkStatus::Confirmed
            | LinkStatus::Conflicted
                if silent > ttl_stale =>
            {
                info!(log, "link {link} is stale");
                link.status = LinkStatus::Stale;
                report.staled += 1;
            }
            // A link only ever reported from one end drifts back down to the
            // one-sided floor.
            LinkStatus::Confirmed
                if link.reporting_devices.len() < 2
                    && link.confidence > cfg.one_sided_floor =>
            {
                link.confidence = round_confidence(
                    (link.confidence - cfg.decay_step).max(cfg.one_sided_floor),
                );
                report.decayed += 1;
            }
            _ => {}
        }

        if link.status == LinkStatus::Stale && silent > ttl_remove {
            if let Some(link) = store.remove_link(&id) {
                info!(log, "removing expired link {link}");
                store.tombstone(link, RemovalReason::Expired, now);
                report.removed += 1;
            }
        }
    }
    store.counters.links_aged_out_total += report.staled as u64;
    store.counters.links_removed_total += report.removed as u64;

    let cutoff = now
        .checked_sub_signed(delta(cfg.tombstone_retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    report.tombstones_pruned = store.prune_tombstones(cutoff);
    report
}

/// Ask the engine for a sweep every `interval` until `shutdown` fires.
pub async fn sweeper_task(
    engine: EngineHandle,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<()>,
    log: slog::Logger,
) {
    let log = log.new(slog::o!("unit" => "sweeper"));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.sweep(Utc::now()).await {
                    Ok(r) => debug!(log, "sweep complete";
                        "staled" => r.staled,
                        "removed" => r.removed,
                        "decayed" => r.decayed),
                    Err(e) => {
                        error!(log, "sweep failed: {e}");
                        break;
                    }
                }
            }
            r = shutdown.changed() => {
                if r.is_err() {
                    break;
                }
            }
        }
    }
    debug!(log, "sweeper exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::tests::log;
    use crate::store::tests::device;
    use crate::store::tests::link;
    use crate::store::tests::t;

    fn store_with(status: LinkStatus, last_seen: i64) -> GraphStore {
        let mut store = GraphStore::new(16);
        store.upsert_device(device("r1", &[]));
        store.upsert_device(device("r2", &[]));
        let mut l = link("r1", "Gi0/1", "r2", Some("Eth1/1"));
        l.status = status;
        l.last_seen_at = t(last_seen);
        store.insert_link(l);
        store
    }

    #[test]
    fn test_stale_then_removed() {
        let cfg = EngineConfig::default();
        let mut store = store_with(LinkStatus::Confirmed, 0);

        let r = sweep(&cfg, &mut store, &log(), t(300));
        assert_eq!(r, SweepReport::default());

        let r = sweep(&cfg, &mut store, &log(), t(301));
        assert_eq!(r.staled, 1);
        assert_eq!(store.links().next().unwrap().status, LinkStatus::Stale);

        let r = sweep(&cfg, &mut store, &log(), t(901));
        assert_eq!(r.removed, 1);
        assert_eq!(store.links().count(), 0);
        let tomb = store.tombstones().next().unwrap();
        assert_eq!(tomb.reason, RemovalReason::Expired);
        assert_eq!(tomb.link.status, LinkStatus::Removed);
        assert_eq!(store.counters.links_aged_out_total, 1);
        assert_eq!(store.counters.links_removed_total, 1);

        // Tombstones are retained for an hour
        let r = sweep(&cfg, &mut store, &log(), t(901 + 3601));
        assert_eq!(r.tombstones_pruned, 1);
    }

    #[test]
    fn test_late_sweep_goes_straight_to_removal() {
        let cfg = EngineConfig::default();
        let mut store = store_with(LinkStatus::Conflicted, 0);
        let r = sweep(&cfg, &mut store, &log(), t(5000));
        assert_eq!((r.staled, r.removed), (1, 1));
        assert_eq!(store.links().count(), 0);
    }

    #[test]
    fn test_one_sided_decay() {
        let cfg = EngineConfig::default();
        let mut store = store_with(LinkStatus::Confirmed, 0);
        let id = store.link_ids()[0];
        {
            let l = store.link_mut(&id).unwrap();
            l.confidence = 0.8;
            l.reporting_devices.insert("r1".into(), t(0));
        }
        let mut seen = Vec::new();
        for i in 1..4 {
            sweep(&cfg, &mut store, &log(), t(i));
            seen.push(store.link(&id).unwrap().confidence);
        }
        assert_eq!(seen, vec![0.75, 0.7, 0.7]);

        // Links reported from both ends keep their confidence
        let l = store.link_mut(&id).unwrap();
        l.confidence = 1.0;
        l.reporting_devices.insert("r2".into(), t(0));
        sweep(&cfg, &mut store, &log(), t(5));
        assert_eq!(store.link(&id).unwrap().confidence, 1.0);
    }
}
