// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Folding a resolved neighbor observation into the graph.
//!
//! Each link moves through a small state machine:
//!
//! ```text
//!   absent --> provisional --> confirmed --> stale --> removed
//!                  |   ^          |   ^        |
//!                  |   +----------|---|--------+  (re-observed)
//!                  +-----------> conflicted <--+
//! ```
//!
//! A provisional link is confirmed by a second observation that is both
//! independent (a new collector, or the other end of the link) and close in
//! time to the first.  A confirmed link is never silently replaced: a
//! competing link on the same port has to out-vote it with more recently
//! active collectors before the incumbent is marked conflicted.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use slog::info;
use slog::trace;
use slog::warn;
use uuid::Uuid;

use crate::link_key::LinkKey;
use crate::normalize::NeighborObservation;
use crate::store::GraphStore;
use crate::types::delta;
use crate::types::EngineConfig;
use protocol::types::DeviceId;
use protocol::types::Endpoint;
use protocol::types::Link;
use protocol::types::LinkStatus;
use protocol::types::MergeResult;
use protocol::types::RemovalReason;

/// Confidence is kept to three decimal places, so that repeated increments
/// land on the same values regardless of the order they were applied in.
pub fn round_confidence(c: f64) -> f64 {
    ((c * 1000.0).round() / 1000.0).clamp(0.0, 1.0)
}

fn within(window: Duration, earlier: DateTime<Utc>, later: DateTime<Utc>) -> bool {
    later.signed_duration_since(earlier) <= delta(window)
}

// Two reports are close in time if they are no more than `window` apart, in
// either order.
fn close_in_time(window: Duration, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.signed_duration_since(b).abs() <= delta(window)
}

/// The number of collectors that reported `link` within `window` of `at`.
pub fn active_collectors(link: &Link, at: DateTime<Utc>, window: Duration) -> usize {
    link.confirming_collectors
        .values()
        .filter(|seen| within(window, **seen, at))
        .count()
}

// Orders links by the strength of their claim on a shared port, strongest
// first.  Recent collector support dominates; the remaining fields only
// break ties, and never depend on the order in which reports arrived.
fn strength(a: &Link, b: &Link, at: DateTime<Utc>, window: Duration) -> Ordering {
    active_collectors(b, at, window)
        .cmp(&active_collectors(a, at, window))
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| {
            b.confirming_collectors
                .len()
                .cmp(&a.confirming_collectors.len())
        })
        .then_with(|| a.first_seen_at.cmp(&b.first_seen_at))
        .then_with(|| a.id.cmp(&b.id))
}

// True if the evidence already on a link would confirm it: reports from two
// collectors, or from both ends, close in time to `at`.  Lets a candidate
// that lost a contest try again once it is better supported, without
// waiting for a collector or a side it has never heard from.
fn corroborated(link: &Link, at: DateTime<Utc>, window: Duration) -> bool {
    let recent_collectors = link
        .confirming_collectors
        .values()
        .filter(|seen| close_in_time(window, **seen, at))
        .count();
    let both_sides = link.endpoints().into_iter().all(|e| {
        link.reporting_devices
            .get(&e.device_id)
            .is_some_and(|seen| close_in_time(window, *seen, at))
    });
    recent_collectors >= 2 || both_sides
}

/// True if `candidate` has a stronger claim than `incumbent`.
pub fn beats(
    candidate: &Link,
    incumbent: &Link,
    at: DateTime<Utc>,
    window: Duration,
) -> bool {
    strength(candidate, incumbent, at, window) == Ordering::Less
}

/// Confirmed links other than `link` that share one of its known ports.
fn confirmed_rivals(store: &GraphStore, link: &Link) -> Vec<Uuid> {
    let mut rivals: Vec<Uuid> = link
        .endpoints()
        .into_iter()
        .filter(|e| !e.is_wildcard())
        .flat_map(|e| store.links_at(e))
        .filter(|id| *id != link.id)
        .filter(|id| {
            store
                .link(id)
                .is_some_and(|l| l.status == LinkStatus::Confirmed)
        })
        .collect();
    rivals.sort();
    rivals.dedup();
    rivals
}

/// Combine the evidence for two links describing the same connection.
pub fn fold_links(target: &mut Link, other: &Link) {
    fn rank(s: LinkStatus) -> u8 {
        match s {
            LinkStatus::Confirmed => 4,
            LinkStatus::Provisional => 3,
            LinkStatus::Conflicted => 2,
            LinkStatus::Stale => 1,
            LinkStatus::Removed => 0,
        }
    }

    merge_times(&mut target.confirming_collectors, &other.confirming_collectors);
    merge_times(&mut target.reporting_devices, &other.reporting_devices);
    target.first_seen_at = target.first_seen_at.min(other.first_seen_at);
    target.last_seen_at = target.last_seen_at.max(other.last_seen_at);
    target.confidence = target.confidence.max(other.confidence);
    target.confirmed_at = match (target.confirmed_at, other.confirmed_at) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    if rank(other.status) > rank(target.status) {
        target.status = other.status;
    }
}

fn merge_times<K: Ord + Clone>(
    into: &mut BTreeMap<K, DateTime<Utc>>,
    from: &BTreeMap<K, DateTime<Utc>>,
) {
    for (k, t) in from {
        let e = into.entry(k.clone()).or_insert(*t);
        *e = (*e).max(*t);
    }
}

/// Among a known-port link and any confirmed links that share one of its
/// ports, keep only the strongest confirmed.  Used after identity merges,
/// which can bring two confirmed links onto one port.
pub fn settle_port_conflicts(
    cfg: &EngineConfig,
    store: &mut GraphStore,
    log: &slog::Logger,
    link_id: Uuid,
    at: DateTime<Utc>,
) {
    let Some(link) = store.link(&link_id) else {
        return;
    };
    if link.status != LinkStatus::Confirmed {
        return;
    }
    let rivals = confirmed_rivals(store, link);
    if rivals.is_empty() {
        return;
    }

    let mut contenders: Vec<Link> = std::iter::once(link_id)
        .chain(rivals)
        .filter_map(|id| store.link(&id).cloned())
        .collect();
    contenders.sort_by(|a, b| strength(a, b, at, cfg.confirm_window));
    for loser in &contenders[1..] {
        warn!(log, "conflicting link after merge: {loser}";
            "winner" => %contenders[0].id);
        if let Some(l) = store.link_mut(&loser.id) {
            l.status = LinkStatus::Conflicted;
        }
        store.counters.conflicts_total += 1;
    }
}

// If a report without a remote port names a remote device that already has
// a port-specific link from the same local port, return that link's key.
fn known_port_link(store: &GraphStore, key: &LinkKey) -> Option<LinkKey> {
    let (known, wild) = if key.endpoint_a().is_wildcard() {
        (key.endpoint_b(), key.endpoint_a())
    } else {
        (key.endpoint_a(), key.endpoint_b())
    };
    store
        .links_at(known)
        .into_iter()
        .filter_map(|id| store.link(&id))
        .filter(|l| !l.is_wildcard() && l.touches(&wild.device_id))
        .min_by(|a, b| {
            let unconfirmed = |l: &Link| l.status != LinkStatus::Confirmed;
            unconfirmed(a)
                .cmp(&unconfirmed(b))
                .then_with(|| b.confidence.total_cmp(&a.confidence))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(LinkKey::of_link)
}

// The wildcard links that a port-specific link supersedes: one as seen from
// each end.
fn wildcard_variants(key: &LinkKey) -> [Uuid; 2] {
    let a = key.endpoint_a();
    let b = key.endpoint_b();
    [
        LinkKey::new(a.clone(), Endpoint::new(b.device_id.clone(), None)).id(),
        LinkKey::new(b.clone(), Endpoint::new(a.device_id.clone(), None)).id(),
    ]
}

fn new_link(key: &LinkKey, obs: &NeighborObservation) -> Link {
    Link {
        id: key.id(),
        endpoint_a: key.endpoint_a().clone(),
        endpoint_b: key.endpoint_b().clone(),
        link_type: obs.link_type,
        confidence: 0.0,
        confirming_collectors: BTreeMap::new(),
        reporting_devices: BTreeMap::new(),
        status: LinkStatus::Provisional,
        first_seen_at: obs.observed_at,
        last_seen_at: obs.observed_at,
        confirmed_at: None,
    }
}

/// Fold one observation, already resolved to the reporting device `local`
/// and the link `key`, into the graph.
pub fn merge(
    cfg: &EngineConfig,
    store: &mut GraphStore,
    log: &slog::Logger,
    obs: &NeighborObservation,
    local: &DeviceId,
    key: LinkKey,
) -> MergeResult {
    let at = obs.observed_at;
    let window = cfg.confirm_window;

    // A report without a remote port only refreshes a link whose remote
    // port is already known; it is no evidence for that port.
    let known = match key.is_wildcard() {
        true => known_port_link(store, &key),
        false => None,
    };
    let refresh_only = known.is_some();
    let key = known.unwrap_or(key);
    assert!(
        !key.is_self_loop(),
        "invariant violation: observation from {local} resolved to a self-loop"
    );
    let id = key.id();

    // Start from the existing link if there is one, otherwise from whatever
    // evidence was gathered while the remote port was still unknown.
    let mut absorbed = Vec::new();
    if !key.is_wildcard() {
        for wid in wildcard_variants(&key) {
            if let Some(w) = store.remove_link(&wid) {
                absorbed.push(w);
            }
        }
    }
    let existing = store.link(&id).cloned();
    let created = existing.is_none();
    let (mut link, prev_confidence, fresh) = match existing {
        Some(mut l) => {
            let c = l.confidence;
            let status = l.status;
            for w in &absorbed {
                fold_links(&mut l, w);
            }
            l.status = status;
            (l, c, false)
        }
        None if !absorbed.is_empty() => {
            let mut l = new_link(&key, obs);
            l.first_seen_at = absorbed[0].first_seen_at;
            l.last_seen_at = absorbed[0].last_seen_at;
            for w in &absorbed {
                fold_links(&mut l, w);
            }
            l.status = LinkStatus::Provisional;
            let c = l.confidence;
            (l, c, false)
        }
        None => (new_link(&key, obs), 0.0, true),
    };
    for w in absorbed {
        info!(log, "superseded wildcard link {w}"; "by" => %id);
        store.tombstone(w, RemovalReason::Superseded, at);
        store.counters.links_removed_total += 1;
    }
    if created {
        store.counters.links_created_total += 1;
    }

    let was = link.status;
    let new_collector = !link.confirming_collectors.contains_key(&obs.collector_id);
    let new_side = !link.reporting_devices.contains_key(local);
    let independent = new_collector || new_side;
    let proximate = close_in_time(window, link.last_seen_at, at);

    if refresh_only {
        if let Some(seen) = link.confirming_collectors.get_mut(&obs.collector_id)
        {
            *seen = (*seen).max(at);
        }
        if let Some(seen) = link.reporting_devices.get_mut(local) {
            *seen = (*seen).max(at);
        }
    } else {
        let seen = link
            .confirming_collectors
            .entry(obs.collector_id.clone())
            .or_insert(at);
        *seen = (*seen).max(at);
        let seen = link.reporting_devices.entry(local.clone()).or_insert(at);
        *seen = (*seen).max(at);
    }
    link.first_seen_at = link.first_seen_at.min(at);
    link.last_seen_at = link.last_seen_at.max(at);
    link.link_type = obs.link_type;

    let mut confidence = link.confidence;
    let mut want_confirmed = false;
    if fresh {
        confidence = cfg.initial_confidence;
    } else if refresh_only {
        if link.status == LinkStatus::Stale {
            link.status = LinkStatus::Provisional;
            want_confirmed = link.confirmed_at.is_some();
        }
    } else {
        match link.status {
            LinkStatus::Provisional => {
                if independent && proximate {
                    confidence += cfg.confirm_increment;
                    want_confirmed = true;
                } else if corroborated(&link, at, window) {
                    want_confirmed = true;
                }
            }
            LinkStatus::Confirmed => {
                let bidirectional = link.endpoints().into_iter().all(|e| {
                    link.reporting_devices
                        .get(&e.device_id)
                        .is_some_and(|seen| within(window, *seen, at))
                });
                if bidirectional || new_collector {
                    confidence += cfg.confirm_increment;
                } else if confidence < cfg.one_sided_floor {
                    confidence =
                        (confidence + cfg.decay_step).min(cfg.one_sided_floor);
                }
            }
            LinkStatus::Conflicted => {
                if independent && proximate {
                    confidence += cfg.confirm_increment;
                }
                want_confirmed = true;
            }
            LinkStatus::Stale => {
                link.status = LinkStatus::Provisional;
                want_confirmed = link.confirmed_at.is_some();
            }
            LinkStatus::Removed => {
                panic!("invariant violation: removed link {link} is live")
            }
        }
    }
    if link.is_wildcard() {
        confidence = confidence.min(cfg.wildcard_cap);
        want_confirmed = false;
    }
    // A reconfirming observation never lowers confidence.
    link.confidence = round_confidence(confidence.max(link.confidence));

    let rivals = match link.is_wildcard() {
        true => Vec::new(),
        false => confirmed_rivals(store, &link),
    };
    if want_confirmed {
        let wins = rivals.iter().all(|r| {
            store
                .link(r)
                .map_or(true, |incumbent| beats(&link, incumbent, at, window))
        });
        if wins {
            for r in &rivals {
                if let Some(incumbent) = store.link_mut(r) {
                    incumbent.status = LinkStatus::Conflicted;
                    warn!(log, "link conflicted by a rewiring: {incumbent}";
                        "winner" => %link.id);
                }
                store.counters.conflicts_total += 1;
            }
            link.status = LinkStatus::Confirmed;
            link.confirmed_at.get_or_insert(at);
            store.counters.links_confirmed_total += 1;
            info!(log, "confirmed link {link}";
                "collector" => &obs.collector_id);
        }
    }
    if link.status != LinkStatus::Confirmed && !rivals.is_empty() {
        store.counters.discrepancies_total += 1;
        warn!(log, "discrepancy: {link} disagrees with a confirmed link";
            "collector" => &obs.collector_id,
            "confirmed" => %rivals[0]);
    }

    if fresh {
        info!(log, "new link {link}"; "collector" => &obs.collector_id);
    } else if was == link.status {
        trace!(log, "refreshed link {link}";
            "collector" => &obs.collector_id);
    }

    let result = MergeResult {
        link_id: link.id,
        status: link.status,
        confidence_delta: round_confidence(link.confidence - prev_confidence),
    };
    store.upsert_link(link);
    result
}
