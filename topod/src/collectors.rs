// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Bookkeeping for the collectors feeding us observations.  This is purely
//! informational: an unregistered collector may still submit batches.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;

use crate::errors::TopodError;
use crate::types::delta;
use crate::types::TopodResult;
use protocol::types::BatchResponse;
use protocol::types::CollectorHeartbeat;
use protocol::types::CollectorInfo;
use protocol::types::CollectorRegister;
use protocol::types::CollectorStatus;

pub const DEFAULT_COLLECTOR_TIMEOUT: Duration = Duration::from_secs(120);

pub struct CollectorRegistry {
    collectors: BTreeMap<String, CollectorInfo>,
    timeout: Duration,
}

impl CollectorRegistry {
    pub fn new(timeout: Duration) -> Self {
        CollectorRegistry {
            collectors: BTreeMap::new(),
            timeout,
        }
    }

    /// Add a collector, or refresh the identity of one that registers again.
    /// Its observation counters survive re-registration.
    pub fn register(
        &mut self,
        reg: CollectorRegister,
        now: DateTime<Utc>,
    ) -> TopodResult<CollectorInfo> {
        let id = reg.id.trim().to_string();
        if id.is_empty() {
            return Err(TopodError::Invalid("collector id is empty".into()));
        }
        let info = self
            .collectors
            .entry(id.clone())
            .and_modify(|c| {
                c.name = reg.name.clone();
                c.version = reg.version.clone();
                c.status = CollectorStatus::Online;
                c.last_heartbeat = now;
            })
            .or_insert_with(|| CollectorInfo {
                id,
                name: reg.name,
                version: reg.version,
                status: CollectorStatus::Online,
                registered_at: now,
                last_heartbeat: now,
                observations_accepted: 0,
                observations_rejected: 0,
            });
        Ok(info.clone())
    }

    pub fn heartbeat(
        &mut self,
        hb: CollectorHeartbeat,
        now: DateTime<Utc>,
    ) -> TopodResult<CollectorInfo> {
        let c = self.collectors.get_mut(hb.id.trim()).ok_or_else(|| {
            TopodError::Missing(format!("no such collector {}", hb.id))
        })?;
        c.status = hb.status;
        c.last_heartbeat = now;
        Ok(c.clone())
    }

    /// Count the outcome of a batch against the collector that sent it.
    pub fn record_batch(&mut self, collector_id: &str, resp: &BatchResponse) {
        if let Some(c) = self.collectors.get_mut(collector_id.trim()) {
            c.observations_accepted += resp.accepted as u64;
            c.observations_rejected += resp.rejected as u64;
        }
    }

    /// Every collector, with those that have missed their heartbeat
    /// reported as offline.
    pub fn list(&self, now: DateTime<Utc>) -> Vec<CollectorInfo> {
        let timeout = delta(self.timeout);
        self.collectors
            .values()
            .cloned()
            .map(|mut c| {
                if now.signed_duration_since(c.last_heartbeat) > timeout {
                    c.status = CollectorStatus::Offline;
                }
                c
            })
            .collect()
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        CollectorRegistry::new(DEFAULT_COLLECTOR_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::t;

    fn reg(id: &str) -> CollectorRegister {
        CollectorRegister {
            id: id.into(),
            name: format!("{id}-name"),
            version: "1.0".into(),
        }
    }

    #[test]
    fn test_heartbeat_timeout() {
        let mut c = CollectorRegistry::default();
        c.register(reg("c1"), t(0)).unwrap();
        assert_eq!(c.list(t(120))[0].status, CollectorStatus::Online);
        assert_eq!(c.list(t(121))[0].status, CollectorStatus::Offline);

        c.heartbeat(
            CollectorHeartbeat {
                id: "c1".into(),
                status: CollectorStatus::Online,
            },
            t(200),
        )
        .unwrap();
        assert_eq!(c.list(t(250))[0].status, CollectorStatus::Online);

        assert!(matches!(
            c.heartbeat(
                CollectorHeartbeat {
                    id: "nope".into(),
                    status: CollectorStatus::Online,
                },
                t(0),
            ),
            Err(TopodError::Missing(_))
        ));
    }

    #[test]
    fn test_counters_survive_reregistration() {
        let mut c = CollectorRegistry::default();
        assert!(c.register(reg(" "), t(0)).is_err());
        c.register(reg("c1"), t(0)).unwrap();
        let resp = BatchResponse {
            accepted: 3,
            rejected: 1,
            results: Vec::new(),
        };
        c.record_batch("c1", &resp);
        c.record_batch("unregistered", &resp);

        let mut again = reg("c1");
        again.version = "1.1".into();
        let info = c.register(again, t(10)).unwrap();
        assert_eq!(info.version, "1.1");
        assert_eq!(info.registered_at, t(0));
        assert_eq!(
            (info.observations_accepted, info.observations_rejected),
            (3, 1)
        );
        assert_eq!(c.list(t(10)).len(), 1);
    }
}
