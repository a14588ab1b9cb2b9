// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Validation and canonicalization of raw neighbor reports.

use std::net::IpAddr;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;

use crate::types::delta;
use protocol::types::DeviceId;
use protocol::types::Endpoint;
use protocol::types::IdentityKey;
use protocol::types::LinkType;
use protocol::types::ObservationBatch;
use protocol::types::RawObservation;
use protocol::types::RejectReason;
use protocol::types::RejectedObservation;
use protocol::MacAddr;

/// A validated neighbor report.  Textual identities are trimmed, and chassis
/// IDs and system names are lower-cased, so they can be compared directly.
#[derive(Clone, Debug, PartialEq)]
pub struct NeighborObservation {
    pub collector_id: String,
    pub observed_at: DateTime<Utc>,
    pub local_device_id: DeviceId,
    pub local_port: String,
    pub remote_chassis_id: Option<String>,
    pub remote_system_name: Option<String>,
    pub remote_ip: Option<IpAddr>,
    pub remote_port: Option<String>,
    pub link_type: LinkType,
}

impl NeighborObservation {
    /// The identity keys this observation carries for its remote end,
    /// strongest first.
    pub fn remote_keys(&self) -> Vec<IdentityKey> {
        let mut keys = Vec::with_capacity(3);
        if let Some(c) = &self.remote_chassis_id {
            keys.push(IdentityKey::ChassisId(c.clone()));
        }
        if let Some(ip) = self.remote_ip {
            keys.push(IdentityKey::ManagementIp(ip));
        }
        if let Some(n) = &self.remote_system_name {
            keys.push(IdentityKey::SystemName(n.clone()));
        }
        keys
    }
}

// Trim a textual field, treating an empty result as absent.
fn clean(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Chassis IDs that look like MAC addresses are rewritten into a single
/// notation.  Anything else is simply lower-cased.
pub fn canonical_chassis_id(chassis_id: &str) -> String {
    match chassis_id.parse::<MacAddr>() {
        Ok(mac) => mac.to_string(),
        Err(_) => chassis_id.to_lowercase(),
    }
}

/// Bring an identity key from another source, such as the registry, into
/// the form produced by the normalizer.
pub fn canonical_key(key: IdentityKey) -> IdentityKey {
    match key {
        IdentityKey::ChassisId(c) => {
            IdentityKey::ChassisId(canonical_chassis_id(c.trim()))
        }
        IdentityKey::SystemName(n) => {
            IdentityKey::SystemName(n.trim().to_lowercase())
        }
        ip => ip,
    }
}

/// Expand a batch into its individual reports, filling in the batch-level
/// device and timestamp wherever an item leaves them out.
pub fn batch_items(batch: &ObservationBatch) -> Vec<RawObservation> {
    batch
        .neighbors
        .iter()
        .map(|raw| {
            let mut raw = raw.clone();
            if clean(&raw.local_device_id).is_none() {
                raw.local_device_id = batch.device_id.clone();
            }
            if raw.observed_at.is_none() {
                raw.observed_at = batch.observed_at;
            }
            raw
        })
        .collect()
}

/// Validate and canonicalize a single raw report.
pub fn normalize(
    collector_id: &str,
    raw: &RawObservation,
    received_at: DateTime<Utc>,
    max_clock_drift: Duration,
) -> Result<NeighborObservation, RejectedObservation> {
    let missing = |what: &str| {
        RejectedObservation::with_detail(RejectReason::MissingFields, what)
    };

    let collector_id = collector_id.trim();
    if collector_id.is_empty() {
        return Err(missing("collector_id"));
    }
    let local_device_id = clean(&raw.local_device_id)
        .ok_or_else(|| missing("local_device_id"))?;
    let local_port =
        clean(&raw.local_port).ok_or_else(|| missing("local_port"))?;

    // The wildcard label stands for a port nobody reported, so no real port
    // may carry it.
    let remote_port = clean(&raw.remote_port);
    for (field, port) in
        [("local_port", Some(&local_port)), ("remote_port", remote_port.as_ref())]
    {
        if port.is_some_and(|p| p == Endpoint::WILDCARD) {
            return Err(RejectedObservation::with_detail(
                RejectReason::InvalidField,
                format!("{field}: {}", Endpoint::WILDCARD),
            ));
        }
    }

    let remote_chassis_id =
        clean(&raw.remote_chassis_id).map(|c| canonical_chassis_id(&c));
    let remote_system_name =
        clean(&raw.remote_system_name).map(|n| n.to_lowercase());
    let remote_ip = clean(&raw.remote_ip);
    if remote_chassis_id.is_none()
        && remote_system_name.is_none()
        && remote_ip.is_none()
    {
        return Err(missing("remote identity"));
    }
    let remote_ip = match remote_ip {
        Some(ip) => Some(ip.parse::<IpAddr>().map_err(|_| {
            RejectedObservation::with_detail(
                RejectReason::InvalidField,
                format!("remote_ip: {ip}"),
            )
        })?),
        None => None,
    };

    let link_type = match clean(&raw.link_type) {
        Some(t) => t.parse::<LinkType>().map_err(|e| {
            RejectedObservation::with_detail(RejectReason::InvalidField, e)
        })?,
        None => LinkType::default(),
    };

    // A collector with a badly skewed clock must not be able to push a
    // link's timestamps into the future.
    let latest = received_at
        .checked_add_signed(delta(max_clock_drift))
        .unwrap_or(received_at);
    let observed_at = match raw.observed_at {
        Some(t) if t <= latest => t,
        _ => received_at,
    };

    Ok(NeighborObservation {
        collector_id: collector_id.to_string(),
        observed_at,
        local_device_id: DeviceId::new(local_device_id),
        local_port,
        remote_chassis_id,
        remote_system_name,
        remote_ip,
        remote_port,
        link_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DRIFT: Duration = Duration::from_secs(60);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn raw() -> RawObservation {
        RawObservation {
            local_device_id: Some("r1".into()),
            local_port: Some("Gi0/1".into()),
            remote_chassis_id: Some("AA:BB".into()),
            remote_port: Some("Eth1/1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_canonicalizes_identities() {
        let mut r = raw();
        r.remote_system_name = Some("  Core-SW1 ".into());
        r.remote_ip = Some(" 10.1.2.3".into());
        let obs = normalize(" c1 ", &r, now(), DRIFT).unwrap();
        assert_eq!(obs.collector_id, "c1");
        assert_eq!(obs.local_device_id, DeviceId::from("r1"));
        assert_eq!(obs.local_port, "Gi0/1");
        assert_eq!(obs.remote_chassis_id.as_deref(), Some("aa:bb"));
        assert_eq!(obs.remote_system_name.as_deref(), Some("core-sw1"));
        assert_eq!(obs.remote_ip, Some("10.1.2.3".parse().unwrap()));
        assert_eq!(obs.remote_port.as_deref(), Some("Eth1/1"));
        assert_eq!(obs.link_type, LinkType::Physical);
        assert_eq!(obs.observed_at, now());
        assert_eq!(
            obs.remote_keys(),
            vec![
                IdentityKey::ChassisId("aa:bb".into()),
                IdentityKey::ManagementIp("10.1.2.3".parse().unwrap()),
                IdentityKey::SystemName("core-sw1".into()),
            ]
        );
    }

    #[test]
    fn test_mac_chassis_ids_converge() {
        assert_eq!(canonical_chassis_id("A8-40-25-00-01-FE"), "a8:40:25:00:01:fe");
        assert_eq!(canonical_chassis_id("a840.2500.01fe"), "a8:40:25:00:01:fe");
        assert_eq!(canonical_chassis_id("R1-Chassis"), "r1-chassis");
        assert_eq!(
            canonical_key(IdentityKey::ChassisId(" A840250001FE".into())),
            IdentityKey::ChassisId("a8:40:25:00:01:fe".into())
        );
        assert_eq!(
            canonical_key(IdentityKey::SystemName("Core-SW1".into())),
            IdentityKey::SystemName("core-sw1".into())
        );
    }

    #[test]
    fn test_missing_fields() {
        let cases = [
            RawObservation {
                local_device_id: None,
                ..raw()
            },
            RawObservation {
                local_port: Some("   ".into()),
                ..raw()
            },
            RawObservation {
                remote_chassis_id: None,
                ..raw()
            },
        ];
        for r in &cases {
            let err = normalize("c1", r, now(), DRIFT).unwrap_err();
            assert_eq!(err.reason, RejectReason::MissingFields, "{r:?}");
        }
        let err = normalize("", &raw(), now(), DRIFT).unwrap_err();
        assert_eq!(err.reason, RejectReason::MissingFields);
    }

    #[test]
    fn test_invalid_fields() {
        let r = RawObservation {
            remote_ip: Some("10.1.2".into()),
            ..raw()
        };
        let err = normalize("c1", &r, now(), DRIFT).unwrap_err();
        assert_eq!(err.reason, RejectReason::InvalidField);

        let r = RawObservation {
            link_type: Some("token-ring".into()),
            ..raw()
        };
        let err = normalize("c1", &r, now(), DRIFT).unwrap_err();
        assert_eq!(err.reason, RejectReason::InvalidField);
    }

    #[test]
    fn test_wildcard_port_label_rejected() {
        let r = RawObservation {
            remote_port: Some(" * ".into()),
            ..raw()
        };
        let err = normalize("c1", &r, now(), DRIFT).unwrap_err();
        assert_eq!(err.reason, RejectReason::InvalidField);
        assert_eq!(err.detail.as_deref(), Some("remote_port: *"));

        let r = RawObservation {
            local_port: Some("*".into()),
            ..raw()
        };
        let err = normalize("c1", &r, now(), DRIFT).unwrap_err();
        assert_eq!(err.detail.as_deref(), Some("local_port: *"));

        // Ports merely containing the character are fine
        let r = RawObservation {
            remote_port: Some("Eth1/*".into()),
            ..raw()
        };
        assert!(normalize("c1", &r, now(), DRIFT).is_ok());
    }

    #[test]
    fn test_clock_skew_is_clamped() {
        let within = now() + chrono::Duration::seconds(30);
        let r = RawObservation {
            observed_at: Some(within),
            ..raw()
        };
        assert_eq!(normalize("c1", &r, now(), DRIFT).unwrap().observed_at, within);

        let skewed = now() + chrono::Duration::seconds(3600);
        let r = RawObservation {
            observed_at: Some(skewed),
            ..raw()
        };
        assert_eq!(normalize("c1", &r, now(), DRIFT).unwrap().observed_at, now());

        let past = now() - chrono::Duration::seconds(20);
        let r = RawObservation {
            observed_at: Some(past),
            ..raw()
        };
        assert_eq!(normalize("c1", &r, now(), DRIFT).unwrap().observed_at, past);
    }

    #[test]
    fn test_batch_defaults() {
        let batch = ObservationBatch {
            collector_id: "c1".into(),
            device_id: Some("r9".into()),
            observed_at: Some(now()),
            neighbors: vec![
                RawObservation {
                    local_device_id: None,
                    ..raw()
                },
                raw(),
            ],
        };
        let items = batch_items(&batch);
        assert_eq!(items[0].local_device_id.as_deref(), Some("r9"));
        assert_eq!(items[1].local_device_id.as_deref(), Some("r1"));
        assert!(items.iter().all(|i| i.observed_at == Some(now())));
    }
}
