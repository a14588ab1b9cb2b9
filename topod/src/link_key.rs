// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::cmp::Ordering;
use std::fmt;

use uuid::Uuid;

use protocol::types::DeviceId;
use protocol::types::Endpoint;
use protocol::types::Link;

// Namespace for the v5 UUIDs derived from link keys.  Changing this value
// changes the id of every link.
const LINK_NAMESPACE: Uuid =
    Uuid::from_u128(0x5f3c_2a9e_1d47_4b8a_9c0e_7a61_d2f4_b803);

/// Direction-independent identity of a link: its two endpoints, sorted by
/// device id and then by port label.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LinkKey {
    a: Endpoint,
    b: Endpoint,
}

fn endpoint_order(x: &Endpoint, y: &Endpoint) -> Ordering {
    x.device_id
        .cmp(&y.device_id)
        .then_with(|| x.port_label().cmp(y.port_label()))
}

impl LinkKey {
    pub fn new(x: Endpoint, y: Endpoint) -> Self {
        if endpoint_order(&x, &y) == Ordering::Greater {
            LinkKey { a: y, b: x }
        } else {
            LinkKey { a: x, b: y }
        }
    }

    /// Build the key for the link implied by a neighbor report.  A missing
    /// remote port becomes a wildcard.
    pub fn build(
        local_device: &DeviceId,
        local_port: &str,
        remote_device: &DeviceId,
        remote_port: Option<&str>,
    ) -> Self {
        LinkKey::new(
            Endpoint::new(local_device.clone(), Some(local_port.to_string())),
            Endpoint::new(
                remote_device.clone(),
                remote_port.map(str::to_string),
            ),
        )
    }

    pub fn of_link(link: &Link) -> Self {
        LinkKey::new(link.endpoint_a.clone(), link.endpoint_b.clone())
    }

    /// The deterministic link id for this key.
    pub fn id(&self) -> Uuid {
        Uuid::new_v5(&LINK_NAMESPACE, self.to_string().as_bytes())
    }

    pub fn endpoint_a(&self) -> &Endpoint {
        &self.a
    }

    pub fn endpoint_b(&self) -> &Endpoint {
        &self.b
    }

    pub fn into_endpoints(self) -> (Endpoint, Endpoint) {
        (self.a, self.b)
    }

    pub fn is_wildcard(&self) -> bool {
        self.a.is_wildcard() || self.b.is_wildcard()
    }

    /// True if both ends are on the same device.
    pub fn is_self_loop(&self) -> bool {
        self.a.device_id == self.b.device_id
    }
}

// Every component is length-prefixed, so no choice of device id or port
// name can make two different keys render identically.
impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for e in [&self.a, &self.b] {
            let dev = e.device_id.as_str();
            let port = e.port_label();
            write!(f, "{}:{dev}{}:{port}", dev.len(), port.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_independent() {
        let r1 = DeviceId::from("r1");
        let r2 = DeviceId::from("r2");
        let fwd = LinkKey::build(&r1, "Gi0/1", &r2, Some("Eth1/1"));
        let rev = LinkKey::build(&r2, "Eth1/1", &r1, Some("Gi0/1"));
        assert_eq!(fwd, rev);
        assert_eq!(fwd.id(), rev.id());
        assert_eq!(fwd.endpoint_a().device_id, r1);
        assert_eq!(fwd.endpoint_b().port.as_deref(), Some("Eth1/1"));
    }

    #[test]
    fn test_same_device_sorted_by_port() {
        let r1 = DeviceId::from("r1");
        let key = LinkKey::build(&r1, "p2", &r1, Some("p1"));
        assert_eq!(key.endpoint_a().port.as_deref(), Some("p1"));
        assert!(key.is_self_loop());
    }

    #[test]
    fn test_wildcard_is_distinct() {
        let r1 = DeviceId::from("r1");
        let r2 = DeviceId::from("r2");
        let known = LinkKey::build(&r1, "Gi0/1", &r2, Some("Eth1/1"));
        let wild = LinkKey::build(&r1, "Gi0/1", &r2, None);
        assert!(wild.is_wildcard());
        assert!(!known.is_wildcard());
        assert_ne!(known.id(), wild.id());
        assert_eq!(wild.endpoint_b().port_label(), Endpoint::WILDCARD);
    }

    #[test]
    fn test_no_separator_collisions() {
        let x = LinkKey::build(
            &DeviceId::from("a:1"),
            "b",
            &DeviceId::from("z"),
            Some("q"),
        );
        let y = LinkKey::build(
            &DeviceId::from("a"),
            "1:b",
            &DeviceId::from("z"),
            Some("q"),
        );
        assert_ne!(x.id(), y.id());
    }
}
