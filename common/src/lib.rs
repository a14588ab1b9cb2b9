// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::BTreeSet;
use std::iter::FromIterator;

pub mod logging;

/// The default port on which the topology API server listens.
pub const DEFAULT_TOPOD_PORT: u16 = 12240;

/// Given two arrays, return two vectors containing only the unique items from each array.
pub fn purge_common<T>(a: &[T], b: &[T]) -> (Vec<T>, Vec<T>)
where
    T: std::cmp::Ord + std::clone::Clone,
{
    let set_a = BTreeSet::from_iter(a.to_vec());
    let set_b = BTreeSet::from_iter(b.to_vec());
    let common: BTreeSet<T> = set_a.intersection(&set_b).cloned().collect();

    (
        a.iter().filter(|e| !common.contains(e)).cloned().collect(),
        b.iter().filter(|e| !common.contains(e)).cloned().collect(),
    )
}

#[test]
fn test_purge() {
    use std::net::Ipv4Addr;
    use std::net::SocketAddr;

    let a = vec!["a", "b", "c", "d"];
    let b = vec!["c", "d", "e", "f"];
    let (mut unique_a, mut unique_b) = purge_common(&a, &b);
    unique_a.sort();
    unique_b.sort();
    assert_eq!(unique_a, vec!["a", "b"]);
    assert_eq!(unique_b, vec!["e", "f"]);

    // The api server manager compares the configured listen addresses
    // against the running servers.
    let configured: Vec<SocketAddr> = vec![
        (Ipv4Addr::new(127, 0, 0, 1), DEFAULT_TOPOD_PORT).into(),
        (Ipv4Addr::new(10, 0, 0, 1), DEFAULT_TOPOD_PORT).into(),
    ];
    let active: Vec<SocketAddr> = vec![
        (Ipv4Addr::new(127, 0, 0, 1), DEFAULT_TOPOD_PORT).into(),
        (Ipv4Addr::new(10, 0, 0, 2), 8080).into(),
    ];
    let (add, remove) = purge_common(&configured, &active);
    assert_eq!(add, vec![configured[1]]);
    assert_eq!(remove, vec![active[1]]);

    let (add, remove) = purge_common(&configured, &configured);
    assert!(add.is_empty());
    assert!(remove.is_empty());
}
