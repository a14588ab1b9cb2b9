// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// An EUI-48 MAC address.  Collectors frequently report a neighbor's chassis
/// ID as a MAC address, each in the notation favored by the device vendor.
#[derive(
    Clone,
    Copy,
    Deserialize,
    JsonSchema,
    Serialize,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
)]
pub struct MacAddr {
    a: [u8; 6],
}

impl From<[u8; 6]> for MacAddr {
    fn from(a: [u8; 6]) -> Self {
        Self { a }
    }
}

impl From<MacAddr> for [u8; 6] {
    fn from(mac: MacAddr) -> [u8; 6] {
        mac.a
    }
}

impl MacAddr {
    /// Create a new MAC address from octets in network byte order.
    pub fn new(o0: u8, o1: u8, o2: u8, o3: u8, o4: u8, o5: u8) -> MacAddr {
        MacAddr {
            a: [o0, o1, o2, o3, o4, o5],
        }
    }

    /// Return `true` if `self` is the null MAC address, all zeros.
    pub fn is_null(self) -> bool {
        self.a == [0u8; 6]
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacError {
    /// Too few hex digits to be a valid MAC address
    #[error("Too few octets")]
    TooShort,
    /// Too many hex digits to be a valid MAC address
    #[error("Too many octets")]
    TooLong,
    /// Found a non-hexadecimal character or a misplaced separator
    #[error("Invalid octet")]
    InvalidOctet,
}

// Split `s` on `sep` into groups of exactly `width` hex digits each, and
// concatenate the digits.
fn collect_groups(
    s: &str,
    sep: char,
    groups: usize,
    width: usize,
) -> Result<String, MacError> {
    let parts: Vec<&str> = s.split(sep).collect();
    match parts.len().cmp(&groups) {
        std::cmp::Ordering::Less => return Err(MacError::TooShort),
        std::cmp::Ordering::Greater => return Err(MacError::TooLong),
        std::cmp::Ordering::Equal => {}
    }
    let mut digits = String::with_capacity(12);
    for part in parts {
        if part.len() != width {
            return Err(MacError::InvalidOctet);
        }
        digits.push_str(part);
    }
    Ok(digits)
}

impl FromStr for MacAddr {
    type Err = MacError;

    /// Accepts the colon (`aa:bb:cc:dd:ee:ff`), dash (`AA-BB-CC-DD-EE-FF`),
    /// dotted (`aabb.ccdd.eeff`) and bare (`aabbccddeeff`) notations.
    fn from_str(s: &str) -> Result<Self, MacError> {
        let digits = if s.contains(':') {
            collect_groups(s, ':', 6, 2)?
        } else if s.contains('-') {
            collect_groups(s, '-', 6, 2)?
        } else if s.contains('.') {
            collect_groups(s, '.', 3, 4)?
        } else {
            match s.len().cmp(&12) {
                std::cmp::Ordering::Less => return Err(MacError::TooShort),
                std::cmp::Ordering::Greater => return Err(MacError::TooLong),
                std::cmp::Ordering::Equal => s.to_string(),
            }
        };
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MacError::InvalidOctet);
        }

        let mut m = MacAddr { a: [0u8; 6] };
        for i in 0..6 {
            let octet = digits
                .get(2 * i..2 * i + 2)
                .ok_or(MacError::InvalidOctet)?;
            m.a[i] = u8::from_str_radix(octet, 16)
                .map_err(|_| MacError::InvalidOctet)?;
        }
        Ok(m)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.a[0], self.a[1], self.a[2], self.a[3], self.a[4], self.a[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notations() {
        let want = MacAddr::new(0xa8, 0x40, 0x25, 0x00, 0x01, 0xfe);
        for s in [
            "a8:40:25:00:01:fe",
            "A8:40:25:00:01:FE",
            "a8-40-25-00-01-fe",
            "a840.2500.01fe",
            "a840250001fe",
        ] {
            assert_eq!(s.parse::<MacAddr>(), Ok(want), "parsing {s}");
        }
        assert_eq!(want.to_string(), "a8:40:25:00:01:fe");
    }

    #[test]
    fn test_rejects() {
        assert_eq!("aa:bb".parse::<MacAddr>(), Err(MacError::TooShort));
        assert_eq!(
            "aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>(),
            Err(MacError::TooLong)
        );
        assert_eq!(
            "aa:bb:cc:dd:ee:fg".parse::<MacAddr>(),
            Err(MacError::InvalidOctet)
        );
        assert_eq!(
            "aab.bccdd.eeff".parse::<MacAddr>(),
            Err(MacError::InvalidOctet)
        );
        assert!("switch-1".parse::<MacAddr>().is_err());
        assert!(MacAddr::from([0u8; 6]).is_null());
    }
}
