// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Types describing the reconciled network topology: the devices and links
//! it contains, the neighbor observations collectors submit to build it,
//! and the summaries served to API consumers.

pub mod macaddr;
pub mod types;

pub use macaddr::MacAddr;
