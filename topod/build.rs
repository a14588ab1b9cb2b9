// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

fn main() -> anyhow::Result<()> {
    // Emit detailed build information, for use in the `/build-info` endpoint.
    vergen::EmitBuilder::builder()
        .all_cargo()
        .all_rustc()
        .all_git()
        .emit()
}
