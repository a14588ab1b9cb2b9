// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Client library for the topology daemon.

/// Return the default port on which the `topod` API server listens for
/// clients.
pub const fn default_port() -> u16 {
    ::common::DEFAULT_TOPOD_PORT
}

// Automatically generate the client bindings using Progenitor.  The daemon
// and its clients share one data model, so every schema other than the
// error body maps back onto the type in `protocol`.
progenitor::generate_api!(
    spec = "../openapi/topod.json",
    interface = Positional,
    inner_type = slog::Logger,
    pre_hook = (|log: &slog::Logger, request: &reqwest::Request| {
        slog::trace!(log, "client request";
            "method" => %request.method(),
            "uri" => %request.url(),
            "body" => ?&request.body(),
        );
    }),
    post_hook = (|log: &slog::Logger, result: &Result<_, _>| {
        slog::trace!(log, "client response"; "result" => ?result);
    }),
    derives = [PartialEq],
    replace = {
        BatchResponse = protocol::types::BatchResponse,
        BuildInfo = protocol::types::BuildInfo,
        CollectorHeartbeat = protocol::types::CollectorHeartbeat,
        CollectorInfo = protocol::types::CollectorInfo,
        CollectorRegister = protocol::types::CollectorRegister,
        CollectorStatus = protocol::types::CollectorStatus,
        Device = protocol::types::Device,
        Endpoint = protocol::types::Endpoint,
        EngineCounters = protocol::types::EngineCounters,
        IdentityKey = protocol::types::IdentityKey,
        ItemOutcome = protocol::types::ItemOutcome,
        ItemResult = protocol::types::ItemResult,
        Link = protocol::types::Link,
        LinkStatus = protocol::types::LinkStatus,
        LinkType = protocol::types::LinkType,
        MergeResult = protocol::types::MergeResult,
        ObservationBatch = protocol::types::ObservationBatch,
        RawObservation = protocol::types::RawObservation,
        RegisteredDevice = protocol::types::RegisteredDevice,
        RejectReason = protocol::types::RejectReason,
        RejectedObservation = protocol::types::RejectedObservation,
        RemovalReason = protocol::types::RemovalReason,
        StatusCounts = protocol::types::StatusCounts,
        Tombstone = protocol::types::Tombstone,
        TopologyGraph = protocol::types::TopologyGraph,
        TopologyStats = protocol::types::TopologyStats,
        TypeCounts = protocol::types::TypeCounts,
    },
);
