// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Stable identity of a device in the topology graph.  Registry-known
/// devices carry the registry's id; shadow devices carry an id synthesized
/// from the strongest identity key they were first seen with.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build the id of a shadow device first referenced by `key`.
    pub fn shadow(key: &IdentityKey) -> Self {
        DeviceId(format!("shadow:{key}"))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        DeviceId(s)
    }
}

/// An attribute by which a device can be recognized in a neighbor report.
///
/// The variants are declared strongest first, so the derived ordering sorts
/// a set of keys from the most to the least trustworthy.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IdentityKey {
    ChassisId(String),
    ManagementIp(IpAddr),
    SystemName(String),
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IdentityKey::ChassisId(c) => write!(f, "chassis/{c}"),
            IdentityKey::ManagementIp(ip) => write!(f, "ip/{ip}"),
            IdentityKey::SystemName(n) => write!(f, "name/{n}"),
        }
    }
}

/// A node in the topology graph.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Device {
    pub id: DeviceId,
    /// Display name, as provided by the registry
    pub name: Option<String>,
    /// Every alias by which this device is known
    pub identity_keys: BTreeSet<IdentityKey>,
    /// True if this device exists only because a neighbor report referred to
    /// it, and the registry has not (yet) vouched for it.
    pub is_shadow: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Device {
    pub fn new(id: DeviceId, is_shadow: bool, now: DateTime<Utc>) -> Self {
        Device {
            id,
            name: None,
            identity_keys: BTreeSet::new(),
            is_shadow,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_seen_at = self.last_seen_at.max(at);
    }
}

/// One end of a link.  A `port` of `None` is a wildcard: the remote port was
/// not present in the report that created the link.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub struct Endpoint {
    pub device_id: DeviceId,
    pub port: Option<String>,
}

impl Endpoint {
    /// Label used for the port when building link keys and for display.
    pub const WILDCARD: &'static str = "*";

    pub fn new(device_id: DeviceId, port: Option<String>) -> Self {
        Endpoint { device_id, port }
    }

    pub fn port_label(&self) -> &str {
        self.port.as_deref().unwrap_or(Self::WILDCARD)
    }

    pub fn is_wildcard(&self) -> bool {
        self.port.is_none()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.port_label())
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    #[default]
    Physical,
    Logical,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkType::Physical => write!(f, "physical"),
            LinkType::Logical => write!(f, "logical"),
        }
    }
}

impl FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "physical" | "ethernet" | "fiber" | "wireless" => {
                Ok(LinkType::Physical)
            }
            "logical" | "virtual" => Ok(LinkType::Logical),
            x => Err(format!("unknown link type: {x}")),
        }
    }
}

/// Lifecycle state of a link.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// Seen once, not yet corroborated
    Provisional,
    /// Corroborated by an independent observation
    Confirmed,
    /// Lost a port to a better-supported competing link
    Conflicted,
    /// Not reconfirmed within the staleness TTL
    Stale,
    /// Expired or deprovisioned; only ever found in the tombstone log
    Removed,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            LinkStatus::Provisional => "provisional",
            LinkStatus::Confirmed => "confirmed",
            LinkStatus::Conflicted => "conflicted",
            LinkStatus::Stale => "stale",
            LinkStatus::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// An edge in the topology graph.  The endpoints are stored in canonical
/// order, so the same physical link always has the same id no matter which
/// side reported it.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Link {
    pub id: Uuid,
    pub endpoint_a: Endpoint,
    pub endpoint_b: Endpoint,
    pub link_type: LinkType,
    /// Estimate of this link's correctness, in [0, 1]
    pub confidence: f64,
    /// Every collector that has reported this link, with the time of its
    /// latest report
    pub confirming_collectors: BTreeMap<String, DateTime<Utc>>,
    /// Endpoint devices from whose side this link has been reported, with
    /// the time of the latest report from each side
    pub reporting_devices: BTreeMap<DeviceId, DateTime<Utc>>,
    pub status: LinkStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// When the link was first confirmed, if it ever was
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Link {
    pub fn is_wildcard(&self) -> bool {
        self.endpoint_a.is_wildcard() || self.endpoint_b.is_wildcard()
    }

    pub fn touches(&self, device: &DeviceId) -> bool {
        &self.endpoint_a.device_id == device
            || &self.endpoint_b.device_id == device
    }

    pub fn endpoints(&self) -> [&Endpoint; 2] {
        [&self.endpoint_a, &self.endpoint_b]
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} <-> {} [{} {}, confidence {:.2}]",
            self.endpoint_a,
            self.endpoint_b,
            self.link_type,
            self.status,
            self.confidence
        )
    }
}

/// Why a link left the serving graph.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Not reconfirmed within the removal TTL
    Expired,
    /// One of its endpoint devices was deprovisioned
    Deprovisioned,
    /// Folded into a link with a known remote port
    Superseded,
    /// Both ends collapsed onto one device after an identity merge
    SelfLoop,
}

/// Audit record of a removed link.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Tombstone {
    pub link: Link,
    pub removed_at: DateTime<Utc>,
    pub reason: RemovalReason,
}

/// A single neighbor report, as submitted by a collector.  Every field is
/// optional on the wire; validation happens when the report is normalized.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct RawObservation {
    pub local_device_id: Option<String>,
    pub local_port: Option<String>,
    pub remote_chassis_id: Option<String>,
    pub remote_system_name: Option<String>,
    pub remote_ip: Option<String>,
    pub remote_port: Option<String>,
    pub link_type: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
}

/// The neighbor reports gathered by one collector from one device during a
/// poll cycle.  `device_id` and `observed_at` apply to every item that does
/// not provide its own.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ObservationBatch {
    pub collector_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    pub neighbors: Vec<RawObservation>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// Missing the local device, the local port, or every remote identity
    MissingFields,
    /// A field is present but unusable
    InvalidField,
    /// The reporting device is unknown to both the graph and the registry
    UnknownLocalDevice,
    /// The remote end resolved to the reporting device itself
    SelfReference,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RejectReason::MissingFields => "missing-fields",
            RejectReason::InvalidField => "invalid-field",
            RejectReason::UnknownLocalDevice => "unknown-local-device",
            RejectReason::SelfReference => "self-reference",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct RejectedObservation {
    pub reason: RejectReason,
    pub detail: Option<String>,
}

impl RejectedObservation {
    pub fn new(reason: RejectReason) -> Self {
        RejectedObservation {
            reason,
            detail: None,
        }
    }

    pub fn with_detail(reason: RejectReason, detail: impl ToString) -> Self {
        RejectedObservation {
            reason,
            detail: Some(detail.to_string()),
        }
    }
}

impl fmt::Display for RejectedObservation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "{}: {d}", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// The effect of folding one observation into the graph.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct MergeResult {
    pub link_id: Uuid,
    pub status: LinkStatus,
    pub confidence_delta: f64,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ItemOutcome {
    Accepted(MergeResult),
    Rejected(RejectedObservation),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ItemResult {
    /// Position of the item within the submitted batch
    pub index: usize,
    pub outcome: ItemOutcome,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct BatchResponse {
    pub accepted: usize,
    pub rejected: usize,
    pub results: Vec<ItemResult>,
}

impl From<Vec<ItemResult>> for BatchResponse {
    fn from(results: Vec<ItemResult>) -> Self {
        let accepted = results
            .iter()
            .filter(|r| matches!(r.outcome, ItemOutcome::Accepted(_)))
            .count();
        BatchResponse {
            accepted,
            rejected: results.len() - accepted,
            results,
        }
    }
}

/// Selects which parts of the graph a snapshot should contain.  By default
/// only confirmed and provisional links are returned.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct SnapshotFilter {
    #[serde(default)]
    pub include_stale: bool,
    #[serde(default)]
    pub include_conflicted: bool,
    /// Limit the snapshot to this device and its immediate neighbors
    #[serde(default)]
    pub device_id: Option<DeviceId>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct StatusCounts {
    pub provisional: usize,
    pub confirmed: usize,
    pub conflicted: usize,
    pub stale: usize,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct TypeCounts {
    pub physical: usize,
    pub logical: usize,
}

/// Running totals kept by the reconciliation engine.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct EngineCounters {
    pub observations_total: u64,
    pub observations_rejected_total: u64,
    pub links_created_total: u64,
    pub links_confirmed_total: u64,
    pub conflicts_total: u64,
    pub discrepancies_total: u64,
    pub links_aged_out_total: u64,
    pub links_removed_total: u64,
    pub identity_merges_total: u64,
    pub shadow_devices_created_total: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct TopologyStats {
    pub devices_total: usize,
    pub shadow_devices: usize,
    /// Links in the graph, in any live state
    pub links_total: usize,
    pub by_status: StatusCounts,
    pub by_type: TypeCounts,
    /// Mean confidence of the confirmed and provisional links
    pub average_confidence: f64,
    pub tombstones: usize,
    pub counters: EngineCounters,
}

/// A point-in-time copy of the topology, as served to the dashboard.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct TopologyGraph {
    pub generated_at: DateTime<Utc>,
    pub devices: Vec<Device>,
    pub links: Vec<Link>,
    pub stats: TopologyStats,
}

/// A device as known to the registry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct RegisteredDevice {
    pub id: DeviceId,
    #[serde(default)]
    pub name: Option<String>,
    pub identity_keys: BTreeSet<IdentityKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct CollectorRegister {
    pub id: String,
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct CollectorHeartbeat {
    pub id: String,
    pub status: CollectorStatus,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CollectorStatus {
    Online,
    Offline,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct CollectorInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: CollectorStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub observations_accepted: u64,
    pub observations_rejected: u64,
}

/// Detailed build information about `topod`.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct BuildInfo {
    pub version: String,
    pub git_sha: String,
    pub git_commit_timestamp: String,
    pub git_branch: String,
    pub rustc_semver: String,
    pub rustc_channel: String,
    pub rustc_host_triple: String,
    pub rustc_commit_sha: String,
    pub cargo_triple: String,
    pub debug: bool,
    pub opt_level: u8,
}
