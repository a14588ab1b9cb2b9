// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Topology HTTP API endpoint functions.

use std::collections::HashMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use dropshot::endpoint;
use dropshot::HttpError;
use dropshot::HttpResponseCreated;
use dropshot::HttpResponseDeleted;
use dropshot::HttpResponseOk;
use dropshot::Path;
use dropshot::Query;
use dropshot::RequestContext;
use dropshot::TypedBody;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;

use crate::query;
use crate::types::TopodResult;
use crate::Global;
use crate::TopodError;
use protocol::types::BatchResponse;
use protocol::types::BuildInfo;
use protocol::types::CollectorHeartbeat;
use protocol::types::CollectorInfo;
use protocol::types::CollectorRegister;
use protocol::types::Device;
use protocol::types::DeviceId;
use protocol::types::ObservationBatch;
use protocol::types::RegisteredDevice;
use protocol::types::SnapshotFilter;
use protocol::types::Tombstone;
use protocol::types::TopologyGraph;
use protocol::types::TopologyStats;

type ApiServer = dropshot::HttpServer<Arc<Global>>;

/// Largest request body accepted.  Sized for a batch covering a few hundred
/// neighbors.
const REQUEST_BODY_MAX_BYTES: usize = 1 << 20;

pub fn current_build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_sha: env!("VERGEN_GIT_SHA").to_string(),
        git_commit_timestamp: env!("VERGEN_GIT_COMMIT_TIMESTAMP").to_string(),
        git_branch: env!("VERGEN_GIT_BRANCH").to_string(),
        rustc_semver: env!("VERGEN_RUSTC_SEMVER").to_string(),
        rustc_channel: env!("VERGEN_RUSTC_CHANNEL").to_string(),
        rustc_host_triple: env!("VERGEN_RUSTC_HOST_TRIPLE").to_string(),
        rustc_commit_sha: env!("VERGEN_RUSTC_COMMIT_HASH").to_string(),
        cargo_triple: env!("VERGEN_CARGO_TARGET_TRIPLE").to_string(),
        debug: env!("VERGEN_CARGO_DEBUG") == "true",
        opt_level: env!("VERGEN_CARGO_OPT_LEVEL").parse().unwrap_or_default(),
    }
}

/// Hand a batch to the engine and charge its outcome to the collector.
pub async fn submit_batch(
    global: &Global,
    batch: ObservationBatch,
) -> TopodResult<BatchResponse> {
    let collector_id = batch.collector_id.clone();
    let resp = global.engine.submit(batch, Utc::now()).await?;
    global
        .collectors
        .lock()
        .unwrap()
        .record_batch(&collector_id, &resp);
    Ok(resp)
}

/// Submit a batch of neighbor observations from a collector.  Each item is
/// accepted or rejected on its own.
#[endpoint {
    method = POST,
    path = "/observations",
}]
async fn observations_submit(
    rqctx: RequestContext<Arc<Global>>,
    body: TypedBody<ObservationBatch>,
) -> Result<HttpResponseOk<BatchResponse>, HttpError> {
    let global: &Global = rqctx.context();
    let batch = body.into_inner();
    debug!(global.log, "batch of {} from {}",
        batch.neighbors.len(), batch.collector_id);
    submit_batch(global, batch)
        .await
        .map(HttpResponseOk)
        .map_err(|e| e.into())
}

#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
struct TopologyQueryParams {
    /// Include links that have not been reconfirmed recently
    include_stale: Option<bool>,
    /// Include links that lost a port to a competing link
    include_conflicted: Option<bool>,
    /// Limit the result to this device and its immediate neighbors
    device_id: Option<String>,
}

impl From<TopologyQueryParams> for SnapshotFilter {
    fn from(q: TopologyQueryParams) -> Self {
        SnapshotFilter {
            include_stale: q.include_stale.unwrap_or(false),
            include_conflicted: q.include_conflicted.unwrap_or(false),
            device_id: q.device_id.map(DeviceId::from),
        }
    }
}

pub fn topology_get_common(
    global: &Global,
    filter: &SnapshotFilter,
) -> TopodResult<TopologyGraph> {
    let snap = global.engine.snapshot();
    if let Some(id) = &filter.device_id {
        if query::device(&snap, id).is_none() {
            return Err(TopodError::Missing(format!("no such device {id}")));
        }
    }
    Ok(query::topology(&snap, filter))
}

/// Return the current topology graph
#[endpoint {
    method = GET,
    path = "/topology",
}]
async fn topology_get(
    rqctx: RequestContext<Arc<Global>>,
    params: Query<TopologyQueryParams>,
) -> Result<HttpResponseOk<TopologyGraph>, HttpError> {
    let global: &Global = rqctx.context();
    let filter = SnapshotFilter::from(params.into_inner());
    topology_get_common(global, &filter)
        .map(HttpResponseOk)
        .map_err(|e| e.into())
}

/// Return summary statistics about the topology graph
#[endpoint {
    method = GET,
    path = "/topology/stats",
}]
async fn topology_stats(
    rqctx: RequestContext<Arc<Global>>,
) -> Result<HttpResponseOk<TopologyStats>, HttpError> {
    let global: &Global = rqctx.context();
    Ok(HttpResponseOk(query::stats(&global.engine.snapshot())))
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct TombstoneQueryParams {
    /// Return at most this many entries
    limit: Option<u32>,
}

/// Return the most recently removed links, newest first
#[endpoint {
    method = GET,
    path = "/topology/tombstones",
}]
async fn topology_tombstones(
    rqctx: RequestContext<Arc<Global>>,
    params: Query<TombstoneQueryParams>,
) -> Result<HttpResponseOk<Vec<Tombstone>>, HttpError> {
    let global: &Global = rqctx.context();
    let limit = params.into_inner().limit.map(|l| l as usize);
    Ok(HttpResponseOk(query::tombstones(&global.engine.snapshot(), limit)))
}

/// Return every device in the topology graph
#[endpoint {
    method = GET,
    path = "/devices",
}]
async fn device_list(
    rqctx: RequestContext<Arc<Global>>,
) -> Result<HttpResponseOk<Vec<Device>>, HttpError> {
    let global: &Global = rqctx.context();
    Ok(HttpResponseOk(global.engine.snapshot().devices.clone()))
}

#[derive(Deserialize, Serialize, JsonSchema)]
struct DevicePathParams {
    device_id: String,
}

/// Return a single device.  The id of a device absorbed by an identity merge
/// returns the device it was merged into.
#[endpoint {
    method = GET,
    path = "/devices/{device_id}",
}]
async fn device_get(
    rqctx: RequestContext<Arc<Global>>,
    path: Path<DevicePathParams>,
) -> Result<HttpResponseOk<Device>, HttpError> {
    let global: &Global = rqctx.context();
    let id = DeviceId::from(path.into_inner().device_id);
    query::device(&global.engine.snapshot(), &id)
        .ok_or(TopodError::Missing(format!("no such device {id}")))
        .map(HttpResponseOk)
        .map_err(|e| e.into())
}

/// Deprovision a device, removing it from both the graph and the registry.
/// Every link ending on the device is removed with it.
#[endpoint {
    method = DELETE,
    path = "/devices/{device_id}",
}]
async fn device_del(
    rqctx: RequestContext<Arc<Global>>,
    path: Path<DevicePathParams>,
) -> Result<HttpResponseDeleted, HttpError> {
    let global: &Global = rqctx.context();
    let id = DeviceId::from(path.into_inner().device_id);
    info!(global.log, "deprovisioning {id}");
    global
        .engine
        .deprovision(id)
        .await
        .map(|_| HttpResponseDeleted())
        .map_err(|e| e.into())
}

pub async fn registry_put_common(
    global: &Global,
    id: &str,
    device: RegisteredDevice,
) -> TopodResult<Device> {
    if device.id.as_str() != id {
        return Err(TopodError::Invalid(format!(
            "body id {} does not match path id {id}",
            device.id
        )));
    }
    global.engine.register_device(device).await
}

/// Add or update a registry entry.  Shadow devices sharing an identity key
/// with the entry are merged into the registered device.
#[endpoint {
    method = PUT,
    path = "/registry/devices/{device_id}",
}]
async fn registry_device_put(
    rqctx: RequestContext<Arc<Global>>,
    path: Path<DevicePathParams>,
    body: TypedBody<RegisteredDevice>,
) -> Result<HttpResponseOk<Device>, HttpError> {
    let global: &Global = rqctx.context();
    let id = path.into_inner().device_id;
    registry_put_common(global, &id, body.into_inner())
        .await
        .map(HttpResponseOk)
        .map_err(|e| e.into())
}

/// Return the contents of the device registry
#[endpoint {
    method = GET,
    path = "/registry/devices",
}]
async fn registry_device_list(
    rqctx: RequestContext<Arc<Global>>,
) -> Result<HttpResponseOk<Vec<RegisteredDevice>>, HttpError> {
    let global: &Global = rqctx.context();
    Ok(HttpResponseOk(global.registry.list()))
}

/// Register a collector
#[endpoint {
    method = POST,
    path = "/collectors/register",
}]
async fn collector_register(
    rqctx: RequestContext<Arc<Global>>,
    body: TypedBody<CollectorRegister>,
) -> Result<HttpResponseCreated<CollectorInfo>, HttpError> {
    let global: &Global = rqctx.context();
    let reg = body.into_inner();
    info!(global.log, "registering collector {}", reg.id;
        "name" => &reg.name, "version" => &reg.version);
    global
        .collectors
        .lock()
        .unwrap()
        .register(reg, Utc::now())
        .map(HttpResponseCreated)
        .map_err(|e| e.into())
}

/// Record a heartbeat from a registered collector
#[endpoint {
    method = POST,
    path = "/collectors/heartbeat",
}]
async fn collector_heartbeat(
    rqctx: RequestContext<Arc<Global>>,
    body: TypedBody<CollectorHeartbeat>,
) -> Result<HttpResponseOk<CollectorInfo>, HttpError> {
    let global: &Global = rqctx.context();
    global
        .collectors
        .lock()
        .unwrap()
        .heartbeat(body.into_inner(), Utc::now())
        .map(HttpResponseOk)
        .map_err(|e| e.into())
}

/// Return every registered collector
#[endpoint {
    method = GET,
    path = "/collectors",
}]
async fn collector_list(
    rqctx: RequestContext<Arc<Global>>,
) -> Result<HttpResponseOk<Vec<CollectorInfo>>, HttpError> {
    let global: &Global = rqctx.context();
    Ok(HttpResponseOk(
        global.collectors.lock().unwrap().list(Utc::now()),
    ))
}

/// Return detailed build information about the `topod` server itself.
#[endpoint {
    method = GET,
    path = "/build-info",
}]
async fn build_info(
    _rqctx: RequestContext<Arc<Global>>,
) -> Result<HttpResponseOk<BuildInfo>, HttpError> {
    Ok(HttpResponseOk(current_build_info()))
}

fn launch_server(
    global: Arc<Global>,
    addr: &SocketAddr,
    id: u32,
) -> anyhow::Result<ApiServer> {
    let config_dropshot = dropshot::ConfigDropshot {
        bind_address: *addr,
        request_body_max_bytes: REQUEST_BODY_MAX_BYTES,
        default_handler_task_mode: dropshot::HandlerTaskMode::Detached,
    };
    let log = global
        .log
        .new(o!("unit" => "api-server", "server_id" => id.to_string()));

    slog::info!(log, "starting api server {id} on {addr}");
    dropshot::HttpServerStarter::new(
        &config_dropshot,
        http_api(),
        global.clone(),
        &log,
    )
    .map(|s| s.start())
    .map_err(|e| anyhow::anyhow!(e.to_string()))
}

/// The API server manager is a task that is responsible for launching and
/// halting dropshot instances that serve the topology API.  The set of
/// instances is governed by the "listen_addresses" vector in the Global
/// structure.  Each time a message arrives on `rx`, the manager compares
/// that list with the set of servers it is running, starting and stopping
/// servers as needed.  When the sending side of the channel is dropped, all
/// servers are shut down and the manager exits.
pub async fn api_server_manager(
    global: Arc<Global>,
    mut rx: tokio::sync::watch::Receiver<()>,
) {
    let mut active = HashMap::<SocketAddr, ApiServer>::new();
    let mut id = 0;
    let mut running = true;

    let log = global.log.new(o!("unit" => "api-server-manager"));
    while running {
        let active_addrs = active.keys().cloned().collect::<Vec<SocketAddr>>();
        let mut config_addrs = global.listen_addresses.lock().unwrap().to_vec();
        // We always listen on localhost
        config_addrs.push(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            common::DEFAULT_TOPOD_PORT,
        ));
        config_addrs.sort();
        config_addrs.dedup();
        // Get the list of all the addresses we should be listening on,
        // and compare it to the list we currently are listening on.
        let (add, remove) = common::purge_common(&config_addrs, &active_addrs);

        for addr in remove {
            let Some(hdl) = active.remove(&addr) else {
                continue;
            };
            info!(log, "closing api server on {addr}");
            if let Err(e) = hdl.close().await {
                error!(log, "error closing api server on {addr}: {e:?}");
            }
        }

        for addr in &add {
            // Increase the `id` to give each server a unique name
            id += 1;
            match launch_server(global.clone(), addr, id) {
                Ok(s) => {
                    active.insert(*addr, s);
                }
                Err(e) => {
                    error!(
                        log,
                        "failed to launch api server {id} on {addr}: {e:?}"
                    );
                }
            };
        }

        // When the tx side is dropped, the changed() below will return an
        // error, telling us that it is time to exit.
        running = rx.changed().await.is_ok();
    }

    // Shut down all the active API servers
    for (addr, hdl) in active {
        info!(log, "closing api server on {addr}");
        if let Err(e) = hdl.close().await {
            error!(log, "error closing api server on {addr}: {e:?}");
        }
    }
}

pub fn http_api() -> dropshot::ApiDescription<Arc<Global>> {
    let mut api = dropshot::ApiDescription::new();

    api.register(build_info).unwrap();
    api.register(observations_submit).unwrap();
    api.register(topology_get).unwrap();
    api.register(topology_stats).unwrap();
    api.register(topology_tombstones).unwrap();
    api.register(device_list).unwrap();
    api.register(device_get).unwrap();
    api.register(device_del).unwrap();
    api.register(registry_device_put).unwrap();
    api.register(registry_device_list).unwrap();
    api.register(collector_register).unwrap();
    api.register(collector_heartbeat).unwrap();
    api.register(collector_list).unwrap();

    api
}
