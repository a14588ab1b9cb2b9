// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The reconciliation engine is the only writer of topology state.  It runs
//! as a single task that owns the graph store and processes one message at a
//! time: collector batches, sweeps, registry updates and deprovisioning all
//! arrive on the same channel, so none of them can ever interleave.  After
//! every message the task publishes an immutable snapshot, which is all that
//! readers ever see.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use slog::debug;
use slog::info;
use slog::o;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::errors::TopodError;
use crate::identity::IdentityResolver;
use crate::link_key::LinkKey;
use crate::merge;
use crate::normalize;
use crate::registry::Registry;
use crate::store::GraphSnapshot;
use crate::store::GraphStore;
use crate::sweeper;
use crate::sweeper::SweepReport;
use crate::types::EngineConfig;
use crate::types::TopodResult;
use protocol::types::BatchResponse;
use protocol::types::Device;
use protocol::types::DeviceId;
use protocol::types::ItemOutcome;
use protocol::types::ItemResult;
use protocol::types::ObservationBatch;
use protocol::types::RawObservation;
use protocol::types::RegisteredDevice;
use protocol::types::RemovalReason;

/// Requests that can be queued for the engine task before callers start to
/// wait.
const ENGINE_QUEUE_DEPTH: usize = 256;

pub enum EngineMsg {
    Observations {
        batch: ObservationBatch,
        received_at: DateTime<Utc>,
        reply: oneshot::Sender<BatchResponse>,
    },
    Sweep {
        now: DateTime<Utc>,
        reply: oneshot::Sender<SweepReport>,
    },
    RegistryUpdate {
        device: RegisteredDevice,
        now: DateTime<Utc>,
        reply: oneshot::Sender<TopodResult<Device>>,
    },
    Deprovision {
        device_id: DeviceId,
        now: DateTime<Utc>,
        reply: oneshot::Sender<TopodResult<Device>>,
    },
    TimeToGo,
}

pub struct Engine {
    cfg: EngineConfig,
    store: GraphStore,
    registry: Arc<dyn Registry>,
    resolver: IdentityResolver,
    log: slog::Logger,
    seq: u64,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        store: GraphStore,
        registry: Arc<dyn Registry>,
        log: &slog::Logger,
    ) -> Self {
        let log = log.new(o!("unit" => "engine"));
        Engine {
            cfg,
            store,
            registry,
            resolver: IdentityResolver::new(&log),
            log,
            seq: 0,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    /// Process every item of a collector batch.  A bad item is rejected
    /// without affecting the rest of the batch.
    pub fn ingest(
        &mut self,
        batch: &ObservationBatch,
        received_at: DateTime<Utc>,
    ) -> BatchResponse {
        let results: Vec<ItemResult> = normalize::batch_items(batch)
            .iter()
            .enumerate()
            .map(|(index, raw)| ItemResult {
                index,
                outcome: self.observe(&batch.collector_id, raw, received_at),
            })
            .collect();
        let response = BatchResponse::from(results);
        debug!(self.log, "ingested batch";
            "collector" => &batch.collector_id,
            "accepted" => response.accepted,
            "rejected" => response.rejected);
        response
    }

    fn observe(
        &mut self,
        collector_id: &str,
        raw: &RawObservation,
        received_at: DateTime<Utc>,
    ) -> ItemOutcome {
        self.store.counters.observations_total += 1;
        let resolved = normalize::normalize(
            collector_id,
            raw,
            received_at,
            self.cfg.max_clock_drift,
        )
        .and_then(|obs| {
            self.resolver
                .resolve(&self.cfg, &mut self.store, self.registry.as_ref(), &obs)
                .map(|ends| (obs, ends))
        });

        match resolved {
            Ok((obs, (local, remote))) => {
                let key = LinkKey::build(
                    &local,
                    &obs.local_port,
                    &remote,
                    obs.remote_port.as_deref(),
                );
                ItemOutcome::Accepted(merge::merge(
                    &self.cfg,
                    &mut self.store,
                    &self.log,
                    &obs,
                    &local,
                    key,
                ))
            }
            Err(rejected) => {
                self.store.counters.observations_rejected_total += 1;
                debug!(self.log, "rejected observation: {rejected}";
                    "collector" => collector_id);
                ItemOutcome::Rejected(rejected)
            }
        }
    }

    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        sweeper::sweep(&self.cfg, &mut self.store, &self.log, now)
    }

    /// Record a device in the registry and bring it into the graph,
    /// absorbing any shadow devices that share its identity keys.
    pub fn register_device(
        &mut self,
        device: RegisteredDevice,
        now: DateTime<Utc>,
    ) -> TopodResult<Device> {
        let id = device.id.clone();
        self.registry.upsert(device)?;
        let entry = self
            .registry
            .get(&id)
            .ok_or_else(|| TopodError::Missing(id.to_string()))?;
        let id = self.resolver.adopt_registered(
            &self.cfg,
            &mut self.store,
            &entry,
            now,
        );
        self.store
            .device(&id)
            .cloned()
            .ok_or_else(|| TopodError::Missing(id.to_string()))
    }

    /// Remove a device from the graph and the registry, retiring every link
    /// that ends on it.
    pub fn deprovision(
        &mut self,
        id: &DeviceId,
        now: DateTime<Utc>,
    ) -> TopodResult<Device> {
        let canonical = self
            .store
            .resolve_id(id)
            .ok_or_else(|| TopodError::Missing(format!("no such device {id}")))?;
        for link_id in self.store.links_of(&canonical) {
            if let Some(link) = self.store.remove_link(&link_id) {
                self.store.tombstone(link, RemovalReason::Deprovisioned, now);
                self.store.counters.links_removed_total += 1;
            }
        }
        self.store.drop_aliases_to(&canonical);
        let device = self
            .store
            .remove_device(&canonical)
            .ok_or_else(|| TopodError::Missing(canonical.to_string()))?;
        self.registry.remove(&canonical);
        info!(self.log, "deprovisioned device {canonical}");
        Ok(device)
    }

    /// Take the next snapshot of the graph.
    pub fn snapshot(&mut self, now: DateTime<Utc>) -> GraphSnapshot {
        self.seq += 1;
        self.store.snapshot(self.seq, now)
    }

    fn publish(&mut self, snapshots: &watch::Sender<Arc<GraphSnapshot>>) {
        snapshots.send_replace(Arc::new(self.snapshot(Utc::now())));
    }
}

// Each change is published before the reply goes out, so a requester always
// sees its own change in the next snapshot it reads.  A requester that has
// gone away no longer cares about the reply, but the change stands.
async fn engine_loop(
    mut engine: Engine,
    mut rx: mpsc::Receiver<EngineMsg>,
    snapshots: watch::Sender<Arc<GraphSnapshot>>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            EngineMsg::Observations {
                batch,
                received_at,
                reply,
            } => {
                let r = engine.ingest(&batch, received_at);
                engine.publish(&snapshots);
                let _ = reply.send(r);
            }
            EngineMsg::Sweep { now, reply } => {
                let r = engine.sweep(now);
                engine.publish(&snapshots);
                let _ = reply.send(r);
            }
            EngineMsg::RegistryUpdate { device, now, reply } => {
                let r = engine.register_device(device, now);
                engine.publish(&snapshots);
                let _ = reply.send(r);
            }
            EngineMsg::Deprovision {
                device_id,
                now,
                reply,
            } => {
                let r = engine.deprovision(&device_id, now);
                engine.publish(&snapshots);
                let _ = reply.send(r);
            }
            EngineMsg::TimeToGo => break,
        }
    }
    info!(engine.log, "engine exiting");
}

/// The requesting side of the engine task.  Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineMsg>,
    snapshots: watch::Receiver<Arc<GraphSnapshot>>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> EngineMsg,
    ) -> TopodResult<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(msg(tx))
            .await
            .map_err(|_| TopodError::Shutdown)?;
        rx.await.map_err(|_| TopodError::Shutdown)
    }

    pub async fn submit(
        &self,
        batch: ObservationBatch,
        received_at: DateTime<Utc>,
    ) -> TopodResult<BatchResponse> {
        self.request(|reply| EngineMsg::Observations {
            batch,
            received_at,
            reply,
        })
        .await
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> TopodResult<SweepReport> {
        self.request(|reply| EngineMsg::Sweep { now, reply }).await
    }

    pub async fn register_device(
        &self,
        device: RegisteredDevice,
    ) -> TopodResult<Device> {
        self.request(|reply| EngineMsg::RegistryUpdate {
            device,
            now: Utc::now(),
            reply,
        })
        .await?
    }

    pub async fn deprovision(&self, device_id: DeviceId) -> TopodResult<Device> {
        self.request(|reply| EngineMsg::Deprovision {
            device_id,
            now: Utc::now(),
            reply,
        })
        .await?
    }

    /// The most recently published snapshot.  Never waits for the engine.
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<GraphSnapshot>> {
        self.snapshots.clone()
    }

    /// Ask the engine to stop once it has drained the requests queued ahead
    /// of this one.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineMsg::TimeToGo).await;
    }
}

/// Start the engine task.
pub fn start(
    mut engine: Engine,
) -> (EngineHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(ENGINE_QUEUE_DEPTH);
    let (snap_tx, snap_rx) =
        watch::channel(Arc::new(engine.snapshot(Utc::now())));
    let task = tokio::task::spawn(engine_loop(engine, rx, snap_tx));
    (
        EngineHandle {
            tx,
            snapshots: snap_rx,
        },
        task,
    )
}
