// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Saving published snapshots to disk, so a restarted daemon picks up where
//! it left off.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use tokio::sync::watch;

use crate::errors::TopodError;
use crate::store::GraphSnapshot;
use crate::types::TopodResult;

const STATE_VERSION: u32 = 1;

#[derive(Deserialize, Serialize)]
struct StateFile {
    version: u32,
    saved_at: DateTime<Utc>,
    snapshot: GraphSnapshot,
}

/// Read a saved snapshot.  A missing file is not an error.
pub fn load(path: &Path) -> TopodResult<Option<GraphSnapshot>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let state: StateFile = serde_json::from_slice(&data)?;
    if state.version != STATE_VERSION {
        return Err(TopodError::Invalid(format!(
            "{}: unsupported state file version {}",
            path.display(),
            state.version
        )));
    }
    Ok(Some(state.snapshot))
}

/// Write a snapshot, replacing any earlier one.  The data goes to a
/// temporary file first, so a crash mid-write leaves the old state intact.
pub async fn save(path: &Path, snapshot: &GraphSnapshot) -> TopodResult<()> {
    let state = StateFile {
        version: STATE_VERSION,
        saved_at: Utc::now(),
        snapshot: snapshot.clone(),
    };
    let data = serde_json::to_vec_pretty(&state)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Save the latest snapshot every `interval`, skipping the write when
/// nothing has been published since the last one.  Exits when `shutdown`
/// fires; the final save is left to the caller, once the engine has
/// stopped.
pub async fn persister_task(
    path: PathBuf,
    interval: Duration,
    snapshots: watch::Receiver<Arc<GraphSnapshot>>,
    mut shutdown: watch::Receiver<()>,
    log: slog::Logger,
) {
    let log = log.new(slog::o!("unit" => "persist"));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut saved = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snap = snapshots.borrow().clone();
                if saved == Some(snap.seq) {
                    continue;
                }
                match save(&path, &snap).await {
                    Ok(()) => {
                        debug!(log, "saved snapshot {}", snap.seq);
                        saved = Some(snap.seq);
                    }
                    Err(e) => error!(log, "failed to save state: {e}";
                        "path" => path.display().to_string()),
                }
            }
            r = shutdown.changed() => {
                if r.is_err() {
                    break;
                }
            }
        }
    }
    info!(log, "persister exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::device;
    use crate::store::tests::link;
    use crate::store::tests::t;
    use crate::store::GraphStore;

    fn state_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("topod-{name}-{}.json", std::process::id()))
    }

    #[tokio::test]
    async fn test_save_and_restore() {
        let mut store = GraphStore::new(8);
        store.upsert_device(device("r1", &[]));
        store.upsert_device(device("r2", &[]));
        store.insert_link(link("r1", "Gi0/1", "r2", Some("Eth1/1")));
        store.add_alias("old-r2".into(), "r2".into());
        let snap = store.snapshot(4, t(30));

        let path = state_path("save");
        save(&path, &snap).await.unwrap();
        let loaded = load(&path).unwrap().unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, snap);

        let restored = GraphStore::restore(loaded, 8).unwrap();
        assert_eq!(restored.resolve_id(&"old-r2".into()), Some("r2".into()));
        assert_eq!(restored.links().count(), 1);
    }

    #[test]
    fn test_load_errors() {
        assert!(load(&state_path("missing")).unwrap().is_none());

        let path = state_path("garbage");
        std::fs::write(&path, "{ not json").unwrap();
        let r = load(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(r, Err(TopodError::Serialization(_))));
    }
}
