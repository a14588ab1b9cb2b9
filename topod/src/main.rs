// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::stream::StreamExt;
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use slog::crit;
use slog::debug;
use slog::info;
use structopt::StructOpt;

use collectors::CollectorRegistry;
use engine::Engine;
use engine::EngineHandle;
pub use errors::TopodError;
use registry::InMemoryRegistry;
use registry::Registry;
use store::GraphStore;
use types::EngineConfig;
pub use types::TopodResult;

mod api_server;
mod collectors;
mod engine;
mod errors;
mod identity;
mod link_key;
mod merge;
mod normalize;
mod persist;
mod query;
mod registry;
mod store;
mod sweeper;
mod types;

/// All global state for the topod daemon
pub struct Global {
    /// Root of the tree of loggers
    pub log: slog::Logger,
    /// Requests to the reconciliation engine, and its latest snapshot
    pub engine: EngineHandle,
    /// Devices known ahead of time
    pub registry: Arc<dyn Registry>,
    /// Collectors that have announced themselves
    pub collectors: Mutex<CollectorRegistry>,
    /// List of addresses on which the api_server should listen.
    pub listen_addresses: Mutex<Vec<SocketAddr>>,
}

impl Global {
    fn new(
        log: &slog::Logger,
        engine: EngineHandle,
        registry: Arc<dyn Registry>,
        collectors: CollectorRegistry,
    ) -> Self {
        Global {
            log: log.clone(),
            engine,
            registry,
            collectors: Mutex::new(collectors),
            listen_addresses: Mutex::new(Vec::new()),
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "topod", about = "Network topology reconciliation daemon")]
enum Args {
    /// Run the topology API server.
    Run(Opt),
    /// Print the OpenAPI document describing the topology API.
    Openapi,
}

#[derive(Clone, Debug, StructOpt)]
pub(crate) struct Opt {
    #[structopt(long, about = "log file")]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        default_value = "json",
        about = "log format",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: common::logging::LogFormat,

    #[structopt(
        long = "listen-addr",
        short = "a",
        number_of_values = 1,
        help = "SocketAddr topod should listen on, in addition to localhost:12240"
    )]
    listen_addr: Vec<SocketAddr>,

    #[structopt(
        long,
        default_value = "300",
        help = "seconds without a report before a link is marked stale"
    )]
    ttl_stale: u64,

    #[structopt(
        long,
        default_value = "900",
        help = "seconds without a report before a stale link is removed"
    )]
    ttl_remove: u64,

    #[structopt(
        long,
        help = "seconds between sweeps (default: a quarter of --ttl-stale)"
    )]
    sweep_interval: Option<u64>,

    #[structopt(
        long,
        default_value = "60",
        help = "seconds an observation timestamp may lie in the future"
    )]
    max_clock_drift: u64,

    #[structopt(
        long,
        default_value = "3600",
        help = "seconds to keep records of removed links"
    )]
    tombstone_retention: u64,

    #[structopt(long, help = "JSON file of devices to seed the registry with")]
    registry_file: Option<PathBuf>,

    #[structopt(long, help = "file in which topology state is saved")]
    state_file: Option<PathBuf>,

    #[structopt(
        long,
        default_value = "30",
        help = "seconds between saves of the state file"
    )]
    persist_interval: u64,

    #[structopt(
        long,
        default_value = "120",
        help = "seconds without a heartbeat before a collector is offline"
    )]
    collector_timeout: u64,
}

fn engine_config(opts: &Opt) -> TopodResult<EngineConfig> {
    let ttl_stale = Duration::from_secs(opts.ttl_stale);
    let cfg = EngineConfig {
        ttl_stale,
        ttl_remove: Duration::from_secs(opts.ttl_remove),
        confirm_window: ttl_stale,
        sweep_interval: opts
            .sweep_interval
            .map(Duration::from_secs)
            .unwrap_or(ttl_stale / 4),
        max_clock_drift: Duration::from_secs(opts.max_clock_drift),
        tombstone_retention: Duration::from_secs(opts.tombstone_retention),
        ..Default::default()
    };
    cfg.validate()?;
    Ok(cfg)
}

// Describe how the engine task ended, including the panic message if it
// panicked.
fn engine_exit_reason(r: Result<(), tokio::task::JoinError>) -> String {
    match r {
        Ok(()) => "engine task exited".to_string(),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown cause".to_string());
            format!("engine panicked: {msg}")
        }
        Err(e) => format!("engine task failed: {e}"),
    }
}

async fn signal_handler(g: Arc<Global>) -> anyhow::Result<()> {
    const SIGNALS: &[std::ffi::c_int] = &[SIGTERM, SIGQUIT, SIGINT];
    let mut sigs = Signals::new(SIGNALS)?;
    let handle = sigs.handle();

    let log = g.log.new(slog::o!("unit" => "signal-handler"));
    if let Some(signal) = sigs.next().await {
        info!(&log, "caught signal {signal} - exiting");
    }
    handle.close();
    Ok(())
}

fn restore_store(
    log: &slog::Logger,
    cfg: &EngineConfig,
    state_file: &Option<PathBuf>,
) -> TopodResult<GraphStore> {
    let Some(path) = state_file else {
        return Ok(GraphStore::new(cfg.tombstone_capacity));
    };
    match persist::load(path)? {
        Some(snap) => {
            info!(log, "restoring topology from {}", path.display();
                "devices" => snap.devices.len(),
                "links" => snap.links.len());
            GraphStore::restore(snap, cfg.tombstone_capacity)
        }
        None => {
            info!(log, "no saved state at {}", path.display());
            Ok(GraphStore::new(cfg.tombstone_capacity))
        }
    }
}

async fn run_topod(opts: Opt) -> anyhow::Result<()> {
    let log = common::logging::init("topod", &opts.log_file, opts.log_format)?;
    let cfg = engine_config(&opts)?;

    let registry: Arc<dyn Registry> = match &opts.registry_file {
        Some(path) => {
            let r = InMemoryRegistry::load(path)?;
            info!(log, "loaded {} registry entries", r.list().len();
                "path" => path.display().to_string());
            Arc::new(r)
        }
        None => Arc::new(InMemoryRegistry::new()),
    };
    let store = restore_store(&log, &cfg, &opts.state_file)?;

    let (engine, mut engine_task) =
        engine::start(Engine::new(cfg.clone(), store, registry.clone(), &log));
    let global = Arc::new(Global::new(
        &log,
        engine.clone(),
        registry,
        CollectorRegistry::new(Duration::from_secs(opts.collector_timeout)),
    ));
    global
        .listen_addresses
        .lock()
        .unwrap()
        .extend(opts.listen_addr.iter().copied());

    // Dropping the sender tells the timer tasks to exit.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let sweeper = tokio::task::spawn(sweeper::sweeper_task(
        engine.clone(),
        cfg.sweep_interval,
        shutdown_rx.clone(),
        log.clone(),
    ));
    let persister = opts.state_file.clone().map(|path| {
        tokio::task::spawn(persist::persister_task(
            path,
            Duration::from_secs(opts.persist_interval),
            engine.subscribe(),
            shutdown_rx.clone(),
            log.clone(),
        ))
    });

    let (api_tx, api_rx) = tokio::sync::watch::channel(());
    let api_global = global.clone();
    let api_server_manager = tokio::task::spawn(async move {
        api_server::api_server_manager(api_global, api_rx).await
    });

    // The engine only stops on its own if it panicked.  Nothing can be
    // ingested after that, so take the whole daemon down with it.
    let engine_failure = tokio::select! {
        r = signal_handler(global.clone()) => {
            r?;
            None
        }
        r = &mut engine_task => Some(engine_exit_reason(r)),
    };
    if let Some(reason) = &engine_failure {
        crit!(&log, "{reason}");
    }

    debug!(&log, "shutting down API server");
    drop(api_tx);
    api_server_manager.await?;

    debug!(&log, "stopping timers");
    drop(shutdown_tx);
    sweeper.await?;
    if let Some(persister) = persister {
        persister.await?;
    }

    if let Some(reason) = engine_failure {
        return Err(anyhow::anyhow!(reason));
    }
    engine.shutdown().await;
    engine_task.await?;
    if let Some(path) = &opts.state_file {
        let snap = engine.snapshot();
        persist::save(path, &snap).await?;
        info!(&log, "saved topology to {}", path.display(); "seq" => snap.seq);
    }

    info!(&log, "exiting");
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::from_args();

    match args {
        Args::Run(opt) => run_topod(opt).await,
        Args::Openapi => Ok(api_server::http_api()
            .openapi("topod", env!("CARGO_PKG_VERSION"))
            .write(&mut std::io::stdout())?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opt {
        let argv = ["topod", "run"].iter().chain(args.iter());
        match Args::from_iter_safe(argv).unwrap() {
            Args::Run(opt) => opt,
            Args::Openapi => panic!("expected run"),
        }
    }

    #[test]
    fn test_defaults() {
        let opt = parse(&[]);
        assert_eq!(opt.log_format, common::logging::LogFormat::Json);
        assert!(opt.listen_addr.is_empty());
        let cfg = engine_config(&opt).unwrap();
        assert_eq!(cfg.ttl_stale, Duration::from_secs(300));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(75));
        assert_eq!(cfg.confirm_window, cfg.ttl_stale);
    }

    #[test]
    fn test_options() {
        let opt = parse(&[
            "-a",
            "10.0.0.1:8080",
            "--listen-addr",
            "[::1]:9000",
            "--ttl-stale",
            "60",
            "--ttl-remove",
            "120",
            "--sweep-interval",
            "5",
        ]);
        assert_eq!(opt.listen_addr.len(), 2);
        let cfg = engine_config(&opt).unwrap();
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));

        // Links must go stale before they can be removed
        let opt = parse(&["--ttl-stale", "600", "--ttl-remove", "600"]);
        assert!(matches!(engine_config(&opt), Err(TopodError::Invalid(_))));
    }

    #[test]
    fn test_restore_without_state_file() {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let store = restore_store(&log, &EngineConfig::default(), &None)
            .unwrap();
        assert_eq!(store.links().count(), 0);
    }

    #[tokio::test]
    async fn test_engine_exit_reason() {
        let task = tokio::task::spawn(async {
            panic!("invariant violation: duplicate link");
        });
        let reason = engine_exit_reason(task.await);
        assert_eq!(reason, "engine panicked: invariant violation: duplicate link");

        let task = tokio::task::spawn(async {});
        assert_eq!(engine_exit_reason(task.await), "engine task exited");
    }
}
