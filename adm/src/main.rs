// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
use structopt::*;

use protocol::types::Device;
use protocol::types::IdentityKey;
use protocol::types::Link;
use protocol::types::ObservationBatch;
use protocol::types::RegisteredDevice;
use topod_client::default_port;
use topod_client::Client;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "topoadm",
    about = "provides a command-line interface to the topology daemon",
    version = "0.0.1"
)]
struct GlobalOpts {
    #[structopt(short, long, help = "topology daemon's hostname or IP address")]
    host: Option<String>,

    #[structopt(help = "daemon's TCP port", short, long)]
    port: Option<u16>,

    #[structopt(subcommand)]
    cmd: Commands,
}

#[derive(Debug, StructOpt)]
enum DeviceCmd {
    /// Show a single device
    Get { device_id: String },
    /// Deprovision a device, removing all of its links
    #[structopt(visible_alias = "rm", visible_alias = "del")]
    Remove { device_id: String },
}

#[derive(Debug, StructOpt)]
enum RegistryCmd {
    /// Add or update a registry entry
    Add {
        #[structopt(long, short = "n")]
        name: Option<String>,
        #[structopt(long = "chassis", short = "c", number_of_values = 1)]
        chassis_ids: Vec<String>,
        #[structopt(long = "ip", short = "i", number_of_values = 1)]
        ips: Vec<IpAddr>,
        #[structopt(long = "sysname", short = "s", number_of_values = 1)]
        system_names: Vec<String>,
        device_id: String,
    },
    /// List every registry entry
    #[structopt(visible_alias = "ls")]
    List,
}

#[derive(Debug, StructOpt)]
enum Commands {
    /// Print detailed build information about the `topod` server.
    #[structopt(visible_alias = "buildinfo")]
    BuildInfo,
    /// Show the topology graph
    #[structopt(visible_alias = "topo")]
    Topology {
        /// Include stale and conflicted links
        #[structopt(long, short = "a")]
        all: bool,
        /// Only show this device and its neighbors
        #[structopt(long, short = "d")]
        device: Option<String>,
    },
    /// Show summary statistics for the graph
    Stats,
    /// List all devices
    Devices,
    /// Manage a single device
    #[structopt(visible_alias = "dev")]
    Device(DeviceCmd),
    /// Manage the device registry
    #[structopt(visible_alias = "reg")]
    Registry(RegistryCmd),
    /// List the collectors known to the daemon
    Collectors,
    /// Show recently removed links
    Tombstones {
        #[structopt(long, short = "n")]
        limit: Option<u32>,
    },
    /// Submit a batch of observations read from a JSON file
    Submit { batch: PathBuf },
}

async fn build_info(client: &Client) -> anyhow::Result<()> {
    let info = client
        .build_info()
        .await
        .context("failed to get build information")?
        .into_inner();
    println!("Version: {}", info.version);
    println!("Commit SHA: {}", info.git_sha);
    println!("Commit timestamp: {}", info.git_commit_timestamp);
    println!("Git branch: {}", info.git_branch);
    println!("Rustc version: {}", info.rustc_semver);
    println!("Rustc channel: {}", info.rustc_channel);
    println!("Rustc triple: {}", info.rustc_host_triple);
    println!("Rustc commit SHA: {}", info.rustc_commit_sha);
    println!("Cargo triple: {}", info.cargo_triple);
    println!("Debug: {}", info.debug);
    println!("Opt level: {}", info.opt_level);
    Ok(())
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let Ok(elapsed) = (now - then).to_std() else {
        return "in the future".to_string();
    };
    let mut secs = elapsed.as_secs();
    let mut mins = secs / 60;
    secs -= mins * 60;
    let mut hours = mins / 60;
    mins -= hours * 60;
    let days = hours / 24;
    hours -= days * 24;
    if days > 0 {
        format!("{days}d{hours}h{mins}m{secs}s ago")
    } else if hours > 0 {
        format!("{hours}h{mins}m{secs}s ago")
    } else if mins > 0 {
        format!("{mins}m{secs}s ago")
    } else {
        format!("{secs}s ago")
    }
}

fn display_device(now: DateTime<Utc>, d: &Device) {
    let kind = if d.is_shadow { " (shadow)" } else { "" };
    match &d.name {
        Some(name) => println!("{} [{name}]{kind}", d.id),
        None => println!("{}{kind}", d.id),
    }
    println!("\tfirst seen: {:>14}", age(now, d.first_seen_at));
    println!("\tlast seen:  {:>14}", age(now, d.last_seen_at));
    for key in &d.identity_keys {
        println!("\t{key}");
    }
}

fn display_link(now: DateTime<Utc>, l: &Link) {
    println!("{l}");
    println!("\tlast seen: {}", age(now, l.last_seen_at));
    let collectors: Vec<&str> =
        l.confirming_collectors.keys().map(|c| c.as_str()).collect();
    println!("\tcollectors: {}", collectors.join(", "));
}

fn identity_keys(
    chassis_ids: Vec<String>,
    ips: Vec<IpAddr>,
    system_names: Vec<String>,
) -> BTreeSet<IdentityKey> {
    chassis_ids
        .into_iter()
        .map(IdentityKey::ChassisId)
        .chain(ips.into_iter().map(IdentityKey::ManagementIp))
        .chain(system_names.into_iter().map(IdentityKey::SystemName))
        .collect()
}

async fn topology(
    client: &Client,
    all: bool,
    device: Option<String>,
) -> anyhow::Result<()> {
    let graph = client
        .topology_get(device.as_deref(), Some(all), Some(all))
        .await
        .context("failed to get topology")?
        .into_inner();
    println!(
        "{} devices, {} links, generated {}",
        graph.devices.len(),
        graph.links.len(),
        graph.generated_at
    );
    let now = Utc::now();
    for l in &graph.links {
        display_link(now, l);
    }
    Ok(())
}

async fn stats(client: &Client) -> anyhow::Result<()> {
    let s = client
        .topology_stats()
        .await
        .context("failed to get statistics")?
        .into_inner();
    println!("Devices: {} ({} shadow)", s.devices_total, s.shadow_devices);
    println!("Links: {}", s.links_total);
    println!("\tconfirmed:   {}", s.by_status.confirmed);
    println!("\tprovisional: {}", s.by_status.provisional);
    println!("\tconflicted:  {}", s.by_status.conflicted);
    println!("\tstale:       {}", s.by_status.stale);
    println!("\tphysical:    {}", s.by_type.physical);
    println!("\tlogical:     {}", s.by_type.logical);
    println!("Average confidence: {:.3}", s.average_confidence);
    println!("Tombstones: {}", s.tombstones);
    let c = &s.counters;
    println!(
        "Observations: {} ({} rejected)",
        c.observations_total, c.observations_rejected_total
    );
    println!(
        "Links created: {} confirmed: {} aged out: {} removed: {}",
        c.links_created_total,
        c.links_confirmed_total,
        c.links_aged_out_total,
        c.links_removed_total
    );
    println!(
        "Conflicts: {} discrepancies: {} identity merges: {}",
        c.conflicts_total, c.discrepancies_total, c.identity_merges_total
    );
    Ok(())
}

async fn submit(client: &Client, path: PathBuf) -> anyhow::Result<()> {
    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let batch: ObservationBatch = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let resp = client
        .observations_submit(&batch)
        .await
        .context("failed to submit observations")?
        .into_inner();
    println!("accepted: {} rejected: {}", resp.accepted, resp.rejected);
    for item in &resp.results {
        if let protocol::types::ItemOutcome::Rejected(r) = &item.outcome {
            println!("\titem {}: {r}", item.index);
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = GlobalOpts::from_args();
    let port = opts.port.unwrap_or_else(default_port);
    let host = opts.host.unwrap_or_else(|| "localhost".to_string());
    let log = slog::Logger::root(slog::Discard, slog::o!());

    let api_log = log.new(slog::o!("unit" => "api"));
    let client = Client::new(&format!("http://{host}:{port}"), api_log);
    let now = Utc::now();

    match opts.cmd {
        Commands::BuildInfo => build_info(&client).await,
        Commands::Topology { all, device } => {
            topology(&client, all, device).await
        }
        Commands::Stats => stats(&client).await,
        Commands::Devices => client
            .device_list()
            .await
            .map(|r| r.into_inner().iter().for_each(|d| display_device(now, d)))
            .context("failed to list devices"),
        Commands::Device(sub) => match sub {
            DeviceCmd::Get { device_id } => client
                .device_get(&device_id)
                .await
                .map(|r| display_device(now, &r.into_inner()))
                .context("failed to get device"),
            DeviceCmd::Remove { device_id } => client
                .device_del(&device_id)
                .await
                .map(|_| ())
                .context("failed to remove device"),
        },
        Commands::Registry(sub) => match sub {
            RegistryCmd::Add {
                name,
                chassis_ids,
                ips,
                system_names,
                device_id,
            } => {
                let entry = RegisteredDevice {
                    id: device_id.clone().into(),
                    name,
                    identity_keys: identity_keys(chassis_ids, ips, system_names),
                };
                client
                    .registry_device_put(&device_id, &entry)
                    .await
                    .map(|r| display_device(now, &r.into_inner()))
                    .context("failed to update registry")
            }
            RegistryCmd::List => client
                .registry_device_list()
                .await
                .map(|r| {
                    for e in r.into_inner() {
                        println!("{} {}", e.id, e.name.unwrap_or_default());
                        e.identity_keys.iter().for_each(|k| println!("\t{k}"));
                    }
                })
                .context("failed to list registry"),
        },
        Commands::Collectors => client
            .collector_list()
            .await
            .map(|r| {
                for c in r.into_inner() {
                    println!(
                        "{} {} v{} {:?} last heartbeat {}",
                        c.id,
                        c.name,
                        c.version,
                        c.status,
                        age(now, c.last_heartbeat)
                    );
                    println!(
                        "\taccepted: {} rejected: {}",
                        c.observations_accepted, c.observations_rejected
                    );
                }
            })
            .context("failed to list collectors"),
        Commands::Tombstones { limit } => client
            .topology_tombstones(limit)
            .await
            .map(|r| {
                for t in r.into_inner() {
                    println!(
                        "{:?} {}: {}",
                        t.reason,
                        age(now, t.removed_at),
                        t.link
                    );
                }
            })
            .context("failed to get tombstones"),
        Commands::Submit { batch } => submit(&client, batch).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_age() {
        let then = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let at = |secs| then + chrono::Duration::seconds(secs);
        assert_eq!(age(at(42), then), "42s ago");
        assert_eq!(age(at(3 * 3600 + 61), then), "3h1m1s ago");
        assert_eq!(age(at(86400 + 5), then), "1d0h0m5s ago");
        assert_eq!(age(then, at(10)), "in the future");
    }

    #[test]
    fn test_registry_add_args() {
        let opts = GlobalOpts::from_iter_safe([
            "topoadm", "registry", "add", "-c", "AA:BB", "--ip", "10.0.0.1",
            "-s", "core-1", "-c", "cc:dd", "core-1",
        ])
        .unwrap();
        let Commands::Registry(RegistryCmd::Add {
            chassis_ids,
            ips,
            system_names,
            device_id,
            ..
        }) = opts.cmd
        else {
            panic!("expected registry add");
        };
        assert_eq!(device_id, "core-1");
        let keys = identity_keys(chassis_ids, ips, system_names);
        assert_eq!(keys.len(), 4);
        assert!(keys.contains(&IdentityKey::ChassisId("cc:dd".into())));
    }
}
