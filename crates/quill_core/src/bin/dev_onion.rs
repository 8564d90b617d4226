/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Context;
use quill_core::net_metrics::NetMetrics;
use quill_core::pinned_hashes::PinnedHashes;
use quill_core::proxy::HttpClientProxy;
use quill_core::runtime::{init_logging, CoreConfig};
use quill_core::transport_supervisor::TransportSupervisor;
use quill_protocol::OnionNetwork;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const USAGE: &str = "usage: dev_onion <check-updates | status | install <tor|lokinet> <version> | uninstall <tor|lokinet>>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cfg = match std::env::var("QUILL_CONFIG") {
        Ok(path) => CoreConfig::load(&path)?,
        Err(_) => CoreConfig::default(),
    };
    let data_dir = cfg.resolve_data_dir()?.join("dev_onion");
    info!("data dir: {}", data_dir.display());

    let pinned_path = cfg
        .pinned_hashes_path
        .clone()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| data_dir.join("pinned_hashes.json"));
    let pinned = Arc::new(PinnedHashes::load(&pinned_path)?);
    info!("pinned hashes: {} entries from {}", pinned.len(), pinned_path.display());

    let proxy = Arc::new(HttpClientProxy::new(Duration::from_secs(30))?);
    let supervisor = TransportSupervisor::new(
        cfg.supervisor_config(&data_dir),
        pinned,
        proxy,
        Arc::new(NetMetrics::new()),
    )?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let network_arg = |i: usize| -> anyhow::Result<OnionNetwork> {
        let raw = args.get(i).context(USAGE)?;
        OnionNetwork::parse(raw).with_context(|| format!("unknown network {raw}"))
    };

    match args.first().map(String::as_str) {
        Some("check-updates") => {
            for res in supervisor.check_updates().await {
                match res {
                    Ok(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                    Err(e) => println!("{}", serde_json::to_string_pretty(&e.to_wire())?),
                }
            }
        }
        Some("status") => {
            for st in supervisor.statuses().await? {
                println!("{}", serde_json::to_string_pretty(&st)?);
            }
        }
        Some("install") => {
            let network = network_arg(1)?;
            let version = args.get(2).context(USAGE)?;
            let mut progress = supervisor.subscribe_progress();
            let printer = tokio::spawn(async move {
                while let Ok(ev) = progress.recv().await {
                    if let Ok(line) = serde_json::to_string(&ev) {
                        println!("{line}");
                    }
                }
            });
            let res = supervisor.install_and_restart(network, version).await;
            printer.abort();
            match res {
                Ok(pointer) => println!("installed {} at {}", pointer.version, pointer.path.display()),
                Err(e) => {
                    println!("{}", serde_json::to_string_pretty(&e.to_wire())?);
                    std::process::exit(1);
                }
            }
        }
        Some("uninstall") => {
            let network = network_arg(1)?;
            if let Err(e) = supervisor.uninstall(network).await {
                println!("{}", serde_json::to_string_pretty(&e.to_wire())?);
                std::process::exit(1);
            }
        }
        _ => anyhow::bail!(USAGE),
    }

    supervisor.shutdown().await;
    Ok(())
}
