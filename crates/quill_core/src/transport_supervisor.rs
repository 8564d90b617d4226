/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use quill_protocol::{InstallProgress, OnionNetwork, OperationDetails, OperationFailure};
use serde::Serialize;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::component_pointer::{self, ComponentPointer};
use crate::net_metrics::NetMetrics;
use crate::onion_assets::HostTarget;
use crate::onion_install::{DownloadBases, InstallError, InstallOutcome, InstallPlan, Installer};
use crate::onion_process::{ProcessConfig, ProcessHandle, ProcessState};
use crate::onion_updates::{self, ReleaseAsset, UpdateChecker, UpdateInfo};
use crate::pinned_hashes::{pinned_key, PinnedHashes};
use crate::proxy::{socks5_url_for_port, validate_proxy_url, ProxyError, ProxyMode, ProxySink};
use crate::route_policy::RouteCandidate;

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub components_root: PathBuf,
    /// Parent of the per-network runtime data dirs handed to the daemons.
    pub process_data_dir: PathBuf,
    /// Defaults to the running host.
    pub target: Option<HostTarget>,
    pub download_bases: DownloadBases,
    pub tor_feed_url: Option<String>,
    pub lokinet_feed_url: Option<String>,
    pub tor_ports: Option<RangeInclusive<u16>>,
    pub lokinet_ports: Option<RangeInclusive<u16>>,
    pub ready_timeout: Option<Duration>,
    pub allow_remote_proxy: bool,
}

/// Failure of an install, update or uninstall, with the context needed to
/// show it to a user.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct OperationError {
    #[source]
    pub error: InstallError,
    pub details: OperationDetails,
}

impl OperationError {
    pub fn code(&self) -> &'static str {
        self.error.code()
    }

    pub fn to_wire(&self) -> OperationFailure {
        OperationFailure {
            code: self.code().to_string(),
            message: self.error.to_string(),
            details: self.details.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TransportStatus {
    pub network: OnionNetwork,
    pub pointer: Option<ComponentPointer>,
    pub process: ProcessState,
}

pub struct TransportSupervisor {
    cfg: SupervisorConfig,
    installer: Installer,
    updates: UpdateChecker,
    tor: ProcessHandle,
    lokinet: ProcessHandle,
    busy: Mutex<HashSet<OnionNetwork>>,
    progress: broadcast::Sender<InstallProgress>,
    proxy: Arc<dyn ProxySink>,
    metrics: Arc<NetMetrics>,
}

struct BusyGuard<'a> {
    set: &'a Mutex<HashSet<OnionNetwork>>,
    network: OnionNetwork,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.network);
    }
}

impl TransportSupervisor {
    /// Spawns one process task per network; must run inside a tokio runtime.
    pub fn new(
        cfg: SupervisorConfig,
        pinned: Arc<PinnedHashes>,
        proxy: Arc<dyn ProxySink>,
        metrics: Arc<NetMetrics>,
    ) -> Result<Self> {
        let target = cfg
            .target
            .or_else(HostTarget::current)
            .context("unsupported host platform for onion components")?;
        let installer = Installer::new(
            cfg.components_root.clone(),
            target,
            pinned,
            cfg.download_bases.clone(),
        )
        .context("build installer")?;
        let updates = UpdateChecker::new(cfg.tor_feed_url.clone(), cfg.lokinet_feed_url.clone())?;

        let proc_cfg = |network: OnionNetwork, ports: &Option<RangeInclusive<u16>>| {
            let mut pc = ProcessConfig::defaults_for(network, cfg.process_data_dir.clone());
            if let Some(range) = ports {
                pc.port_range = range.clone();
            }
            if let Some(t) = cfg.ready_timeout {
                pc.ready_timeout = t;
            }
            pc
        };
        let tor = ProcessHandle::spawn(OnionNetwork::Tor, proc_cfg(OnionNetwork::Tor, &cfg.tor_ports));
        let lokinet = ProcessHandle::spawn(
            OnionNetwork::Lokinet,
            proc_cfg(OnionNetwork::Lokinet, &cfg.lokinet_ports),
        );
        let (progress, _) = broadcast::channel(256);

        Ok(Self {
            cfg,
            installer,
            updates,
            tor,
            lokinet,
            busy: Mutex::new(HashSet::new()),
            progress,
            proxy,
            metrics,
        })
    }

    fn process(&self, network: OnionNetwork) -> &ProcessHandle {
        match network {
            OnionNetwork::Tor => &self.tor,
            OnionNetwork::Lokinet => &self.lokinet,
        }
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<InstallProgress> {
        self.progress.subscribe()
    }

    pub fn subscribe_process(&self, network: OnionNetwork) -> watch::Receiver<ProcessState> {
        self.process(network).subscribe()
    }

    fn claim(&self, network: OnionNetwork) -> Result<BusyGuard<'_>, InstallError> {
        let mut set = self.busy.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(network) {
            return Err(InstallError::Busy);
        }
        Ok(BusyGuard {
            set: &self.busy,
            network,
        })
    }

    fn fail(&self, error: InstallError, details: OperationDetails) -> OperationError {
        let err = OperationError { error, details };
        tracing::error!(
            code = err.code(),
            network = ?err.details.network,
            version = ?err.details.version,
            error = %err.error,
            "onion component operation failed"
        );
        self.metrics.install_failed(format!("{}: {}", err.code(), err.error));
        err
    }

    /// Installs and activates `version` without touching a running daemon.
    pub async fn install(
        &self,
        network: OnionNetwork,
        version: &str,
    ) -> Result<InstallOutcome, OperationError> {
        let plan = self.installer.plan(network, version);
        let _guard = self
            .claim(network)
            .map_err(|e| self.fail(e, plan.details()))?;
        self.run_install(&plan).await
    }

    /// Caller holds the network's busy guard.
    async fn run_install(&self, plan: &InstallPlan) -> Result<InstallOutcome, OperationError> {
        let tx = self.progress.clone();
        match self
            .installer
            .install(plan, |p| {
                let _ = tx.send(p);
            })
            .await
        {
            Ok(outcome) => {
                self.metrics.install_ok();
                Ok(outcome)
            }
            Err(e) => Err(self.fail(e, plan.details())),
        }
    }

    /// Install `version`; a running daemon is restarted on it. If the new
    /// binary does not come up the previous pointer and daemon are restored.
    pub async fn install_and_restart(
        &self,
        network: OnionNetwork,
        version: &str,
    ) -> Result<ComponentPointer, OperationError> {
        let plan = self.installer.plan(network, version);
        self.install_plan_and_restart(&plan).await
    }

    /// Install, restart and any rollback run under one busy guard so no
    /// other operation on the network can interleave.
    async fn install_plan_and_restart(
        &self,
        plan: &InstallPlan,
    ) -> Result<ComponentPointer, OperationError> {
        let network = plan.asset.network;
        let _guard = self
            .claim(network)
            .map_err(|e| self.fail(e, plan.details()))?;
        let proc = self.process(network);
        let was_running = matches!(proc.state(), ProcessState::Running { .. });
        let InstallOutcome {
            pointer, rollback, ..
        } = self.run_install(plan).await?;
        if !was_running {
            rollback.commit().await;
            return Ok(pointer);
        }

        let start_err = match proc.start(pointer.path.clone()).await {
            Ok(port) => {
                tracing::info!(%network, version = %pointer.version, port, "restarted on new version");
                rollback.commit().await;
                return Ok(pointer);
            }
            Err(e) => e,
        };
        tracing::warn!(%network, version = %pointer.version, error = %start_err, "new version failed to start, rolling back");
        let previous = rollback.previous().cloned();
        if let Err(e) = rollback.apply().await {
            return Err(self.fail(e, plan.details()));
        }
        if let Some(prev) = previous {
            if let Err(e) = proc.start(prev.path.clone()).await {
                tracing::warn!(%network, version = %prev.version, error = %e, "previous version failed to restart");
            }
        }
        Err(self.fail(
            InstallError::Unknown(format!("new version failed to start: {start_err}")),
            plan.details(),
        ))
    }

    pub async fn uninstall(&self, network: OnionNetwork) -> Result<(), OperationError> {
        let dir = component_pointer::network_dir(&self.cfg.components_root, network);
        let details = OperationDetails {
            network: Some(network),
            target_dir: Some(dir.display().to_string()),
            ..Default::default()
        };
        let _guard = self
            .claim(network)
            .map_err(|e| self.fail(e, details.clone()))?;
        if let Err(e) = self.process(network).stop().await {
            tracing::warn!(%network, error = %e, "stop before uninstall");
        }
        component_pointer::remove_pointer(&self.cfg.components_root, network)
            .await
            .map_err(|e| self.fail(InstallError::Fs(format!("{e:#}")), details.clone()))?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.fail(e.into(), details)),
        }
        tracing::info!(%network, "component uninstalled");
        Ok(())
    }

    /// Starts the active version; returns its socks port.
    pub async fn start(&self, network: OnionNetwork) -> Result<u16> {
        let ptr = component_pointer::read_pointer(&self.cfg.components_root, network)
            .await?
            .with_context(|| format!("{network} is not installed"))?;
        let port = self.process(network).start(ptr.path).await?;
        Ok(port)
    }

    pub async fn stop(&self, network: OnionNetwork) -> Result<()> {
        self.process(network).stop().await?;
        Ok(())
    }

    pub async fn status(&self, network: OnionNetwork) -> Result<TransportStatus> {
        let pointer = component_pointer::read_pointer(&self.cfg.components_root, network).await?;
        Ok(TransportStatus {
            network,
            pointer,
            process: self.process(network).state(),
        })
    }

    pub async fn statuses(&self) -> Result<Vec<TransportStatus>> {
        let mut out = Vec::with_capacity(OnionNetwork::ALL.len());
        for network in OnionNetwork::ALL {
            out.push(self.status(network).await?);
        }
        Ok(out)
    }

    pub async fn check_update(&self, network: OnionNetwork) -> Result<UpdateInfo, OperationError> {
        let base_details = OperationDetails {
            network: Some(network),
            ..Default::default()
        };
        let current = component_pointer::read_pointer(&self.cfg.components_root, network)
            .await
            .map_err(|e| self.fail(InstallError::Fs(format!("{e:#}")), base_details.clone()))?
            .map(|p| p.version);
        let target = self.installer.target();
        let latest = self
            .updates
            .latest(network, target)
            .await
            .map_err(|e| self.fail(InstallError::DownloadFailed(format!("{e:#}")), base_details))?;
        let asset = match latest.asset {
            Some(a) => a,
            None => {
                let plan = self.installer.plan(network, &latest.version);
                ReleaseAsset {
                    name: plan.asset.name,
                    url: plan.asset.url,
                }
            }
        };
        let info = onion_updates::evaluate(
            network,
            target,
            current.as_deref(),
            &latest.version,
            &asset,
            self.installer.pinned(),
        );
        tracing::info!(
            %network,
            current = ?info.current,
            latest = %info.latest,
            update_available = info.update_available,
            installable = info.installable,
            "update check"
        );
        Ok(info)
    }

    pub async fn check_updates(&self) -> Vec<Result<UpdateInfo, OperationError>> {
        let mut out = Vec::with_capacity(OnionNetwork::ALL.len());
        for network in OnionNetwork::ALL {
            out.push(self.check_update(network).await);
        }
        out
    }

    /// Installs the latest release when it is newer and pinned.
    pub async fn install_update(
        &self,
        network: OnionNetwork,
    ) -> Result<Option<ComponentPointer>, OperationError> {
        let info = self.check_update(network).await?;
        if !info.update_available {
            return Ok(None);
        }
        let plan =
            self.installer
                .plan_for_asset(network, &info.latest, &info.asset_name, &info.download_url);
        if !info.installable {
            let key = pinned_key(plan.target, &info.latest, &info.asset_name);
            return Err(self.fail(InstallError::PinnedHashMissing { key }, plan.details()));
        }
        self.install_plan_and_restart(&plan).await.map(Some)
    }

    /// Routes traffic through the first candidate whose daemon is running.
    pub fn apply_route(&self, candidates: &[RouteCandidate]) -> Result<ProxyMode, ProxyError> {
        for c in candidates {
            let network = c.kind.network();
            if let Some(port) = self.process(network).state().socks_port() {
                let mode = ProxyMode::Socks5 {
                    url: socks5_url_for_port(port),
                };
                self.proxy.apply(&mode)?;
                tracing::info!(%network, port, target = %c.target, "proxy activated");
                return Ok(mode);
            }
        }
        Err(ProxyError::NoRunningTransport)
    }

    pub fn apply_proxy_url(&self, raw: &str) -> Result<ProxyMode, ProxyError> {
        let url = validate_proxy_url(raw, self.cfg.allow_remote_proxy)?;
        let mode = ProxyMode::Socks5 { url };
        self.proxy.apply(&mode)?;
        Ok(mode)
    }

    pub fn disable_proxy(&self) -> Result<(), ProxyError> {
        self.proxy.apply(&ProxyMode::Direct)?;
        tracing::info!("proxy disabled");
        Ok(())
    }

    pub async fn shutdown(&self) {
        for network in OnionNetwork::ALL {
            if let Err(e) = self.process(network).stop().await {
                tracing::debug!(%network, error = %e, "stop on shutdown");
            }
        }
    }
}
