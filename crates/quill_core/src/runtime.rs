/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::delivery_scheduler::{DeliveryScheduler, OutboxSender, SchedulerSettings};
use crate::keys::{default_data_dir, load_or_generate_identity};
use crate::net_metrics::NetMetrics;
use crate::onion_install::DownloadBases;
use crate::outbox_store::SqliteOutboxStore;
use crate::pin_store::FilePinStore;
use crate::pinned_hashes::PinnedHashes;
use crate::proxy::HttpClientProxy;
use crate::retry_policy::{NetMode, RetryPolicies};
use crate::sync_engine::{ConversationKeys, IdentityDirectory, SyncEngine};
use crate::sync_store::SqliteSyncStore;
use crate::transport_supervisor::{SupervisorConfig, TransportSupervisor};
use crate::ui_events::UiEvent;
use crate::vault_keyring::{Argon2Settings, PinVerifyOutcome, VaultKeyring};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Where onion components are unpacked. Defaults to `<data_dir>/components`.
    #[serde(default)]
    pub components_root: Option<String>,
    /// JSON map of pinned archive hashes. Defaults to `<data_dir>/pinned_hashes.json`.
    #[serde(default)]
    pub pinned_hashes_path: Option<String>,
    #[serde(default)]
    pub tor_feed_url: Option<String>,
    #[serde(default)]
    pub lokinet_feed_url: Option<String>,
    #[serde(default)]
    pub tor_download_base: Option<String>,
    #[serde(default)]
    pub lokinet_download_base: Option<String>,
    #[serde(default)]
    pub scheduler_tick_ms: Option<u64>,
    #[serde(default)]
    pub outbox_batch_size: Option<u32>,
    #[serde(default)]
    pub ack_timeout_ms: Option<i64>,
    #[serde(default)]
    pub retry_policies: Option<RetryPolicies>,
    /// "direct", "tor", "lokinet" or "onion".
    #[serde(default)]
    pub net_mode: Option<String>,
    #[serde(default)]
    pub tor_port_start: Option<u16>,
    #[serde(default)]
    pub tor_port_end: Option<u16>,
    #[serde(default)]
    pub lokinet_port_start: Option<u16>,
    #[serde(default)]
    pub lokinet_port_end: Option<u16>,
    #[serde(default)]
    pub process_ready_timeout_secs: Option<u64>,
    /// Accept socks proxies outside loopback.
    #[serde(default)]
    pub allow_remote_proxy: Option<bool>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub argon2: Option<Argon2Settings>,
}

impl CoreConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(d) => Ok(PathBuf::from(d)),
            None => default_data_dir(),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let d = SchedulerSettings::default();
        SchedulerSettings {
            tick_interval: self
                .scheduler_tick_ms
                .map(Duration::from_millis)
                .unwrap_or(d.tick_interval),
            batch_size: self.outbox_batch_size.unwrap_or(d.batch_size).clamp(1, 500),
            ack_timeout_ms: self.ack_timeout_ms.unwrap_or(d.ack_timeout_ms).max(1_000),
            policies: self.retry_policies.clone().unwrap_or_default(),
        }
    }

    pub fn supervisor_config(&self, data_dir: &Path) -> SupervisorConfig {
        let range = |start: Option<u16>, end: Option<u16>| match (start, end) {
            (Some(s), Some(e)) if s <= e => Some(s..=e),
            (Some(s), None) => Some(s..=s.saturating_add(49)),
            _ => None,
        };
        SupervisorConfig {
            components_root: self
                .components_root
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("components")),
            process_data_dir: data_dir.join("onion"),
            target: None,
            download_bases: DownloadBases {
                tor: self.tor_download_base.clone(),
                lokinet: self.lokinet_download_base.clone(),
            },
            tor_feed_url: self.tor_feed_url.clone(),
            lokinet_feed_url: self.lokinet_feed_url.clone(),
            tor_ports: range(self.tor_port_start, self.tor_port_end),
            lokinet_ports: range(self.lokinet_port_start, self.lokinet_port_end),
            ready_timeout: self.process_ready_timeout_secs.map(Duration::from_secs),
            allow_remote_proxy: self.allow_remote_proxy.unwrap_or(false),
        }
    }

    fn pinned_hashes_path(&self, data_dir: &Path) -> PathBuf {
        self.pinned_hashes_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("pinned_hashes.json"))
    }
}

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init()
        .ok();
}

/// App-provided pieces the core does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub sender: Arc<dyn OutboxSender>,
    pub identities: Arc<dyn IdentityDirectory>,
    pub conv_keys: Arc<dyn ConversationKeys>,
}

pub struct Core {
    data_dir: PathBuf,
    pub keyring: Arc<VaultKeyring>,
    pub scheduler: Arc<DeliveryScheduler>,
    pub supervisor: Arc<TransportSupervisor>,
    pub proxy: Arc<HttpClientProxy>,
    pub metrics: Arc<NetMetrics>,
    collaborators: Collaborators,
    ui_events: broadcast::Sender<UiEvent>,
    net_mode: Arc<RwLock<NetMode>>,
    sync: RwLock<Option<Arc<SyncEngine>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    /// Builds every subsystem. Nothing is sent until the vault is unlocked.
    pub async fn open(cfg: CoreConfig, collaborators: Collaborators) -> Result<Self> {
        let data_dir = cfg.resolve_data_dir()?;
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("create data dir: {}", data_dir.display()))?;
        info!(data_dir = %data_dir.display(), "opening core");

        let metrics = Arc::new(NetMetrics::new());
        let (ui_events, _) = broadcast::channel(256);

        let mut keyring = VaultKeyring::new(Arc::new(FilePinStore::new(data_dir.join("vault_pin.json"))));
        if let Some(a) = cfg.argon2 {
            keyring = keyring.with_argon2(a);
        }
        let keyring = Arc::new(keyring);

        let http_timeout = Duration::from_secs(cfg.http_timeout_secs.unwrap_or(30).clamp(5, 300));
        let proxy = Arc::new(HttpClientProxy::new(http_timeout).context("build http client")?);

        let pinned = Arc::new(PinnedHashes::load(&cfg.pinned_hashes_path(&data_dir))?);
        if pinned.is_empty() {
            warn!("no pinned hashes configured; onion installs will be refused");
        }
        let supervisor = Arc::new(TransportSupervisor::new(
            cfg.supervisor_config(&data_dir),
            pinned,
            proxy.clone(),
            metrics.clone(),
        )?);

        let initial_mode = match cfg.net_mode.as_deref() {
            Some(s) => s.parse::<NetMode>().context("net_mode")?,
            None => NetMode::Direct,
        };
        let net_mode = Arc::new(RwLock::new(initial_mode));

        let outbox = SqliteOutboxStore::open(data_dir.join("outbox.db"))?;
        let gate_keyring = keyring.clone();
        let mode_read = net_mode.clone();
        let scheduler = Arc::new(
            DeliveryScheduler::new(
                Arc::new(outbox),
                collaborators.sender.clone(),
                cfg.scheduler_settings(),
            )
            .with_gate(Arc::new(move || gate_keyring.is_unlocked()))
            .with_net_mode(Arc::new(move || {
                mode_read.read().map(|g| *g).unwrap_or(NetMode::Direct)
            }))
            .with_ui_events(ui_events.clone())
            .with_metrics(metrics.clone()),
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            data_dir,
            keyring,
            scheduler,
            supervisor,
            proxy,
            metrics,
            collaborators,
            ui_events,
            net_mode,
            sync: RwLock::new(None),
            shutdown_tx,
            worker: Mutex::new(None),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn subscribe_ui(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_events.subscribe()
    }

    pub fn net_mode(&self) -> NetMode {
        self.net_mode.read().map(|g| *g).unwrap_or(NetMode::Direct)
    }

    /// Takes effect on the next scheduler tick.
    pub fn set_net_mode(&self, mode: NetMode) {
        let mut g = self.net_mode.write().unwrap_or_else(|p| p.into_inner());
        *g = mode;
        info!(mode = mode.as_str(), "net mode changed");
    }

    pub fn sync(&self) -> Option<Arc<SyncEngine>> {
        self.sync.read().ok().and_then(|g| g.clone())
    }

    /// First-time PIN setup; leaves the vault unlocked.
    pub async fn set_pin(&self, pin: &str) -> Result<()> {
        self.keyring.set_pin(pin).await?;
        self.after_unlock().await
    }

    pub async fn unlock(&self, pin: &str) -> Result<PinVerifyOutcome> {
        let outcome = self.keyring.verify_pin(pin).await?;
        if outcome == PinVerifyOutcome::Unlocked {
            self.after_unlock().await?;
        }
        Ok(outcome)
    }

    /// Forgets the vault key and drops the sync engine with the device
    /// identity it holds. The scheduler idles until the next unlock.
    pub fn lock(&self) {
        self.keyring.lock();
        let dropped = self
            .sync
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if dropped.is_some() {
            info!("sync engine released");
        }
    }

    async fn after_unlock(&self) -> Result<()> {
        let key = self.keyring.vault_key().context("vault is locked")?;

        if self.sync().is_none() {
            let dir = self.data_dir.clone();
            let identity = tokio::task::spawn_blocking(move || load_or_generate_identity(&dir, &key))
                .await??;
            info!(device_id = %identity.device_id, "device identity loaded");
            let store = SqliteSyncStore::open(self.data_dir.join("sync.db"))?;
            let gate_keyring = self.keyring.clone();
            let engine = SyncEngine::new(
                Arc::new(store),
                self.collaborators.identities.clone(),
                self.collaborators.conv_keys.clone(),
                Arc::new(identity),
            )
            .with_gate(Arc::new(move || gate_keyring.is_unlocked()))
            .with_metrics(self.metrics.clone())
            .with_ui_events(self.ui_events.clone());
            let mut g = self.sync.write().unwrap_or_else(|p| p.into_inner());
            if g.is_none() {
                *g = Some(Arc::new(engine));
            }
        }

        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if worker.is_none() {
            *worker = Some(self.scheduler.start_worker(self.shutdown_tx.subscribe()));
            info!("outbox worker started");
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(j) = worker {
            let _ = j.await;
        }
        self.supervisor.shutdown().await;
        self.lock();
        info!("core stopped");
    }
}
