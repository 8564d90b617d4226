/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use quill_protocol::{SyncEnvelope, SyncHeader};
use rand::{rngs::OsRng, RngCore as _};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use zeroize::Zeroizing;

use crate::keys::{DeviceIdentity, DeviceKeys};
use crate::net_metrics::NetMetrics;
use crate::sync_crypto;
use crate::sync_store::{ChainHead, StoredEvent, SyncStore};
use crate::ui_events::UiEvent;

/// Known devices and their public keys.
pub trait IdentityDirectory: Send + Sync {
    fn device(&self, device_id: &str) -> Option<DeviceKeys>;
}

/// Per-conversation shared secrets.
pub trait ConversationKeys: Send + Sync {
    fn conversation_secret(&self, conv_id: &str) -> Option<Zeroizing<Vec<u8>>>;
}

/// Returns true while identity keys may be used.
pub type SyncGate = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("vault is locked")]
    VaultLocked,
    #[error("unknown author device {0}")]
    UnknownAuthor(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("no shared secret for conversation {0}")]
    MissingConversationKey(String),
    #[error("decrypt failed: {0}")]
    Decrypt(String),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("storage: {0}")]
    Storage(String),
}

fn storage(e: anyhow::Error) -> SyncError {
    SyncError::Storage(format!("{e:#}"))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Accepted {
        event_id: String,
        hash: String,
        conflict: bool,
    },
    /// Already stored; nothing changed.
    Duplicate { event_id: String },
}

pub struct SyncEngine {
    store: Arc<dyn SyncStore>,
    identities: Arc<dyn IdentityDirectory>,
    conv_keys: Arc<dyn ConversationKeys>,
    local: Arc<DeviceIdentity>,
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    gate: Option<SyncGate>,
    metrics: Option<Arc<NetMetrics>>,
    ui_events: Option<broadcast::Sender<UiEvent>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn SyncStore>,
        identities: Arc<dyn IdentityDirectory>,
        conv_keys: Arc<dyn ConversationKeys>,
        local: Arc<DeviceIdentity>,
    ) -> Self {
        Self {
            store,
            identities,
            conv_keys,
            local,
            lanes: Mutex::new(HashMap::new()),
            gate: None,
            metrics: None,
            ui_events: None,
        }
    }

    /// Refuses `apply` and sealing while `gate` returns false.
    pub fn with_gate(mut self, gate: SyncGate) -> Self {
        self.gate = Some(gate);
        self
    }

    fn is_open(&self) -> bool {
        self.gate.as_ref().map(|g| g()).unwrap_or(true)
    }

    pub fn with_metrics(mut self, metrics: Arc<NetMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_ui_events(mut self, tx: broadcast::Sender<UiEvent>) -> Self {
        self.ui_events = Some(tx);
        self
    }

    fn lane(&self, conv_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        lanes.entry(conv_id.to_string()).or_default().clone()
    }

    /// Applies one inbound envelope. Envelopes of the same conversation are
    /// applied one at a time, in call order.
    pub async fn apply(&self, env: &SyncEnvelope) -> Result<Applied, SyncError> {
        if !self.is_open() {
            return Err(SyncError::VaultLocked);
        }
        let lane = self.lane(&env.header.conv_id);
        let _turn = lane.lock().await;
        let res = self.apply_in_lane(env).await;

        let h = &env.header;
        match &res {
            Ok(Applied::Accepted { conflict, hash, .. }) => {
                if let Some(m) = &self.metrics {
                    m.sync_accepted(*conflict);
                }
                if *conflict {
                    tracing::warn!(conv_id = %h.conv_id, event_id = %h.event_id, prev = ?h.prev, "sync event does not extend local head");
                } else {
                    tracing::debug!(conv_id = %h.conv_id, event_id = %h.event_id, hash = %hash, "sync event applied");
                }
                if let Some(tx) = &self.ui_events {
                    let detail = if *conflict { "conflict" } else { "applied" };
                    let _ = tx.send(UiEvent::new(
                        "sync",
                        Some(detail.to_string()),
                        Some(h.event_id.clone()),
                    ));
                }
            }
            Ok(Applied::Duplicate { .. }) => {
                if let Some(m) = &self.metrics {
                    m.sync_duplicate();
                }
                tracing::debug!(event_id = %h.event_id, "sync replay ignored");
            }
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.sync_dropped();
                }
                tracing::warn!(conv_id = %h.conv_id, event_id = %h.event_id, author = %h.author_device_id, error = %e, "sync event dropped");
            }
        }
        res
    }

    async fn apply_in_lane(&self, env: &SyncEnvelope) -> Result<Applied, SyncError> {
        let h = &env.header;
        if h.conv_id.is_empty() || h.event_id.is_empty() || h.author_device_id.is_empty() {
            return Err(SyncError::Malformed("empty header field".to_string()));
        }

        let author = self
            .identities
            .device(&h.author_device_id)
            .ok_or_else(|| SyncError::UnknownAuthor(h.author_device_id.clone()))?;
        if !sync_crypto::verify_event(&author.signing, env) {
            return Err(SyncError::InvalidSignature);
        }

        if self.store.has_event(&h.event_id).await.map_err(storage)? {
            return Ok(Applied::Duplicate {
                event_id: h.event_id.clone(),
            });
        }

        let head = self.store.head(&h.conv_id).await.map_err(storage)?;
        let conflict = h.prev.as_deref() != head.as_ref().map(|c| c.hash.as_str());

        let secret = self
            .conv_keys
            .conversation_secret(&h.conv_id)
            .ok_or_else(|| SyncError::MissingConversationKey(h.conv_id.clone()))?;
        let key = sync_crypto::derive_sync_key(
            &secret,
            &self.local.agreement,
            &author.agreement,
            &h.conv_id,
        )
        .map_err(|e| SyncError::Decrypt(e.to_string()))?;
        let plaintext =
            sync_crypto::open_payload(&key, env).map_err(|e| SyncError::Decrypt(e.to_string()))?;

        let hash = sync_crypto::event_hash(h, &plaintext);
        let stored = StoredEvent {
            event_id: h.event_id.clone(),
            conv_id: h.conv_id.clone(),
            author_device_id: h.author_device_id.clone(),
            ts: h.ts,
            lamport: h.lamport,
            prev: h.prev.clone(),
            hash: hash.clone(),
            plaintext,
            conflict,
            received_at_ms: now_ms(),
        };
        if !self.store.append(stored).await.map_err(storage)? {
            return Ok(Applied::Duplicate {
                event_id: h.event_id.clone(),
            });
        }
        Ok(Applied::Accepted {
            event_id: h.event_id.clone(),
            hash,
            conflict,
        })
    }

    /// Builds an envelope for `recipient_device_id` extending the local head
    /// and records the event locally so the next send chains onto it.
    pub async fn seal_for(
        &self,
        recipient_device_id: &str,
        conv_id: &str,
        plaintext: &[u8],
    ) -> Result<SyncEnvelope> {
        let mut out = self
            .seal_for_devices(&[recipient_device_id], conv_id, plaintext)
            .await?;
        out.pop().context("no envelope sealed")
    }

    /// One event, one envelope per recipient, all sharing the same header.
    pub async fn seal_for_devices(
        &self,
        recipient_device_ids: &[&str],
        conv_id: &str,
        plaintext: &[u8],
    ) -> Result<Vec<SyncEnvelope>> {
        if !self.is_open() {
            return Err(SyncError::VaultLocked.into());
        }
        let recipients = recipient_device_ids
            .iter()
            .map(|id| {
                self.identities
                    .device(id)
                    .with_context(|| format!("unknown device {id}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let lane = self.lane(conv_id);
        let _turn = lane.lock().await;
        let head = self.store.head(conv_id).await?;
        let envelopes = SyncAuthor::new(self.local.clone(), self.conv_keys.clone()).seal_multi(
            &recipients,
            conv_id,
            plaintext,
            head.as_ref(),
        )?;
        let Some(first) = envelopes.first() else {
            return Ok(envelopes);
        };
        let h = &first.header;
        let stored = StoredEvent {
            event_id: h.event_id.clone(),
            conv_id: h.conv_id.clone(),
            author_device_id: h.author_device_id.clone(),
            ts: h.ts,
            lamport: h.lamport,
            prev: h.prev.clone(),
            hash: sync_crypto::event_hash(h, plaintext),
            plaintext: plaintext.to_vec(),
            conflict: false,
            received_at_ms: now_ms(),
        };
        self.store.append(stored).await?;
        tracing::debug!(conv_id, event_id = %h.event_id, lamport = h.lamport, recipients = envelopes.len(), "sync event sealed");
        Ok(envelopes)
    }

    pub async fn events(&self, conv_id: &str) -> Result<Vec<StoredEvent>> {
        self.store.events(conv_id).await
    }

    pub async fn conflicts(&self, conv_id: &str) -> Result<Vec<StoredEvent>> {
        self.store.conflicts(conv_id).await
    }

    pub async fn resolve_conflict(&self, event_id: &str) -> Result<bool> {
        self.store.resolve_conflict(event_id).await
    }
}

/// Producer side of the sync protocol.
pub struct SyncAuthor {
    local: Arc<DeviceIdentity>,
    conv_keys: Arc<dyn ConversationKeys>,
}

impl SyncAuthor {
    pub fn new(local: Arc<DeviceIdentity>, conv_keys: Arc<dyn ConversationKeys>) -> Self {
        Self { local, conv_keys }
    }

    pub fn seal(
        &self,
        recipient: &DeviceKeys,
        conv_id: &str,
        plaintext: &[u8],
        head: Option<&ChainHead>,
    ) -> Result<SyncEnvelope> {
        let mut out = self.seal_multi(std::slice::from_ref(recipient), conv_id, plaintext, head)?;
        out.pop().context("no envelope sealed")
    }

    /// Seals one event for each recipient. The header, and so the event
    /// hash, is shared; only ciphertext, nonce and signature differ.
    pub fn seal_multi(
        &self,
        recipients: &[DeviceKeys],
        conv_id: &str,
        plaintext: &[u8],
        head: Option<&ChainHead>,
    ) -> Result<Vec<SyncEnvelope>> {
        let secret = self
            .conv_keys
            .conversation_secret(conv_id)
            .with_context(|| format!("no shared secret for conversation {conv_id}"))?;
        let mut id = [0u8; 16];
        OsRng.fill_bytes(&mut id);
        let header = SyncHeader {
            conv_id: conv_id.to_string(),
            event_id: hex::encode(id),
            author_device_id: self.local.device_id.clone(),
            ts: now_ms(),
            lamport: head.map(|h| h.lamport).unwrap_or(0) + 1,
            prev: head.map(|h| h.hash.clone()),
        };
        recipients
            .iter()
            .map(|recipient| -> Result<SyncEnvelope> {
                let key = sync_crypto::derive_sync_key(
                    &secret,
                    &self.local.agreement,
                    &recipient.agreement,
                    conv_id,
                )?;
                let (ciphertext_b64, nonce_b64) =
                    sync_crypto::seal_payload(&key, &header, plaintext)?;
                let sig_b64 = sync_crypto::sign_event(
                    &self.local.signing,
                    &header,
                    &ciphertext_b64,
                    &nonce_b64,
                );
                Ok(SyncEnvelope {
                    header: header.clone(),
                    ciphertext_b64,
                    nonce_b64,
                    sig_b64,
                })
            })
            .collect()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
