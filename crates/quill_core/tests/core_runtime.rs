/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use async_trait::async_trait;
use quill_core::delivery_scheduler::{OutboxSender, SendOutcome, TickSkip};
use quill_core::keys::DeviceKeys;
use quill_core::outbox_store::OutboxRecord;
use quill_core::retry_policy::NetMode;
use quill_core::runtime::{Collaborators, Core, CoreConfig};
use quill_core::sync_engine::{ConversationKeys, IdentityDirectory, SyncError};
use quill_protocol::{SyncEnvelope, SyncHeader};
use quill_core::vault_keyring::PinVerifyOutcome;
use std::sync::Arc;
use zeroize::Zeroizing;

struct NullSender;

#[async_trait]
impl OutboxSender for NullSender {
    async fn send(&self, _rec: &OutboxRecord, _mode: NetMode) -> Result<SendOutcome> {
        Ok(SendOutcome::Sent)
    }
}

struct Nobody;

impl IdentityDirectory for Nobody {
    fn device(&self, _device_id: &str) -> Option<DeviceKeys> {
        None
    }
}

impl ConversationKeys for Nobody {
    fn conversation_secret(&self, _conv_id: &str) -> Option<Zeroizing<Vec<u8>>> {
        None
    }
}

fn config(dir: &std::path::Path) -> CoreConfig {
    serde_json::from_value(serde_json::json!({
        "data_dir": dir.display().to_string(),
        "net_mode": "tor",
        "scheduler_tick_ms": 50,
        "argon2": { "m_cost_kib": 256, "t_cost": 1, "p_cost": 1 }
    }))
    .unwrap()
}

fn collaborators() -> Collaborators {
    Collaborators {
        sender: Arc::new(NullSender),
        identities: Arc::new(Nobody),
        conv_keys: Arc::new(Nobody),
    }
}

#[tokio::test]
async fn core_stays_idle_until_unlocked() {
    let dir = tempfile::tempdir().unwrap();
    let core = Core::open(config(dir.path()), collaborators()).await.unwrap();
    assert_eq!(core.net_mode(), NetMode::Tor);
    assert!(core.sync().is_none());

    let report = core.scheduler.tick().await.unwrap();
    assert_eq!(report.skipped, Some(TickSkip::VaultLocked));

    core.set_pin("4321").await.unwrap();
    assert!(core.sync().is_some());
    assert!(core.keyring.is_unlocked());
    assert!(dir.path().join("vault_pin.json").exists());
    assert!(dir.path().join("device_identity.sealed").exists());

    let engine = core.sync().unwrap();
    core.lock();
    assert!(core.sync().is_none());
    let env = SyncEnvelope {
        header: SyncHeader {
            conv_id: "conv".into(),
            event_id: "ev".into(),
            author_device_id: "someone".into(),
            ts: 1,
            lamport: 1,
            prev: None,
        },
        ciphertext_b64: String::new(),
        nonce_b64: String::new(),
        sig_b64: String::new(),
    };
    // A handle taken before the lock stops working with it.
    assert!(matches!(engine.apply(&env).await, Err(SyncError::VaultLocked)));
    assert!(engine.seal_for("someone", "conv", b"x").await.is_err());
    drop(engine);
    assert_eq!(
        core.scheduler.tick().await.unwrap().skipped,
        Some(TickSkip::VaultLocked)
    );
    assert!(matches!(
        core.unlock("0000").await.unwrap(),
        PinVerifyOutcome::Mismatch { failures: 1, .. }
    ));

    core.set_net_mode(NetMode::Direct);
    assert_eq!(core.scheduler.current_policy().0, NetMode::Direct);
    core.shutdown().await;

    // A second process over the same data dir sees the same PIN.
    let again = Core::open(config(dir.path()), collaborators()).await.unwrap();
    assert!(matches!(
        again.unlock("4321").await.unwrap(),
        PinVerifyOutcome::Locked { .. } | PinVerifyOutcome::Unlocked
    ));
    again.shutdown().await;
}

#[test]
fn config_defaults_are_sane() {
    let cfg = CoreConfig::default();
    let settings = cfg.scheduler_settings();
    assert_eq!(settings.batch_size, 40);
    let sup = cfg.supervisor_config(std::path::Path::new("/data"));
    assert_eq!(sup.components_root, std::path::Path::new("/data/components"));
    assert!(sup.tor_ports.is_none());
    assert!(!sup.allow_remote_proxy);
}
