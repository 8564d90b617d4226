/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::component_pointer::write_atomic;

pub const PIN_RECORD_V1: u32 = 1;
pub const PIN_RECORD_V2: u32 = 2;

/// Persisted PIN state. `verifier` is an Argon2 PHC string; the vault key
/// is stored sealed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRecord {
    pub v: u32,
    pub verifier: String,
    pub nonce_b64: String,
    pub sealed_vault_key_b64: String,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub locked_until_ms: i64,
    #[serde(default)]
    pub updated_at_ms: i64,
}

#[async_trait]
pub trait PinStore: Send + Sync {
    async fn load(&self) -> Result<Option<PinRecord>>;
    async fn save(&self, rec: &PinRecord) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// One JSON file, replaced atomically on every save.
pub struct FilePinStore {
    path: PathBuf,
}

impl FilePinStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PinStore for FilePinStore {
    async fn load(&self) -> Result<Option<PinRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        let rec = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", self.path.display()))?;
        Ok(Some(rec))
    }

    async fn save(&self, rec: &PinRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(rec)?;
        write_atomic(&self.path, &bytes).await
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", self.path.display())),
        }
    }
}

#[derive(Default)]
pub struct MemoryPinStore {
    rec: Mutex<Option<PinRecord>>,
    saves: std::sync::atomic::AtomicU64,
}

impl MemoryPinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(rec: PinRecord) -> Self {
        Self {
            rec: Mutex::new(Some(rec)),
            saves: Default::default(),
        }
    }

    /// Number of `save` calls so far.
    pub fn saves(&self) -> u64 {
        self.saves.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl PinStore for MemoryPinStore {
    async fn load(&self) -> Result<Option<PinRecord>> {
        Ok(self.rec.lock().await.clone())
    }

    async fn save(&self, rec: &PinRecord) -> Result<()> {
        *self.rec.lock().await = Some(rec.clone());
        self.saves.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.rec.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_roundtrip_and_legacy_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pin.json");
        let store = FilePinStore::new(&path);
        assert!(store.load().await.unwrap().is_none());

        // Legacy records predate the lockout fields.
        std::fs::write(
            &path,
            r#"{"v":1,"verifier":"$argon2id$x","nonce_b64":"AA==","sealed_vault_key_b64":"AA=="}"#,
        )
        .unwrap();
        let rec = store.load().await.unwrap().unwrap();
        assert_eq!(rec.v, PIN_RECORD_V1);
        assert_eq!(rec.failures, 0);
        assert_eq!(rec.locked_until_ms, 0);

        let next = PinRecord {
            failures: 2,
            ..rec
        };
        store.save(&next).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(next));
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}
