/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use aes_gcm::{aead::Aead, aead::KeyInit, aead::Payload, Aes256Gcm, Nonce};
use argon2::password_hash::{rand_core::OsRng as PhcRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::{rngs::OsRng, RngCore as _};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::pin_store::{PinRecord, PinStore, PIN_RECORD_V1, PIN_RECORD_V2};

pub const PIN_MIN_LEN: usize = 4;
pub const PIN_MAX_LEN: usize = 8;
pub const MAX_LOCKOUT_MS: i64 = 30_000;

const SEAL_LABEL_V1: &[u8] = b"quill-vault-seal-v1";
const SEAL_LABEL_V2: &[u8] = b"quill-vault-seal-v2";
const SEAL_AAD_V2: &[u8] = b"quill-vault/v2";

pub type VaultKey = Zeroizing<[u8; 32]>;
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PinVerifyOutcome {
    Unlocked,
    Mismatch { failures: u32, locked_until_ms: i64 },
    Locked { retry_after_ms: i64 },
    NotSet,
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("pin must be {PIN_MIN_LEN}-{PIN_MAX_LEN} digits")]
    InvalidPin,
    #[error("a pin is already set; unlock first")]
    AlreadySet,
    #[error("vault record is corrupt: {0}")]
    Corrupt(String),
    #[error("pin storage: {0}")]
    Storage(String),
}

fn storage(e: anyhow::Error) -> VaultError {
    VaultError::Storage(format!("{e:#}"))
}

/// Argon2id cost. Defaults follow the argon2 crate's recommendations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct Argon2Settings {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for Argon2Settings {
    fn default() -> Self {
        Self {
            m_cost_kib: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }
}

/// Lockout after the `failures`-th consecutive wrong PIN.
pub fn lockout_ms(failures: u32) -> i64 {
    if failures == 0 {
        return 0;
    }
    let exp = (failures - 1).min(5);
    (1_000i64 << exp).min(MAX_LOCKOUT_MS)
}

pub fn validate_pin(pin: &str) -> Result<(), VaultError> {
    let len_ok = (PIN_MIN_LEN..=PIN_MAX_LEN).contains(&pin.len());
    if !len_ok || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VaultError::InvalidPin);
    }
    Ok(())
}

pub struct VaultKeyring {
    store: Arc<dyn PinStore>,
    argon: Argon2Settings,
    clock: Clock,
    key: RwLock<Option<VaultKey>>,
    verify_turn: Mutex<()>,
}

impl VaultKeyring {
    pub fn new(store: Arc<dyn PinStore>) -> Self {
        Self {
            store,
            argon: Argon2Settings::default(),
            clock: Arc::new(now_ms),
            key: RwLock::new(None),
            verify_turn: Mutex::new(()),
        }
    }

    pub fn with_argon2(mut self, argon: Argon2Settings) -> Self {
        self.argon = argon;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.read().map(|g| g.is_some()).unwrap_or(false)
    }

    pub fn vault_key(&self) -> Option<VaultKey> {
        self.key.read().ok().and_then(|g| g.clone())
    }

    /// Drops the in-memory vault key.
    pub fn lock(&self) {
        let mut g = self.key.write().unwrap_or_else(|p| p.into_inner());
        *g = None;
        tracing::info!("vault locked");
    }

    fn hold(&self, key: VaultKey) {
        let mut g = self.key.write().unwrap_or_else(|p| p.into_inner());
        *g = Some(key);
    }

    pub async fn has_pin(&self) -> Result<bool, VaultError> {
        Ok(self.store.load().await.map_err(storage)?.is_some())
    }

    /// First-time setup, or re-sealing the vault key while unlocked.
    pub async fn set_pin(&self, pin: &str) -> Result<(), VaultError> {
        validate_pin(pin)?;
        let _turn = self.verify_turn.lock().await;
        let existing = self.store.load().await.map_err(storage)?;
        let key = match (existing, self.vault_key()) {
            (None, _) => {
                let mut k = Zeroizing::new([0u8; 32]);
                OsRng.fill_bytes(k.as_mut_slice());
                k
            }
            (Some(_), Some(k)) => k,
            (Some(_), None) => return Err(VaultError::AlreadySet),
        };
        let rec = self.seal_record(pin, &key).await?;
        self.store.save(&rec).await.map_err(storage)?;
        self.hold(key);
        tracing::info!("vault pin set");
        Ok(())
    }

    pub async fn verify_pin(&self, pin: &str) -> Result<PinVerifyOutcome, VaultError> {
        let _turn = self.verify_turn.lock().await;
        self.verify_in_turn(pin).await
    }

    /// Replaces the PIN after checking `old`. Anything but `Unlocked` is
    /// returned unchanged and the PIN stays as it was.
    pub async fn change_pin(&self, old: &str, new: &str) -> Result<PinVerifyOutcome, VaultError> {
        validate_pin(new)?;
        let _turn = self.verify_turn.lock().await;
        let outcome = self.verify_in_turn(old).await?;
        if outcome != PinVerifyOutcome::Unlocked {
            return Ok(outcome);
        }
        let key = self
            .vault_key()
            .ok_or_else(|| VaultError::Corrupt("vault key vanished during change".to_string()))?;
        let rec = self.seal_record(new, &key).await?;
        self.store.save(&rec).await.map_err(storage)?;
        tracing::info!("vault pin changed");
        Ok(PinVerifyOutcome::Unlocked)
    }

    async fn verify_in_turn(&self, pin: &str) -> Result<PinVerifyOutcome, VaultError> {
        let Some(mut rec) = self.store.load().await.map_err(storage)? else {
            return Ok(PinVerifyOutcome::NotSet);
        };
        let now = (self.clock)();
        if rec.locked_until_ms > now {
            return Ok(PinVerifyOutcome::Locked {
                retry_after_ms: rec.locked_until_ms - now,
            });
        }

        if !check_verifier(pin, &rec.verifier).await? {
            rec.failures = rec.failures.saturating_add(1);
            rec.locked_until_ms = now + lockout_ms(rec.failures);
            rec.updated_at_ms = now;
            self.store.save(&rec).await.map_err(storage)?;
            tracing::warn!(failures = rec.failures, locked_until_ms = rec.locked_until_ms, "wrong vault pin");
            return Ok(PinVerifyOutcome::Mismatch {
                failures: rec.failures,
                locked_until_ms: rec.locked_until_ms,
            });
        }

        let key = unseal(pin, &rec)?;
        let migrate = rec.v < PIN_RECORD_V2;
        if migrate {
            let verifier = rec.verifier.clone();
            rec = seal_with(pin, &key, verifier, now)?;
            tracing::info!("vault pin record migrated to v2");
        } else {
            rec.failures = 0;
            rec.locked_until_ms = 0;
            rec.updated_at_ms = now;
        }
        self.store.save(&rec).await.map_err(storage)?;
        self.hold(key);
        Ok(PinVerifyOutcome::Unlocked)
    }

    async fn seal_record(&self, pin: &str, key: &VaultKey) -> Result<PinRecord, VaultError> {
        let verifier = hash_pin(pin, self.argon).await?;
        seal_with(pin, key, verifier, (self.clock)())
    }
}

fn seal_key(label: &[u8], pin: &str) -> Zeroizing<[u8; 32]> {
    let mut h = Sha256::new();
    h.update(label);
    h.update(pin.as_bytes());
    Zeroizing::new(h.finalize().into())
}

fn seal_with(pin: &str, key: &VaultKey, verifier: String, now: i64) -> Result<PinRecord, VaultError> {
    let sk = seal_key(SEAL_LABEL_V2, pin);
    let cipher = Aes256Gcm::new_from_slice(sk.as_slice())
        .map_err(|e| VaultError::Corrupt(e.to_string()))?;
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: key.as_slice(),
                aad: SEAL_AAD_V2,
            },
        )
        .map_err(|e| VaultError::Corrupt(format!("seal: {e}")))?;
    Ok(PinRecord {
        v: PIN_RECORD_V2,
        verifier,
        nonce_b64: B64.encode(nonce),
        sealed_vault_key_b64: B64.encode(ct),
        failures: 0,
        locked_until_ms: 0,
        updated_at_ms: now,
    })
}

fn unseal(pin: &str, rec: &PinRecord) -> Result<VaultKey, VaultError> {
    let (label, aad): (&[u8], &[u8]) = if rec.v <= PIN_RECORD_V1 {
        (SEAL_LABEL_V1, b"")
    } else {
        (SEAL_LABEL_V2, SEAL_AAD_V2)
    };
    let nonce = B64
        .decode(rec.nonce_b64.as_bytes())
        .map_err(|e| VaultError::Corrupt(format!("nonce: {e}")))?;
    let ct = B64
        .decode(rec.sealed_vault_key_b64.as_bytes())
        .map_err(|e| VaultError::Corrupt(format!("sealed key: {e}")))?;
    if nonce.len() != 12 {
        return Err(VaultError::Corrupt("bad nonce length".to_string()));
    }
    let sk = seal_key(label, pin);
    let cipher = Aes256Gcm::new_from_slice(sk.as_slice())
        .map_err(|e| VaultError::Corrupt(e.to_string()))?;
    let pt = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: &ct, aad })
            .map_err(|_| VaultError::Corrupt("sealed vault key does not open".to_string()))?,
    );
    if pt.len() != 32 {
        return Err(VaultError::Corrupt("vault key has bad length".to_string()));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&pt);
    Ok(key)
}

async fn hash_pin(pin: &str, cost: Argon2Settings) -> Result<String, VaultError> {
    let pin = Zeroizing::new(pin.to_string());
    tokio::task::spawn_blocking(move || {
        let params = Params::new(cost.m_cost_kib, cost.t_cost, cost.p_cost, None)
            .map_err(|e| VaultError::Corrupt(format!("argon2 params: {e}")))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let salt = SaltString::generate(&mut PhcRng);
        argon
            .hash_password(pin.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| VaultError::Corrupt(format!("argon2: {e}")))
    })
    .await
    .map_err(|e| VaultError::Storage(format!("argon2 task: {e}")))?
}

async fn check_verifier(pin: &str, verifier: &str) -> Result<bool, VaultError> {
    let pin = Zeroizing::new(pin.to_string());
    let verifier = verifier.to_string();
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&verifier)
            .map_err(|e| VaultError::Corrupt(format!("verifier: {e}")))?;
        // Cost parameters come from the PHC string itself.
        Ok(Argon2::default()
            .verify_password(pin.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|e| VaultError::Storage(format!("argon2 task: {e}")))?
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin_store::MemoryPinStore;

    const CHEAP: Argon2Settings = Argon2Settings {
        m_cost_kib: 256,
        t_cost: 1,
        p_cost: 1,
    };

    /// A record as written before the v2 seal label and AAD.
    async fn legacy_v1_record(pin: &str, key: &[u8; 32]) -> PinRecord {
        let verifier = hash_pin(pin, CHEAP).await.unwrap();
        let sk = seal_key(SEAL_LABEL_V1, pin);
        let cipher = Aes256Gcm::new_from_slice(sk.as_slice()).unwrap();
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), key.as_slice())
            .unwrap();
        PinRecord {
            v: PIN_RECORD_V1,
            verifier,
            nonce_b64: B64.encode(nonce),
            sealed_vault_key_b64: B64.encode(ct),
            failures: 0,
            locked_until_ms: 0,
            updated_at_ms: 0,
        }
    }


    #[tokio::test]
    async fn legacy_record_migrates_on_first_unlock() {
        let key = [42u8; 32];
        let legacy = legacy_v1_record("2468", &key).await;
        let store = Arc::new(MemoryPinStore::with_record(legacy.clone()));
        let keyring = VaultKeyring::new(store.clone()).with_argon2(CHEAP);

        assert_eq!(
            keyring.verify_pin("2468").await.unwrap(),
            PinVerifyOutcome::Unlocked
        );
        assert_eq!(*keyring.vault_key().unwrap(), key);

        let migrated = store.load().await.unwrap().unwrap();
        assert_eq!(migrated.v, PIN_RECORD_V2);
        assert_eq!(migrated.verifier, legacy.verifier);
        assert_ne!(migrated.sealed_vault_key_b64, legacy.sealed_vault_key_b64);

        // The migrated record still opens with the same PIN and key.
        keyring.lock();
        assert_eq!(
            keyring.verify_pin("2468").await.unwrap(),
            PinVerifyOutcome::Unlocked
        );
        assert_eq!(*keyring.vault_key().unwrap(), key);
    }

    #[test]
    fn lockout_doubles_and_caps() {
        let got: Vec<i64> = (0..=7).map(lockout_ms).collect();
        assert_eq!(got, vec![0, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn pin_format() {
        assert!(validate_pin("1234").is_ok());
        assert!(validate_pin("12345678").is_ok());
        assert!(validate_pin("123").is_err());
        assert!(validate_pin("123456789").is_err());
        assert!(validate_pin("12a4").is_err());
        assert!(validate_pin("１２３４").is_err());
    }
}
