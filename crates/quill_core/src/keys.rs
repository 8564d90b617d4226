/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use aes_gcm::{aead::Aead, aead::KeyInit, aead::Payload, Aes256Gcm, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use directories::ProjectDirs;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore as _};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::{
    fs,
    path::{Path, PathBuf},
};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};
use zeroize::Zeroizing;

const IDENTITY_FILE: &str = "device_identity.sealed";
const IDENTITY_AAD: &[u8] = b"quill-device-identity/v1";

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("QUILL_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "quill", "Quill")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

/// Public half of a device, as known to other devices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceKeys {
    pub signing: VerifyingKey,
    pub agreement: XPublicKey,
}

#[derive(Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub signing: SigningKey,
    pub agreement: StaticSecret,
}

impl DeviceIdentity {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let agreement = StaticSecret::random_from_rng(OsRng);
        Self::from_parts(signing, agreement)
    }

    fn from_parts(signing: SigningKey, agreement: StaticSecret) -> Self {
        Self {
            device_id: device_id_for(&signing.verifying_key()),
            signing,
            agreement,
        }
    }

    pub fn device_keys(&self) -> DeviceKeys {
        DeviceKeys {
            signing: self.signing.verifying_key(),
            agreement: XPublicKey::from(&self.agreement),
        }
    }
}

pub fn device_id_for(key: &VerifyingKey) -> String {
    let mut h = sha2::Sha256::new();
    h.update(key.as_bytes());
    let hex = hex::encode(h.finalize());
    hex[..32].to_string()
}

#[derive(Serialize, Deserialize)]
struct SealedIdentity {
    v: u32,
    nonce_b64: String,
    ct_b64: String,
}

/// Loads the device identity sealed under `vault_key`, creating one on
/// first run.
pub fn load_or_generate_identity(dir: impl AsRef<Path>, vault_key: &[u8; 32]) -> Result<DeviceIdentity> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("create data dir: {}", dir.display()))?;
    let path = dir.join(IDENTITY_FILE);
    let cipher = Aes256Gcm::new_from_slice(vault_key).map_err(|e| anyhow!("vault key: {e}"))?;

    if path.exists() {
        let raw = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let sealed: SealedIdentity = serde_json::from_slice(&raw).context("parse sealed identity")?;
        let nonce = B64.decode(sealed.nonce_b64.as_bytes())?;
        let ct = B64.decode(sealed.ct_b64.as_bytes())?;
        if nonce.len() != 12 {
            anyhow::bail!("sealed identity has bad nonce");
        }
        let pt = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &ct,
                        aad: IDENTITY_AAD,
                    },
                )
                .map_err(|_| anyhow!("device identity does not open with this vault key"))?,
        );
        if pt.len() != 64 {
            anyhow::bail!("sealed identity has bad length");
        }
        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(&pt[..32]);
        let mut x = Zeroizing::new([0u8; 32]);
        x.copy_from_slice(&pt[32..]);
        return Ok(DeviceIdentity::from_parts(
            SigningKey::from_bytes(&seed),
            StaticSecret::from(*x),
        ));
    }

    let id = DeviceIdentity::generate();
    let mut pt = Zeroizing::new(Vec::with_capacity(64));
    pt.extend_from_slice(&id.signing.to_bytes());
    pt.extend_from_slice(id.agreement.as_bytes());
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &pt,
                aad: IDENTITY_AAD,
            },
        )
        .map_err(|e| anyhow!("seal identity: {e}"))?;
    let sealed = SealedIdentity {
        v: 1,
        nonce_b64: B64.encode(nonce),
        ct_b64: B64.encode(ct),
    };
    let tmp = dir.join(format!(".{IDENTITY_FILE}.tmp"));
    fs::write(&tmp, serde_json::to_vec(&sealed)?).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("write {}", path.display()))?;
    tracing::info!(device_id = %id.device_id, "generated device identity");
    Ok(id)
}
