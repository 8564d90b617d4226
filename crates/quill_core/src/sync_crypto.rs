/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use aes_gcm::{aead::Aead, aead::KeyInit, aead::Payload, Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use quill_protocol::{SyncEnvelope, SyncHeader};
use rand::RngCore as _;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};
use zeroize::Zeroizing;

const SYNC_KDF_INFO: &[u8] = b"quill/sync/v1";
const SIGNING_DOMAIN: &[u8] = b"quill-sync-event-v1\n";
const HASH_DOMAIN: &[u8] = b"quill-sync-chain-v1\n";

/// Canonical header encoding; also the AEAD associated data.
pub fn header_bytes(h: &SyncHeader) -> Vec<u8> {
    // Field order is fixed by the struct definition.
    serde_json::to_vec(h).unwrap_or_default()
}

pub fn signing_bytes(h: &SyncHeader, ciphertext_b64: &str, nonce_b64: &str) -> Vec<u8> {
    let header = header_bytes(h);
    let mut out =
        Vec::with_capacity(SIGNING_DOMAIN.len() + header.len() + ciphertext_b64.len() + nonce_b64.len() + 2);
    out.extend_from_slice(SIGNING_DOMAIN);
    out.extend_from_slice(&header);
    out.push(b'\n');
    out.extend_from_slice(ciphertext_b64.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(nonce_b64.as_bytes());
    out
}

/// Chain hash of an event: the canonical header and a digest of the
/// plaintext. The per-recipient ciphertext stays out so every device that
/// receives the event links to the same hash.
pub fn event_hash(h: &SyncHeader, plaintext: &[u8]) -> String {
    let body = Sha256::digest(plaintext);
    let mut d = Sha256::new();
    d.update(HASH_DOMAIN);
    d.update(header_bytes(h));
    d.update(b"\n");
    d.update(body);
    hex::encode(d.finalize())
}

pub fn sign_event(
    key: &SigningKey,
    h: &SyncHeader,
    ciphertext_b64: &str,
    nonce_b64: &str,
) -> String {
    let sig = key.sign(&signing_bytes(h, ciphertext_b64, nonce_b64));
    B64.encode(sig.to_bytes())
}

pub fn verify_event(key: &VerifyingKey, env: &SyncEnvelope) -> bool {
    let Ok(raw) = B64.decode(env.sig_b64.as_bytes()) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&raw) else {
        return false;
    };
    key.verify(
        &signing_bytes(&env.header, &env.ciphertext_b64, &env.nonce_b64),
        &sig,
    )
    .is_ok()
}

/// HKDF-SHA256 over `conv_secret || X25519(local, remote)`, salted with the
/// conversation id.
pub fn derive_sync_key(
    conv_secret: &[u8],
    local: &StaticSecret,
    remote: &XPublicKey,
    conv_id: &str,
) -> Result<Zeroizing<[u8; 32]>> {
    let dh = local.diffie_hellman(remote);
    let mut ikm = Zeroizing::new(Vec::with_capacity(conv_secret.len() + 32));
    ikm.extend_from_slice(conv_secret);
    ikm.extend_from_slice(dh.as_bytes());
    let hk = Hkdf::<Sha256>::new(Some(conv_id.as_bytes()), &ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(SYNC_KDF_INFO, &mut okm[..])
        .map_err(|e| anyhow!("hkdf expand: {e}"))?;
    Ok(okm)
}

/// Returns `(ciphertext_b64, nonce_b64)`.
pub fn seal_payload(key: &[u8; 32], h: &SyncHeader, plaintext: &[u8]) -> Result<(String, String)> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("aes key: {e}"))?;
    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let aad = header_bytes(h);
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| anyhow!("aes-gcm encrypt: {e}"))?;
    Ok((B64.encode(ct), B64.encode(nonce_bytes)))
}

pub fn open_payload(key: &[u8; 32], env: &SyncEnvelope) -> Result<Vec<u8>> {
    let ct = B64.decode(env.ciphertext_b64.as_bytes())?;
    let nonce = B64.decode(env.nonce_b64.as_bytes())?;
    if nonce.len() != 12 {
        anyhow::bail!("bad nonce length {}", nonce.len());
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("aes key: {e}"))?;
    let aad = header_bytes(&env.header);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &ct,
                aad: &aad,
            },
        )
        .map_err(|e| anyhow!("aes-gcm decrypt: {e}"))
}
