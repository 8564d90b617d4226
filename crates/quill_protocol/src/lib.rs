/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OnionNetwork {
    Tor,
    Lokinet,
}

impl OnionNetwork {
    pub const ALL: [OnionNetwork; 2] = [OnionNetwork::Tor, OnionNetwork::Lokinet];

    pub fn as_str(&self) -> &'static str {
        match self {
            OnionNetwork::Tor => "tor",
            OnionNetwork::Lokinet => "lokinet",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "tor" => Some(Self::Tor),
            "lokinet" | "loki" => Some(Self::Lokinet),
            _ => None,
        }
    }
}

impl fmt::Display for OnionNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SyncHeader {
    pub conv_id: String,
    pub event_id: String,
    pub author_device_id: String,
    pub ts: i64,
    pub lamport: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
}

/// Multi-device sync event as it travels between devices.
///
/// `sig_b64` covers the header and both base64 fields; see
/// `quill_core::sync_crypto::signing_bytes`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SyncEnvelope {
    pub header: SyncHeader,
    pub ciphertext_b64: String,
    pub nonce_b64: String,
    pub sig_b64: String,
}

/// Install progress, keyed by step.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum InstallProgress {
    Download {
        network: OnionNetwork,
        version: String,
        received_bytes: u64,
        total_bytes: Option<u64>,
    },
    Verify {
        network: OnionNetwork,
        version: String,
        sha256: String,
    },
    Unpack {
        network: OnionNetwork,
        version: String,
        target_dir: String,
    },
    Activate {
        network: OnionNetwork,
        version: String,
        path: String,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct OperationDetails {
    pub network: Option<OnionNetwork>,
    pub version: Option<String>,
    pub asset_name: Option<String>,
    pub download_url: Option<String>,
    pub target_dir: Option<String>,
}

/// Error payload surfaced for install/update/uninstall operations.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    pub code: String,
    pub message: String,
    pub details: OperationDetails,
}
