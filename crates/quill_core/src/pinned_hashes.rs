/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

use crate::onion_assets::HostTarget;

/// Known-good SHA-256 digests of upstream archives, keyed by
/// `"{platform}:{arch}:{version}:{filename}"`.
#[derive(Clone, Debug, Default)]
pub struct PinnedHashes {
    entries: HashMap<String, String>,
}

pub fn pinned_key(target: HostTarget, version: &str, filename: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        target.platform.as_str(),
        target.arch.as_str(),
        version,
        filename
    )
}

impl PinnedHashes {
    /// JSON object `{ key: hex }`. A missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "pinned hash table not found");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let map: HashMap<String, String> =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        Ok(Self::from_entries(map))
    }

    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .filter_map(|(k, v)| {
                let key: String = k.into();
                let hex = v.as_ref().trim().to_ascii_lowercase();
                let valid = hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit());
                if !valid {
                    tracing::warn!(key = %key, "ignoring malformed pinned hash");
                    return None;
                }
                Some((key, hex))
            })
            .collect();
        Self { entries }
    }

    pub fn lookup(&self, target: HostTarget, version: &str, filename: &str) -> Option<&str> {
        self.entries
            .get(&pinned_key(target, version, filename))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
