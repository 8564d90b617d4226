/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use quill_protocol::OnionNetwork;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `<root>/<network>/current.json`: which installed version is active.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentPointer {
    pub version: String,
    pub path: PathBuf,
}

pub fn network_dir(root: &Path, network: OnionNetwork) -> PathBuf {
    root.join(network.as_str())
}

pub fn pointer_path(root: &Path, network: OnionNetwork) -> PathBuf {
    network_dir(root, network).join("current.json")
}

pub async fn read_pointer(root: &Path, network: OnionNetwork) -> Result<Option<ComponentPointer>> {
    let path = pointer_path(root, network);
    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let ptr = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(ptr))
}

pub async fn write_pointer_atomic(
    root: &Path,
    network: OnionNetwork,
    ptr: &ComponentPointer,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(ptr)?;
    write_atomic(&pointer_path(root, network), &bytes).await
}

pub async fn remove_pointer(root: &Path, network: OnionNetwork) -> Result<()> {
    let path = pointer_path(root, network);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

/// Write to a sibling temp file then rename over `path`, so readers see
/// either the old or the new content.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("pointer");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", rand::random::<u32>()));
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("rename into {}", path.display()));
    }
    Ok(())
}
