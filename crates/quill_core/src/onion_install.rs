/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use futures_util::StreamExt;
use quill_protocol::{InstallProgress, OnionNetwork, OperationDetails};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::component_pointer::{self, ComponentPointer};
use crate::onion_assets::{resolve_asset, AssetSpec, HostTarget, Platform};
use crate::pinned_hashes::{pinned_key, PinnedHashes};

const MAX_REDIRECTS: usize = 5;
const PROGRESS_STEP_BYTES: u64 = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("no pinned sha256 for {key}")]
    PinnedHashMissing { key: String },
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("extract failed: {0}")]
    ExtractFailed(String),
    #[error("binary not found in {0}")]
    BinaryMissing(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("filesystem error: {0}")]
    Fs(String),
    #[error("install already in progress")]
    Busy,
    #[error("{0}")]
    Unknown(String),
}

impl InstallError {
    pub fn code(&self) -> &'static str {
        match self {
            InstallError::PinnedHashMissing { .. } => "PINNED_HASH_MISSING",
            InstallError::HashMismatch { .. } => "HASH_MISMATCH",
            InstallError::DownloadFailed(_) => "DOWNLOAD_FAILED",
            InstallError::ExtractFailed(_) => "EXTRACT_FAILED",
            InstallError::BinaryMissing(_) => "BINARY_MISSING",
            InstallError::PermissionDenied(_) => "PERMISSION_DENIED",
            InstallError::Fs(_) => "FS_ERROR",
            InstallError::Busy | InstallError::Unknown(_) => "UNKNOWN_ERROR",
        }
    }
}

impl From<std::io::Error> for InstallError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            InstallError::PermissionDenied(e.to_string())
        } else {
            InstallError::Fs(e.to_string())
        }
    }
}

impl From<reqwest::Error> for InstallError {
    fn from(e: reqwest::Error) -> Self {
        InstallError::DownloadFailed(e.to_string())
    }
}

fn fs_err(e: anyhow::Error) -> InstallError {
    match e.downcast_ref::<std::io::Error>() {
        Some(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
            InstallError::PermissionDenied(format!("{e:#}"))
        }
        _ => InstallError::Fs(format!("{e:#}")),
    }
}

/// Everything an install needs to know up front; also used to fill
/// failure details when the install never gets far.
#[derive(Clone, Debug)]
pub struct InstallPlan {
    pub target: HostTarget,
    pub asset: AssetSpec,
    pub target_dir: PathBuf,
}

impl InstallPlan {
    pub fn details(&self) -> OperationDetails {
        OperationDetails {
            network: Some(self.asset.network),
            version: Some(self.asset.version.clone()),
            asset_name: Some(self.asset.name.clone()),
            download_url: Some(self.asset.url.clone()),
            target_dir: Some(self.target_dir.display().to_string()),
        }
    }
}

#[derive(Debug)]
pub struct InstallOutcome {
    pub pointer: ComponentPointer,
    pub previous: Option<ComponentPointer>,
    pub rollback: Rollback,
}

/// Restores the pointer that was active before an install.
///
/// Reinstalling the active version unpacks next to it; the old directory
/// stays until [`Rollback::commit`] so a rollback can still point at it.
#[derive(Debug)]
pub struct Rollback {
    root: PathBuf,
    network: OnionNetwork,
    previous: Option<ComponentPointer>,
    installed: PathBuf,
    replaced: Option<PathBuf>,
}

impl Rollback {
    pub fn previous(&self) -> Option<&ComponentPointer> {
        self.previous.as_ref()
    }

    /// Directory the previous pointer lives in when it is superseded by a
    /// reinstall of the same version.
    pub fn replaced_dir(&self) -> Option<&Path> {
        self.replaced.as_deref()
    }

    pub async fn apply(self) -> Result<(), InstallError> {
        match &self.previous {
            Some(ptr) => component_pointer::write_pointer_atomic(&self.root, self.network, ptr)
                .await
                .map_err(fs_err)?,
            None => component_pointer::remove_pointer(&self.root, self.network)
                .await
                .map_err(fs_err)?,
        }
        if self.replaced.is_some() {
            remove_dir_logged(&self.installed).await;
        }
        tracing::info!(
            network = %self.network,
            restored = ?self.previous.as_ref().map(|p| p.version.as_str()),
            "install rolled back"
        );
        Ok(())
    }

    /// Keeps the new install and drops the directory it replaced.
    pub async fn commit(self) {
        if let Some(dir) = &self.replaced {
            remove_dir_logged(dir).await;
        }
    }
}

async fn remove_dir_logged(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(path = %dir.display(), "removed install dir"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %dir.display(), error = %e, "remove install dir"),
    }
}

/// Top-level directory under `net_dir` holding `ptr`'s binary.
fn install_dir_of(net_dir: &Path, ptr: &ComponentPointer) -> Option<PathBuf> {
    let rel = ptr.path.strip_prefix(net_dir).ok()?;
    let first = rel.components().next()?;
    Some(net_dir.join(first.as_os_str()))
}

#[derive(Clone, Debug, Default)]
pub struct DownloadBases {
    pub tor: Option<String>,
    pub lokinet: Option<String>,
}

pub struct Installer {
    root: PathBuf,
    target: HostTarget,
    pinned: Arc<PinnedHashes>,
    bases: DownloadBases,
    client: reqwest::Client,
}

impl Installer {
    pub fn new(
        root: PathBuf,
        target: HostTarget,
        pinned: Arc<PinnedHashes>,
        bases: DownloadBases,
    ) -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(Duration::from_secs(20))
            .user_agent(concat!("quill/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            root,
            target,
            pinned,
            bases,
            client,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn target(&self) -> HostTarget {
        self.target
    }

    pub fn pinned(&self) -> &PinnedHashes {
        &self.pinned
    }

    pub fn plan(&self, network: OnionNetwork, version: &str) -> InstallPlan {
        let base = match network {
            OnionNetwork::Tor => self.bases.tor.as_deref(),
            OnionNetwork::Lokinet => self.bases.lokinet.as_deref(),
        };
        let asset = resolve_asset(network, self.target, version, base);
        let target_dir = component_pointer::network_dir(&self.root, network).join(&asset.version);
        InstallPlan {
            target: self.target,
            asset,
            target_dir,
        }
    }

    /// Like [`Installer::plan`] but downloading an asset the release feed
    /// named explicitly.
    pub fn plan_for_asset(
        &self,
        network: OnionNetwork,
        version: &str,
        name: &str,
        url: &str,
    ) -> InstallPlan {
        let mut plan = self.plan(network, version);
        plan.asset.name = name.to_string();
        plan.asset.url = url.to_string();
        plan
    }

    /// Download, verify, unpack and activate `plan`. The pointer is only
    /// touched after every earlier step succeeded.
    pub async fn install<F>(
        &self,
        plan: &InstallPlan,
        progress: F,
    ) -> Result<InstallOutcome, InstallError>
    where
        F: Fn(InstallProgress),
    {
        let asset = &plan.asset;
        let network = asset.network;
        let expected = self
            .pinned
            .lookup(plan.target, &asset.version, &asset.name)
            .ok_or_else(|| InstallError::PinnedHashMissing {
                key: pinned_key(plan.target, &asset.version, &asset.name),
            })?
            .to_string();

        let net_dir = component_pointer::network_dir(&self.root, network);
        let staging = Staging::create(&net_dir).await?;
        let archive = staging.path().join(&asset.name);

        let actual = self.download(asset, &archive, &progress).await?;
        if !actual.eq_ignore_ascii_case(&expected) {
            return Err(InstallError::HashMismatch { expected, actual });
        }
        progress(InstallProgress::Verify {
            network,
            version: asset.version.clone(),
            sha256: actual,
        });

        let unpacked = staging.path().join("unpacked");
        tokio::fs::create_dir_all(&unpacked).await?;
        extract(&archive, &unpacked, plan.target.platform).await?;
        let (content_root, rel_binary) = locate_binary(&unpacked, &asset.binary_candidates).await?;

        // Never delete what the active pointer resolves to before the swap.
        let previous = component_pointer::read_pointer(&self.root, network)
            .await
            .map_err(fs_err)?;
        let active_dir = previous.as_ref().and_then(|p| install_dir_of(&net_dir, p));
        let dest = if !tokio::fs::try_exists(&plan.target_dir).await? {
            plan.target_dir.clone()
        } else if active_dir.as_deref() == Some(plan.target_dir.as_path()) {
            fresh_sibling(&plan.target_dir)
        } else {
            tokio::fs::remove_dir_all(&plan.target_dir).await?;
            plan.target_dir.clone()
        };
        let replaced = active_dir.filter(|d| {
            previous.as_ref().map(|p| p.version.as_str()) == Some(asset.version.as_str())
                && *d != dest
        });

        tokio::fs::rename(&content_root, &dest).await?;
        let binary = dest.join(&rel_binary);
        make_executable(&binary).await?;
        progress(InstallProgress::Unpack {
            network,
            version: asset.version.clone(),
            target_dir: dest.display().to_string(),
        });

        let pointer = ComponentPointer {
            version: asset.version.clone(),
            path: binary,
        };
        component_pointer::write_pointer_atomic(&self.root, network, &pointer)
            .await
            .map_err(fs_err)?;
        progress(InstallProgress::Activate {
            network,
            version: asset.version.clone(),
            path: pointer.path.display().to_string(),
        });
        tracing::info!(
            %network,
            version = %asset.version,
            path = %pointer.path.display(),
            "component activated"
        );

        Ok(InstallOutcome {
            rollback: Rollback {
                root: self.root.clone(),
                network,
                previous: previous.clone(),
                installed: dest,
                replaced,
            },
            pointer,
            previous,
        })
    }

    async fn download<F>(
        &self,
        asset: &AssetSpec,
        dest: &Path,
        progress: &F,
    ) -> Result<String, InstallError>
    where
        F: Fn(InstallProgress),
    {
        tracing::info!(url = %asset.url, "downloading component");
        let resp = self.client.get(&asset.url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(InstallError::DownloadFailed(format!(
                "http {status} for {}",
                asset.url
            )));
        }
        let total = resp.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;
        let mut reported: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if received - reported >= PROGRESS_STEP_BYTES {
                reported = received;
                progress(InstallProgress::Download {
                    network: asset.network,
                    version: asset.version.clone(),
                    received_bytes: received,
                    total_bytes: total,
                });
            }
        }
        file.flush().await?;
        progress(InstallProgress::Download {
            network: asset.network,
            version: asset.version.clone(),
            received_bytes: received,
            total_bytes: total,
        });
        Ok(hex::encode(hasher.finalize()))
    }
}

/// `<version>.<nonce>` next to `dir`.
fn fresh_sibling(dir: &Path) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.with_file_name(format!("{name}.{:08x}", rand::random::<u32>()))
}

/// Scratch directory removed on drop, whatever the install outcome.
struct Staging(PathBuf);

impl Staging {
    async fn create(net_dir: &Path) -> Result<Self, InstallError> {
        let path = net_dir.join(format!(".staging-{:08x}", rand::random::<u32>()));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.0.display(), error = %e, "staging cleanup failed");
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    TarXz,
}

impl ArchiveKind {
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar.xz") {
            Some(Self::TarXz)
        } else {
            None
        }
    }
}

async fn extract(archive: &Path, dest: &Path, platform: Platform) -> Result<(), InstallError> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let kind = ArchiveKind::detect(name)
        .ok_or_else(|| InstallError::ExtractFailed(format!("unsupported archive {name}")))?;

    let mut cmd = match (kind, platform) {
        (ArchiveKind::Zip, Platform::Win32) => {
            let mut c = tokio::process::Command::new("powershell");
            c.arg("-NoProfile")
                .arg("-NonInteractive")
                .arg("-Command")
                .arg("Expand-Archive -Force -LiteralPath $env:QUILL_ARCHIVE -DestinationPath $env:QUILL_DEST")
                .env("QUILL_ARCHIVE", archive)
                .env("QUILL_DEST", dest);
            c
        }
        (ArchiveKind::Zip, _) => {
            let mut c = tokio::process::Command::new("unzip");
            c.arg("-q").arg("-o").arg(archive).arg("-d").arg(dest);
            c
        }
        (ArchiveKind::TarGz, _) | (ArchiveKind::TarXz, _) => {
            let flag = if kind == ArchiveKind::TarGz { "-xzf" } else { "-xJf" };
            let mut c = tokio::process::Command::new("tar");
            c.arg(flag).arg(archive).arg("-C").arg(dest);
            c
        }
    };
    cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);

    let out = cmd
        .output()
        .await
        .map_err(|e| InstallError::ExtractFailed(format!("spawn extractor: {e}")))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(InstallError::ExtractFailed(format!(
            "{} ({})",
            out.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Finds the executable inside `unpacked`. Archives that wrap everything
/// in a single top-level folder are looked into as well. Returns the
/// directory that becomes the install dir and the binary path relative to
/// it.
async fn locate_binary(
    unpacked: &Path,
    candidates: &[PathBuf],
) -> Result<(PathBuf, PathBuf), InstallError> {
    let mut roots = vec![unpacked.to_path_buf()];
    let mut entries = tokio::fs::read_dir(unpacked).await?;
    let mut dirs = Vec::new();
    let mut others = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        } else {
            others += 1;
        }
    }
    if dirs.len() == 1 && others == 0 {
        roots.extend(dirs);
    }

    for root in roots {
        for rel in candidates {
            let meta = tokio::fs::metadata(root.join(rel)).await;
            if matches!(meta, Ok(m) if m.is_file()) {
                return Ok((root, rel.clone()));
            }
        }
    }
    Err(InstallError::BinaryMissing(unpacked.display().to_string()))
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), InstallError> {
    Ok(())
}
