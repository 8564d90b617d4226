/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use quill_protocol::OnionNetwork;
use std::cmp::Ordering;
use std::path::PathBuf;

pub const TOR_DOWNLOAD_BASE: &str = "https://archive.torproject.org/tor-package-archive/torbrowser";
pub const LOKINET_DOWNLOAD_BASE: &str = "https://github.com/oxen-io/lokinet/releases/download";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Platform {
    Linux,
    Darwin,
    Win32,
}

impl Platform {
    /// Id used in pinned-hash keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Darwin => "darwin",
            Platform::Win32 => "win32",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "linux" => Some(Self::Linux),
            "darwin" | "macos" => Some(Self::Darwin),
            "win32" | "windows" => Some(Self::Win32),
            _ => None,
        }
    }

    fn tokens(&self) -> &'static [&'static str] {
        match self {
            Platform::Linux => &["linux"],
            Platform::Darwin => &["macos", "darwin", "osx", "mac"],
            Platform::Win32 => &["windows", "win32", "win64", "win"],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    X64,
    Arm64,
    Ia32,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
            Arch::Ia32 => "ia32",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "x64" | "x86_64" | "amd64" => Some(Self::X64),
            "arm64" | "aarch64" => Some(Self::Arm64),
            "ia32" | "x86" | "i686" => Some(Self::Ia32),
            _ => None,
        }
    }

    fn tokens(&self) -> &'static [&'static str] {
        match self {
            Arch::X64 => &["x86_64", "amd64", "x64"],
            Arch::Arm64 => &["arm64", "aarch64"],
            Arch::Ia32 => &["i686", "i386", "x86", "ia32"],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostTarget {
    pub platform: Platform,
    pub arch: Arch,
}

impl HostTarget {
    pub fn current() -> Option<Self> {
        let platform = match std::env::consts::OS {
            "linux" => Platform::Linux,
            "macos" => Platform::Darwin,
            "windows" => Platform::Win32,
            _ => return None,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => Arch::X64,
            "aarch64" => Arch::Arm64,
            "x86" => Arch::Ia32,
            _ => return None,
        };
        Some(Self { platform, arch })
    }
}

pub fn platform_label(network: OnionNetwork, platform: Platform) -> &'static str {
    match (network, platform) {
        (_, Platform::Linux) => "linux",
        (_, Platform::Darwin) => "macos",
        (_, Platform::Win32) => "windows",
    }
}

pub fn arch_label(network: OnionNetwork, arch: Arch) -> &'static str {
    match (network, arch) {
        (OnionNetwork::Tor, Arch::X64) => "x86_64",
        (OnionNetwork::Tor, Arch::Arm64) => "aarch64",
        (OnionNetwork::Tor, Arch::Ia32) => "i686",
        (OnionNetwork::Lokinet, Arch::X64) => "amd64",
        (OnionNetwork::Lokinet, Arch::Arm64) => "aarch64",
        (OnionNetwork::Lokinet, Arch::Ia32) => "x86",
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetSpec {
    pub network: OnionNetwork,
    pub version: String,
    pub name: String,
    pub url: String,
    /// Locations, relative to the install dir, where the executable may
    /// live. The first existing one wins.
    pub binary_candidates: Vec<PathBuf>,
}

pub fn asset_name(network: OnionNetwork, target: HostTarget, version: &str) -> String {
    let p = platform_label(network, target.platform);
    let a = arch_label(network, target.arch);
    match network {
        OnionNetwork::Tor => format!("tor-expert-bundle-{p}-{a}-{version}.tar.gz"),
        OnionNetwork::Lokinet => {
            let ext = if target.platform == Platform::Win32 {
                "zip"
            } else {
                "tar.xz"
            };
            format!("lokinet-{p}-{a}-v{version}.{ext}")
        }
    }
}

pub fn binary_candidates(network: OnionNetwork, platform: Platform) -> Vec<PathBuf> {
    let exe = |name: &str| {
        if platform == Platform::Win32 {
            format!("{name}.exe")
        } else {
            name.to_string()
        }
    };
    match network {
        OnionNetwork::Tor => vec![
            PathBuf::from("tor").join(exe("tor")),
            PathBuf::from(exe("tor")),
        ],
        OnionNetwork::Lokinet => vec![
            PathBuf::from("bin").join(exe("lokinet")),
            PathBuf::from(exe("lokinet")),
        ],
    }
}

/// Conventional asset for `(network, target, version)`, downloaded from
/// `base_url` (or the upstream default).
pub fn resolve_asset(
    network: OnionNetwork,
    target: HostTarget,
    version: &str,
    base_url: Option<&str>,
) -> AssetSpec {
    let version = version.trim().trim_start_matches('v').to_string();
    let name = asset_name(network, target, &version);
    let base = base_url
        .map(|b| b.trim_end_matches('/').to_string())
        .unwrap_or_else(|| match network {
            OnionNetwork::Tor => TOR_DOWNLOAD_BASE.to_string(),
            OnionNetwork::Lokinet => LOKINET_DOWNLOAD_BASE.to_string(),
        });
    let url = match network {
        OnionNetwork::Tor => format!("{base}/{version}/{name}"),
        OnionNetwork::Lokinet => format!("{base}/v{version}/{name}"),
    };
    AssetSpec {
        network,
        binary_candidates: binary_candidates(network, target.platform),
        version,
        name,
        url,
    }
}

const SIGNATURE_SUFFIXES: &[&str] = &[".sig", ".asc", ".minisig", ".sha256", ".sha256sum", ".sign"];
const ARCHIVE_SUFFIXES: &[&str] = &[".zip", ".tar.gz", ".tgz", ".tar.xz"];

/// Picks the release asset for `target` among upstream filenames. Detached
/// signatures and non-archives are never candidates.
pub fn select_release_asset<'a>(names: &[&'a str], target: HostTarget) -> Option<&'a str> {
    names.iter().copied().find(|name| {
        let lower = name.to_ascii_lowercase();
        if SIGNATURE_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
            return false;
        }
        if !ARCHIVE_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
            return false;
        }
        let tokens = filename_tokens(&lower);
        let has = |class: &[&str]| class.iter().any(|t| tokens.iter().any(|x| x == t));
        has(target.platform.tokens()) && has(target.arch.tokens())
    })
}

// "lokinet-linux-x86_64-v0.9.11.tar.xz" -> ["lokinet", "linux", "x86_64", "v0", "9", ...]
fn filename_tokens(lower: &str) -> Vec<String> {
    lower
        .split(|c: char| c == '-' || c == '.' || c == ' ' || c == '+')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Numeric dotted-version comparison; a leading `v` is ignored and
/// non-numeric suffixes (`14.5a3`) compare by their leading digits.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .trim_start_matches('v')
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse::<u64>().unwrap_or(0)
            })
            .collect()
    };
    let (pa, pb) = (parse(a), parse(b));
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let x = pa.get(i).copied().unwrap_or(0);
        let y = pb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

pub fn looks_like_version(s: &str) -> bool {
    let s = s.trim().trim_start_matches('v');
    !s.is_empty()
        && s.split('.').count() >= 2
        && s.split('.').all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
