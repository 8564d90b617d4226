/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use quill_protocol::OnionNetwork;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;

use crate::http_retry;
use crate::onion_assets::{compare_versions, looks_like_version, select_release_asset, HostTarget};
use crate::pinned_hashes::PinnedHashes;

pub const TOR_FEED_URL: &str = "https://dist.torproject.org/torbrowser/";
pub const LOKINET_FEED_URL: &str = "https://api.github.com/repos/oxen-io/lokinet/releases/latest";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LatestRelease {
    pub version: String,
    /// Upstream asset for the host, when the feed lists assets.
    pub asset: Option<ReleaseAsset>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UpdateInfo {
    pub network: OnionNetwork,
    pub current: Option<String>,
    pub latest: String,
    pub asset_name: String,
    pub download_url: String,
    pub update_available: bool,
    pub installable: bool,
    /// Error code explaining why `installable` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<String>,
}

/// Highest stable version directory in an Apache-style index page.
pub fn parse_tor_listing(html: &str) -> Option<String> {
    let mut best: Option<String> = None;
    let mut rest = html;
    while let Some(i) = rest.find("href=\"") {
        rest = &rest[i + 6..];
        let Some(end) = rest.find('"') else {
            break;
        };
        let candidate = rest[..end].trim_end_matches('/');
        rest = &rest[end..];
        if !looks_like_version(candidate) {
            continue;
        }
        let newer = match &best {
            Some(b) => compare_versions(candidate, b) == Ordering::Greater,
            None => true,
        };
        if newer {
            best = Some(candidate.to_string());
        }
    }
    best
}

#[derive(Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

pub fn parse_lokinet_release(json: &str, target: HostTarget) -> Result<LatestRelease> {
    let rel: GithubRelease = serde_json::from_str(json).context("parse release json")?;
    if rel.draft || rel.prerelease {
        anyhow::bail!("latest release {} is not a stable release", rel.tag_name);
    }
    let version = rel.tag_name.trim().trim_start_matches('v').to_string();
    if !looks_like_version(&version) {
        anyhow::bail!("unexpected release tag {}", rel.tag_name);
    }
    let names: Vec<&str> = rel.assets.iter().map(|a| a.name.as_str()).collect();
    let asset = select_release_asset(&names, target).and_then(|picked| {
        rel.assets
            .iter()
            .find(|a| a.name == picked)
            .map(|a| ReleaseAsset {
                name: a.name.clone(),
                url: a.browser_download_url.clone(),
            })
    });
    Ok(LatestRelease { version, asset })
}

pub struct UpdateChecker {
    client: reqwest::Client,
    tor_feed: String,
    lokinet_feed: String,
}

impl UpdateChecker {
    pub fn new(tor_feed: Option<String>, lokinet_feed: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("quill/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build update client")?;
        Ok(Self {
            client,
            tor_feed: tor_feed.unwrap_or_else(|| TOR_FEED_URL.to_string()),
            lokinet_feed: lokinet_feed.unwrap_or_else(|| LOKINET_FEED_URL.to_string()),
        })
    }

    pub async fn latest(&self, network: OnionNetwork, target: HostTarget) -> Result<LatestRelease> {
        match network {
            OnionNetwork::Tor => {
                let html = http_retry::get_text(&self.client, &self.tor_feed, 3).await?;
                let version = parse_tor_listing(&html)
                    .with_context(|| format!("no versions listed at {}", self.tor_feed))?;
                Ok(LatestRelease {
                    version,
                    asset: None,
                })
            }
            OnionNetwork::Lokinet => {
                let json = http_retry::get_text(&self.client, &self.lokinet_feed, 3).await?;
                parse_lokinet_release(&json, target)
            }
        }
    }
}

/// Combine the feed answer with the local state. `asset` is what an
/// install of `latest` would download.
pub fn evaluate(
    network: OnionNetwork,
    target: HostTarget,
    current: Option<&str>,
    latest: &str,
    asset: &ReleaseAsset,
    pinned: &PinnedHashes,
) -> UpdateInfo {
    let update_available = match current {
        Some(c) => compare_versions(latest, c) == Ordering::Greater,
        None => true,
    };
    let pinned_ok = pinned.lookup(target, latest, &asset.name).is_some();
    UpdateInfo {
        network,
        current: current.map(str::to_string),
        latest: latest.to_string(),
        asset_name: asset.name.clone(),
        download_url: asset.url.clone(),
        update_available,
        installable: pinned_ok,
        blocked: (!pinned_ok).then(|| "PINNED_HASH_MISSING".to_string()),
    }
}
