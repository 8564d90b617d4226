/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use quill_protocol::OnionNetwork;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteMode {
    Auto,
    PreferLokinet,
    PreferTor,
    /// Operator picked one transport by hand. More than one available
    /// target is treated as ambiguous and yields no route.
    Manual,
}

impl RouteMode {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "auto" => Some(Self::Auto),
            "preferLokinet" | "prefer_lokinet" | "prefer-lokinet" => Some(Self::PreferLokinet),
            "preferTor" | "prefer_tor" | "prefer-tor" => Some(Self::PreferTor),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Lokinet,
    Tor,
}

impl RouteKind {
    pub fn network(&self) -> OnionNetwork {
        match self {
            RouteKind::Lokinet => OnionNetwork::Lokinet,
            RouteKind::Tor => OnionNetwork::Tor,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct RouteEndpoints {
    pub lokinet: Option<String>,
    pub tor_onion: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteCandidate {
    pub kind: RouteKind,
    pub target: String,
}

pub fn select_route(mode: RouteMode, endpoints: &RouteEndpoints) -> Vec<RouteCandidate> {
    let lokinet = present(&endpoints.lokinet).map(|t| RouteCandidate {
        kind: RouteKind::Lokinet,
        target: t,
    });
    let tor = present(&endpoints.tor_onion).map(|t| RouteCandidate {
        kind: RouteKind::Tor,
        target: t,
    });

    match mode {
        RouteMode::Auto => lokinet.into_iter().chain(tor).collect(),
        RouteMode::PreferLokinet => lokinet.into_iter().collect(),
        RouteMode::PreferTor => tor.into_iter().collect(),
        RouteMode::Manual => match (lokinet, tor) {
            (Some(_), Some(_)) => Vec::new(),
            (Some(one), None) | (None, Some(one)) => vec![one],
            (None, None) => Vec::new(),
        },
    }
}

/// String-mode entry point; unknown modes produce no route.
pub fn select_route_named(mode: &str, endpoints: &RouteEndpoints) -> Vec<RouteCandidate> {
    match RouteMode::parse(mode) {
        Some(m) => select_route(m, endpoints),
        None => {
            tracing::warn!(mode, "unknown route mode");
            Vec::new()
        }
    }
}

fn present(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
