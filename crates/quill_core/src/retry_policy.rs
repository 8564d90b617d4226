/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rand::{thread_rng, Rng};
use serde::Deserialize;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetMode {
    Direct,
    Tor,
    Lokinet,
    Onion,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown net mode {0:?}")]
pub struct UnknownNetMode(pub String);

impl FromStr for NetMode {
    type Err = UnknownNetMode;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "direct" | "clearnet" => Ok(Self::Direct),
            "tor" => Ok(Self::Tor),
            "lokinet" | "loki" => Ok(Self::Lokinet),
            "onion" => Ok(Self::Onion),
            _ => Err(UnknownNetMode(input.to_string())),
        }
    }
}

impl NetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetMode::Direct => "direct",
            NetMode::Tor => "tor",
            NetMode::Lokinet => "lokinet",
            NetMode::Onion => "onion",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Direct routes fail fast; onion circuits get patient caps.
    pub fn for_mode(mode: NetMode) -> Self {
        match mode {
            NetMode::Direct => Self {
                max_attempts: 6,
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                jitter_ratio: 0.2,
            },
            NetMode::Tor | NetMode::Lokinet | NetMode::Onion => Self {
                max_attempts: 12,
                base_delay_ms: 5_000,
                max_delay_ms: 15 * 60_000,
                jitter_ratio: 0.3,
            },
        }
    }
}

/// Per-mode policy table. Config may override individual modes.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RetryPolicies {
    pub direct: Option<RetryPolicy>,
    pub tor: Option<RetryPolicy>,
    pub lokinet: Option<RetryPolicy>,
    pub onion: Option<RetryPolicy>,
}

impl RetryPolicies {
    pub fn get(&self, mode: NetMode) -> RetryPolicy {
        let custom = match mode {
            NetMode::Direct => self.direct,
            NetMode::Tor => self.tor,
            NetMode::Lokinet => self.lokinet,
            NetMode::Onion => self.onion,
        };
        custom.unwrap_or_else(|| RetryPolicy::for_mode(mode))
    }
}

pub fn compute_backoff_ms(attempts: u32, policy: &RetryPolicy) -> u64 {
    compute_backoff_ms_with(attempts, policy, &mut thread_rng())
}

pub fn compute_backoff_ms_with<R: Rng + ?Sized>(
    attempts: u32,
    policy: &RetryPolicy,
    rng: &mut R,
) -> u64 {
    let max = policy.max_delay_ms as f64;
    // 2^64 already overflows any sane cap.
    let exp = attempts.min(64) as i32;
    let raw = policy.base_delay_ms as f64 * 2f64.powi(exp);

    let ratio = if policy.jitter_ratio.is_finite() {
        policy.jitter_ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let factor = if ratio > 0.0 {
        1.0 + rng.gen_range(-ratio..=ratio)
    } else {
        1.0
    };

    let v = raw * factor;
    if !v.is_finite() {
        return policy.max_delay_ms;
    }
    v.clamp(0.0, max).round() as u64
}

pub fn can_retry(attempts: u32, policy: &RetryPolicy) -> bool {
    attempts < policy.max_attempts
}
