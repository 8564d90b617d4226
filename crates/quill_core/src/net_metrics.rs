/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
pub struct NetMetrics {
    pub outbox_sent: AtomicU64,
    pub outbox_acked: AtomicU64,
    pub outbox_ack_timeouts: AtomicU64,
    pub outbox_send_failures: AtomicU64,
    pub outbox_exhausted_skips: AtomicU64,
    pub outbox_expired: AtomicU64,
    pub outbox_send_rtt_ema_ms: AtomicU64,

    pub sync_accepted: AtomicU64,
    pub sync_conflicts: AtomicU64,
    pub sync_dropped: AtomicU64,
    pub sync_duplicates: AtomicU64,

    pub installs_ok: AtomicU64,
    pub installs_failed: AtomicU64,
    last_install_error: Mutex<Option<String>>,
}

impl NetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbox_sent(&self) {
        self.outbox_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbox_acked(&self) {
        self.outbox_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbox_ack_timeout(&self) {
        self.outbox_ack_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbox_send_failure(&self) {
        self.outbox_send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbox_exhausted_skip(&self) {
        self.outbox_exhausted_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbox_expired_add(&self, n: u64) {
        self.outbox_expired.fetch_add(n, Ordering::Relaxed);
    }

    pub fn outbox_send_rtt_update(&self, ms: u64) {
        if ms == 0 {
            return;
        }
        let prev = self.outbox_send_rtt_ema_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            ms
        } else {
            (prev.saturating_mul(7).saturating_add(ms)) / 8
        };
        self.outbox_send_rtt_ema_ms.store(next, Ordering::Relaxed);
    }

    pub fn sync_accepted(&self, conflict: bool) {
        self.sync_accepted.fetch_add(1, Ordering::Relaxed);
        if conflict {
            self.sync_conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sync_dropped(&self) {
        self.sync_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sync_duplicate(&self) {
        self.sync_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn install_ok(&self) {
        self.installs_ok.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut g) = self.last_install_error.lock() {
            *g = None;
        }
    }

    pub fn install_failed(&self, err: String) {
        self.installs_failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut g) = self.last_install_error.lock() {
            *g = Some(err);
        }
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let last_install_error = self
            .last_install_error
            .lock()
            .ok()
            .and_then(|g| g.clone());
        serde_json::json!({
            "ts_ms": now_ms(),
            "outbox": {
                "sent": self.outbox_sent.load(Ordering::Relaxed),
                "acked": self.outbox_acked.load(Ordering::Relaxed),
                "ack_timeouts": self.outbox_ack_timeouts.load(Ordering::Relaxed),
                "send_failures": self.outbox_send_failures.load(Ordering::Relaxed),
                "exhausted_skips": self.outbox_exhausted_skips.load(Ordering::Relaxed),
                "expired": self.outbox_expired.load(Ordering::Relaxed),
                "send_rtt_ms": self.outbox_send_rtt_ema_ms.load(Ordering::Relaxed),
            },
            "sync": {
                "accepted": self.sync_accepted.load(Ordering::Relaxed),
                "conflicts": self.sync_conflicts.load(Ordering::Relaxed),
                "dropped": self.sync_dropped.load(Ordering::Relaxed),
                "duplicates": self.sync_duplicates.load(Ordering::Relaxed),
            },
            "transport": {
                "installs_ok": self.installs_ok.load(Ordering::Relaxed),
                "installs_failed": self.installs_failed.load(Ordering::Relaxed),
                "last_install_error": last_install_error,
            },
        })
    }
}
