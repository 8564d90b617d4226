/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use async_trait::async_trait;
use quill_core::delivery_scheduler::{
    DeliveryScheduler, OutboxSender, SchedulerSettings, SendOutcome, TickSkip,
};
use quill_core::outbox_store::{
    MemoryOutboxStore, OutboxPatch, OutboxRecord, OutboxStats, OutboxStatus, OutboxStore,
    PARKED_AT_MS,
};
use quill_core::retry_policy::{NetMode, RetryPolicies, RetryPolicy};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Wraps the memory store and records every patch it receives.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryOutboxStore,
    patches: Mutex<Vec<(String, OutboxPatch)>>,
}

impl RecordingStore {
    fn updates_for(&self, id: &str) -> Vec<OutboxPatch> {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| i == id)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl OutboxStore for RecordingStore {
    async fn insert(&self, rec: OutboxRecord) -> Result<()> {
        self.inner.insert(rec).await
    }
    async fn get(&self, id: &str) -> Result<Option<OutboxRecord>> {
        self.inner.get(id).await
    }
    async fn update(&self, id: &str, patch: OutboxPatch) -> Result<()> {
        self.patches
            .lock()
            .unwrap()
            .push((id.to_string(), patch.clone()));
        self.inner.update(id, patch).await
    }
    async fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id).await
    }
    async fn list_due(&self, now_ms: i64, limit: u32) -> Result<Vec<OutboxRecord>> {
        self.inner.list_due(now_ms, limit).await
    }
    async fn list_in_flight(&self) -> Result<Vec<OutboxRecord>> {
        self.inner.list_in_flight().await
    }
    async fn sweep_expired(&self, now_ms: i64) -> Result<u64> {
        self.inner.sweep_expired(now_ms).await
    }
    async fn stats(&self, max_attempts: u32) -> Result<OutboxStats> {
        self.inner.stats(max_attempts).await
    }
}

struct ScriptedSender {
    outcome: Mutex<SendOutcome>,
    calls: AtomicU32,
}

impl ScriptedSender {
    fn new(outcome: SendOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboxSender for ScriptedSender {
    async fn send(&self, _rec: &OutboxRecord, _mode: NetMode) -> Result<SendOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome.lock().unwrap().clone())
    }
}

fn settings(max_attempts: u32) -> SchedulerSettings {
    let policy = RetryPolicy {
        max_attempts,
        base_delay_ms: 1_000,
        max_delay_ms: 8_000,
        jitter_ratio: 0.0,
    };
    SchedulerSettings {
        ack_timeout_ms: 5_000,
        policies: RetryPolicies {
            direct: Some(policy),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn wall_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

async fn seed(store: &dyn OutboxStore, now: i64, attempts: u32) -> String {
    let mut rec = OutboxRecord::new("conv-a", b"sealed".to_vec(), now - 10);
    rec.attempts = attempts;
    let id = rec.id.clone();
    store.insert(rec).await.unwrap();
    id
}

#[tokio::test]
async fn successful_send_marks_in_flight_with_ack_deadline() {
    let now = wall_ms();
    let store = Arc::new(RecordingStore::default());
    let sender = Arc::new(ScriptedSender::new(SendOutcome::Sent));
    let sched = DeliveryScheduler::new(store.clone(), sender.clone(), settings(3));
    let id = seed(store.as_ref(), now, 0).await;

    let report = sched.tick_at(now).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(sender.calls(), 1);

    let rec = store.get(&id).await.unwrap().unwrap();
    assert_eq!(rec.status, OutboxStatus::InFlight);
    assert_eq!(rec.attempts, 1);
    assert_eq!(rec.last_attempt_at_ms, Some(now));
    assert_eq!(rec.ack_deadline_ms, Some(now + 5_000));
    // Backoff uses the count before this attempt: base * 2^0.
    assert_eq!(rec.next_attempt_at_ms, now + 1_000);

    // Claimed and in flight: the next tick does not resend.
    let report = sched.tick_at(now + 1).await.unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(sender.calls(), 1);
}

#[tokio::test]
async fn missed_ack_demotes_to_pending_in_one_update() {
    let now = wall_ms();
    let store = Arc::new(RecordingStore::default());
    let sender = Arc::new(ScriptedSender::new(SendOutcome::Sent));
    let sched = DeliveryScheduler::new(store.clone(), sender.clone(), settings(5));
    let id = seed(store.as_ref(), now, 0).await;

    sched.tick_at(now).await.unwrap();
    // Attempt bookkeeping plus the in-flight transition.
    assert_eq!(store.updates_for(&id).len(), 2);

    *sender.outcome.lock().unwrap() =
        SendOutcome::RetryableFailure("circuit closed".to_string());
    let later = now + 6_000;
    let report = sched.tick_at(later).await.unwrap();
    assert_eq!(report.demoted, 1);

    let updates = store.updates_for(&id);
    let demotion = &updates[2];
    assert_eq!(demotion.status, Some(OutboxStatus::Pending));
    assert_eq!(demotion.next_attempt_at_ms, Some(later));
    assert_eq!(demotion.in_flight_at_ms, Some(None));
    assert_eq!(demotion.ack_deadline_ms, Some(None));
    assert_eq!(demotion.attempts, None);

    // Demoted records are due immediately and retried in the same tick.
    assert_eq!(report.retry_scheduled, 1);
    assert_eq!(sender.calls(), 2);
    let rec = store.get(&id).await.unwrap().unwrap();
    assert_eq!(rec.status, OutboxStatus::Pending);
    assert_eq!(rec.attempts, 2);
    assert_eq!(rec.next_attempt_at_ms, later + 2_000);
}

#[tokio::test]
async fn exhausted_records_are_skipped_not_deleted() {
    let now = wall_ms();
    let store = Arc::new(MemoryOutboxStore::new());
    let sender = Arc::new(ScriptedSender::new(SendOutcome::Sent));
    let sched = DeliveryScheduler::new(store.clone(), sender.clone(), settings(3));
    let id = seed(store.as_ref(), now, 3).await;

    let report = sched.tick_at(now).await.unwrap();
    assert_eq!(report.exhausted, 1);
    assert_eq!(sender.calls(), 0);
    let rec = store.get(&id).await.unwrap().unwrap();
    assert_eq!(rec.attempts, 3);
    assert_eq!(rec.status, OutboxStatus::Pending);
    let stats = sched.stats().await.unwrap();
    assert_eq!((stats.pending, stats.exhausted), (0, 1));

    assert!(sched.retry_now(&id).await.unwrap());
    let rec = store.get(&id).await.unwrap().unwrap();
    assert_eq!(rec.attempts, 0);
    let report = sched.tick().await.unwrap();
    assert_eq!(report.sent, 1);
}

#[tokio::test]
async fn rejected_records_are_parked_with_their_error() {
    let now = wall_ms();
    let store = Arc::new(MemoryOutboxStore::new());
    let sender = Arc::new(ScriptedSender::new(SendOutcome::Rejected(
        "payload too large".to_string(),
    )));
    let sched = DeliveryScheduler::new(store.clone(), sender.clone(), settings(5));
    let id = seed(store.as_ref(), now, 0).await;

    let report = sched.tick_at(now).await.unwrap();
    assert_eq!(report.rejected, 1);
    let rec = store.get(&id).await.unwrap().unwrap();
    assert_eq!(rec.next_attempt_at_ms, PARKED_AT_MS);
    assert_eq!(rec.last_error.as_deref(), Some("payload too large"));
    assert_eq!(sched.stats().await.unwrap().parked, 1);

    sched.tick_at(now + 60_000).await.unwrap();
    assert_eq!(sender.calls(), 1);
}

#[tokio::test]
async fn ack_removes_record() {
    let store = Arc::new(MemoryOutboxStore::new());
    let sender = Arc::new(ScriptedSender::new(SendOutcome::Sent));
    let sched = DeliveryScheduler::new(store.clone(), sender, settings(5));
    let id = sched.enqueue("conv-a", b"x".to_vec()).await.unwrap();
    sched.tick().await.unwrap();
    assert!(sched.ack(&id).await.unwrap());
    assert!(!sched.ack(&id).await.unwrap());
    assert!(store.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn closed_gate_skips_the_tick() {
    let now = wall_ms();
    let store = Arc::new(MemoryOutboxStore::new());
    let sender = Arc::new(ScriptedSender::new(SendOutcome::Sent));
    let open = Arc::new(AtomicBool::new(false));
    let gate = open.clone();
    let sched = DeliveryScheduler::new(store.clone(), sender.clone(), settings(5))
        .with_gate(Arc::new(move || gate.load(Ordering::SeqCst)));
    seed(store.as_ref(), now, 0).await;

    let report = sched.tick_at(now).await.unwrap();
    assert_eq!(report.skipped, Some(TickSkip::VaultLocked));
    assert_eq!(sender.calls(), 0);

    open.store(true, Ordering::SeqCst);
    assert_eq!(sched.tick_at(now).await.unwrap().sent, 1);
}

/// Blocks inside `send` until released.
struct ParkedSender {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl OutboxSender for ParkedSender {
    async fn send(&self, _rec: &OutboxRecord, _mode: NetMode) -> Result<SendOutcome> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(SendOutcome::Sent)
    }
}

#[tokio::test]
async fn overlapping_tick_is_skipped() {
    let now = wall_ms();
    let store = Arc::new(MemoryOutboxStore::new());
    let sender = Arc::new(ParkedSender {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let sched = Arc::new(DeliveryScheduler::new(
        store.clone(),
        sender.clone(),
        settings(5),
    ));
    seed(store.as_ref(), now, 0).await;

    let first = {
        let sched = sched.clone();
        tokio::spawn(async move { sched.tick_at(now).await })
    };
    sender.entered.notified().await;

    let second = sched.tick_at(now).await.unwrap();
    assert_eq!(second.skipped, Some(TickSkip::AlreadyRunning));

    sender.release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.sent, 1);
    assert_eq!(first.skipped, None);
}

#[tokio::test]
async fn net_mode_selects_the_policy() {
    let store = Arc::new(MemoryOutboxStore::new());
    let sender = Arc::new(ScriptedSender::new(SendOutcome::Sent));
    let sched = DeliveryScheduler::new(store, sender, settings(3))
        .with_net_mode(Arc::new(|| NetMode::Tor));
    let (mode, policy) = sched.current_policy();
    assert_eq!(mode, NetMode::Tor);
    assert_eq!(policy, RetryPolicy::for_mode(NetMode::Tor));
}

#[tokio::test]
async fn last_failed_attempt_is_reported_as_exhausted() {
    let now = wall_ms();
    let store = Arc::new(MemoryOutboxStore::new());
    let sender = Arc::new(ScriptedSender::new(SendOutcome::RetryableFailure(
        "no circuit".to_string(),
    )));
    let (tx, mut rx) = tokio::sync::broadcast::channel(16);
    let sched = DeliveryScheduler::new(store.clone(), sender, settings(2)).with_ui_events(tx);
    let id = seed(store.as_ref(), now, 1).await;

    let report = sched.tick_at(now).await.unwrap();
    assert_eq!(report.retry_scheduled, 1);
    let ev = rx.try_recv().unwrap();
    assert_eq!(ev.kind, "outbox");
    assert_eq!(ev.subject_id.as_deref(), Some(id.as_str()));
    assert!(ev.detail.unwrap().starts_with("exhausted"));
}

/// Fails every send and remembers the mode each one went out under.
#[derive(Default)]
struct ModeLog(Mutex<Vec<NetMode>>);

#[async_trait]
impl OutboxSender for ModeLog {
    async fn send(&self, _rec: &OutboxRecord, mode: NetMode) -> Result<SendOutcome> {
        self.0.lock().unwrap().push(mode);
        Ok(SendOutcome::RetryableFailure("no route".to_string()))
    }
}

#[tokio::test]
async fn net_mode_switch_applies_on_the_next_tick() {
    let now = wall_ms();
    let store = Arc::new(MemoryOutboxStore::new());
    let sender = Arc::new(ModeLog::default());
    let onion = Arc::new(AtomicBool::new(false));
    let flag = onion.clone();
    let tor = RetryPolicy {
        max_attempts: 10,
        base_delay_ms: 5_000,
        max_delay_ms: 300_000,
        jitter_ratio: 0.0,
    };
    let mut cfg = settings(3);
    cfg.policies.tor = Some(tor);
    let sched = DeliveryScheduler::new(store.clone(), sender.clone(), cfg).with_net_mode(
        Arc::new(move || {
            if flag.load(Ordering::SeqCst) {
                NetMode::Tor
            } else {
                NetMode::Direct
            }
        }),
    );
    let fresh = seed(store.as_ref(), now, 0).await;
    let worn = seed(store.as_ref(), now, 3).await;

    // Direct: base 1s, and three attempts already use up the budget.
    let first = sched.tick_at(now).await.unwrap();
    assert_eq!(first.retry_scheduled, 1);
    assert_eq!(first.exhausted, 1);
    let rec = store.get(&fresh).await.unwrap().unwrap();
    assert_eq!(rec.attempts, 1);
    assert_eq!(rec.next_attempt_at_ms, now + 1_000);

    onion.store(true, Ordering::SeqCst);
    let later = now + 1_000;
    let second = sched.tick_at(later).await.unwrap();
    assert_eq!(second.retry_scheduled, 2);
    assert_eq!(second.exhausted, 0);

    let rec = store.get(&fresh).await.unwrap().unwrap();
    assert_eq!(rec.attempts, 2);
    assert_eq!(rec.next_attempt_at_ms, later + 10_000);
    let rec = store.get(&worn).await.unwrap().unwrap();
    assert_eq!(rec.attempts, 4);
    assert_eq!(rec.next_attempt_at_ms, later + 40_000);

    assert_eq!(
        *sender.0.lock().unwrap(),
        [NetMode::Direct, NetMode::Tor, NetMode::Tor]
    );
}
