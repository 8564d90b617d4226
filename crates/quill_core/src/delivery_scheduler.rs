/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::net_metrics::NetMetrics;
use crate::outbox_store::{OutboxPatch, OutboxRecord, OutboxStats, OutboxStatus, OutboxStore, PARKED_AT_MS};
use crate::retry_policy::{can_retry, compute_backoff_ms, NetMode, RetryPolicies, RetryPolicy};
use crate::ui_events::UiEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport; an ack is expected before the deadline.
    Sent,
    RetryableFailure(String),
    /// The transport refused the record for good (bad recipient, payload
    /// too large...). Kept for manual recovery.
    Rejected(String),
}

#[async_trait]
pub trait OutboxSender: Send + Sync {
    async fn send(&self, rec: &OutboxRecord, mode: NetMode) -> Result<SendOutcome>;
}

pub type NetModeFn = Arc<dyn Fn() -> NetMode + Send + Sync>;
pub type GateFn = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub batch_size: u32,
    pub ack_timeout_ms: i64,
    pub policies: RetryPolicies,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            batch_size: 40,
            ack_timeout_ms: 45_000,
            policies: RetryPolicies::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSkip {
    AlreadyRunning,
    VaultLocked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub skipped: Option<TickSkip>,
    pub expired: u64,
    pub demoted: u32,
    pub sent: u32,
    pub retry_scheduled: u32,
    pub rejected: u32,
    pub exhausted: u32,
    pub deduped: u32,
}

impl TickReport {
    fn skipped(reason: TickSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    pub fn has_activity(&self) -> bool {
        self.expired > 0
            || self.demoted > 0
            || self.sent > 0
            || self.retry_scheduled > 0
            || self.rejected > 0
            || self.exhausted > 0
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DeliveryScheduler {
    store: Arc<dyn OutboxStore>,
    sender: Arc<dyn OutboxSender>,
    net_mode: NetModeFn,
    gate: GateFn,
    settings: SchedulerSettings,
    running: AtomicBool,
    // Ids handed to the sender and not yet acked or demoted. Only the tick
    // touches this set.
    in_flight: Mutex<HashSet<String>>,
    notify: Arc<Notify>,
    ui_events: broadcast::Sender<UiEvent>,
    metrics: Arc<NetMetrics>,
}

impl DeliveryScheduler {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        sender: Arc<dyn OutboxSender>,
        settings: SchedulerSettings,
    ) -> Self {
        let (ui_events, _) = broadcast::channel(64);
        Self {
            store,
            sender,
            net_mode: Arc::new(|| NetMode::Direct),
            gate: Arc::new(|| true),
            settings,
            running: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            notify: Arc::new(Notify::new()),
            ui_events,
            metrics: Arc::new(NetMetrics::new()),
        }
    }

    pub fn with_net_mode(mut self, f: NetModeFn) -> Self {
        self.net_mode = f;
        self
    }

    /// Ticks are no-ops while the gate returns false (vault locked).
    pub fn with_gate(mut self, f: GateFn) -> Self {
        self.gate = f;
        self
    }

    pub fn with_ui_events(mut self, tx: broadcast::Sender<UiEvent>) -> Self {
        self.ui_events = tx;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<NetMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn current_policy(&self) -> (NetMode, RetryPolicy) {
        let mode = (self.net_mode)();
        (mode, self.settings.policies.get(mode))
    }

    pub async fn enqueue(&self, conv_id: &str, ciphertext: Vec<u8>) -> Result<String> {
        let rec = OutboxRecord::new(conv_id, ciphertext, now_ms());
        let id = rec.id.clone();
        self.store
            .insert(rec)
            .await
            .with_context(|| format!("enqueue outbox record for {conv_id}"))?;
        debug!(id = %id, conv_id, "outbox enqueued");
        self.notify.notify_one();
        Ok(id)
    }

    /// Transport-level acknowledgement: the record is done and removed.
    pub async fn ack(&self, id: &str) -> Result<bool> {
        let removed = self.store.delete(id).await?;
        if removed {
            self.metrics.outbox_acked();
            let _ = self.ui_events.send(UiEvent::new(
                "outbox",
                Some("acked".to_string()),
                Some(id.to_string()),
            ));
        }
        Ok(removed)
    }

    /// Manual recovery for exhausted or rejected records.
    pub async fn retry_now(&self, id: &str) -> Result<bool> {
        let Some(rec) = self.store.get(id).await? else {
            return Ok(false);
        };
        if rec.status != OutboxStatus::Pending {
            return Ok(false);
        }
        self.store
            .update(
                id,
                OutboxPatch {
                    attempts: Some(0),
                    next_attempt_at_ms: Some(now_ms()),
                    last_error: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.notify.notify_one();
        Ok(true)
    }

    pub async fn clear(&self, id: &str) -> Result<bool> {
        self.store.delete(id).await
    }

    /// Exhaustion is judged against the current mode's policy.
    pub async fn stats(&self) -> Result<OutboxStats> {
        let (_, policy) = self.current_policy();
        self.store.stats(policy.max_attempts).await
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(now_ms()).await
    }

    pub async fn tick_at(&self, now: i64) -> Result<TickReport> {
        if !(self.gate)() {
            return Ok(TickReport::skipped(TickSkip::VaultLocked));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(TickReport::skipped(TickSkip::AlreadyRunning));
        }
        let _guard = RunningGuard(&self.running);
        self.run_tick(now).await
    }

    async fn run_tick(&self, now: i64) -> Result<TickReport> {
        let mut report = TickReport::default();

        report.expired = self
            .store
            .sweep_expired(now)
            .await
            .context("sweep expired outbox records")?;
        if report.expired > 0 {
            self.metrics.outbox_expired_add(report.expired);
            info!(count = report.expired, "outbox records expired");
        }

        let mut still_in_flight = HashSet::new();
        for rec in self.store.list_in_flight().await? {
            let deadline = rec.ack_deadline_ms.unwrap_or(i64::MIN);
            if deadline < now && rec.expires_at_ms > now {
                self.store
                    .update(
                        &rec.id,
                        OutboxPatch {
                            status: Some(OutboxStatus::Pending),
                            next_attempt_at_ms: Some(now),
                            in_flight_at_ms: Some(None),
                            ack_deadline_ms: Some(None),
                            ..Default::default()
                        },
                    )
                    .await
                    .with_context(|| format!("demote outbox record {}", rec.id))?;
                report.demoted += 1;
                self.metrics.outbox_ack_timeout();
                info!(id = %rec.id, attempts = rec.attempts, "ack timeout, back to pending");
                let _ = self.ui_events.send(UiEvent::new(
                    "outbox",
                    Some("ack_timeout".to_string()),
                    Some(rec.id.clone()),
                ));
            } else {
                still_in_flight.insert(rec.id);
            }
        }
        self.claims().retain(|id| still_in_flight.contains(id));

        let (mode, policy) = self.current_policy();
        let due = self
            .store
            .list_due(now, self.settings.batch_size.max(1))
            .await?;
        for rec in due {
            let claimed = self.claims().contains(&rec.id);
            if claimed {
                report.deduped += 1;
                continue;
            }
            if !can_retry(rec.attempts, &policy) {
                report.exhausted += 1;
                self.metrics.outbox_exhausted_skip();
                debug!(
                    id = %rec.id,
                    attempts = rec.attempts,
                    max_attempts = policy.max_attempts,
                    mode = mode.as_str(),
                    "outbox record exhausted, waiting for manual retry"
                );
                continue;
            }
            self.attempt(rec, now, mode, &policy, &mut report).await?;
        }

        Ok(report)
    }

    async fn attempt(
        &self,
        mut rec: OutboxRecord,
        now: i64,
        mode: NetMode,
        policy: &RetryPolicy,
        report: &mut TickReport,
    ) -> Result<()> {
        // Count the attempt before the send so a crash mid-send cannot leave
        // an un-attempted record looking exhausted.
        let delay = compute_backoff_ms(rec.attempts, policy) as i64;
        rec.attempts = rec.attempts.saturating_add(1);
        rec.last_attempt_at_ms = Some(now);
        rec.next_attempt_at_ms = now.saturating_add(delay);
        self.store
            .update(
                &rec.id,
                OutboxPatch {
                    attempts: Some(rec.attempts),
                    last_attempt_at_ms: Some(Some(now)),
                    next_attempt_at_ms: Some(rec.next_attempt_at_ms),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("mark attempt for {}", rec.id))?;

        self.claims().insert(rec.id.clone());
        let started = Instant::now();
        let outcome = match self.sender.send(&rec, mode).await {
            Ok(v) => v,
            Err(e) => SendOutcome::RetryableFailure(format!("{e:#}")),
        };

        match outcome {
            SendOutcome::Sent => {
                self.metrics
                    .outbox_send_rtt_update(started.elapsed().as_millis() as u64);
                self.store
                    .update(
                        &rec.id,
                        OutboxPatch {
                            status: Some(OutboxStatus::InFlight),
                            in_flight_at_ms: Some(Some(now)),
                            ack_deadline_ms: Some(Some(
                                now.saturating_add(self.settings.ack_timeout_ms),
                            )),
                            ..Default::default()
                        },
                    )
                    .await
                    .with_context(|| format!("mark in flight for {}", rec.id))?;
                report.sent += 1;
                self.metrics.outbox_sent();
                debug!(id = %rec.id, attempt = rec.attempts, mode = mode.as_str(), "outbox sent");
                let _ = self.ui_events.send(UiEvent::new(
                    "outbox",
                    Some("sent".to_string()),
                    Some(rec.id.clone()),
                ));
            }
            SendOutcome::RetryableFailure(err) => {
                self.claims().remove(&rec.id);
                report.retry_scheduled += 1;
                self.metrics.outbox_send_failure();
                warn!(
                    id = %rec.id,
                    attempt = rec.attempts,
                    next_attempt_at_ms = rec.next_attempt_at_ms,
                    "outbox send failed: {err}"
                );
                let detail = if can_retry(rec.attempts, policy) {
                    format!("retry: {}", truncate(&err, 140))
                } else {
                    info!(id = %rec.id, attempts = rec.attempts, "outbox record exhausted its attempts");
                    format!("exhausted: {}", truncate(&err, 140))
                };
                let _ = self.ui_events.send(UiEvent::new(
                    "outbox",
                    Some(detail),
                    Some(rec.id.clone()),
                ));
            }
            SendOutcome::Rejected(err) => {
                self.claims().remove(&rec.id);
                self.store
                    .update(
                        &rec.id,
                        OutboxPatch {
                            next_attempt_at_ms: Some(PARKED_AT_MS),
                            last_error: Some(Some(err.clone())),
                            ..Default::default()
                        },
                    )
                    .await
                    .with_context(|| format!("park rejected record {}", rec.id))?;
                report.rejected += 1;
                self.metrics.outbox_send_failure();
                warn!(id = %rec.id, "outbox send rejected, parked: {err}");
                let _ = self.ui_events.send(UiEvent::new(
                    "outbox",
                    Some(format!("rejected: {}", truncate(&err, 140))),
                    Some(rec.id.clone()),
                ));
            }
        }
        Ok(())
    }

    fn claims(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // The set holds plain ids; a poisoned lock still has usable data.
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn start_worker(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.settings.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() { break; }
                    }
                    _ = tick.tick() => {}
                    _ = this.notify.notified() => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                match this.tick().await {
                    Ok(report) if report.has_activity() => {
                        debug!(?report, "outbox tick");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("outbox tick failed: {e:#}"),
                }
            }
            info!("delivery scheduler stopped");
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.lines().next().unwrap_or("").chars().take(max).collect()
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
