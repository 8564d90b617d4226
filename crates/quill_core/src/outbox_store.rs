/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::sync::Mutex;

/// Outgoing messages live at most 12h in the outbox.
pub const OUTBOX_TTL_MS: i64 = 12 * 3600 * 1000;

/// `next_attempt_at_ms` for records that must never be picked up again
/// automatically.
pub const PARKED_AT_MS: i64 = i64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Acked,
    Expired,
}

impl OutboxStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            OutboxStatus::Pending => 0,
            OutboxStatus::InFlight => 1,
            OutboxStatus::Acked => 2,
            OutboxStatus::Expired => 3,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Pending),
            1 => Some(Self::InFlight),
            2 => Some(Self::Acked),
            3 => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxRecord {
    pub id: String,
    pub conv_id: String,
    pub ciphertext: Vec<u8>,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub attempts: u32,
    pub next_attempt_at_ms: i64,
    pub status: OutboxStatus,
    pub last_attempt_at_ms: Option<i64>,
    pub in_flight_at_ms: Option<i64>,
    pub ack_deadline_ms: Option<i64>,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    pub fn new(conv_id: &str, ciphertext: Vec<u8>, now_ms: i64) -> Self {
        Self {
            id: new_record_id(),
            conv_id: conv_id.to_string(),
            ciphertext,
            created_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(OUTBOX_TTL_MS),
            attempts: 0,
            next_attempt_at_ms: now_ms,
            status: OutboxStatus::Pending,
            last_attempt_at_ms: None,
            in_flight_at_ms: None,
            ack_deadline_ms: None,
            last_error: None,
        }
    }

    pub fn is_parked(&self) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at_ms == PARKED_AT_MS
    }
}

/// Partial update. `None` leaves a column alone; for nullable columns the
/// inner `Option` is the new value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutboxPatch {
    pub status: Option<OutboxStatus>,
    pub attempts: Option<u32>,
    pub next_attempt_at_ms: Option<i64>,
    pub last_attempt_at_ms: Option<Option<i64>>,
    pub in_flight_at_ms: Option<Option<i64>>,
    pub ack_deadline_ms: Option<Option<i64>>,
    pub last_error: Option<Option<String>>,
}

impl OutboxPatch {
    fn apply_to(&self, rec: &mut OutboxRecord) {
        if let Some(v) = self.status {
            rec.status = v;
        }
        if let Some(v) = self.attempts {
            rec.attempts = v;
        }
        if let Some(v) = self.next_attempt_at_ms {
            rec.next_attempt_at_ms = v;
        }
        if let Some(v) = self.last_attempt_at_ms {
            rec.last_attempt_at_ms = v;
        }
        if let Some(v) = self.in_flight_at_ms {
            rec.in_flight_at_ms = v;
        }
        if let Some(v) = self.ack_deadline_ms {
            rec.ack_deadline_ms = v;
        }
        if let Some(v) = &self.last_error {
            rec.last_error = v.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: u64,
    pub in_flight: u64,
    /// Pending but out of automatic attempts; waiting for `retry_now`.
    pub exhausted: u64,
    pub parked: u64,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert(&self, rec: OutboxRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<OutboxRecord>>;
    async fn update(&self, id: &str, patch: OutboxPatch) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<bool>;
    /// Pending records with `next_attempt_at_ms <= now_ms`, earliest due
    /// first, then oldest.
    async fn list_due(&self, now_ms: i64, limit: u32) -> Result<Vec<OutboxRecord>>;
    async fn list_in_flight(&self) -> Result<Vec<OutboxRecord>>;
    /// Deletes pending/in-flight records with `expires_at_ms <= now_ms`.
    async fn sweep_expired(&self, now_ms: i64) -> Result<u64>;
    /// Counts by state. Pending records with `attempts >= max_attempts`
    /// count as exhausted.
    async fn stats(&self, max_attempts: u32) -> Result<OutboxStats>;
}

#[derive(Clone)]
pub struct SqliteOutboxStore {
    db_path: PathBuf,
}

impl SqliteOutboxStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self { db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let conn = Connection::open(&db_path)
                .with_context(|| format!("open db: {}", db_path.display()))?;
            f(&conn)
        })
        .await?
    }
}

const SELECT_COLUMNS: &str = "id, conv_id, ciphertext, created_at_ms, expires_at_ms, attempts, next_attempt_at_ms, status, last_attempt_at_ms, in_flight_at_ms, ack_deadline_ms, last_error";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<OutboxRecord> {
    let status: i64 = row.get(7)?;
    Ok(OutboxRecord {
        id: row.get(0)?,
        conv_id: row.get(1)?,
        ciphertext: row.get(2)?,
        created_at_ms: row.get(3)?,
        expires_at_ms: row.get(4)?,
        attempts: row.get(5)?,
        next_attempt_at_ms: row.get(6)?,
        status: OutboxStatus::from_i64(status).unwrap_or(OutboxStatus::Pending),
        last_attempt_at_ms: row.get(8)?,
        in_flight_at_ms: row.get(9)?,
        ack_deadline_ms: row.get(10)?,
        last_error: row.get(11)?,
    })
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn insert(&self, rec: OutboxRecord) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO outbox (
                  id, conv_id, ciphertext, created_at_ms, expires_at_ms, attempts, next_attempt_at_ms,
                  status, last_attempt_at_ms, in_flight_at_ms, ack_deadline_ms, last_error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    rec.id,
                    rec.conv_id,
                    rec.ciphertext,
                    rec.created_at_ms,
                    rec.expires_at_ms,
                    rec.attempts,
                    rec.next_attempt_at_ms,
                    rec.status.as_i64(),
                    rec.last_attempt_at_ms,
                    rec.in_flight_at_ms,
                    rec.ack_deadline_ms,
                    rec.last_error
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let rec = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM outbox WHERE id = ?1"),
                    params![id],
                    row_to_record,
                )
                .optional()?;
            Ok(rec)
        })
        .await
    }

    async fn update(&self, id: &str, patch: OutboxPatch) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            // Read-modify-write keeps the patch semantics identical to the
            // in-memory store.
            let Some(mut rec) = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM outbox WHERE id = ?1"),
                    params![id],
                    row_to_record,
                )
                .optional()?
            else {
                return Ok(());
            };
            patch.apply_to(&mut rec);
            conn.execute(
                r#"
                UPDATE outbox SET
                  attempts = ?2, next_attempt_at_ms = ?3, status = ?4, last_attempt_at_ms = ?5,
                  in_flight_at_ms = ?6, ack_deadline_ms = ?7, last_error = ?8
                WHERE id = ?1
                "#,
                params![
                    rec.id,
                    rec.attempts,
                    rec.next_attempt_at_ms,
                    rec.status.as_i64(),
                    rec.last_attempt_at_ms,
                    rec.in_flight_at_ms,
                    rec.ack_deadline_ms,
                    rec.last_error
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
        .await
    }

    async fn list_due(&self, now_ms: i64, limit: u32) -> Result<Vec<OutboxRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {SELECT_COLUMNS}
                FROM outbox
                WHERE status = ?1 AND next_attempt_at_ms <= ?2
                ORDER BY next_attempt_at_ms ASC, created_at_ms ASC
                LIMIT ?3
                "#
            ))?;
            let rows = stmt.query_map(
                params![OutboxStatus::Pending.as_i64(), now_ms, limit],
                row_to_record,
            )?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_in_flight(&self) -> Result<Vec<OutboxRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM outbox WHERE status = ?1 ORDER BY created_at_ms ASC"
            ))?;
            let rows = stmt.query_map(params![OutboxStatus::InFlight.as_i64()], row_to_record)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    async fn sweep_expired(&self, now_ms: i64) -> Result<u64> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM outbox WHERE status IN (?1, ?2) AND expires_at_ms <= ?3",
                params![
                    OutboxStatus::Pending.as_i64(),
                    OutboxStatus::InFlight.as_i64(),
                    now_ms
                ],
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn stats(&self, max_attempts: u32) -> Result<OutboxStats> {
        self.with_conn(move |conn| {
            let pending: u64 = conn.query_row(
                "SELECT COUNT(*) FROM outbox WHERE status = ?1 AND next_attempt_at_ms < ?2 AND attempts < ?3",
                params![OutboxStatus::Pending.as_i64(), PARKED_AT_MS, max_attempts],
                |r| r.get(0),
            )?;
            let exhausted: u64 = conn.query_row(
                "SELECT COUNT(*) FROM outbox WHERE status = ?1 AND next_attempt_at_ms < ?2 AND attempts >= ?3",
                params![OutboxStatus::Pending.as_i64(), PARKED_AT_MS, max_attempts],
                |r| r.get(0),
            )?;
            let in_flight: u64 = conn.query_row(
                "SELECT COUNT(*) FROM outbox WHERE status = ?1",
                params![OutboxStatus::InFlight.as_i64()],
                |r| r.get(0),
            )?;
            let parked: u64 = conn.query_row(
                "SELECT COUNT(*) FROM outbox WHERE status = ?1 AND next_attempt_at_ms = ?2",
                params![OutboxStatus::Pending.as_i64(), PARKED_AT_MS],
                |r| r.get(0),
            )?;
            Ok(OutboxStats {
                pending,
                in_flight,
                exhausted,
                parked,
            })
        })
        .await
    }
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS outbox (
          id TEXT PRIMARY KEY,
          conv_id TEXT NOT NULL,
          ciphertext BLOB NOT NULL,
          created_at_ms INTEGER NOT NULL,
          expires_at_ms INTEGER NOT NULL,
          attempts INTEGER NOT NULL,
          next_attempt_at_ms INTEGER NOT NULL,
          status INTEGER NOT NULL,
          last_attempt_at_ms INTEGER NULL,
          in_flight_at_ms INTEGER NULL,
          ack_deadline_ms INTEGER NULL,
          last_error TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox(status, next_attempt_at_ms, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_outbox_expiry ON outbox(expires_at_ms);
        "#,
    )?;
    Ok(())
}

/// Volatile store, used by tests and by callers that bring their own
/// persistence.
#[derive(Default)]
pub struct MemoryOutboxStore {
    records: Mutex<HashMap<String, OutboxRecord>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn insert(&self, rec: OutboxRecord) -> Result<()> {
        let mut g = self.records.lock().await;
        if g.contains_key(&rec.id) {
            anyhow::bail!("duplicate outbox id: {}", rec.id);
        }
        g.insert(rec.id.clone(), rec);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn update(&self, id: &str, patch: OutboxPatch) -> Result<()> {
        if let Some(rec) = self.records.lock().await.get_mut(id) {
            patch.apply_to(rec);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.lock().await.remove(id).is_some())
    }

    async fn list_due(&self, now_ms: i64, limit: u32) -> Result<Vec<OutboxRecord>> {
        let g = self.records.lock().await;
        let mut due: Vec<OutboxRecord> = g
            .values()
            .filter(|r| r.status == OutboxStatus::Pending && r.next_attempt_at_ms <= now_ms)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            (a.next_attempt_at_ms, a.created_at_ms).cmp(&(b.next_attempt_at_ms, b.created_at_ms))
        });
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn list_in_flight(&self) -> Result<Vec<OutboxRecord>> {
        let g = self.records.lock().await;
        let mut out: Vec<OutboxRecord> = g
            .values()
            .filter(|r| r.status == OutboxStatus::InFlight)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at_ms);
        Ok(out)
    }

    async fn sweep_expired(&self, now_ms: i64) -> Result<u64> {
        let mut g = self.records.lock().await;
        let before = g.len();
        g.retain(|_, r| {
            let live = matches!(r.status, OutboxStatus::Pending | OutboxStatus::InFlight);
            !(live && r.expires_at_ms <= now_ms)
        });
        Ok((before - g.len()) as u64)
    }

    async fn stats(&self, max_attempts: u32) -> Result<OutboxStats> {
        let g = self.records.lock().await;
        let mut stats = OutboxStats::default();
        for r in g.values() {
            match r.status {
                OutboxStatus::Pending if r.is_parked() => stats.parked += 1,
                OutboxStatus::Pending if r.attempts >= max_attempts => stats.exhausted += 1,
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::InFlight => stats.in_flight += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}

fn new_record_id() -> String {
    // 16 random bytes -> 32 hex chars
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}
