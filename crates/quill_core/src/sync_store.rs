/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEvent {
    pub event_id: String,
    pub conv_id: String,
    pub author_device_id: String,
    pub ts: i64,
    pub lamport: u64,
    pub prev: Option<String>,
    pub hash: String,
    pub plaintext: Vec<u8>,
    /// Set when `prev` did not match the local head at apply time.
    pub conflict: bool,
    pub received_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainHead {
    pub event_id: String,
    pub hash: String,
    pub lamport: u64,
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn has_event(&self, event_id: &str) -> Result<bool>;
    async fn head(&self, conv_id: &str) -> Result<Option<ChainHead>>;
    /// Persists `ev` and moves the conversation head onto it in one
    /// transaction. Returns false when `event_id` is already stored.
    async fn append(&self, ev: StoredEvent) -> Result<bool>;
    /// Events of a conversation in apply order.
    async fn events(&self, conv_id: &str) -> Result<Vec<StoredEvent>>;
    async fn conflicts(&self, conv_id: &str) -> Result<Vec<StoredEvent>>;
    async fn resolve_conflict(&self, event_id: &str) -> Result<bool>;
}

#[derive(Clone)]
pub struct SqliteSyncStore {
    db_path: PathBuf,
}

impl SqliteSyncStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self { db_path })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = Connection::open(&db_path)
                .with_context(|| format!("open db: {}", db_path.display()))?;
            f(&mut conn)
        })
        .await?
    }
}

const EVENT_COLUMNS: &str =
    "event_id, conv_id, author_device_id, ts, lamport, prev, hash, plaintext, conflict, received_at_ms";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<StoredEvent> {
    let lamport: i64 = row.get(4)?;
    let conflict: i64 = row.get(8)?;
    Ok(StoredEvent {
        event_id: row.get(0)?,
        conv_id: row.get(1)?,
        author_device_id: row.get(2)?,
        ts: row.get(3)?,
        lamport: lamport.max(0) as u64,
        prev: row.get(5)?,
        hash: row.get(6)?,
        plaintext: row.get(7)?,
        conflict: conflict != 0,
        received_at_ms: row.get(9)?,
    })
}

#[async_trait]
impl SyncStore for SqliteSyncStore {
    async fn has_event(&self, event_id: &str) -> Result<bool> {
        let event_id = event_id.to_string();
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sync_events WHERE event_id = ?1",
                    params![event_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn head(&self, conv_id: &str) -> Result<Option<ChainHead>> {
        let conv_id = conv_id.to_string();
        self.with_conn(move |conn| {
            let head = conn
                .query_row(
                    "SELECT event_id, hash, lamport FROM sync_heads WHERE conv_id = ?1",
                    params![conv_id],
                    |r| {
                        let lamport: i64 = r.get(2)?;
                        Ok(ChainHead {
                            event_id: r.get(0)?,
                            hash: r.get(1)?,
                            lamport: lamport.max(0) as u64,
                        })
                    },
                )
                .optional()?;
            Ok(head)
        })
        .await
    }

    async fn append(&self, ev: StoredEvent) -> Result<bool> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                r#"
                INSERT OR IGNORE INTO sync_events (
                  event_id, conv_id, author_device_id, ts, lamport, prev, hash, plaintext,
                  conflict, received_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    ev.event_id,
                    ev.conv_id,
                    ev.author_device_id,
                    ev.ts,
                    ev.lamport as i64,
                    ev.prev,
                    ev.hash,
                    ev.plaintext,
                    ev.conflict as i64,
                    ev.received_at_ms
                ],
            )?;
            if inserted == 0 {
                return Ok(false);
            }
            tx.execute(
                r#"
                INSERT INTO sync_heads (conv_id, event_id, hash, lamport)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(conv_id) DO UPDATE SET
                  event_id = excluded.event_id,
                  hash = excluded.hash,
                  lamport = MAX(sync_heads.lamport, excluded.lamport)
                "#,
                params![ev.conv_id, ev.event_id, ev.hash, ev.lamport as i64],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn events(&self, conv_id: &str) -> Result<Vec<StoredEvent>> {
        let conv_id = conv_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM sync_events WHERE conv_id = ?1 ORDER BY seq ASC"
            ))?;
            let rows = stmt.query_map(params![conv_id], row_to_event)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    async fn conflicts(&self, conv_id: &str) -> Result<Vec<StoredEvent>> {
        let conv_id = conv_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM sync_events WHERE conv_id = ?1 AND conflict = 1 ORDER BY seq ASC"
            ))?;
            let rows = stmt.query_map(params![conv_id], row_to_event)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    async fn resolve_conflict(&self, event_id: &str) -> Result<bool> {
        let event_id = event_id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE sync_events SET conflict = 0 WHERE event_id = ?1 AND conflict = 1",
                params![event_id],
            )?;
            Ok(n > 0)
        })
        .await
    }
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS sync_events (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          event_id TEXT NOT NULL UNIQUE,
          conv_id TEXT NOT NULL,
          author_device_id TEXT NOT NULL,
          ts INTEGER NOT NULL,
          lamport INTEGER NOT NULL,
          prev TEXT NULL,
          hash TEXT NOT NULL,
          plaintext BLOB NOT NULL,
          conflict INTEGER NOT NULL DEFAULT 0,
          received_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sync_events_conv ON sync_events(conv_id, seq);
        CREATE TABLE IF NOT EXISTS sync_heads (
          conv_id TEXT PRIMARY KEY,
          event_id TEXT NOT NULL,
          hash TEXT NOT NULL,
          lamport INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}
