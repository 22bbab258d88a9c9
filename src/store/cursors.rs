//! Durable sync cursors
//!
//! A cursor only moves inside the same transaction that makes the page's
//! messages visible.

use super::messages::{insert_message_on, upsert_event_on};
use super::{row_opt_ts, to_ts, EncryptedStore, NewMessage};
use crate::provider::{Capability, EventContent};
use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorStatus {
    Idle,
    Failed,
}

impl CursorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorStatus::Idle => "idle",
            CursorStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorState {
    pub account_id: i64,
    pub capability: Capability,
    pub position: Option<String>,
    pub page_size: Option<u32>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub state: CursorStatus,
    pub last_error: Option<String>,
}

impl CursorState {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let capability: String = row.get(1)?;
        let state: String = row.get(6)?;
        Ok(Self {
            account_id: row.get(0)?,
            capability: capability
                .parse()
                .map_err(|e: String| super::conversion_error(1, e))?,
            position: row.get(2)?,
            page_size: row.get(3)?,
            last_success_at: row_opt_ts(row, 4)?,
            consecutive_failures: row.get(5)?,
            state: if state == "failed" {
                CursorStatus::Failed
            } else {
                CursorStatus::Idle
            },
            last_error: row.get(7)?,
        })
    }
}

/// One fetched page, ready to commit together with its cursor advance
#[derive(Debug)]
pub struct PersistPage<'a> {
    pub account_id: i64,
    pub capability: Capability,
    pub messages: &'a [NewMessage],
    pub events: &'a [EventContent],
    /// `None` keeps the stored position
    pub next_position: Option<&'a str>,
    pub page_size: u32,
}

const CURSOR_COLUMNS: &str =
    "account_id, capability, position, page_size, last_success_at, consecutive_failures, state, last_error";

impl EncryptedStore {
    pub fn get_cursor(&self, account_id: i64, capability: Capability) -> Result<Option<CursorState>> {
        let sql = format!(
            "SELECT {} FROM cursors WHERE account_id = ?1 AND capability = ?2",
            CURSOR_COLUMNS
        );
        Ok(self
            .conn()
            .query_row(&sql, params![account_id, capability.as_str()], CursorState::from_row)
            .optional()?)
    }

    pub fn list_cursors(&self) -> Result<Vec<CursorState>> {
        let sql = format!("SELECT {} FROM cursors ORDER BY account_id, capability", CURSOR_COLUMNS);
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], CursorState::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Insert a page and advance its cursor in one transaction.
    ///
    /// Returns the ids of messages that were new. Already known provider ids
    /// are skipped, so a replayed page inserts nothing.
    pub fn persist_page(&self, page: &PersistPage<'_>) -> Result<Vec<i64>> {
        let tx = self.conn().unchecked_transaction()?;
        let mut new_ids = Vec::new();

        for message in page.messages {
            if let Some(id) = insert_message_on(&tx, page.account_id, message)? {
                new_ids.push(id);
            }
        }
        for event in page.events {
            upsert_event_on(&tx, page.account_id, event)?;
        }

        let now = to_ts(&Utc::now());
        tx.execute(
            "INSERT INTO cursors
                (account_id, capability, position, page_size, last_success_at,
                 consecutive_failures, state, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 'idle', NULL, ?5)
             ON CONFLICT(account_id, capability) DO UPDATE SET
                position = COALESCE(excluded.position, cursors.position),
                page_size = excluded.page_size,
                last_success_at = excluded.last_success_at,
                consecutive_failures = 0,
                state = 'idle',
                last_error = NULL,
                updated_at = excluded.updated_at",
            params![
                page.account_id,
                page.capability.as_str(),
                page.next_position,
                page.page_size,
                now
            ],
        )?;

        if page.capability == Capability::Mail {
            tx.execute(
                "UPDATE accounts SET bootstrap_pending = 0, updated_at = ?2
                 WHERE id = ?1 AND bootstrap_pending = 1",
                params![page.account_id, now],
            )?;
        }

        tx.commit()?;
        tracing::debug!(
            account_id = page.account_id,
            capability = %page.capability,
            new = new_ids.len(),
            "Page persisted"
        );
        Ok(new_ids)
    }

    /// Count a failed fetch without touching the position
    pub fn record_cursor_failure(&self, account_id: i64, capability: Capability, error: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cursors
                (account_id, capability, consecutive_failures, state, last_error, updated_at)
             VALUES (?1, ?2, 1, 'failed', ?3, ?4)
             ON CONFLICT(account_id, capability) DO UPDATE SET
                consecutive_failures = cursors.consecutive_failures + 1,
                state = 'failed',
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![account_id, capability.as_str(), error, to_ts(&Utc::now())],
        )?;
        Ok(())
    }
}
