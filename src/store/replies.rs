//! Reply-queue persistence
//!
//! Every transition is a conditional `UPDATE ... WHERE state = ?`, so two
//! processes racing on the same entry cannot both win. Partial unique
//! indexes keep one open and one sent entry per message.

use super::{conversion_error, row_opt_ts, row_ts, to_ts, EncryptedStore};
use crate::{MailHubError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyState {
    Drafting,
    PendingSend,
    /// Claimed by a send in progress
    Sending,
    Sent,
    Abandoned,
}

impl ReplyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyState::Drafting => "drafting",
            ReplyState::PendingSend => "pending_send",
            ReplyState::Sending => "sending",
            ReplyState::Sent => "sent",
            ReplyState::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "drafting" => Some(ReplyState::Drafting),
            "pending_send" => Some(ReplyState::PendingSend),
            "sending" => Some(ReplyState::Sending),
            "sent" => Some(ReplyState::Sent),
            "abandoned" => Some(ReplyState::Abandoned),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ReplyState::Drafting | ReplyState::PendingSend | ReplyState::Sending)
    }
}

impl std::fmt::Display for ReplyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the current draft content was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposeMode {
    /// Drafted from the message alone
    Generated,
    /// User text polished by the collaborator
    Refined,
    /// User text stored verbatim
    Raw,
}

impl ComposeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComposeMode::Generated => "generated",
            ComposeMode::Refined => "refined",
            ComposeMode::Raw => "raw",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generated" => Some(ComposeMode::Generated),
            "refined" => Some(ComposeMode::Refined),
            "raw" => Some(ComposeMode::Raw),
            _ => None,
        }
    }
}

impl std::str::FromStr for ComposeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ComposeMode::parse(&s.trim().to_lowercase()).ok_or_else(|| format!("unknown compose mode: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    Manual,
    Auto,
}

impl SendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendMode::Manual => "manual",
            SendMode::Auto => "auto",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(SendMode::Manual),
            "auto" => Some(SendMode::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyEntry {
    pub id: i64,
    pub message_id: i64,
    pub state: ReplyState,
    pub compose_mode: Option<ComposeMode>,
    pub subject: String,
    pub body: String,
    pub revision_count: u32,
    pub from_addr: Option<String>,
    pub to_addr: Option<String>,
    pub not_ready_reason: Option<String>,
    pub send_mode: Option<SendMode>,
    pub provider_send_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl ReplyEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let state: String = row.get(2)?;
        let mode: Option<String> = row.get(3)?;
        let send_mode: Option<String> = row.get(10)?;
        Ok(Self {
            id: row.get(0)?,
            message_id: row.get(1)?,
            state: ReplyState::parse(&state)
                .ok_or_else(|| conversion_error(2, format!("unknown reply state {}", state)))?,
            compose_mode: mode.as_deref().and_then(ComposeMode::parse),
            subject: row.get(4)?,
            body: row.get(5)?,
            revision_count: row.get(6)?,
            from_addr: row.get(7)?,
            to_addr: row.get(8)?,
            not_ready_reason: row.get(9)?,
            send_mode: send_mode.as_deref().and_then(SendMode::parse),
            provider_send_id: row.get(11)?,
            last_error: row.get(12)?,
            created_at: row_ts(row, 13)?,
            updated_at: row_ts(row, 14)?,
            sent_at: row_opt_ts(row, 15)?,
        })
    }
}

const REPLY_COLUMNS: &str = "id, message_id, state, compose_mode, subject, body, revision_count, \
     from_addr, to_addr, not_ready_reason, send_mode, provider_send_id, last_error, \
     created_at, updated_at, sent_at";

/// Final content written when an entry is claimed for sending
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClaimContent<'a> {
    pub subject: &'a str,
    pub body: &'a str,
    pub from: &'a str,
    pub to: &'a str,
}

impl EncryptedStore {
    pub fn get_reply(&self, id: i64) -> Result<Option<ReplyEntry>> {
        let sql = format!("SELECT {} FROM reply_queue WHERE id = ?1", REPLY_COLUMNS);
        Ok(self
            .conn()
            .query_row(&sql, params![id], ReplyEntry::from_row)
            .optional()?)
    }

    pub fn open_reply_for_message(&self, message_id: i64) -> Result<Option<ReplyEntry>> {
        let sql = format!(
            "SELECT {} FROM reply_queue
             WHERE message_id = ?1 AND state IN ('drafting', 'pending_send', 'sending')",
            REPLY_COLUMNS
        );
        Ok(self
            .conn()
            .query_row(&sql, params![message_id], ReplyEntry::from_row)
            .optional()?)
    }

    pub fn sent_reply_for_message(&self, message_id: i64) -> Result<Option<ReplyEntry>> {
        let sql = format!(
            "SELECT {} FROM reply_queue WHERE message_id = ?1 AND state = 'sent'",
            REPLY_COLUMNS
        );
        Ok(self
            .conn()
            .query_row(&sql, params![message_id], ReplyEntry::from_row)
            .optional()?)
    }

    /// Return the open entry for a message, creating an empty draft if none.
    ///
    /// The flag is true when this call created it. A message that already
    /// has a sent reply cannot be reopened.
    pub fn open_reply_entry(
        &self,
        message_id: i64,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<(ReplyEntry, bool)> {
        if let Some(sent) = self.sent_reply_for_message(message_id)? {
            return Err(MailHubError::InvalidState(format!(
                "message {} already has sent reply {}",
                message_id, sent.id
            )));
        }

        let now = to_ts(&Utc::now());
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO reply_queue
                (message_id, state, from_addr, to_addr, created_at, updated_at)
             VALUES (?1, 'drafting', ?2, ?3, ?4, ?4)",
            params![message_id, from, to, now],
        )?;

        let entry = self.open_reply_for_message(message_id)?.ok_or_else(|| {
            MailHubError::InvalidState(format!("no open reply for message {}", message_id))
        })?;
        if inserted == 1 {
            tracing::info!(reply_id = entry.id, message_id, "Reply entry opened");
        }
        Ok((entry, inserted == 1))
    }

    /// Replace draft content if the entry is still in `expected` state
    pub fn write_reply_draft(
        &self,
        id: i64,
        expected: ReplyState,
        mode: ComposeMode,
        subject: &str,
        body: &str,
        bump_revision: bool,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE reply_queue SET
                compose_mode = ?3, subject = ?4, body = ?5,
                revision_count = revision_count + ?6,
                not_ready_reason = NULL,
                updated_at = ?7
             WHERE id = ?1 AND state = ?2",
            params![
                id,
                expected.as_str(),
                mode.as_str(),
                subject,
                body,
                if bump_revision { 1 } else { 0 },
                to_ts(&Utc::now())
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn transition_reply(&self, id: i64, from: ReplyState, to: ReplyState) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE reply_queue SET state = ?3, updated_at = ?4 WHERE id = ?1 AND state = ?2",
            params![id, from.as_str(), to.as_str(), to_ts(&Utc::now())],
        )?;
        if changed == 1 {
            tracing::info!(reply_id = id, from = from.as_str(), to = to.as_str(), "Reply state changed");
        }
        Ok(changed == 1)
    }

    /// Abandon from any state but `sent`
    pub fn abandon_reply(&self, id: i64, reason: Option<&str>) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE reply_queue SET state = 'abandoned', not_ready_reason = COALESCE(?2, not_ready_reason),
                updated_at = ?3
             WHERE id = ?1 AND state IN ('drafting', 'pending_send', 'sending')",
            params![id, reason, to_ts(&Utc::now())],
        )?;
        Ok(changed == 1)
    }

    /// `pending_send -> sending`, writing the final content. Only one caller wins.
    pub(crate) fn claim_reply_for_send(
        &self,
        id: i64,
        mode: SendMode,
        content: &ClaimContent<'_>,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE reply_queue SET
                state = 'sending', send_mode = ?2, subject = ?3, body = ?4,
                from_addr = ?5, to_addr = ?6, updated_at = ?7
             WHERE id = ?1 AND state = 'pending_send'",
            params![
                id,
                mode.as_str(),
                content.subject,
                content.body,
                content.from,
                content.to,
                to_ts(&Utc::now())
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_reply_sent(&self, id: i64, provider_send_id: &str) -> Result<bool> {
        let now = to_ts(&Utc::now());
        let changed = self.conn().execute(
            "UPDATE reply_queue SET
                state = 'sent', provider_send_id = ?2, last_error = NULL,
                not_ready_reason = NULL, sent_at = ?3, updated_at = ?3
             WHERE id = ?1 AND state = 'sending'",
            params![id, provider_send_id, now],
        )?;
        Ok(changed == 1)
    }

    /// `sending -> pending_send` after a failed provider send
    pub fn release_reply_after_failure(&self, id: i64, error: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE reply_queue SET state = 'pending_send', last_error = ?2, updated_at = ?3
             WHERE id = ?1 AND state = 'sending'",
            params![id, error, to_ts(&Utc::now())],
        )?;
        Ok(changed == 1)
    }

    pub fn set_reply_addressing(&self, id: i64, from: Option<&str>, to: Option<&str>) -> Result<()> {
        self.conn().execute(
            "UPDATE reply_queue SET from_addr = COALESCE(?2, from_addr), to_addr = COALESCE(?3, to_addr),
                updated_at = ?4
             WHERE id = ?1",
            params![id, from, to, to_ts(&Utc::now())],
        )?;
        Ok(())
    }

    /// Record why an entry is not sendable; `None` clears it
    pub fn set_not_ready_reason(&self, id: i64, reason: Option<&str>) -> Result<()> {
        self.conn().execute(
            "UPDATE reply_queue SET not_ready_reason = ?2 WHERE id = ?1
             AND not_ready_reason IS NOT ?2",
            params![id, reason],
        )?;
        Ok(())
    }

    /// Entries in any of `states`, oldest first
    pub fn list_replies(&self, states: &[ReplyState]) -> Result<Vec<ReplyEntry>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=states.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT {} FROM reply_queue WHERE state IN ({}) ORDER BY id",
            REPLY_COLUMNS,
            placeholders.join(", ")
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let names: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(names), ReplyEntry::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn replies_sent_between(&self, start: &DateTime<Utc>, end: &DateTime<Utc>) -> Result<Vec<ReplyEntry>> {
        let sql = format!(
            "SELECT {} FROM reply_queue WHERE state = 'sent' AND sent_at >= ?1 AND sent_at < ?2
             ORDER BY sent_at, id",
            REPLY_COLUMNS
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![to_ts(start), to_ts(end)], ReplyEntry::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Open entries across the messages of one account
    pub fn open_reply_count_for_account(&self, account_id: i64) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT count(*) FROM reply_queue r JOIN messages m ON m.id = r.message_id
             WHERE m.account_id = ?1 AND r.state IN ('drafting', 'pending_send', 'sending')",
            params![account_id],
            |row| row.get(0),
        )?)
    }
}
