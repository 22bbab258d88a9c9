//! Messages and calendar events

use super::{conversion_error, row_opt_ts, row_ts, to_ts, EncryptedStore};
use crate::provider::{EventContent, MailContent};
use crate::{MailHubError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// How a message entered the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestSource {
    Poll,
    Bootstrap,
    Ingest,
}

impl IngestSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestSource::Poll => "poll",
            IngestSource::Bootstrap => "bootstrap",
            IngestSource::Ingest => "ingest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "poll" => Some(IngestSource::Poll),
            "bootstrap" => Some(IngestSource::Bootstrap),
            "ingest" => Some(IngestSource::Ingest),
            _ => None,
        }
    }
}

/// A message about to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub provider_message_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub snippet: String,
    pub body_text: String,
    pub received_at: DateTime<Utc>,
    pub source: IngestSource,
}

impl NewMessage {
    pub fn from_content(content: MailContent, source: IngestSource) -> Self {
        Self {
            provider_message_id: content.provider_message_id,
            from: content.from,
            to: content.to,
            subject: content.subject,
            snippet: content.snippet,
            body_text: content.body_text,
            received_at: content.received_at,
            source,
        }
    }
}

/// A persisted message. The body is never serialized.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub account_id: i64,
    pub provider_message_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub snippet: String,
    #[serde(skip)]
    pub body_text: String,
    pub received_at: DateTime<Utc>,
    pub source: IngestSource,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Subject, or a placeholder for empty subjects
    pub fn title(&self) -> String {
        let subject = self.subject.trim();
        if subject.is_empty() {
            "(no subject)".to_string()
        } else {
            subject.to_string()
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let source: String = row.get(9)?;
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            provider_message_id: row.get(2)?,
            from: row.get(3)?,
            to: row.get(4)?,
            subject: row.get(5)?,
            snippet: row.get(6)?,
            body_text: row.get(7)?,
            received_at: row_ts(row, 8)?,
            source: IngestSource::parse(&source)
                .ok_or_else(|| conversion_error(9, format!("unknown source {}", source)))?,
            created_at: row_ts(row, 10)?,
        })
    }
}

const MESSAGE_COLUMNS: &str = "id, account_id, provider_message_id, from_addr, to_addr, subject, \
     snippet, body_text, received_at, source, created_at";

/// Calendar event as stored
#[derive(Debug, Clone, Serialize)]
pub struct CalendarEvent {
    pub id: i64,
    pub account_id: i64,
    pub provider_event_id: String,
    pub title: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub location: String,
    pub updated_at: DateTime<Utc>,
}

/// Insert unless the provider id is already known; returns the new row id
pub(crate) fn insert_message_on(
    conn: &Connection,
    account_id: i64,
    message: &NewMessage,
) -> Result<Option<i64>> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO messages
            (account_id, provider_message_id, from_addr, to_addr, subject, snippet,
             body_text, received_at, source, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            account_id,
            message.provider_message_id,
            message.from,
            message.to,
            message.subject,
            message.snippet,
            message.body_text,
            to_ts(&message.received_at),
            message.source.as_str(),
            to_ts(&Utc::now()),
        ],
    )?;
    Ok(if inserted == 1 {
        Some(conn.last_insert_rowid())
    } else {
        None
    })
}

/// Insert or refresh an event; returns true when something changed
pub(crate) fn upsert_event_on(conn: &Connection, account_id: i64, event: &EventContent) -> Result<bool> {
    let changed = conn.execute(
        "INSERT INTO calendar_events
            (account_id, provider_event_id, title, starts_at, ends_at, location, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(account_id, provider_event_id) DO UPDATE SET
            title = excluded.title,
            starts_at = excluded.starts_at,
            ends_at = excluded.ends_at,
            location = excluded.location,
            updated_at = excluded.updated_at
         WHERE excluded.updated_at > calendar_events.updated_at",
        params![
            account_id,
            event.provider_event_id,
            event.title,
            event.starts_at.as_ref().map(to_ts),
            event.ends_at.as_ref().map(to_ts),
            event.location,
            to_ts(&event.updated_at),
        ],
    )?;
    Ok(changed > 0)
}

impl EncryptedStore {
    /// Persist one message outside of a sync page (manual ingest)
    pub fn insert_message(&self, account_id: i64, message: &NewMessage) -> Result<Option<i64>> {
        insert_message_on(self.conn(), account_id, message)
    }

    pub fn get_message(&self, id: i64) -> Result<Option<StoredMessage>> {
        let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
        Ok(self
            .conn()
            .query_row(&sql, params![id], StoredMessage::from_row)
            .optional()?)
    }

    pub fn find_messages_by_provider_id(&self, provider_message_id: &str) -> Result<Vec<StoredMessage>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE provider_message_id = ?1 ORDER BY id",
            MESSAGE_COLUMNS
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![provider_message_id], StoredMessage::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Resolve a local numeric id or a provider message id
    pub fn resolve_message(&self, reference: &str) -> Result<StoredMessage> {
        let reference = reference.trim().trim_start_matches('#');
        if let Ok(id) = reference.parse::<i64>() {
            if let Some(message) = self.get_message(id)? {
                return Ok(message);
            }
        }
        let mut matches = self.find_messages_by_provider_id(reference)?;
        match matches.len() {
            0 => Err(MailHubError::NotFound(format!("message {}", reference))),
            1 => Ok(matches.remove(0)),
            _ => Err(MailHubError::Ambiguous {
                target: reference.to_string(),
                candidates: matches.iter().map(|m| m.id).collect(),
            }),
        }
    }

    /// Messages received in `[start, end)`, oldest first
    pub fn messages_received_between(
        &self,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE received_at >= ?1 AND received_at < ?2
             ORDER BY received_at, id",
            MESSAGE_COLUMNS
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![to_ts(start), to_ts(end)], StoredMessage::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn message_count(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("SELECT count(*) FROM messages", [], |row| row.get(0))?)
    }

    pub fn message_count_for_account(&self, account_id: i64) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT count(*) FROM messages WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?)
    }

    pub fn list_events(&self, account_id: i64) -> Result<Vec<CalendarEvent>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, account_id, provider_event_id, title, starts_at, ends_at, location, updated_at
             FROM calendar_events WHERE account_id = ?1 ORDER BY starts_at, id",
        )?;
        let rows = stmt.query_map(params![account_id], |row| {
            Ok(CalendarEvent {
                id: row.get(0)?,
                account_id: row.get(1)?,
                provider_event_id: row.get(2)?,
                title: row.get(3)?,
                starts_at: row_opt_ts(row, 4)?,
                ends_at: row_opt_ts(row, 5)?,
                location: row.get(6)?,
                updated_at: row_ts(row, 7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{account, open_temp};
    use super::*;
    use chrono::TimeZone;

    fn message(pid: &str) -> NewMessage {
        NewMessage {
            provider_message_id: pid.to_string(),
            from: "Bob <bob@example.com>".to_string(),
            to: "me@example.com".to_string(),
            subject: format!("About {}", pid),
            snippet: "snippet".to_string(),
            body_text: "body".to_string(),
            received_at: Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap(),
            source: IngestSource::Poll,
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let (_temp, store) = open_temp();
        let acct = account(&store, "me@example.com");

        let first = store.insert_message(acct, &message("p1")).unwrap();
        let second = store.insert_message(acct, &message("p1")).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.message_count().unwrap(), 1);
    }

    #[test]
    fn test_same_provider_id_in_two_accounts() {
        let (_temp, store) = open_temp();
        let a = account(&store, "a@example.com");
        let b = account(&store, "b@example.com");
        store.insert_message(a, &message("shared")).unwrap();
        store.insert_message(b, &message("shared")).unwrap();
        assert_eq!(store.message_count().unwrap(), 2);

        match store.resolve_message("shared") {
            Err(MailHubError::Ambiguous { candidates, .. }) => assert_eq!(candidates.len(), 2),
            other => panic!("unexpected {:?}", other.map(|m| m.id)),
        }
    }

    #[test]
    fn test_resolve_by_id_or_provider_id() {
        let (_temp, store) = open_temp();
        let acct = account(&store, "me@example.com");
        let id = store.insert_message(acct, &message("p9")).unwrap().unwrap();

        assert_eq!(store.resolve_message(&id.to_string()).unwrap().id, id);
        assert_eq!(store.resolve_message(&format!("#{}", id)).unwrap().id, id);
        assert_eq!(store.resolve_message("p9").unwrap().id, id);
        assert!(matches!(store.resolve_message("nope"), Err(MailHubError::NotFound(_))));
    }

    #[test]
    fn test_received_between() {
        let (_temp, store) = open_temp();
        let acct = account(&store, "me@example.com");
        store.insert_message(acct, &message("p1")).unwrap();

        let start = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 5, 2, 0, 0, 0).unwrap();
        assert_eq!(store.messages_received_between(&start, &end).unwrap().len(), 1);
        assert!(store.messages_received_between(&end, &(end + chrono::Duration::days(1))).unwrap().is_empty());
    }

    #[test]
    fn test_event_upsert_only_moves_forward() {
        let (_temp, store) = open_temp();
        let acct = account(&store, "me@example.com");
        let t1 = Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap();
        let mut event = EventContent {
            provider_event_id: "e1".to_string(),
            title: "Standup".to_string(),
            starts_at: Some(t1),
            ends_at: None,
            location: String::new(),
            updated_at: t1,
        };
        assert!(upsert_event_on(store.conn(), acct, &event).unwrap());
        assert!(!upsert_event_on(store.conn(), acct, &event).unwrap());

        event.title = "Standup (moved)".to_string();
        event.updated_at = t1 + chrono::Duration::minutes(5);
        assert!(upsert_event_on(store.conn(), acct, &event).unwrap());
        let events = store.list_events(acct).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Standup (moved)");
    }
}
