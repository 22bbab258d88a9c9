//! File spool provider
//!
//! Each account gets `<spool>/<account>/<capability>/inbox/*.json`; sent mail
//! lands in `<spool>/<account>/mail/outbox/`. Items are ordered by timestamp
//! then id, and the cursor is `<rfc3339>|<id>` of the last item handed out.

use super::{
    Capability, CapabilityProvider, EventContent, FetchCursor, FetchedItem, MailContent,
    OutboundMessage, Page, ProviderConnector, ProviderContext, ProviderError,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Provider name accounts use to bind to the spool
pub const SPOOL_PROVIDER: &str = "spool";

#[derive(Debug, Deserialize)]
struct SpoolMail {
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    body: String,
    received_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SpoolEvent {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    location: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SentRecord<'a> {
    id: &'a str,
    sent_at: DateTime<Utc>,
    #[serde(flatten)]
    message: &'a OutboundMessage,
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '@' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Spool for one account and capability
#[derive(Debug)]
pub struct SpoolProvider {
    dir: PathBuf,
    capability: Capability,
    sent_counter: AtomicU64,
}

impl SpoolProvider {
    pub fn new(account_dir: impl Into<PathBuf>, capability: Capability) -> Self {
        Self {
            dir: account_dir.into(),
            capability,
            sent_counter: AtomicU64::new(0),
        }
    }

    fn inbox(&self) -> PathBuf {
        self.dir.join(self.capability.as_str()).join("inbox")
    }

    fn outbox(&self) -> PathBuf {
        self.dir.join(Capability::Mail.as_str()).join("outbox")
    }

    fn read_json(path: &Path) -> Result<serde_json::Value, ProviderError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProviderError::Transport(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Rejected(format!("{}: {}", path.display(), e)))
    }

    /// (timestamp, id, path) for every parseable inbox file, sorted
    fn scan(&self) -> Result<Vec<(DateTime<Utc>, String, PathBuf)>, ProviderError> {
        let inbox = self.inbox();
        if !inbox.is_dir() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&inbox)
            .map_err(|e| ProviderError::Transport(format!("{}: {}", inbox.display(), e)))?;

        let mut items = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let value = match Self::read_json(&path) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable spool file");
                    continue;
                }
            };
            let key = match self.capability {
                Capability::Calendar => serde_json::from_value::<SpoolEvent>(value)
                    .map(|e| (e.updated_at, e.id)),
                _ => serde_json::from_value::<SpoolMail>(value).map(|m| (m.received_at, m.id)),
            };
            match key {
                Ok((ts, id)) => items.push((ts, id, path)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping malformed spool file")
                }
            }
        }
        items.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        Ok(items)
    }

    fn position(ts: &DateTime<Utc>, id: &str) -> String {
        format!("{}|{}", ts.to_rfc3339_opts(SecondsFormat::Micros, true), id)
    }

    fn parse_position(position: &str) -> Result<(DateTime<Utc>, String), ProviderError> {
        let (ts, id) = position
            .split_once('|')
            .ok_or_else(|| ProviderError::Rejected(format!("bad spool cursor: {}", position)))?;
        let ts = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| ProviderError::Rejected(format!("bad spool cursor: {}", e)))?
            .with_timezone(&Utc);
        Ok((ts, id.to_string()))
    }
}

#[async_trait]
impl CapabilityProvider for SpoolProvider {
    async fn list_new(&self, cursor: &FetchCursor, page_size: u32) -> Result<Page, ProviderError> {
        let items = self.scan()?;
        let after = match cursor {
            FetchCursor::At(position) => Some(Self::parse_position(position)?),
            _ => None,
        };

        let mut remaining = items.into_iter().filter(|(ts, id, _)| match (cursor, &after) {
            (FetchCursor::Since(since), _) => ts >= since,
            (FetchCursor::At(_), Some((ats, aid))) => (ts, id) > (ats, aid),
            _ => true,
        });

        let page: Vec<(DateTime<Utc>, String, PathBuf)> =
            remaining.by_ref().take(page_size.max(1) as usize).collect();
        let has_more = remaining.next().is_some();

        Ok(Page {
            next_cursor: page.last().map(|(ts, id, _)| Self::position(ts, id)),
            items: page.into_iter().map(|(_, id, _)| id).collect(),
            has_more,
        })
    }

    async fn fetch_full(&self, item_id: &str) -> Result<FetchedItem, ProviderError> {
        let (_, _, path) = self
            .scan()?
            .into_iter()
            .find(|(_, id, _)| id == item_id)
            .ok_or_else(|| ProviderError::Rejected(format!("no spool item {}", item_id)))?;
        let value = Self::read_json(&path)?;

        match self.capability {
            Capability::Calendar => {
                let e: SpoolEvent = serde_json::from_value(value)
                    .map_err(|e| ProviderError::Rejected(e.to_string()))?;
                Ok(FetchedItem::Event(EventContent {
                    provider_event_id: e.id,
                    title: e.title,
                    starts_at: e.starts_at,
                    ends_at: e.ends_at,
                    location: e.location,
                    updated_at: e.updated_at,
                }))
            }
            _ => {
                let m: SpoolMail = serde_json::from_value(value)
                    .map_err(|e| ProviderError::Rejected(e.to_string()))?;
                let snippet = m
                    .snippet
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| m.body.chars().take(160).collect());
                Ok(FetchedItem::Mail(MailContent {
                    provider_message_id: m.id,
                    from: m.from,
                    to: m.to,
                    subject: m.subject,
                    snippet,
                    body_text: m.body,
                    received_at: m.received_at,
                }))
            }
        }
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String, ProviderError> {
        if message.to.trim().is_empty() || message.from.trim().is_empty() {
            return Err(ProviderError::Rejected("sender and recipient are required".to_string()));
        }
        let outbox = self.outbox();
        std::fs::create_dir_all(&outbox)
            .map_err(|e| ProviderError::Transport(format!("{}: {}", outbox.display(), e)))?;

        let now = Utc::now();
        let seq = self.sent_counter.fetch_add(1, Ordering::SeqCst);
        let id = format!(
            "spool-{}-{}-{}",
            now.timestamp_micros(),
            std::process::id(),
            seq
        );
        let record = SentRecord {
            id: &id,
            sent_at: now,
            message,
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        let path = outbox.join(format!("{}.json", id));
        std::fs::write(&path, json)
            .map_err(|e| ProviderError::Transport(format!("{}: {}", path.display(), e)))?;
        Ok(id)
    }
}

/// Connector for `provider: spool` accounts
#[derive(Debug, Clone)]
pub struct SpoolConnector {
    root: PathBuf,
}

impl SpoolConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one account's spool
    pub fn account_dir(&self, external_key: &str) -> PathBuf {
        self.root.join(sanitize(external_key))
    }
}

impl ProviderConnector for SpoolConnector {
    fn name(&self) -> &str {
        SPOOL_PROVIDER
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::Mail | Capability::Calendar)
    }

    fn connect(&self, ctx: &ProviderContext) -> Result<Arc<dyn super::CapabilityProvider>, ProviderError> {
        Ok(Arc::new(SpoolProvider::new(
            self.account_dir(&ctx.external_key),
            ctx.capability,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn write_mail(dir: &Path, id: &str, minute: u32) {
        let inbox = dir.join("mail").join("inbox");
        std::fs::create_dir_all(&inbox).unwrap();
        let received = Utc.with_ymd_and_hms(2025, 3, 1, 9, minute, 0).unwrap();
        let json = serde_json::json!({
            "id": id,
            "from": "Alice <alice@example.com>",
            "to": "me@example.com",
            "subject": format!("Subject {}", id),
            "body": "Hello there, can you take a look?",
            "received_at": received,
        });
        std::fs::write(inbox.join(format!("{}.json", id)), json.to_string()).unwrap();
    }

    #[tokio::test]
    async fn test_paging_with_cursor() {
        let temp = TempDir::new().unwrap();
        for (i, id) in ["m1", "m2", "m3"].iter().enumerate() {
            write_mail(temp.path(), id, i as u32);
        }
        let provider = SpoolProvider::new(temp.path(), Capability::Mail);

        let first = provider.list_new(&FetchCursor::Bootstrap, 2).await.unwrap();
        assert_eq!(first.items, vec!["m1", "m2"]);
        assert!(first.has_more);

        let cursor = FetchCursor::At(first.next_cursor.clone().unwrap());
        let second = provider.list_new(&cursor, 2).await.unwrap();
        assert_eq!(second.items, vec!["m3"]);
        assert!(!second.has_more);

        let cursor = FetchCursor::At(second.next_cursor.clone().unwrap());
        let empty = provider.list_new(&cursor, 2).await.unwrap();
        assert!(empty.items.is_empty());
        assert!(empty.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_since_window() {
        let temp = TempDir::new().unwrap();
        write_mail(temp.path(), "old", 0);
        write_mail(temp.path(), "new", 30);
        let provider = SpoolProvider::new(temp.path(), Capability::Mail);

        let since = Utc.with_ymd_and_hms(2025, 3, 1, 9, 15, 0).unwrap();
        let page = provider.list_new(&FetchCursor::Since(since), 10).await.unwrap();
        assert_eq!(page.items, vec!["new"]);
    }

    #[tokio::test]
    async fn test_fetch_full_and_send() {
        let temp = TempDir::new().unwrap();
        write_mail(temp.path(), "m1", 0);
        let provider = SpoolProvider::new(temp.path(), Capability::Mail);

        match provider.fetch_full("m1").await.unwrap() {
            FetchedItem::Mail(mail) => {
                assert_eq!(mail.subject, "Subject m1");
                assert!(mail.snippet.starts_with("Hello there"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(provider.fetch_full("missing").await.is_err());

        let msg = OutboundMessage {
            from: "me@example.com".to_string(),
            to: "alice@example.com".to_string(),
            subject: "Re: Subject m1".to_string(),
            body: "Sure".to_string(),
            in_reply_to: Some("m1".to_string()),
        };
        let id = provider.send(&msg).await.unwrap();
        assert!(temp.path().join("mail").join("outbox").join(format!("{}.json", id)).exists());

        let bad = OutboundMessage {
            to: String::new(),
            ..msg
        };
        assert!(matches!(provider.send(&bad).await, Err(ProviderError::Rejected(_))));
    }

    #[test]
    fn test_sanitized_account_dir() {
        let connector = SpoolConnector::new("/spool");
        assert_eq!(
            connector.account_dir("me@example.com/../x"),
            PathBuf::from("/spool/me@example.com_.._x")
        );
    }
}
