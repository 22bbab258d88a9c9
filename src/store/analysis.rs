//! Per-message analysis records

use super::{conversion_error, row_ts, to_ts, EncryptedStore};
use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Who produced an analysis record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    /// The external classification collaborator
    Collaborator,
    /// Deterministic keyword rules
    Rules,
    /// Recorded by a caller outside the run
    External,
}

impl AnalysisSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisSource::Collaborator => "collaborator",
            AnalysisSource::Rules => "rules",
            AnalysisSource::External => "external",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collaborator" => Some(AnalysisSource::Collaborator),
            "rules" => Some(AnalysisSource::Rules),
            "external" => Some(AnalysisSource::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRecord {
    pub message_id: i64,
    pub tag: String,
    pub confidence: f64,
    pub summary: String,
    pub suggest_reply: bool,
    pub suggestion: String,
    pub reasons: Vec<String>,
    pub source: AnalysisSource,
    pub written_at: DateTime<Utc>,
}

impl EncryptedStore {
    /// Write the current record for a message, superseding any earlier one
    pub fn upsert_analysis(&self, record: &AnalysisRecord) -> Result<()> {
        let reasons = serde_json::to_string(&record.reasons)?;
        self.conn().execute(
            "INSERT INTO message_analysis
                (message_id, tag, confidence, summary, suggest_reply, suggestion, reasons, source, written_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(message_id) DO UPDATE SET
                tag = excluded.tag,
                confidence = excluded.confidence,
                summary = excluded.summary,
                suggest_reply = excluded.suggest_reply,
                suggestion = excluded.suggestion,
                reasons = excluded.reasons,
                source = excluded.source,
                written_at = excluded.written_at",
            params![
                record.message_id,
                record.tag,
                record.confidence,
                record.summary,
                record.suggest_reply,
                record.suggestion,
                reasons,
                record.source.as_str(),
                to_ts(&record.written_at),
            ],
        )?;
        tracing::debug!(
            message_id = record.message_id,
            tag = %record.tag,
            source = record.source.as_str(),
            "Analysis recorded"
        );
        Ok(())
    }

    pub fn get_analysis(&self, message_id: i64) -> Result<Option<AnalysisRecord>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT message_id, tag, confidence, summary, suggest_reply, suggestion, reasons, source, written_at
                 FROM message_analysis WHERE message_id = ?1",
                params![message_id],
                |row| {
                    let reasons: String = row.get(6)?;
                    let source: String = row.get(7)?;
                    Ok(AnalysisRecord {
                        message_id: row.get(0)?,
                        tag: row.get(1)?,
                        confidence: row.get(2)?,
                        summary: row.get(3)?,
                        suggest_reply: row.get(4)?,
                        suggestion: row.get(5)?,
                        reasons: serde_json::from_str(&reasons)
                            .map_err(|e| conversion_error(6, e.to_string()))?,
                        source: AnalysisSource::parse(&source)
                            .ok_or_else(|| conversion_error(7, format!("unknown source {}", source)))?,
                        written_at: row_ts(row, 8)?,
                    })
                },
            )
            .optional()?)
    }

    /// Ids of stored messages with no analysis record yet, oldest first
    pub fn unanalyzed_message_ids(&self, limit: usize) -> Result<Vec<i64>> {
        let mut stmt = self.conn().prepare(
            "SELECT m.id FROM messages m
             LEFT JOIN message_analysis a ON a.message_id = m.id
             WHERE a.message_id IS NULL
             ORDER BY m.id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{account, open_temp};
    use super::super::{IngestSource, NewMessage};
    use super::*;

    #[test]
    fn test_latest_write_supersedes() {
        let (_temp, store) = open_temp();
        let acct = account(&store, "me@example.com");
        let id = store
            .insert_message(
                acct,
                &NewMessage {
                    provider_message_id: "p1".to_string(),
                    from: "a@example.com".to_string(),
                    to: "me@example.com".to_string(),
                    subject: "Invoice".to_string(),
                    snippet: String::new(),
                    body_text: String::new(),
                    received_at: Utc::now(),
                    source: IngestSource::Poll,
                },
            )
            .unwrap()
            .unwrap();

        let mut record = AnalysisRecord {
            message_id: id,
            tag: "billing".to_string(),
            confidence: 0.6,
            summary: "Invoice".to_string(),
            suggest_reply: false,
            suggestion: String::new(),
            reasons: vec!["keyword: invoice".to_string()],
            source: AnalysisSource::Rules,
            written_at: Utc::now(),
        };
        store.upsert_analysis(&record).unwrap();

        record.tag = "action".to_string();
        record.source = AnalysisSource::External;
        record.suggest_reply = true;
        store.upsert_analysis(&record).unwrap();

        let stored = store.get_analysis(id).unwrap().unwrap();
        assert_eq!(stored.tag, "action");
        assert_eq!(stored.source, AnalysisSource::External);
        assert!(stored.suggest_reply);
        assert_eq!(stored.reasons, vec!["keyword: invoice".to_string()]);
        assert!(store.get_analysis(id + 100).unwrap().is_none());
    }

    #[test]
    fn test_unanalyzed_ids_skip_recorded() {
        let (_temp, store) = open_temp();
        let acct = account(&store, "me@example.com");
        let ids: Vec<i64> = ["p1", "p2", "p3"]
            .iter()
            .map(|pid| {
                store
                    .insert_message(
                        acct,
                        &NewMessage {
                            provider_message_id: pid.to_string(),
                            from: "a@example.com".to_string(),
                            to: "me@example.com".to_string(),
                            subject: "Hello".to_string(),
                            snippet: String::new(),
                            body_text: String::new(),
                            received_at: Utc::now(),
                            source: IngestSource::Poll,
                        },
                    )
                    .unwrap()
                    .unwrap()
            })
            .collect();

        store
            .upsert_analysis(&AnalysisRecord {
                message_id: ids[1],
                tag: "other".to_string(),
                confidence: 0.5,
                summary: String::new(),
                suggest_reply: false,
                suggestion: String::new(),
                reasons: Vec::new(),
                source: AnalysisSource::Rules,
                written_at: Utc::now(),
            })
            .unwrap();

        assert_eq!(store.unanalyzed_message_ids(10).unwrap(), vec![ids[0], ids[2]]);
        assert_eq!(store.unanalyzed_message_ids(1).unwrap(), vec![ids[0]]);
    }
}
