//! Job slot markers

use super::{row_ts, to_ts, EncryptedStore};
use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotMarker {
    pub task_kind: String,
    pub slot_id: String,
    pub executed_at: DateTime<Utc>,
    pub result: Option<String>,
}

impl EncryptedStore {
    /// Check-and-set a slot. Only the first caller for a slot gets `true`.
    pub fn claim_slot(&self, task_kind: &str, slot_id: &str, executed_at: &DateTime<Utc>) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO job_slots (task_kind, slot_id, executed_at) VALUES (?1, ?2, ?3)",
            params![task_kind, slot_id, to_ts(executed_at)],
        )?;
        Ok(inserted == 1)
    }

    pub fn record_slot_result(&self, task_kind: &str, slot_id: &str, result: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE job_slots SET result = ?3 WHERE task_kind = ?1 AND slot_id = ?2",
            params![task_kind, slot_id, result],
        )?;
        Ok(())
    }

    pub fn list_slots(&self, task_kind: &str) -> Result<Vec<SlotMarker>> {
        let mut stmt = self.conn().prepare(
            "SELECT task_kind, slot_id, executed_at, result FROM job_slots
             WHERE task_kind = ?1 ORDER BY slot_id",
        )?;
        let rows = stmt.query_map(params![task_kind], |row| {
            Ok(SlotMarker {
                task_kind: row.get(0)?,
                slot_id: row.get(1)?,
                executed_at: row_ts(row, 2)?,
                result: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_temp;
    use super::*;

    #[test]
    fn test_claim_once_per_slot() {
        let (_temp, store) = open_temp();
        let now = Utc::now();
        assert!(store.claim_slot("digest", "2025-05-01.08:00", &now).unwrap());
        assert!(!store.claim_slot("digest", "2025-05-01.08:00", &now).unwrap());
        assert!(store.claim_slot("digest", "2025-05-01.18:00", &now).unwrap());
        assert!(store.claim_slot("billing_rollup", "2025-05-01.08:00", &now).unwrap());

        store.record_slot_result("digest", "2025-05-01.08:00", "ok").unwrap();
        let slots = store.list_slots("digest").unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].result.as_deref(), Some("ok"));
        assert!(slots[1].result.is_none());
    }
}
