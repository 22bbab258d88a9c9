//! Named secrets kept inside the encrypted store.
//!
//! Values never leave this module except wrapped in [`Zeroizing`], and are
//! never logged. Accounts point at entries by name (`secret_ref`).

use super::{to_ts, EncryptedStore};
use crate::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use zeroize::Zeroizing;

pub struct SecretStore<'a> {
    store: &'a EncryptedStore,
}

impl<'a> SecretStore<'a> {
    pub(crate) fn new(store: &'a EncryptedStore) -> Self {
        Self { store }
    }

    pub fn get(&self, name: &str) -> Result<Option<Zeroizing<String>>> {
        let value: Option<String> = self
            .store
            .conn()
            .query_row("SELECT value FROM secrets WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        Ok(value.map(Zeroizing::new))
    }

    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        self.store.conn().execute(
            "INSERT INTO secrets (name, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![name, value, to_ts(&Utc::now())],
        )?;
        tracing::debug!(name, "Secret stored");
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        let removed = self
            .store
            .conn()
            .execute("DELETE FROM secrets WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    pub fn names(&self) -> Result<Vec<String>> {
        let mut stmt = self.store.conn().prepare("SELECT name FROM secrets ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_temp;

    #[test]
    fn test_set_get_delete() {
        let (_temp, store) = open_temp();
        let secrets = store.secrets();
        assert!(secrets.get("account:spool:a").unwrap().is_none());

        secrets.set("account:spool:a", "hunter2").unwrap();
        secrets.set("account:spool:a", "hunter3").unwrap();
        assert_eq!(secrets.get("account:spool:a").unwrap().unwrap().as_str(), "hunter3");
        assert_eq!(secrets.names().unwrap(), vec!["account:spool:a".to_string()]);

        assert!(secrets.delete("account:spool:a").unwrap());
        assert!(!secrets.delete("account:spool:a").unwrap());
    }
}
