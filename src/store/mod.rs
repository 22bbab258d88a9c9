//! Encrypted store
//!
//! One SQLCipher database holds accounts, cursors, messages, analysis,
//! reply-queue entries, named secrets and job slot markers. It can only be
//! opened with a key produced by the vault, and the key is verified before
//! any schema is created or any row is touched.

mod analysis;
mod cursors;
mod messages;
mod replies;
mod schema;
mod secrets;
mod slots;

pub use analysis::{AnalysisRecord, AnalysisSource};
pub use cursors::{CursorState, CursorStatus, PersistPage};
pub use messages::{CalendarEvent, IngestSource, NewMessage, StoredMessage};
pub use replies::{ComposeMode, ReplyEntry, ReplyState, SendMode};
pub(crate) use replies::ClaimContent;
pub use secrets::SecretStore;
pub use slots::SlotMarker;

use crate::vault::DbKey;
use crate::{MailHubError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Handle on the open, key-verified store
pub struct EncryptedStore {
    conn: Connection,
    path: PathBuf,
}

impl std::fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("path", &self.path)
            .finish()
    }
}

impl EncryptedStore {
    /// Open (or create) the store and verify the key.
    ///
    /// With a wrong key the file is left exactly as it was.
    pub fn open(path: impl AsRef<Path>, key: &DbKey) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
            restrict_dir_permissions(parent)?;
        }

        tracing::info!(path = %path.display(), "Opening encrypted store");

        let conn = Connection::open(&path)?;
        let pragma = Zeroizing::new(format!("PRAGMA key = \"x'{}'\";", key.to_hex().as_str()));
        conn.execute_batch(&pragma)?;

        let verified: rusqlite::Result<i64> =
            conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0));
        if let Err(e) = verified {
            tracing::warn!(path = %path.display(), "Store key verification failed");
            drop(conn);
            return Err(MailHubError::KeyVerification(format!(
                "store could not be decrypted with the selected key: {}",
                e
            )));
        }

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self { conn, path };
        store.init_schema()?;
        store.restrict_permissions()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(schema::SCHEMA)?;
        Ok(())
    }

    /// chmod 0600 on the database and its WAL/SHM companions
    fn restrict_permissions(&self) -> Result<()> {
        restrict_file_permissions(&self.path)?;
        for suffix in ["-wal", "-shm"] {
            let mut companion = self.path.clone().into_os_string();
            companion.push(suffix);
            let companion = PathBuf::from(companion);
            if companion.exists() {
                restrict_file_permissions(&companion)?;
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Release the handle, reporting close errors
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| MailHubError::Store(e))
    }

    /// `PRAGMA quick_check`; `Ok(None)` when healthy, otherwise the first problem
    pub fn health_check(&self) -> Result<Option<String>> {
        let result: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if result.eq_ignore_ascii_case("ok") {
            Ok(None)
        } else {
            Ok(Some(result))
        }
    }

    /// Named secrets kept inside the encrypted store
    pub fn secrets(&self) -> SecretStore<'_> {
        SecretStore::new(self)
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, to_ts(&Utc::now())],
        )?;
        Ok(())
    }
}

/// Fixed-width UTC timestamp, so text order is time order
pub fn to_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn row_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn row_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        parse_ts(&r).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// chmod 0600 (no-op off unix)
pub fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.exists() {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// chmod 0700 (no-op off unix)
pub fn restrict_dir_permissions(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.is_dir() {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
