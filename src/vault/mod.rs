//! Secret vault
//!
//! Chooses where the 32-byte store key ("dbkey") lives and hands it out for
//! the duration of one process run. A backend only counts as available after
//! it is reachable AND a probe value survives a write/read/delete round trip.
//! The selection is re-derived by probing on every acquisition; the record on
//! disk is evidence to compare against, never a cached answer.

mod backends;
pub mod material;
mod seal;

pub use backends::{
    CredentialFileBackend, CredentialSource, LocalFileBackend, OsKeyringBackend,
    CREDENTIALS_DIRECTORY_ENV, DBKEY_FILE_ENV,
};
pub use material::{decode_key_material, encode_key};
pub use seal::LocalSealer;

use crate::config::{MailHubConfig, StatePaths};
use crate::{MailHubError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the store key in bytes
pub const KEY_LEN: usize = 32;

/// Key storage backends, in default priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    OsKeyring,
    CredentialFile,
    LocalFile,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::OsKeyring => "os_keyring",
            BackendKind::CredentialFile => "credential_file",
            BackendKind::LocalFile => "local_file",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "os_keyring" | "keyring" | "keychain" => Ok(BackendKind::OsKeyring),
            "credential_file" | "systemd" => Ok(BackendKind::CredentialFile),
            "local_file" | "local" => Ok(BackendKind::LocalFile),
            other => Err(format!("unknown key backend: {}", other)),
        }
    }
}

/// The store key. Wiped on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DbKey([u8; KEY_LEN]);

impl DbKey {
    /// Fresh random key
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| MailHubError::KeyVerification("random key generation failed".to_string()))?;
        let key = Self(bytes);
        bytes.zeroize();
        Ok(key)
    }

    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() != KEY_LEN {
            return Err(format!("dbkey must be exactly {} bytes", KEY_LEN));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Hex form used in the SQLCipher key pragma
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }
}

impl std::fmt::Debug for DbKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbKey(<redacted>)")
    }
}

/// Which value a backend operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// The real dbkey
    Key,
    /// Throwaway value used for availability probes
    Probe,
}

/// Backend-level failure with an optional hint for the user
#[derive(Error, Debug, Clone)]
#[error("{reason}")]
pub struct BackendFault {
    pub reason: String,
    pub suggestion: Option<String>,
}

impl BackendFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// A place the dbkey can be stored
pub trait KeyBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Does the backing service exist at all. Returns evidence on success.
    fn reachable(&self) -> std::result::Result<String, BackendFault>;

    fn read(&self, entry: Entry) -> std::result::Result<Option<Zeroizing<String>>, BackendFault>;

    fn write(&self, entry: Entry, value: &str) -> std::result::Result<(), BackendFault>;

    fn delete(&self, entry: Entry) -> std::result::Result<(), BackendFault>;

    /// Prove the backend really stores values. Returns evidence on success.
    fn round_trip(&self) -> std::result::Result<String, BackendFault> {
        write_read_delete(self)
    }
}

/// Write a random probe value, read it back, then delete it
pub(crate) fn write_read_delete<B: KeyBackend + ?Sized>(
    backend: &B,
) -> std::result::Result<String, BackendFault> {
    let mut raw = [0u8; 18];
    SystemRandom::new()
        .fill(&mut raw)
        .map_err(|_| BackendFault::new("probe value generation failed"))?;
    let probe = URL_SAFE_NO_PAD.encode(raw);

    let result = backend.write(Entry::Probe, &probe).and_then(|()| {
        match backend.read(Entry::Probe)? {
            Some(got) if got.trim() == probe => Ok("probe_roundtrip_ok".to_string()),
            Some(_) => Err(BackendFault::new("probe read back a different value")),
            None => Err(BackendFault::new("probe value was not stored")),
        }
    });

    if let Err(e) = backend.delete(Entry::Probe) {
        tracing::debug!(backend = %backend.kind(), error = %e, "Probe cleanup failed");
    }
    result
}

/// Outcome of probing one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCheck {
    pub backend: BackendKind,
    pub available: bool,
    pub reason: String,
    pub suggestion: String,
    pub evidence: BTreeMap<String, String>,
}

impl BackendCheck {
    fn probe(backend: &dyn KeyBackend) -> Self {
        let kind = backend.kind();
        let mut evidence = BTreeMap::new();

        let reach = match backend.reachable() {
            Ok(reach) => reach,
            Err(fault) => {
                evidence.insert("reachable".to_string(), "false".to_string());
                return Self {
                    backend: kind,
                    available: false,
                    reason: fault.reason,
                    suggestion: fault.suggestion.unwrap_or_default(),
                    evidence,
                };
            }
        };
        evidence.insert("reachable".to_string(), reach);

        match backend.round_trip() {
            Ok(proof) => {
                evidence.insert("round_trip".to_string(), proof);
                Self {
                    backend: kind,
                    available: true,
                    reason: "reachable and round trip verified".to_string(),
                    suggestion: String::new(),
                    evidence,
                }
            }
            Err(fault) => {
                evidence.insert("round_trip".to_string(), "failed".to_string());
                Self {
                    backend: kind,
                    available: false,
                    reason: format!("reachable but round trip failed: {}", fault.reason),
                    suggestion: fault.suggestion.unwrap_or_default(),
                    evidence,
                }
            }
        }
    }
}

/// Non-secret record of the selected backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRecord {
    pub backend: BackendKind,
    pub evidence: BTreeMap<String, String>,
    pub selected_at: DateTime<Utc>,
}

impl BackendRecord {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        seal::write_private(path, format!("{}\n", json).as_bytes())
            .map_err(|e| MailHubError::Io(std::io::Error::other(e.reason)))
    }
}

/// Result of a fresh probe pass
#[derive(Debug, Clone)]
pub struct Selection {
    index: usize,
    pub backend: BackendKind,
    pub checks: Vec<BackendCheck>,
}

impl Selection {
    pub fn check(&self) -> &BackendCheck {
        &self.checks[self.index]
    }
}

/// What `setup` did
#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    pub backend: BackendKind,
    /// `existing`, `migrated` or `generated`
    pub key_origin: String,
    pub checks: Vec<BackendCheck>,
    pub record_path: PathBuf,
}

/// Selects a key backend and produces the dbkey
pub struct SecretVault {
    backends: Vec<Box<dyn KeyBackend>>,
    record_path: PathBuf,
}

impl SecretVault {
    /// Backends are tried in the given order
    pub fn new(backends: Vec<Box<dyn KeyBackend>>, record_path: impl Into<PathBuf>) -> Self {
        Self {
            backends,
            record_path: record_path.into(),
        }
    }

    /// Build the configured backend chain
    pub fn from_config(config: &MailHubConfig, paths: &StatePaths) -> Self {
        let security = &config.security;
        let backends = security
            .backends
            .iter()
            .map(|kind| -> Box<dyn KeyBackend> {
                match kind {
                    BackendKind::OsKeyring => Box::new(OsKeyringBackend::new(
                        &security.keyring_service,
                        &security.keyring_account,
                    )),
                    BackendKind::CredentialFile => Box::new(CredentialFileBackend::from_env(
                        security.credential_file.as_deref(),
                    )),
                    BackendKind::LocalFile => Box::new(LocalFileBackend::new(
                        paths.local_key(security.local_key_path.as_deref()),
                        paths.seal_salt(),
                    )),
                }
            })
            .collect();
        Self::new(backends, paths.backend_record())
    }

    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    pub fn load_record(&self) -> Result<Option<BackendRecord>> {
        BackendRecord::load(&self.record_path)
    }

    /// Probe every backend; nothing is selected or written
    pub fn probe_all(&self) -> Vec<BackendCheck> {
        self.backends
            .iter()
            .map(|b| BackendCheck::probe(b.as_ref()))
            .collect()
    }

    /// Probe all backends and pick the first verified one
    pub fn select(&self) -> Result<Selection> {
        let checks = self.probe_all();
        for check in &checks {
            tracing::debug!(
                backend = %check.backend,
                available = check.available,
                reason = %check.reason,
                "Key backend probed"
            );
        }
        match checks.iter().position(|c| c.available) {
            Some(index) => Ok(Selection {
                index,
                backend: checks[index].backend,
                checks,
            }),
            None => {
                let reasons: Vec<String> = checks
                    .iter()
                    .map(|c| format!("{}: {}", c.backend, c.reason))
                    .collect();
                Err(MailHubError::BackendUnavailable(if reasons.is_empty() {
                    "no key backends enabled".to_string()
                } else {
                    reasons.join("; ")
                }))
            }
        }
    }

    fn backend(&self, kind: BackendKind) -> Option<&dyn KeyBackend> {
        self.backends
            .iter()
            .find(|b| b.kind() == kind)
            .map(|b| b.as_ref())
    }

    fn read_key(backend: &dyn KeyBackend) -> Result<Option<DbKey>> {
        let raw = backend
            .read(Entry::Key)
            .map_err(|e| MailHubError::KeyVerification(format!("{}: {}", backend.kind(), e)))?;
        match raw {
            None => Ok(None),
            Some(raw) => decode_key_material(raw.as_bytes())
                .map(Some)
                .map_err(|e| MailHubError::KeyVerification(format!("{}: {}", backend.kind(), e))),
        }
    }

    /// Re-probe every backend, select one, make sure it holds a working key
    /// and write the backend record.
    ///
    /// An existing key in the selected backend is kept. If the previously
    /// recorded backend still holds a key, that key is carried over so the
    /// existing store stays readable.
    pub fn setup(&self) -> Result<SetupReport> {
        let selection = self.select()?;
        let backend = self
            .backend(selection.backend)
            .ok_or_else(|| MailHubError::BackendUnavailable("selected backend vanished".to_string()))?;

        let (key, origin) = match Self::read_key(backend)? {
            Some(key) => (key, "existing"),
            None => {
                let previous = self
                    .load_record()
                    .ok()
                    .flatten()
                    .filter(|r| r.backend != selection.backend)
                    .and_then(|r| self.backend(r.backend))
                    .and_then(|b| Self::read_key(b).ok().flatten());
                match previous {
                    Some(key) => (key, "migrated"),
                    None => (DbKey::generate()?, "generated"),
                }
            }
        };

        if origin != "existing" {
            let encoded = encode_key(&key);
            backend.write(Entry::Key, &encoded).map_err(|e| {
                MailHubError::KeyVerification(format!("{}: cannot store key: {}", backend.kind(), e))
            })?;
            let stored = Self::read_key(backend)?.ok_or_else(|| {
                MailHubError::KeyVerification(format!("{}: key not readable after write", backend.kind()))
            })?;
            if stored.as_bytes() != key.as_bytes() {
                return Err(MailHubError::KeyVerification(format!(
                    "{}: key read back differs from key written",
                    backend.kind()
                )));
            }
        }

        let record = BackendRecord {
            backend: selection.backend,
            evidence: selection.check().evidence.clone(),
            selected_at: Utc::now(),
        };
        record.save(&self.record_path)?;

        tracing::info!(backend = %selection.backend, key_origin = origin, "Key backend selected");

        Ok(SetupReport {
            backend: selection.backend,
            key_origin: origin.to_string(),
            checks: selection.checks,
            record_path: self.record_path.clone(),
        })
    }

    /// Probe, confirm the selection matches the record, and return the key.
    ///
    /// Fails closed: nothing here writes any state.
    pub fn acquire_key(&self) -> Result<DbKey> {
        let record = self.load_record()?.ok_or_else(|| {
            MailHubError::BackendUnavailable(
                "no key backend has been set up; run `mailhub vault setup`".to_string(),
            )
        })?;

        let selection = self.select()?;
        if selection.backend != record.backend {
            return Err(MailHubError::SelectionChanged {
                recorded: record.backend.to_string(),
                current: selection.backend.to_string(),
            });
        }

        let backend = self
            .backend(selection.backend)
            .ok_or_else(|| MailHubError::BackendUnavailable("selected backend vanished".to_string()))?;
        let key = Self::read_key(backend)?.ok_or_else(|| {
            MailHubError::KeyVerification(format!("{}: no dbkey stored", selection.backend))
        })?;

        tracing::debug!(backend = %selection.backend, "Store key acquired");
        Ok(key)
    }
}
