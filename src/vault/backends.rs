//! Key storage backends
//!
//! Three mutually exclusive places the dbkey can live, in priority order:
//! the OS-native secret store, an injected credential file, and a sealed
//! local file under the state directory.

use super::seal::{write_private, LocalSealer};
use super::{BackendFault, BackendKind, Entry, KeyBackend};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Env var pointing at a writable dbkey credential file
pub const DBKEY_FILE_ENV: &str = "MAILHUB_DBKEY_FILE";

/// Env var set by systemd for `LoadCredential=`
pub const CREDENTIALS_DIRECTORY_ENV: &str = "CREDENTIALS_DIRECTORY";

/// OS keyring (macOS Keychain, Windows Credential Manager, Linux keyutils)
#[derive(Debug, Clone)]
pub struct OsKeyringBackend {
    service: String,
    account: String,
}

impl OsKeyringBackend {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self, entry: Entry) -> Result<keyring::Entry, BackendFault> {
        let account = match entry {
            Entry::Key => self.account.clone(),
            Entry::Probe => format!("{}.probe.{}", self.account, std::process::id()),
        };
        keyring::Entry::new(&self.service, &account).map_err(|e| {
            BackendFault::new(format!("keyring unavailable: {}", e))
                .with_suggestion("Unlock or install an OS keyring, or use the credential_file/local_file backend")
        })
    }
}

impl KeyBackend for OsKeyringBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OsKeyring
    }

    fn reachable(&self) -> Result<String, BackendFault> {
        self.entry(Entry::Key)?;
        Ok(format!("keyring service '{}' reachable", self.service))
    }

    fn read(&self, entry: Entry) -> Result<Option<Zeroizing<String>>, BackendFault> {
        match self.entry(entry)?.get_password() {
            Ok(value) => Ok(Some(Zeroizing::new(value))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(BackendFault::new(format!("keyring read failed: {}", e))),
        }
    }

    fn write(&self, entry: Entry, value: &str) -> Result<(), BackendFault> {
        self.entry(entry)?
            .set_password(value)
            .map_err(|e| BackendFault::new(format!("keyring write failed: {}", e)))
    }

    fn delete(&self, entry: Entry) -> Result<(), BackendFault> {
        match self.entry(entry)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(BackendFault::new(format!("keyring delete failed: {}", e))),
        }
    }
}

/// Where the credential file path came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// `security.credential_file` in config.yaml
    Config,
    /// `MAILHUB_DBKEY_FILE`
    EnvFile,
    /// `$CREDENTIALS_DIRECTORY/dbkey`, read-only
    Injected,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Config => "config",
            CredentialSource::EnvFile => DBKEY_FILE_ENV,
            CredentialSource::Injected => CREDENTIALS_DIRECTORY_ENV,
        }
    }
}

/// Externally provided credential file (systemd `LoadCredential` or a path)
#[derive(Debug, Clone)]
pub struct CredentialFileBackend {
    location: Option<(PathBuf, CredentialSource)>,
}

impl CredentialFileBackend {
    pub fn new(path: impl Into<PathBuf>, source: CredentialSource) -> Self {
        Self {
            location: Some((path.into(), source)),
        }
    }

    /// Resolve from config, then `MAILHUB_DBKEY_FILE`, then `$CREDENTIALS_DIRECTORY/dbkey`
    pub fn from_env(configured: Option<&Path>) -> Self {
        if let Some(path) = configured {
            return Self::new(path, CredentialSource::Config);
        }
        if let Ok(file) = std::env::var(DBKEY_FILE_ENV) {
            let file = file.trim();
            if !file.is_empty() {
                return Self::new(file, CredentialSource::EnvFile);
            }
        }
        if let Ok(dir) = std::env::var(CREDENTIALS_DIRECTORY_ENV) {
            let dir = dir.trim();
            if !dir.is_empty() {
                return Self::new(Path::new(dir).join("dbkey"), CredentialSource::Injected);
            }
        }
        Self { location: None }
    }

    fn location(&self) -> Result<(&Path, CredentialSource), BackendFault> {
        self.location
            .as_ref()
            .map(|(p, s)| (p.as_path(), *s))
            .ok_or_else(|| {
                BackendFault::new("no dbkey credential file configured").with_suggestion(
                    "Run as a systemd service with LoadCredential=dbkey:/path/to/dbkey, \
                     or set MAILHUB_DBKEY_FILE to a writable file",
                )
            })
    }

    fn path_for(&self, entry: Entry) -> Result<PathBuf, BackendFault> {
        let (path, _) = self.location()?;
        Ok(match entry {
            Entry::Key => path.to_path_buf(),
            Entry::Probe => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "dbkey".to_string());
                path.with_file_name(format!(".{}.probe", name))
            }
        })
    }
}

impl KeyBackend for CredentialFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CredentialFile
    }

    fn reachable(&self) -> Result<String, BackendFault> {
        let (path, source) = self.location()?;
        match source {
            CredentialSource::Injected => {
                if !path.is_file() {
                    return Err(BackendFault::new(format!(
                        "injected credential {} does not exist",
                        path.display()
                    ))
                    .with_suggestion("Add LoadCredential=dbkey:/path/to/dbkey to the service unit"));
                }
            }
            CredentialSource::Config | CredentialSource::EnvFile => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    if !parent.is_dir() {
                        return Err(BackendFault::new(format!(
                            "credential directory {} does not exist",
                            parent.display()
                        )));
                    }
                }
            }
        }
        Ok(format!("{} ({})", path.display(), source.as_str()))
    }

    fn read(&self, entry: Entry) -> Result<Option<Zeroizing<String>>, BackendFault> {
        let path = self.path_for(entry)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = Zeroizing::new(
            fs::read(&path)
                .map_err(|e| BackendFault::new(format!("cannot read {}: {}", path.display(), e)))?,
        );
        Ok(Some(Zeroizing::new(String::from_utf8_lossy(&bytes).to_string())))
    }

    fn write(&self, entry: Entry, value: &str) -> Result<(), BackendFault> {
        let (_, source) = self.location()?;
        if source == CredentialSource::Injected {
            return Err(BackendFault::new("injected credentials are read-only")
                .with_suggestion("Set MAILHUB_DBKEY_FILE to a writable file to let setup create the key"));
        }
        let path = self.path_for(entry)?;
        write_private(&path, format!("{}\n", value).as_bytes())
    }

    fn delete(&self, entry: Entry) -> Result<(), BackendFault> {
        let path = self.path_for(entry)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendFault::new(format!("cannot delete {}: {}", path.display(), e))),
        }
    }

    /// Injected credentials cannot be written, so the round trip reads the
    /// key twice and requires both reads to decode to the same key.
    fn round_trip(&self) -> Result<String, BackendFault> {
        let (_, source) = self.location()?;
        if source != CredentialSource::Injected {
            return super::write_read_delete(self);
        }
        let first = self
            .read(Entry::Key)?
            .ok_or_else(|| BackendFault::new("injected credential disappeared"))?;
        let second = self
            .read(Entry::Key)?
            .ok_or_else(|| BackendFault::new("injected credential disappeared"))?;
        let a = super::material::decode_key_material(first.as_bytes())
            .map_err(|e| BackendFault::new(format!("injected credential invalid: {}", e)))?;
        let b = super::material::decode_key_material(second.as_bytes())
            .map_err(|e| BackendFault::new(format!("injected credential invalid: {}", e)))?;
        if a.as_bytes() != b.as_bytes() {
            return Err(BackendFault::new("injected credential changed between reads"));
        }
        Ok("credential_read_verified".to_string())
    }
}

/// Sealed key file under the state directory
#[derive(Debug, Clone)]
pub struct LocalFileBackend {
    key_path: PathBuf,
    sealer: LocalSealer,
}

impl LocalFileBackend {
    pub fn new(key_path: impl Into<PathBuf>, salt_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            sealer: LocalSealer::new(salt_path),
        }
    }

    fn path_for(&self, entry: Entry) -> PathBuf {
        match entry {
            Entry::Key => self.key_path.clone(),
            Entry::Probe => self.key_path.with_extension("probe"),
        }
    }
}

impl KeyBackend for LocalFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalFile
    }

    fn reachable(&self) -> Result<String, BackendFault> {
        let dir = self
            .key_path
            .parent()
            .ok_or_else(|| BackendFault::new("local key path has no parent directory"))?;
        fs::create_dir_all(dir).map_err(|e| {
            BackendFault::new(format!("cannot prepare {}: {}", dir.display(), e))
                .with_suggestion("Ensure the state directory is writable")
        })?;
        crate::store::restrict_dir_permissions(dir)
            .map_err(|e| BackendFault::new(format!("cannot restrict {}: {}", dir.display(), e)))?;
        Ok(format!("{} writable", dir.display()))
    }

    fn read(&self, entry: Entry) -> Result<Option<Zeroizing<String>>, BackendFault> {
        let path = self.path_for(entry);
        if !path.exists() {
            return Ok(None);
        }
        crate::store::restrict_file_permissions(&path)
            .map_err(|e| BackendFault::new(format!("cannot restrict {}: {}", path.display(), e)))?;
        let sealed = fs::read_to_string(&path)
            .map_err(|e| BackendFault::new(format!("cannot read {}: {}", path.display(), e)))?;
        let plain = self.sealer.open(&sealed)?;
        Ok(Some(Zeroizing::new(String::from_utf8_lossy(&plain).to_string())))
    }

    fn write(&self, entry: Entry, value: &str) -> Result<(), BackendFault> {
        let sealed = self.sealer.seal(value.as_bytes())?;
        write_private(&self.path_for(entry), format!("{}\n", sealed).as_bytes())
    }

    fn delete(&self, entry: Entry) -> Result<(), BackendFault> {
        let path = self.path_for(entry);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendFault::new(format!("cannot delete {}: {}", path.display(), e))),
        }
    }
}
