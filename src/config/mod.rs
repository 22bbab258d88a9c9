//! Configuration system
//!
//! Loads `<state_dir>/config.yaml` with support for:
//! - Key backend priority and locations
//! - Sync windows, page sizes and throttling backoff
//! - Fallback triage rules and the external collaborator
//! - Reply queue policy and recurring tasks
//! - The review/confirm handshake that gates scheduled runs

mod mailhub_config;
pub mod validation;

pub use mailhub_config::{
    BackoffConfig, CollaboratorConfig, GeneralConfig, LabelRule, MailHubConfig, ReplyConfig,
    RuntimeConfig, ScheduleConfig, ScheduledTaskConfig, SecurityConfig, SyncConfig, TriageConfig,
    DEFAULT_DISCLOSURE,
};
pub use validation::{validate_config, validate_config_result, ValidationError};

use std::path::{Path, PathBuf};

/// Environment variable overriding the state directory
pub const STATE_DIR_ENV: &str = "MAILHUB_STATE_DIR";

/// Default state directory: `$MAILHUB_STATE_DIR`, else `~/.config/mailhub`
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        let dir = dir.trim();
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("mailhub");
    path
}

/// Files that live under the state directory
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        Self::new(default_state_dir())
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn store(&self) -> PathBuf {
        self.root.join("mailhub.db")
    }

    /// Non-secret record of the selected key backend
    pub fn backend_record(&self) -> PathBuf {
        self.root.join("key-backend.json")
    }

    /// Sealed local fallback key, honouring a configured override
    pub fn local_key(&self, configured: Option<&Path>) -> PathBuf {
        match configured {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => self.root.join(p),
            None => self.root.join("dbkey.enc"),
        }
    }

    /// Per-install salt for sealing the local key
    pub fn seal_salt(&self) -> PathBuf {
        self.root.join(".seal_salt")
    }

    /// Root of the file spool provider
    pub fn spool(&self) -> PathBuf {
        self.root.join("spool")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_paths() {
        let paths = StatePaths::new("/tmp/mh");
        assert_eq!(paths.config(), PathBuf::from("/tmp/mh/config.yaml"));
        assert_eq!(paths.store(), PathBuf::from("/tmp/mh/mailhub.db"));
        assert_eq!(paths.local_key(None), PathBuf::from("/tmp/mh/dbkey.enc"));
        assert_eq!(
            paths.local_key(Some(Path::new("keys/k.enc"))),
            PathBuf::from("/tmp/mh/keys/k.enc")
        );
        assert_eq!(
            paths.local_key(Some(Path::new("/etc/mh.key"))),
            PathBuf::from("/etc/mh.key")
        );
    }
}
