//! MailHub configuration file handling
//!
//! Loads and manages `<state_dir>/config.yaml`. Every section has defaults so
//! a missing or partial file still yields a usable (but unconfirmed) config.

use crate::jobs::schedule::TaskKind;
use crate::vault::BackendKind;
use crate::{MailHubError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default disclosure line appended to generated drafts
pub const DEFAULT_DISCLOSURE: &str = "This reply was drafted with MailHub assistance.";

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Name shown in digests
    pub display_name: Option<String>,

    /// Line appended to drafts produced by the collaborator
    pub disclosure: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            disclosure: DEFAULT_DISCLOSURE.to_string(),
        }
    }
}

/// Key backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Backends in priority order; disabled backends are simply left out
    pub backends: Vec<BackendKind>,

    /// OS keyring service name
    pub keyring_service: String,

    /// OS keyring account name
    pub keyring_account: String,

    /// Sealed local key file (relative paths resolve under the state dir)
    pub local_key_path: Option<PathBuf>,

    /// Injected credential file; falls back to `MAILHUB_DBKEY_FILE`, then
    /// `$CREDENTIALS_DIRECTORY/dbkey`
    pub credential_file: Option<PathBuf>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            backends: vec![
                BackendKind::OsKeyring,
                BackendKind::CredentialFile,
                BackendKind::LocalFile,
            ],
            keyring_service: "mailhub.dbkey".to_string(),
            keyring_account: "default".to_string(),
            local_key_path: None,
            credential_file: None,
        }
    }
}

/// Backoff policy for provider throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 16_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Incremental sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Window used when an account has no cursor and no bootstrap pending
    pub cold_start_days: u32,
    pub max_page_size: u32,
    pub min_page_size: u32,
    pub max_pages_per_run: u32,
    /// Upper bound for any single provider call
    pub provider_timeout_secs: u64,
    pub backoff: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cold_start_days: 30,
            max_page_size: 50,
            min_page_size: 10,
            max_pages_per_run: 5,
            provider_timeout_secs: 30,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Keyword rule for the fallback classifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelRule {
    pub label: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub senders: Vec<String>,
}

impl LabelRule {
    fn new(label: &str, keywords: &[&str], senders: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            senders: senders.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Triage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// Evaluated in order; first match wins
    pub rules: Vec<LabelRule>,

    /// Phrases that make a message look like it expects an answer
    pub reply_keywords: Vec<String>,

    /// Sender fragments that never get reply suggestions
    pub no_reply_senders: Vec<String>,

    /// Labels that never get reply suggestions
    pub no_reply_labels: Vec<String>,

    /// Body characters forwarded to the collaborator
    pub body_limit: usize,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                LabelRule::new(
                    "security",
                    &["verification code", "security alert", "password reset", "sign-in attempt", "2fa"],
                    &["security@", "account-security"],
                ),
                LabelRule::new(
                    "billing",
                    &["invoice", "receipt", "payment", "statement", "bill ", "amount due"],
                    &["billing@", "invoice@", "payments@"],
                ),
                LabelRule::new(
                    "meeting",
                    &["meeting", "invitation", "calendar", "reschedule", "agenda"],
                    &["calendar-notification"],
                ),
                LabelRule::new(
                    "newsletter",
                    &["unsubscribe", "newsletter", "weekly digest", "view in browser"],
                    &["newsletter@", "news@"],
                ),
                LabelRule::new(
                    "action",
                    &["please review", "action required", "could you", "can you", "deadline"],
                    &[],
                ),
            ],
            reply_keywords: [
                "?",
                "let me know",
                "please reply",
                "could you",
                "can you",
                "would you",
                "get back to me",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            no_reply_senders: ["no-reply", "noreply", "do-not-reply", "donotreply", "mailer-daemon", "notifications@"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            no_reply_labels: ["security", "newsletter", "billing"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            body_limit: 4_000,
        }
    }
}

impl TriageConfig {
    /// Labels the collaborator may answer with
    pub fn allowed_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for rule in &self.rules {
            let label = rule.label.trim().to_lowercase();
            if !label.is_empty() && !labels.contains(&label) {
                labels.push(label);
            }
        }
        if !labels.iter().any(|l| l == "other") {
            labels.push("other".to_string());
        }
        labels
    }
}

/// External drafting/classification collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub enabled: bool,
    /// Program followed by its arguments
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub workdir: Option<PathBuf>,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: Vec::new(),
            timeout_secs: 45,
            workdir: None,
        }
    }
}

/// Reply queue policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// Append the disclosure to verbatim (raw) drafts
    pub disclosure_on_raw: bool,

    /// Append the disclosure to refined drafts
    pub disclosure_on_refined: bool,

    /// Auto-abandon not-ready entries after this many days (`None` keeps them)
    pub not_ready_expiry_days: Option<u32>,

    /// Send already-confirmed entries during scheduled runs
    pub auto_send: bool,

    /// Standing confirmation used by auto-send
    pub auto_send_phrase: String,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            disclosure_on_raw: false,
            disclosure_on_refined: true,
            not_ready_expiry_days: None,
            auto_send: false,
            auto_send_phrase: "yes, send confirmed replies".to_string(),
        }
    }
}

/// One recurring task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTaskConfig {
    pub kind: TaskKind,
    /// `mon`..`sun`; empty means every day
    #[serde(default)]
    pub weekdays: Vec<String>,
    /// 1..=31; empty means every day of the month
    #[serde(default)]
    pub days_of_month: Vec<u32>,
    /// `HH:MM` local times
    #[serde(default)]
    pub times: Vec<String>,
}

/// Schedule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Fixed offset for local time in minutes east of UTC; system local time if unset
    pub utc_offset_minutes: Option<i32>,
    pub tasks: Vec<ScheduledTaskConfig>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: None,
            tasks: vec![
                ScheduledTaskConfig {
                    kind: TaskKind::Digest,
                    weekdays: Vec::new(),
                    days_of_month: Vec::new(),
                    times: vec!["08:00".to_string(), "18:00".to_string()],
                },
                ScheduledTaskConfig {
                    kind: TaskKind::BillingRollup,
                    weekdays: Vec::new(),
                    days_of_month: vec![1],
                    times: vec!["09:00".to_string()],
                },
            ],
        }
    }
}

/// Review/confirmation state written by the CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub config_reviewed: bool,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub config_confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// MailHub configuration
///
/// Represents the complete `config.yaml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailHubConfig {
    pub general: GeneralConfig,
    pub security: SecurityConfig,
    pub sync: SyncConfig,
    pub triage: TriageConfig,
    pub collaborator: CollaboratorConfig,
    pub reply: ReplyConfig,
    pub schedule: ScheduleConfig,
    pub runtime: RuntimeConfig,
}

impl MailHubConfig {
    /// Create a configuration with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(MailHubError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading MailHub configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            backends = config.security.backends.len(),
            tasks = config.schedule.tasks.len(),
            reviewed = config.runtime.config_reviewed,
            confirmed = config.runtime.config_confirmed,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Load, or fall back to defaults when the file does not exist yet
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving MailHub configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;
        crate::store::restrict_file_permissions(path)?;

        Ok(())
    }

    /// Record that the user has looked at the configuration.
    ///
    /// Reviewing again after a confirmation clears the confirmation, so any
    /// edited config has to be confirmed anew.
    pub fn mark_reviewed(&mut self) {
        self.runtime.config_reviewed = true;
        self.runtime.reviewed_at = Some(Utc::now());
        self.runtime.config_confirmed = false;
        self.runtime.confirmed_at = None;
    }

    /// Confirm the configuration; only allowed after review
    pub fn confirm(&mut self) -> Result<()> {
        if !self.runtime.config_reviewed {
            return Err(MailHubError::InvalidState(
                "configuration must be reviewed before it can be confirmed".to_string(),
            ));
        }
        self.runtime.config_confirmed = true;
        self.runtime.confirmed_at = Some(Utc::now());
        Ok(())
    }

    /// Trimmed disclosure line
    pub fn disclosure(&self) -> &str {
        self.general.disclosure.trim()
    }
}
