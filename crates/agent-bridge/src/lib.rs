//! Agent bridge for mail classification and reply drafting
//!
//! A type-safe interface to an external agent process. The agent is treated as
//! a pure function: one JSON request goes in on stdin, exactly one JSON object
//! must come back on stdout, and anything that does not match the fixed schema
//! is rejected.
//!
//! # Example
//!
//! ```no_run
//! use agent_bridge::{ClassifyRequest, Collaborator, IncomingEmail, ProcessCollaborator};
//! use std::time::Duration;
//!
//! # async fn demo() -> agent_bridge::Result<()> {
//! let agent = ProcessCollaborator::new(vec!["my-agent".into(), "--json".into()])?
//!     .with_timeout(Duration::from_secs(30));
//!
//! let request = ClassifyRequest {
//!     email: IncomingEmail {
//!         subject: "Invoice 2024-03".into(),
//!         from: "billing@example.com".into(),
//!         snippet: "Your invoice is ready".into(),
//!         body_text: String::new(),
//!     },
//!     labels: vec!["billing".into(), "other".into()],
//! };
//! let classification = agent.classify(&request).await?;
//! println!("{} ({:.2})", classification.label, classification.confidence);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default wall-clock budget for one agent invocation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);

const MAX_REASONS: usize = 8;
const MAX_REASON_CHARS: usize = 300;

/// Constraints forwarded with every drafting request.
pub const PRIVACY_CONSTRAINTS: &[&str] = &[
    "Do not include user private data.",
    "Do not reveal any information outside the current email being replied to.",
    "Do not use data from other emails, accounts, contacts, calendar events, or billing records.",
    "If uncertain whether content is out of scope, omit it.",
];

/// Errors that can occur when talking to the agent
#[derive(Error, Debug)]
pub enum Error {
    #[error("agent bridge is disabled (no command configured)")]
    Disabled,

    #[error("failed to start agent: {0}")]
    Spawn(String),

    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("agent output rejected: {0}")]
    MalformedOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Task names understood by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    ClassifyEmail,
    DraftReply,
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::ClassifyEmail => write!(f, "classify_email"),
            Task::DraftReply => write!(f, "draft_reply"),
        }
    }
}

/// The single email an agent call is allowed to see
#[derive(Debug, Clone, Default, Serialize)]
pub struct IncomingEmail {
    pub subject: String,
    pub from: String,
    pub snippet: String,
    pub body_text: String,
}

/// Classification request
#[derive(Debug, Clone, Serialize)]
pub struct ClassifyRequest {
    pub email: IncomingEmail,
    /// Labels the agent may choose from
    pub labels: Vec<String>,
}

/// Classification answer. Unknown fields are a schema violation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Classification {
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl Classification {
    /// Check the answer against the request it belongs to.
    pub fn validate(mut self, allowed_labels: &[String]) -> Result<Self> {
        let label = self.label.trim().to_lowercase();
        if label.is_empty() {
            return Err(Error::MalformedOutput("empty label".to_string()));
        }
        if !allowed_labels.is_empty() && !allowed_labels.iter().any(|l| l == &label) {
            return Err(Error::MalformedOutput(format!("label not allowed: {}", label)));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::MalformedOutput(format!(
                "confidence out of range: {}",
                self.confidence
            )));
        }
        self.label = label;
        self.reasons.truncate(MAX_REASONS);
        for reason in &mut self.reasons {
            if reason.chars().count() > MAX_REASON_CHARS {
                *reason = reason.chars().take(MAX_REASON_CHARS).collect();
            }
        }
        Ok(self)
    }
}

/// Drafting request
#[derive(Debug, Clone, Serialize)]
pub struct DraftRequest {
    pub email: IncomingEmail,
    /// User guidance or a default instruction
    pub hint: String,
    /// Text the draft body must end with (may be empty)
    pub must_append_disclosure: String,
    pub privacy_constraints: Vec<String>,
}

impl DraftRequest {
    pub fn new(email: IncomingEmail, hint: impl Into<String>, disclosure: impl Into<String>) -> Self {
        Self {
            email,
            hint: hint.into(),
            must_append_disclosure: disclosure.into(),
            privacy_constraints: PRIVACY_CONSTRAINTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Drafting answer. Unknown fields are a schema violation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Draft {
    pub subject: String,
    pub body: String,
}

impl Draft {
    pub fn validate(self) -> Result<Self> {
        let subject = self.subject.trim().to_string();
        let body = self.body.trim().to_string();
        if subject.is_empty() || body.is_empty() {
            return Err(Error::MalformedOutput("draft subject and body are required".to_string()));
        }
        if subject.contains('\n') || subject.contains('\r') {
            return Err(Error::MalformedOutput("multi-line subject".to_string()));
        }
        Ok(Self { subject, body })
    }
}

/// Anything that can classify and draft.
///
/// Implementations must only ever populate the returned content fields;
/// callers never derive control flow from agent output beyond them.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification>;

    async fn draft_reply(&self, request: &DraftRequest) -> Result<Draft>;
}

/// Collaborator used when no agent command is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCollaborator;

#[async_trait]
impl Collaborator for DisabledCollaborator {
    async fn classify(&self, _request: &ClassifyRequest) -> Result<Classification> {
        Err(Error::Disabled)
    }

    async fn draft_reply(&self, _request: &DraftRequest) -> Result<Draft> {
        Err(Error::Disabled)
    }
}

/// Output captured from one agent run
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    task: Task,
    input: &'a T,
}

/// Agent reached over a process boundary
#[derive(Debug, Clone)]
pub struct ProcessCollaborator {
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl ProcessCollaborator {
    /// Create from a full argv (program first)
    pub fn new(argv: Vec<String>) -> Result<Self> {
        let mut parts = argv.into_iter().filter(|a| !a.trim().is_empty());
        let program = parts.next().ok_or(Error::Disabled)?;
        Ok(Self {
            program,
            args: parts.collect(),
            workdir: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.workdir = Some(path.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one task and return the single JSON object it printed
    pub async fn run_task<T: Serialize>(&self, task: Task, input: &T) -> Result<serde_json::Value> {
        let request = serde_json::to_vec(&Envelope { task, input })?;
        let output = self.run_command(&request).await?;

        if !output.success {
            return Err(Error::NonZeroExit {
                code: None,
                stderr: output.stderr.chars().take(500).collect(),
            });
        }

        extract_json(&output.stdout)
            .ok_or_else(|| Error::MalformedOutput(format!("{} produced no JSON object", task)))
    }

    async fn run_command(&self, stdin_payload: &[u8]) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", self.program, e)))?;

        // The write counts against the timeout too: an agent that never reads
        // stdin would otherwise block a payload larger than the pipe buffer.
        // Dropping the future on expiry drops the child, which kills it.
        let stdin = child.stdin.take();
        let exchange = async move {
            if let Some(mut stdin) = stdin {
                // A closed pipe just means the agent ignored its input.
                if let Err(e) = stdin.write_all(stdin_payload).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(Error::Io(e));
                    }
                }
            }
            Ok(child.wait_with_output().await?)
        };

        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout(self.timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(Error::NonZeroExit {
                code: output.status.code(),
                stderr: stderr.chars().take(500).collect(),
            });
        }

        Ok(CommandOutput {
            success: true,
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl Collaborator for ProcessCollaborator {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification> {
        let value = self.run_task(Task::ClassifyEmail, request).await?;
        let parsed: Classification = serde_json::from_value(value)
            .map_err(|e| Error::MalformedOutput(e.to_string()))?;
        parsed.validate(&request.labels)
    }

    async fn draft_reply(&self, request: &DraftRequest) -> Result<Draft> {
        let value = self.run_task(Task::DraftReply, request).await?;
        let parsed: Draft =
            serde_json::from_value(value).map_err(|e| Error::MalformedOutput(e.to_string()))?;
        parsed.validate()
    }
}

/// Find the JSON object in agent output.
///
/// The whole output is tried first, then each line from the bottom up.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let raw = text.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with('{') && raw.ends_with('}') {
        if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(raw) {
            return Some(value);
        }
    }
    raw.lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{') && line.ends_with('}'))
        .find_map(|line| match serde_json::from_str(line) {
            Ok(value @ serde_json::Value::Object(_)) => Some(value),
            _ => None,
        })
}
