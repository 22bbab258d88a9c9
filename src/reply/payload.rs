//! Send-time override payloads
//!
//! An override fully replaces the stored draft. Keys are case-insensitive;
//! only `subject`, `to`, `from` and `context` are accepted and `context`
//! (the body) must be present.

use crate::{MailHubError, Result};
use serde_json::Value;

/// Appended to every body supplied at send time
pub const PROVENANCE_MARKER: &str = "\n\n--\n[mailhub] Message content supplied at send time.";

const ALLOWED_KEYS: &[&str] = &["subject", "to", "from", "context"];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OverridePayload {
    pub subject: Option<String>,
    pub to: Option<String>,
    pub from: Option<String>,
    pub context: String,
}

impl OverridePayload {
    /// Parse a JSON object; anything else is a send rejection
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| MailHubError::SendBlocked(format!("override payload is not JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| MailHubError::SendBlocked("override payload must be a JSON object".to_string()))?;

        let mut payload = OverridePayload::default();
        let mut unknown = Vec::new();
        for (key, value) in object {
            let key = key.trim().to_lowercase();
            let text = match value {
                Value::Null => String::new(),
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            let text = (!text.is_empty()).then_some(text);
            match key.as_str() {
                "subject" => payload.subject = text,
                "to" => payload.to = text,
                "from" => payload.from = text,
                "context" => payload.context = text.unwrap_or_default(),
                _ => unknown.push(key),
            }
        }

        if !unknown.is_empty() {
            unknown.sort();
            return Err(MailHubError::SendBlocked(format!(
                "override payload allows only {}; unexpected: {}",
                ALLOWED_KEYS.join(", "),
                unknown.join(", ")
            )));
        }
        if payload.context.is_empty() {
            return Err(MailHubError::SendBlocked(
                "override payload requires a non-empty 'context'".to_string(),
            ));
        }
        if let Some(subject) = &payload.subject {
            if subject.contains('\n') || subject.contains('\r') {
                return Err(MailHubError::SendBlocked("override subject must be one line".to_string()));
            }
        }
        Ok(payload)
    }

    /// Body that will be sent: the context plus the provenance marker
    pub fn body(&self) -> String {
        format!("{}{}", self.context.trim_end(), PROVENANCE_MARKER)
    }
}
