//! Targets, confirmations and address parsing for the reply queue

use crate::{MailHubError, Result};

/// How a caller pointed at a queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTarget {
    /// Stable entry id
    Id(i64),
    /// 1-based position in the current list; only ever resolved to an id
    Index(usize),
    /// Natural-language reference matched against titles
    Title(String),
}

impl ReplyTarget {
    /// `12`, `#12`, `id 12` and `id:12` are ids; `item 3` and `index 3` are
    /// list positions; anything else is a title.
    pub fn parse(raw: &str) -> Result<Self> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(MailHubError::InvalidState("empty reply target".to_string()));
        }
        let lower = text.to_lowercase();

        if let Some(id) = parse_number(lower.trim_start_matches('#')) {
            return Ok(ReplyTarget::Id(id));
        }
        if let Some(rest) = lower.strip_prefix("id") {
            if let Some(id) = parse_number(rest.trim().trim_start_matches(':').trim()) {
                return Ok(ReplyTarget::Id(id));
            }
        }
        for prefix in ["item", "index", "no."] {
            if let Some(rest) = lower.strip_prefix(prefix) {
                if let Some(n) = parse_number(rest.trim().trim_start_matches(['#', ':', '.']).trim()) {
                    if n < 1 {
                        return Err(MailHubError::InvalidState(format!(
                            "list positions start at 1: {}",
                            text
                        )));
                    }
                    return Ok(ReplyTarget::Index(n as usize));
                }
            }
        }
        Ok(ReplyTarget::Title(text.to_string()))
    }
}

fn parse_number(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

const NEGATIONS: &[&str] = &["not", "don't", "dont", "never", "no", "cancel", "stop", "without"];

/// An explicit, out-of-band confirmation to send.
///
/// The phrase has to contain the word `send` and no negation; silence and
/// implicit agreement never count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation(String);

impl Confirmation {
    pub fn parse(phrase: Option<&str>) -> Result<Self> {
        let phrase = phrase.map(str::trim).unwrap_or_default();
        if phrase.is_empty() {
            return Err(MailHubError::SendBlocked(
                "confirmation is required and must include the word 'send'".to_string(),
            ));
        }
        let lower = phrase.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .filter(|w| !w.is_empty())
            .collect();
        if !words.contains(&"send") {
            return Err(MailHubError::SendBlocked(
                "confirmation must include the word 'send'".to_string(),
            ));
        }
        if words.iter().any(|w| NEGATIONS.contains(w)) {
            return Err(MailHubError::SendBlocked(format!(
                "confirmation is not an unambiguous affirmative: {}",
                phrase
            )));
        }
        Ok(Self(phrase.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Bare address from a header like `Name <addr@host>`
pub fn extract_address(header: &str) -> Option<String> {
    let header = header.trim();
    let candidate = match (header.rfind('<'), header.rfind('>')) {
        (Some(start), Some(end)) if start < end => &header[start + 1..end],
        _ => header,
    };
    let candidate = candidate.trim().trim_matches(|c| c == '"' || c == '\'');
    is_plausible_address(candidate).then(|| candidate.to_string())
}

pub fn is_plausible_address(value: &str) -> bool {
    let value = value.trim();
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !value.chars().any(|c| c.is_whitespace() || c == '<' || c == '>')
        }
        None => false,
    }
}
