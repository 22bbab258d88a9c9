//! Deterministic keyword rules
//!
//! Used whenever the collaborator is disabled or returns anything that does
//! not validate. Output has the same shape as a collaborator classification.

use crate::config::TriageConfig;
use agent_bridge::{Classification, Draft, IncomingEmail};

const RULE_CONFIDENCE: f64 = 0.6;
const DEFAULT_CONFIDENCE: f64 = 0.3;

fn contains_any<'k>(haystack: &str, needles: &'k [String]) -> Option<&'k str> {
    needles
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .find(|n| haystack.contains(&n.to_lowercase()))
}

/// First matching rule wins; unmatched mail is `other`
pub fn classify(config: &TriageConfig, email: &IncomingEmail) -> Classification {
    let from = email.from.to_lowercase();
    let text = format!("{}\n{}\n{}", email.subject, email.snippet, email.body_text).to_lowercase();

    for rule in &config.rules {
        let label = rule.label.trim().to_lowercase();
        if label.is_empty() {
            continue;
        }
        if let Some(sender) = contains_any(&from, &rule.senders) {
            return Classification {
                label,
                confidence: RULE_CONFIDENCE,
                reasons: vec![format!("sender matches '{}'", sender)],
            };
        }
        if let Some(keyword) = contains_any(&text, &rule.keywords) {
            return Classification {
                label,
                confidence: RULE_CONFIDENCE,
                reasons: vec![format!("keyword '{}'", keyword)],
            };
        }
    }

    Classification {
        label: "other".to_string(),
        confidence: DEFAULT_CONFIDENCE,
        reasons: vec!["no rule matched".to_string()],
    }
}

/// Whether a message looks like it expects an answer
pub fn suggests_reply(config: &TriageConfig, label: &str, email: &IncomingEmail) -> bool {
    let label = label.to_lowercase();
    if config.no_reply_labels.iter().any(|l| l.trim().eq_ignore_ascii_case(&label)) {
        return false;
    }
    let from = email.from.to_lowercase();
    if contains_any(&from, &config.no_reply_senders).is_some() {
        return false;
    }
    let text = format!("{}\n{}", email.subject, email.body_text).to_lowercase();
    contains_any(&text, &config.reply_keywords).is_some()
}

/// Short acknowledgement used when no collaborator draft is available
pub fn fallback_draft(email: &IncomingEmail, hint: &str, disclosure: &str) -> Draft {
    let subject = reply_subject(&email.subject);
    let mut body = if hint.trim().is_empty() {
        "Thanks for your message. I have received it and will get back to you shortly.".to_string()
    } else {
        hint.trim().to_string()
    };
    if !disclosure.trim().is_empty() {
        body.push_str("\n\n");
        body.push_str(disclosure.trim());
    }
    Draft { subject, body }
}

/// `Re: <subject>` without stacking prefixes
pub fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject.is_empty() {
        return "Re: (no subject)".to_string();
    }
    if subject.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        subject.to_string()
    } else {
        format!("Re: {}", subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(from: &str, subject: &str, body: &str) -> IncomingEmail {
        IncomingEmail {
            subject: subject.to_string(),
            from: from.to_string(),
            snippet: String::new(),
            body_text: body.to_string(),
        }
    }

    #[test]
    fn test_keyword_and_sender_rules() {
        let config = TriageConfig::default();
        let invoice = classify(&config, &email("shop@example.com", "Your invoice #42", ""));
        assert_eq!(invoice.label, "billing");

        let alert = classify(&config, &email("security@bank.example", "Hello", ""));
        assert_eq!(alert.label, "security");
        assert!(alert.reasons[0].contains("security@"));

        let other = classify(&config, &email("friend@example.com", "Photos", "Look at these"));
        assert_eq!(other.label, "other");
        assert!(other.confidence < invoice.confidence);
    }

    #[test]
    fn test_reply_suggestion() {
        let config = TriageConfig::default();
        let question = email("bob@example.com", "Lunch", "Can you make it on Friday?");
        assert!(suggests_reply(&config, "other", &question));
        assert!(!suggests_reply(&config, "billing", &question));

        let noreply = email("no-reply@service.example", "Lunch", "Can you make it?");
        assert!(!suggests_reply(&config, "other", &noreply));

        let statement = email("bob@example.com", "FYI", "Just so you know.");
        assert!(!suggests_reply(&config, "other", &statement));
    }

    #[test]
    fn test_reply_subject_and_fallback() {
        assert_eq!(reply_subject("Question"), "Re: Question");
        assert_eq!(reply_subject("RE: Question"), "RE: Question");
        assert_eq!(reply_subject("  "), "Re: (no subject)");

        let draft = fallback_draft(&email("a@example.com", "Plan", ""), "", "Drafted with help.");
        assert_eq!(draft.subject, "Re: Plan");
        assert!(draft.body.ends_with("Drafted with help."));
    }
}
