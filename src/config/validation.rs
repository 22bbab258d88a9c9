//! Configuration validation
//!
//! Validates MailHub configuration for correctness:
//! - Schedule entries parse (weekdays, days of month, `HH:MM` times)
//! - Page sizes and backoff policy are sane
//! - Key backends are listed at most once
//! - An enabled collaborator has a command

use super::mailhub_config::MailHubConfig;
use crate::jobs::schedule::{parse_hhmm, parse_weekday};
use crate::MailHubError;
use std::collections::HashSet;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a MailHub configuration
pub fn validate_config(config: &MailHubConfig) -> ValidationResult {
    let mut errors = Vec::new();

    validate_security(config, &mut errors);
    validate_sync(config, &mut errors);
    validate_triage(config, &mut errors);
    validate_schedule(config, &mut errors);

    if config.collaborator.enabled && config.collaborator.command.iter().all(|a| a.trim().is_empty()) {
        errors.push(ValidationError::new(
            "collaborator.command",
            "Collaborator is enabled but no command is configured",
        ));
    }
    if config.collaborator.timeout_secs == 0 {
        errors.push(ValidationError::new(
            "collaborator.timeout_secs",
            "Timeout must be greater than 0",
        ));
    }

    if config.reply.auto_send && !config.reply.auto_send_phrase.to_lowercase().contains("send") {
        errors.push(ValidationError::new(
            "reply.auto_send_phrase",
            "Standing confirmation must contain 'send'",
        ));
    }
    if config.reply.not_ready_expiry_days == Some(0) {
        errors.push(ValidationError::new(
            "reply.not_ready_expiry_days",
            "Use null to disable expiry instead of 0",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and convert to the crate error type
pub fn validate_config_result(config: &MailHubConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        MailHubError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

fn validate_security(config: &MailHubConfig, errors: &mut Vec<ValidationError>) {
    if config.security.backends.is_empty() {
        errors.push(ValidationError::new(
            "security.backends",
            "At least one key backend must be enabled",
        ));
    }
    let mut seen = HashSet::new();
    for backend in &config.security.backends {
        if !seen.insert(*backend) {
            errors.push(ValidationError::new(
                "security.backends",
                format!("Duplicate backend: {}", backend.as_str()),
            ));
        }
    }
    if config.security.keyring_service.trim().is_empty() {
        errors.push(ValidationError::new(
            "security.keyring_service",
            "Keyring service name cannot be empty",
        ));
    }
}

fn validate_sync(config: &MailHubConfig, errors: &mut Vec<ValidationError>) {
    let sync = &config.sync;
    if sync.min_page_size == 0 {
        errors.push(ValidationError::new(
            "sync.min_page_size",
            "Page size must be greater than 0",
        ));
    }
    if sync.min_page_size > sync.max_page_size {
        errors.push(ValidationError::new(
            "sync.min_page_size",
            format!(
                "min_page_size ({}) exceeds max_page_size ({})",
                sync.min_page_size, sync.max_page_size
            ),
        ));
    }
    if sync.max_pages_per_run == 0 {
        errors.push(ValidationError::new(
            "sync.max_pages_per_run",
            "Must fetch at least one page per run",
        ));
    }
    if sync.provider_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "sync.provider_timeout_secs",
            "Timeout must be greater than 0",
        ));
    }

    let backoff = &sync.backoff;
    if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
        errors.push(ValidationError::new(
            "sync.backoff.multiplier",
            "Multiplier must be a finite number >= 1.0",
        ));
    }
    if backoff.initial_backoff_ms > backoff.max_backoff_ms {
        errors.push(ValidationError::new(
            "sync.backoff.initial_backoff_ms",
            "Initial backoff exceeds max backoff",
        ));
    }
    if backoff.max_retries > 20 {
        errors.push(ValidationError::new(
            "sync.backoff.max_retries",
            "At most 20 retries are allowed",
        ));
    }
}

fn validate_triage(config: &MailHubConfig, errors: &mut Vec<ValidationError>) {
    for (i, rule) in config.triage.rules.iter().enumerate() {
        if rule.label.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("triage.rules[{}].label", i),
                "Label cannot be empty",
            ));
        }
        if rule.keywords.is_empty() && rule.senders.is_empty() {
            errors.push(ValidationError::new(
                format!("triage.rules[{}]", i),
                "Rule needs at least one keyword or sender",
            ));
        }
    }
    if config.triage.body_limit == 0 {
        errors.push(ValidationError::new(
            "triage.body_limit",
            "Body limit must be greater than 0",
        ));
    }
}

fn validate_schedule(config: &MailHubConfig, errors: &mut Vec<ValidationError>) {
    if let Some(offset) = config.schedule.utc_offset_minutes {
        if !(-14 * 60..=14 * 60).contains(&offset) {
            errors.push(ValidationError::new(
                "schedule.utc_offset_minutes",
                format!("Offset out of range: {}", offset),
            ));
        }
    }

    for (i, task) in config.schedule.tasks.iter().enumerate() {
        let field = format!("schedule.tasks[{}]", i);
        if task.times.is_empty() {
            errors.push(ValidationError::new(&field, "At least one time is required"));
        }
        for time in &task.times {
            if parse_hhmm(time).is_none() {
                errors.push(ValidationError::new(
                    format!("{}.times", field),
                    format!("Invalid time '{}', expected HH:MM", time),
                ));
            }
        }
        for day in &task.weekdays {
            if parse_weekday(day).is_none() {
                errors.push(ValidationError::new(
                    format!("{}.weekdays", field),
                    format!("Invalid weekday '{}'", day),
                ));
            }
        }
        for day in &task.days_of_month {
            if !(1..=31).contains(day) {
                errors.push(ValidationError::new(
                    format!("{}.days_of_month", field),
                    format!("Invalid day of month {}", day),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::mailhub_config::ScheduledTaskConfig;
    use crate::jobs::schedule::TaskKind;
    use crate::vault::BackendKind;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&MailHubConfig::new()).is_ok());
    }

    #[test]
    fn test_page_size_bounds() {
        let mut config = MailHubConfig::new();
        config.sync.min_page_size = 100;
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "sync.min_page_size"));
    }

    #[test]
    fn test_duplicate_backend() {
        let mut config = MailHubConfig::new();
        config.security.backends = vec![BackendKind::LocalFile, BackendKind::LocalFile];
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("Duplicate backend")));
    }

    #[test]
    fn test_bad_schedule() {
        let mut config = MailHubConfig::new();
        config.schedule.tasks = vec![ScheduledTaskConfig {
            kind: TaskKind::Digest,
            weekdays: vec!["funday".to_string()],
            days_of_month: vec![32],
            times: vec!["25:00".to_string()],
        }];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_enabled_collaborator_needs_command() {
        let mut config = MailHubConfig::new();
        config.collaborator.enabled = true;
        let result = validate_config_result(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("collaborator.command"));
    }

    #[test]
    fn test_auto_send_phrase_needs_send() {
        let mut config = MailHubConfig::new();
        config.reply.auto_send = true;
        config.reply.auto_send_phrase = "go ahead".to_string();
        assert!(validate_config(&config).is_err());
    }
}
