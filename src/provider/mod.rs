//! Provider capability interface
//!
//! Core code reaches mail and calendar providers only through
//! [`CapabilityProvider`]. Concrete wire protocols live behind
//! [`ProviderConnector`]s registered by provider name, so sync, triage and
//! send never branch on which provider an account uses.

mod spool;

pub use spool::{SpoolConnector, SpoolProvider, SPOOL_PROVIDER};

use crate::config::StatePaths;
use crate::sync::backoff::{RetryDecision, RetryableError};
use crate::{MailHubError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

/// Independent account capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Mail,
    Calendar,
    Contacts,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Mail => "mail",
            Capability::Calendar => "calendar",
            Capability::Contacts => "contacts",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mail" | "email" => Ok(Capability::Mail),
            "calendar" => Ok(Capability::Calendar),
            "contacts" => Ok(Capability::Contacts),
            other => Err(format!("unknown capability: {}", other)),
        }
    }
}

/// Where a fetch starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchCursor {
    /// First pull after bind; no time window
    Bootstrap,
    /// No stored position yet; everything since this instant
    Since(DateTime<Utc>),
    /// Provider-specific position returned by an earlier page
    At(String),
}

/// One bounded page of new item ids
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<String>,
    /// Position after this page; `None` keeps the current one
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Full content of one mail message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailContent {
    pub provider_message_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub snippet: String,
    pub body_text: String,
    pub received_at: DateTime<Utc>,
}

/// Full content of one calendar event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContent {
    pub provider_event_id: String,
    pub title: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub location: String,
    pub updated_at: DateTime<Utc>,
}

/// Anything `fetch_full` can return
#[derive(Debug, Clone, PartialEq)]
pub enum FetchedItem {
    Mail(MailContent),
    Event(EventContent),
}

/// A reply ready to leave
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Provider id of the message being answered
    pub in_reply_to: Option<String>,
}

/// Provider failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("throttled by provider (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    #[error("rejected by provider: {0}")]
    Rejected(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl RetryableError for ProviderError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            ProviderError::Throttled {
                retry_after: Some(d),
            } => RetryDecision::RetryAfter(*d),
            ProviderError::Throttled { retry_after: None } => RetryDecision::Retry,
            _ => RetryDecision::NoRetry,
        }
    }
}

/// Per-account, per-capability provider
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Ids of items after `cursor`, at most `page_size` of them
    async fn list_new(&self, cursor: &FetchCursor, page_size: u32) -> std::result::Result<Page, ProviderError>;

    async fn fetch_full(&self, item_id: &str) -> std::result::Result<FetchedItem, ProviderError>;

    /// Returns the provider id of the sent message
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<String, ProviderError>;
}

/// What a connector gets to build a provider
#[derive(Clone)]
pub struct ProviderContext {
    pub account_id: i64,
    pub provider: String,
    pub external_key: String,
    pub address: Option<String>,
    pub capability: Capability,
    /// Resolved secret referenced by the account, if any
    pub secret: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("account_id", &self.account_id)
            .field("provider", &self.provider)
            .field("capability", &self.capability)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Builds providers for one provider family
pub trait ProviderConnector: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, capability: Capability) -> bool;

    fn connect(&self, ctx: &ProviderContext) -> std::result::Result<Arc<dyn CapabilityProvider>, ProviderError>;
}

/// Connectors by provider name
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    connectors: HashMap<String, Arc<dyn ProviderConnector>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in spool connector
    pub fn with_defaults(paths: &StatePaths) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SpoolConnector::new(paths.spool())));
        registry
    }

    pub fn register(&mut self, connector: Arc<dyn ProviderConnector>) {
        self.connectors
            .insert(connector.name().to_lowercase(), connector);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.connectors.contains_key(&provider.to_lowercase())
    }

    pub fn connect(&self, ctx: &ProviderContext) -> Result<Arc<dyn CapabilityProvider>> {
        let connector = self
            .connectors
            .get(&ctx.provider.to_lowercase())
            .ok_or_else(|| MailHubError::NotFound(format!("provider connector '{}'", ctx.provider)))?;
        if !connector.supports(ctx.capability) {
            return Err(MailHubError::InvalidState(format!(
                "provider '{}' does not support {}",
                ctx.provider, ctx.capability
            )));
        }
        Ok(connector.connect(ctx)?)
    }
}

/// Run a provider call under a deadline
pub async fn bounded<T, F>(timeout: Duration, call: F) -> std::result::Result<T, ProviderError>
where
    F: Future<Output = std::result::Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}
