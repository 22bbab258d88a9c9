//! Incremental sync engine
//!
//! Per (account, capability) the engine reads the durable cursor, asks the
//! provider for one bounded page, fetches each item in full and commits the
//! items together with the cursor advance. Throttling is retried with
//! backoff and a shrinking page size; anything else fails the capability for
//! this run without touching other accounts.

pub mod backoff;

use crate::accounts::{Account, AccountRegistry, AccountStatus};
use crate::config::SyncConfig;
use crate::provider::{
    bounded, Capability, CapabilityProvider, FetchCursor, FetchedItem, MailContent, Page,
    ProviderError, ProviderRegistry,
};
use crate::store::{CursorState, EncryptedStore, IngestSource, NewMessage, PersistPage};
use crate::{MailHubError, Result};
use backoff::{with_retry, RetryConfig};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Ok,
    Failed,
}

/// Outcome for one account and capability
#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    pub account_id: i64,
    pub account: String,
    pub capability: Capability,
    pub status: PollStatus,
    pub bootstrap: bool,
    pub pages: u32,
    pub fetched: usize,
    pub new_message_ids: Vec<i64>,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PollReport {
    fn new(account: &Account, capability: Capability) -> Self {
        Self {
            account_id: account.id,
            account: account.display_name().to_string(),
            capability,
            status: PollStatus::Ok,
            bootstrap: false,
            pages: 0,
            fetched: 0,
            new_message_ids: Vec::new(),
            retries: 0,
            error: None,
        }
    }
}

pub struct SyncEngine<'a> {
    store: &'a EncryptedStore,
    providers: &'a ProviderRegistry,
    config: &'a SyncConfig,
    retry: RetryConfig,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a EncryptedStore, providers: &'a ProviderRegistry, config: &'a SyncConfig) -> Self {
        Self {
            store,
            providers,
            config,
            retry: RetryConfig::from(&config.backoff),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.provider_timeout_secs.max(1))
    }

    /// Requested page size for a retry attempt: halves per attempt, never below the floor
    pub fn page_size_for_attempt(&self, attempt: u32) -> u32 {
        let max = self.config.max_page_size.max(1);
        let min = self.config.min_page_size.clamp(1, max);
        let shrunk = max.checked_shr(attempt).unwrap_or(0);
        shrunk.max(min)
    }

    /// Sync every enabled account; one report per synced capability
    pub async fn poll_all(&self) -> Result<Vec<PollReport>> {
        let accounts = AccountRegistry::new(self.store).list_enabled()?;
        let mut reports = Vec::new();
        for account in &accounts {
            reports.extend(self.poll_account(account).await?);
        }
        Ok(reports)
    }

    /// Sync one account. Provider failures land in the reports; only store
    /// failures are returned as errors.
    pub async fn poll_account(&self, account: &Account) -> Result<Vec<PollReport>> {
        let registry = AccountRegistry::new(self.store);
        let mut reports = Vec::new();

        for capability in account.capabilities.enabled() {
            if capability == Capability::Contacts {
                tracing::debug!(account_id = account.id, "Contacts capability is not synced");
                continue;
            }
            reports.push(self.poll_capability(account, capability).await?);
        }

        let failed: Vec<&PollReport> = reports.iter().filter(|r| r.status == PollStatus::Failed).collect();
        if let Some(first) = failed.first() {
            let detail = format!("{}: {}", first.capability, first.error.as_deref().unwrap_or("failed"));
            registry.set_status(account.id, AccountStatus::Error, Some(&detail))?;
        } else if account.status == AccountStatus::Error && !reports.is_empty() {
            registry.set_status(account.id, AccountStatus::Active, None)?;
        }
        Ok(reports)
    }

    pub async fn poll_capability(&self, account: &Account, capability: Capability) -> Result<PollReport> {
        let mut report = PollReport::new(account, capability);

        let outcome = match AccountRegistry::new(self.store)
            .provider_context(account, capability)
            .and_then(|ctx| self.providers.connect(&ctx))
        {
            Ok(provider) => self.fetch_pages(account, capability, provider, &mut report).await,
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            if matches!(e, MailHubError::Store(_)) {
                return Err(e);
            }
            let message = e.to_string();
            tracing::warn!(
                account_id = account.id,
                capability = %capability,
                error = %message,
                "Sync failed"
            );
            self.store.record_cursor_failure(account.id, capability, &message)?;
            report.status = PollStatus::Failed;
            report.error = Some(message);
        } else {
            tracing::info!(
                account_id = account.id,
                capability = %capability,
                pages = report.pages,
                fetched = report.fetched,
                new = report.new_message_ids.len(),
                "Sync finished"
            );
        }
        Ok(report)
    }

    fn starting_cursor(&self, account: &Account, capability: Capability, state: Option<&CursorState>) -> FetchCursor {
        if let Some(position) = state.and_then(|s| s.position.clone()) {
            return FetchCursor::At(position);
        }
        if capability == Capability::Mail && account.bootstrap_pending {
            return FetchCursor::Bootstrap;
        }
        FetchCursor::Since(Utc::now() - ChronoDuration::days(i64::from(self.config.cold_start_days)))
    }

    async fn fetch_pages(
        &self,
        account: &Account,
        capability: Capability,
        provider: Arc<dyn CapabilityProvider>,
        report: &mut PollReport,
    ) -> Result<()> {
        let max_pages = self.config.max_pages_per_run.max(1);
        let timeout = self.timeout();
        // bootstrap_pending is cleared by the first persisted page
        let mut account = account.clone();

        loop {
            let state = self.store.get_cursor(account.id, capability)?;
            let cursor = self.starting_cursor(&account, capability, state.as_ref());
            if cursor == FetchCursor::Bootstrap {
                report.bootstrap = true;
                tracing::info!(account_id = account.id, "Bootstrap fetch");
            }

            let listed = with_retry(&self.retry, "list_new", |attempt| {
                let provider = Arc::clone(&provider);
                let cursor = cursor.clone();
                let size = self.page_size_for_attempt(attempt);
                async move {
                    bounded(timeout, provider.list_new(&cursor, size))
                        .await
                        .map(|page| (page, size))
                }
            })
            .await;
            report.retries += listed.retries;
            let (page, page_size): (Page, u32) = listed.result?;

            let source = if report.bootstrap {
                IngestSource::Bootstrap
            } else {
                IngestSource::Poll
            };
            let mut messages = Vec::new();
            let mut events = Vec::new();
            for item_id in &page.items {
                let fetched = with_retry(&self.retry, "fetch_full", |_| {
                    let provider = Arc::clone(&provider);
                    async move { bounded(timeout, provider.fetch_full(item_id)).await }
                })
                .await;
                report.retries += fetched.retries;
                match (fetched.result?, capability) {
                    (FetchedItem::Mail(mail), Capability::Mail) => {
                        messages.push(NewMessage::from_content(mail, source))
                    }
                    (FetchedItem::Event(event), Capability::Calendar) => events.push(event),
                    (_, capability) => {
                        return Err(ProviderError::Rejected(format!(
                            "item {} does not match capability {}",
                            item_id, capability
                        ))
                        .into())
                    }
                }
            }
            report.fetched += page.items.len();

            let unchanged = page.items.is_empty()
                && page.next_cursor.is_none()
                && cursor != FetchCursor::Bootstrap
                && state
                    .as_ref()
                    .map(|s| s.consecutive_failures == 0 && s.last_success_at.is_some())
                    .unwrap_or(false);
            if unchanged {
                tracing::debug!(account_id = account.id, capability = %capability, "Nothing new");
                break;
            }

            let new_ids = self.store.persist_page(&PersistPage {
                account_id: account.id,
                capability,
                messages: &messages,
                events: &events,
                next_position: page.next_cursor.as_deref(),
                page_size,
            })?;
            report.new_message_ids.extend(new_ids);
            report.pages += 1;
            if capability == Capability::Mail {
                account.bootstrap_pending = false;
            }

            if !page.has_more || report.pages >= max_pages {
                if page.has_more {
                    tracing::info!(
                        account_id = account.id,
                        capability = %capability,
                        "Page limit reached; continuing next run"
                    );
                }
                break;
            }
        }
        Ok(())
    }

    /// Persist a message supplied out of band
    pub fn ingest(&self, account_id: i64, content: MailContent) -> Result<Option<i64>> {
        let account = AccountRegistry::new(self.store).require(account_id)?;
        if !account.capabilities.mail {
            return Err(MailHubError::InvalidState(format!(
                "account {} has no mail capability",
                account.display_name()
            )));
        }
        let id = self
            .store
            .insert_message(account.id, &NewMessage::from_content(content, IngestSource::Ingest))?;
        tracing::info!(account_id, inserted = id.is_some(), "Message ingested");
        Ok(id)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::accounts::{BindRequest, CapabilitySet};
    use crate::config::MailHubConfig;
    use crate::store::test_support::open_temp;

    fn setup(provider: &ScriptedProvider) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedConnector {
            provider: provider.clone(),
        }));
        registry
    }

    fn bind(store: &EncryptedStore, caps: CapabilitySet) -> Account {
        AccountRegistry::new(store)
            .bind(&BindRequest {
                provider: "scripted".to_string(),
                external_key: "me@example.com".to_string(),
                address: Some("me@example.com".to_string()),
                capabilities: caps,
                ..BindRequest::default()
            })
            .unwrap()
            .account
    }

    fn sync_config() -> SyncConfig {
        let mut config = MailHubConfig::default().sync;
        config.max_page_size = 2;
        config.min_page_size = 1;
        config
    }

    #[tokio::test]
    async fn test_bootstrap_then_incremental() {
        let (_temp, store) = open_temp();
        let provider = ScriptedProvider::with_mail(vec![
            mail("m1", "a@example.com", "One", "first", 0),
            mail("m2", "a@example.com", "Two", "second", 1),
            mail("m3", "a@example.com", "Three", "third", 2),
        ]);
        let registry = setup(&provider);
        let config = sync_config();
        let engine = SyncEngine::new(&store, &registry, &config).with_retry_config(RetryConfig::quick());
        bind(&store, CapabilitySet::mail_only());

        let reports = engine.poll_all().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].bootstrap);
        assert_eq!(reports[0].new_message_ids.len(), 3);
        assert_eq!(reports[0].pages, 2);

        let cursors = provider.script.lock().unwrap().cursors_seen.clone();
        assert_eq!(cursors[0], FetchCursor::Bootstrap);
        assert_eq!(cursors[1], FetchCursor::At("2".to_string()));
        assert_eq!(
            cursors.iter().filter(|c| **c == FetchCursor::Bootstrap).count(),
            1
        );

        let msg = store.resolve_message("m1").unwrap();
        assert_eq!(msg.source, IngestSource::Bootstrap);
    }

    #[tokio::test]
    async fn test_repeated_poll_is_idempotent() {
        let (_temp, store) = open_temp();
        let provider = ScriptedProvider::with_mail(vec![mail("m1", "a@example.com", "One", "x", 0)]);
        let registry = setup(&provider);
        let config = sync_config();
        let engine = SyncEngine::new(&store, &registry, &config).with_retry_config(RetryConfig::quick());
        let account = bind(&store, CapabilitySet::mail_only());

        engine.poll_all().await.unwrap();
        let cursor_before = store.get_cursor(account.id, Capability::Mail).unwrap();
        let count_before = store.message_count().unwrap();

        let reports = engine.poll_all().await.unwrap();
        assert!(reports[0].new_message_ids.is_empty());
        assert_eq!(store.get_cursor(account.id, Capability::Mail).unwrap(), cursor_before);
        assert_eq!(store.message_count().unwrap(), count_before);

        provider.push(mail("m2", "a@example.com", "Two", "y", 5));
        let reports = engine.poll_all().await.unwrap();
        assert_eq!(reports[0].new_message_ids.len(), 1);
        assert!(!reports[0].bootstrap);
    }

    #[tokio::test]
    async fn test_throttling_shrinks_page_and_recovers() {
        let (_temp, store) = open_temp();
        let provider = ScriptedProvider::with_mail(vec![mail("m1", "a@example.com", "One", "x", 0)]);
        provider.script.lock().unwrap().throttle_first = 2;
        let registry = setup(&provider);
        let mut config = sync_config();
        config.max_page_size = 8;
        config.min_page_size = 3;
        let engine = SyncEngine::new(&store, &registry, &config).with_retry_config(RetryConfig::quick());
        bind(&store, CapabilitySet::mail_only());

        let reports = engine.poll_all().await.unwrap();
        assert_eq!(reports[0].status, PollStatus::Ok);
        assert_eq!(reports[0].retries, 2);
        assert_eq!(provider.script.lock().unwrap().page_sizes_seen, vec![8, 4, 3]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_capability() {
        let (_temp, store) = open_temp();
        let provider = ScriptedProvider::with_mail(vec![mail("m1", "a@example.com", "One", "x", 0)]);
        provider.script.lock().unwrap().throttle_first = 100;
        let registry = setup(&provider);
        let config = sync_config();
        let engine = SyncEngine::new(&store, &registry, &config).with_retry_config(RetryConfig::quick());
        let account = bind(&store, CapabilitySet::mail_only());

        let reports = engine.poll_all().await.unwrap();
        assert_eq!(reports[0].status, PollStatus::Failed);
        assert_eq!(reports[0].retries, RetryConfig::quick().max_retries);
        assert_eq!(store.message_count().unwrap(), 0);

        let cursor = store.get_cursor(account.id, Capability::Mail).unwrap().unwrap();
        assert_eq!(cursor.consecutive_failures, 1);
        assert!(cursor.position.is_none());
        let account = AccountRegistry::new(&store).require(account.id).unwrap();
        assert_eq!(account.status, AccountStatus::Error);
        assert!(account.bootstrap_pending);
    }

    #[tokio::test]
    async fn test_unsupported_capability_reported_not_fatal() {
        let (_temp, store) = open_temp();
        let provider = ScriptedProvider::with_mail(vec![mail("m1", "a@example.com", "One", "x", 0)]);
        let registry = setup(&provider);
        let config = sync_config();
        let engine = SyncEngine::new(&store, &registry, &config).with_retry_config(RetryConfig::quick());
        bind(
            &store,
            CapabilitySet {
                mail: true,
                calendar: true,
                contacts: true,
            },
        );

        let reports = engine.poll_all().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].status, PollStatus::Ok);
        assert_eq!(reports[1].capability, Capability::Calendar);
        assert_eq!(reports[1].status, PollStatus::Failed);
    }

    #[test]
    fn test_page_size_floor() {
        let (_temp, store) = open_temp();
        let registry = ProviderRegistry::new();
        let mut config = sync_config();
        config.max_page_size = 50;
        config.min_page_size = 10;
        let engine = SyncEngine::new(&store, &registry, &config);
        assert_eq!(engine.page_size_for_attempt(0), 50);
        assert_eq!(engine.page_size_for_attempt(1), 25);
        assert_eq!(engine.page_size_for_attempt(2), 12);
        assert_eq!(engine.page_size_for_attempt(3), 10);
        assert_eq!(engine.page_size_for_attempt(40), 10);
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let (_temp, store) = open_temp();
        let registry = ProviderRegistry::new();
        let config = sync_config();
        let engine = SyncEngine::new(&store, &registry, &config);
        let account = bind(&store, CapabilitySet::mail_only());

        let content = mail("x1", "a@example.com", "Manual", "body", 0);
        assert!(engine.ingest(account.id, content.clone()).unwrap().is_some());
        assert!(engine.ingest(account.id, content).unwrap().is_none());
        assert_eq!(store.resolve_message("x1").unwrap().source, IngestSource::Ingest);
    }
}
