//! The top-level run
//!
//! Gates are checked in order and the first unmet one stops the run before
//! anything is fetched. After the gates: sync, triage of what the sync
//! persisted, reply-queue housekeeping, then scheduled tasks. Repeating a
//! run is harmless: cursors stop duplicate ingestion and slot markers stop
//! duplicate task execution.

pub mod report;
pub mod schedule;

pub use report::{BillingRollup, DailyStats, GateFailure, RunReport, StatsItem, TaskRun};
pub use schedule::{DueSlot, LocalZone, TaskKind};

use crate::accounts::AccountRegistry;
use crate::config::MailHubConfig;
use crate::provider::ProviderRegistry;
use crate::reply::ReplyQueue;
use crate::store::EncryptedStore;
use crate::sync::backoff::RetryConfig;
use crate::sync::SyncEngine;
use crate::triage::TriageRouter;
use crate::{MailHubError, Result};
use agent_bridge::Collaborator;
use chrono::{DateTime, Utc};

pub const LATEST_RUN_KEY: &str = "run:latest";
pub const LATEST_DIGEST_KEY: &str = "digest:latest";
pub const LATEST_BILLING_KEY: &str = "billing_rollup:latest";

/// Most earlier-unanalyzed messages one run will pick up
const TRIAGE_BACKLOG_LIMIT: usize = 200;

pub struct JobGate<'a> {
    store: &'a EncryptedStore,
    config: &'a MailHubConfig,
    providers: &'a ProviderRegistry,
    collaborator: &'a dyn Collaborator,
    retry: Option<RetryConfig>,
}

impl<'a> JobGate<'a> {
    pub fn new(
        store: &'a EncryptedStore,
        config: &'a MailHubConfig,
        providers: &'a ProviderRegistry,
        collaborator: &'a dyn Collaborator,
    ) -> Self {
        Self {
            store,
            config,
            providers,
            collaborator,
            retry: None,
        }
    }

    /// Override the backoff policy from config
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// First unmet gate as `GateBlocked`
    pub fn check_gates(&self) -> Result<()> {
        let blocked = |code: &str, message: &str| {
            Err(MailHubError::GateBlocked {
                code: code.to_string(),
                message: message.to_string(),
            })
        };

        if !self.config.runtime.config_reviewed {
            return blocked(
                "config_not_reviewed",
                "Review the configuration with `mailhub config show`",
            );
        }
        if !self.config.runtime.config_confirmed {
            return blocked(
                "config_not_confirmed",
                "Confirm the configuration with `mailhub config confirm`",
            );
        }
        if let Some(problem) = self.store.health_check()? {
            return blocked("health_check_failed", &problem);
        }
        if AccountRegistry::new(self.store).list_enabled()?.is_empty() {
            return blocked("no_account_bound", "Bind an account with `mailhub account bind`");
        }
        Ok(())
    }

    pub async fn run(&self) -> Result<RunReport> {
        self.run_at(Utc::now()).await
    }

    /// One run with `now` as the clock for schedules and expiry
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunReport> {
        match self.check_gates() {
            Ok(()) => {}
            Err(MailHubError::GateBlocked { code, message }) => {
                tracing::warn!(code = %code, "Run blocked at gate");
                return Ok(RunReport::blocked(code, message, now));
            }
            Err(e) => return Err(e),
        }
        tracing::info!("Run started");

        let mut engine = SyncEngine::new(self.store, self.providers, &self.config.sync);
        if let Some(retry) = &self.retry {
            engine = engine.with_retry_config(retry.clone());
        }
        let polls = engine.poll_all().await?;

        // Messages left without analysis by an earlier run that stopped after
        // ingesting are picked up again behind this run's new arrivals.
        let mut triage_ids: Vec<i64> = polls
            .iter()
            .flat_map(|p| p.new_message_ids.iter().copied())
            .collect();
        for id in self.store.unanalyzed_message_ids(TRIAGE_BACKLOG_LIMIT)? {
            if !triage_ids.contains(&id) {
                triage_ids.push(id);
            }
        }
        let analyzed = TriageRouter::new(self.store, self.config, self.collaborator)
            .triage(&triage_ids)
            .await?;

        let queue = ReplyQueue::new(self.store, self.config, self.collaborator, self.providers);
        let expired_replies = queue.expire_not_ready(now)?;
        let auto_sent = queue.auto_send_confirmed().await?;

        let tasks = self.run_scheduled(now)?;

        let zone = LocalZone::from_config(&self.config.schedule);
        let stats = report::daily_stats(self.store, &zone, zone.to_local(now).date())?;

        let report = RunReport {
            ok: true,
            reason: None,
            started_at: now,
            polls,
            analyzed,
            expired_replies,
            auto_sent,
            tasks,
            stats: Some(stats),
        };
        self.store
            .kv_set(LATEST_RUN_KEY, &serde_json::to_string(&report)?)?;
        tracing::info!(
            polls = report.polls.len(),
            analyzed = report.analyzed.len(),
            tasks = report.tasks.len(),
            "Run finished"
        );
        Ok(report)
    }

    /// Execute due tasks whose slot marker this call wins
    fn run_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<TaskRun>> {
        let zone = LocalZone::from_config(&self.config.schedule);
        let mut runs = Vec::new();

        for slot in schedule::due_tasks(&self.config.schedule, now) {
            let kind = slot.kind.as_str();
            if !self.store.claim_slot(kind, &slot.slot_id, &now)? {
                tracing::debug!(task = kind, slot = %slot.slot_id, "Slot already executed");
                runs.push(TaskRun {
                    kind: slot.kind,
                    slot_id: slot.slot_id,
                    executed: false,
                    summary: None,
                });
                continue;
            }

            let summary = match slot.kind {
                TaskKind::Digest => {
                    let stats = report::daily_stats(self.store, &zone, slot.local_date)?;
                    self.store
                        .kv_set(LATEST_DIGEST_KEY, &serde_json::to_string(&stats)?)?;
                    format!(
                        "{} received, {} replied, {} awaiting reply",
                        stats.totals.received, stats.totals.replied, stats.totals.suggested_not_replied
                    )
                }
                TaskKind::BillingRollup => {
                    let rollup = report::billing_rollup(self.store, &zone, now)?;
                    self.store
                        .kv_set(LATEST_BILLING_KEY, &serde_json::to_string(&rollup)?)?;
                    format!("{} billing messages in {}", rollup.count, rollup.month)
                }
            };
            self.store.record_slot_result(kind, &slot.slot_id, &summary)?;
            tracing::info!(task = kind, slot = %slot.slot_id, "Scheduled task executed");

            runs.push(TaskRun {
                kind: slot.kind,
                slot_id: slot.slot_id,
                executed: true,
                summary: Some(summary),
            });
        }
        Ok(runs)
    }

    /// Today's statistics without running anything
    pub fn summary_at(&self, now: DateTime<Utc>) -> Result<DailyStats> {
        let zone = LocalZone::from_config(&self.config.schedule);
        report::daily_stats(self.store, &zone, zone.to_local(now).date())
    }
}

/// Cached output of the last run / task, if any
pub fn latest_cached(store: &EncryptedStore, key: &str) -> Result<Option<serde_json::Value>> {
    store
        .kv_get(key)?
        .map(|raw| serde_json::from_str(&raw).map_err(MailHubError::from))
        .transpose()
}
