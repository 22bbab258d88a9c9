//! Reply queue
//!
//! One reply in progress per message, moving
//! `drafting -> pending_send -> sending -> sent`. Mutations address entries
//! by stable id; list positions and titles are only resolved to an id, and
//! ambiguous titles are handed back to the caller. A send needs an explicit
//! confirmation, happens at most once and is never retried automatically.

pub mod addressing;
pub mod payload;

pub use addressing::{extract_address, Confirmation, ReplyTarget};
pub use payload::{OverridePayload, PROVENANCE_MARKER};

use crate::accounts::{Account, AccountRegistry};
use crate::config::MailHubConfig;
use crate::provider::{bounded, Capability, OutboundMessage, ProviderRegistry};
use crate::store::{
    ClaimContent, ComposeMode, EncryptedStore, ReplyEntry, ReplyState, SendMode, StoredMessage,
};
use crate::triage::{incoming_email, rules};
use crate::{MailHubError, Result};
use agent_bridge::{Collaborator, DraftRequest};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::time::Duration;

/// Why an open entry cannot be sent right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotReadyReason {
    DraftEmpty,
    NotConfirmed,
    MissingFrom,
    MissingTo,
    SendInterrupted,
}

impl NotReadyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotReadyReason::DraftEmpty => "draft_empty",
            NotReadyReason::NotConfirmed => "not_confirmed",
            NotReadyReason::MissingFrom => "missing_from",
            NotReadyReason::MissingTo => "missing_to",
            NotReadyReason::SendInterrupted => "send_interrupted",
        }
    }
}

/// One open entry as shown to a user
#[derive(Debug, Clone, Serialize)]
pub struct ReplyListItem {
    /// 1-based position in this listing; resolves to `id`
    pub index: usize,
    pub id: i64,
    pub message_id: i64,
    pub state: ReplyState,
    pub new_title: String,
    pub source_title: String,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub sendable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_ready: Option<NotReadyReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub display: String,
    pub send_command: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotReadyEntry {
    pub id: i64,
    pub reason: NotReadyReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyListing {
    pub entries: Vec<ReplyListItem>,
    pub sendable_ids: Vec<i64>,
    pub not_ready: Vec<NotReadyEntry>,
}

/// Result of compose/revise
#[derive(Debug, Clone, Serialize)]
pub struct DraftOutcome {
    pub entry: ReplyEntry,
    pub source_title: String,
    /// True when the collaborator failed and the deterministic draft was used
    pub used_fallback: bool,
    pub confirm_command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectedBy {
    Id,
    Index,
    Title,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub id: i64,
    pub selected_by: SelectedBy,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub send_mode: SendMode,
    pub used_override: bool,
    pub provider_send_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoSendResult {
    pub id: i64,
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ReplyQueue<'a> {
    store: &'a EncryptedStore,
    config: &'a MailHubConfig,
    collaborator: &'a dyn Collaborator,
    providers: &'a ProviderRegistry,
}

struct Resolved {
    entry: ReplyEntry,
    selected_by: SelectedBy,
}

fn send_command(id: i64) -> String {
    format!("mailhub reply send {} --confirm \"send\"", id)
}

fn append_disclosure(body: &str, disclosure: &str) -> String {
    let body = body.trim_end();
    let disclosure = disclosure.trim();
    if disclosure.is_empty() || body.ends_with(disclosure) {
        body.to_string()
    } else {
        format!("{}\n\n{}", body, disclosure)
    }
}

impl<'a> ReplyQueue<'a> {
    pub fn new(
        store: &'a EncryptedStore,
        config: &'a MailHubConfig,
        collaborator: &'a dyn Collaborator,
        providers: &'a ProviderRegistry,
    ) -> Self {
        Self {
            store,
            config,
            collaborator,
            providers,
        }
    }

    fn account_for(&self, message: &StoredMessage) -> Result<Account> {
        AccountRegistry::new(self.store).require(message.account_id)
    }

    fn message_for(&self, entry: &ReplyEntry) -> Result<StoredMessage> {
        self.store
            .get_message(entry.message_id)?
            .ok_or_else(|| MailHubError::NotFound(format!("message {}", entry.message_id)))
    }

    /// Open (or return) the entry for a message, seeding its addressing
    pub fn open_for_message(&self, message: &StoredMessage) -> Result<(ReplyEntry, bool)> {
        let account = self.account_for(message)?;
        let to = extract_address(&message.from);
        self.store
            .open_reply_entry(message.id, account.address.as_deref(), to.as_deref())
    }

    /// Start a draft for a message in one of the three compose modes
    pub async fn compose(&self, message_ref: &str, mode: ComposeMode, text: Option<&str>) -> Result<DraftOutcome> {
        let message = self.store.resolve_message(message_ref)?;
        require_text(mode, text)?;
        let (entry, _) = self.open_for_message(&message)?;
        if entry.state != ReplyState::Drafting || !entry.body.trim().is_empty() {
            return Err(MailHubError::InvalidState(format!(
                "reply {} already has a draft ({}); use revise",
                entry.id, entry.state
            )));
        }

        let (subject, body, used_fallback) = self.build_draft(&message, mode, text).await?;
        if !self
            .store
            .write_reply_draft(entry.id, ReplyState::Drafting, mode, &subject, &body, false)?
        {
            return Err(MailHubError::InvalidState(format!(
                "reply {} changed while drafting",
                entry.id
            )));
        }
        tracing::info!(reply_id = entry.id, mode = mode.as_str(), used_fallback, "Draft composed");
        self.draft_outcome(entry.id, &message, used_fallback)
    }

    /// Replace the draft of a `drafting` entry and bump its revision
    pub async fn revise(&self, target: &str, mode: ComposeMode, text: Option<&str>) -> Result<DraftOutcome> {
        let Resolved { entry, .. } = self.resolve(target)?;
        if entry.state != ReplyState::Drafting {
            return Err(MailHubError::InvalidState(format!(
                "reply {} is {}; only drafts can be revised",
                entry.id, entry.state
            )));
        }
        let message = self.message_for(&entry)?;
        let (subject, body, used_fallback) = self.build_draft(&message, mode, text).await?;
        if !self
            .store
            .write_reply_draft(entry.id, ReplyState::Drafting, mode, &subject, &body, true)?
        {
            return Err(MailHubError::InvalidState(format!(
                "reply {} changed while revising",
                entry.id
            )));
        }
        tracing::info!(reply_id = entry.id, mode = mode.as_str(), "Draft revised");
        self.draft_outcome(entry.id, &message, used_fallback)
    }

    fn draft_outcome(&self, id: i64, message: &StoredMessage, used_fallback: bool) -> Result<DraftOutcome> {
        let entry = self
            .store
            .get_reply(id)?
            .ok_or_else(|| MailHubError::NotFound(format!("reply {}", id)))?;
        Ok(DraftOutcome {
            confirm_command: format!("mailhub reply confirm {}", entry.id),
            entry,
            source_title: message.title(),
            used_fallback,
        })
    }

    async fn build_draft(
        &self,
        message: &StoredMessage,
        mode: ComposeMode,
        text: Option<&str>,
    ) -> Result<(String, String, bool)> {
        let user_text = text.map(str::trim).filter(|t| !t.is_empty());
        let disclosure = self.config.disclosure();
        let subject = rules::reply_subject(&message.subject);

        require_text(mode, text)?;
        match mode {
            ComposeMode::Raw => {
                let text = user_text.unwrap_or_default();
                let body = if self.config.reply.disclosure_on_raw {
                    append_disclosure(text, disclosure)
                } else {
                    text.to_string()
                };
                Ok((subject, body, false))
            }
            ComposeMode::Refined | ComposeMode::Generated => {
                let disclosure = if mode == ComposeMode::Generated || self.config.reply.disclosure_on_refined {
                    disclosure
                } else {
                    ""
                };
                let hint = user_text.unwrap_or("Write a short, polite reply to this email.");
                let email = incoming_email(message, self.config.triage.body_limit);
                let request = DraftRequest::new(email.clone(), hint, disclosure);

                match self.collaborator.draft_reply(&request).await.and_then(|d| d.validate()) {
                    Ok(draft) => Ok((draft.subject, append_disclosure(&draft.body, disclosure), false)),
                    Err(e) => {
                        tracing::warn!(message_id = message.id, error = %e, "Draft collaborator failed; using fallback");
                        let fallback = match (mode, user_text) {
                            (ComposeMode::Refined, Some(text)) => rules::fallback_draft(&email, text, disclosure),
                            _ => rules::fallback_draft(&email, "", disclosure),
                        };
                        Ok((fallback.subject, fallback.body, true))
                    }
                }
            }
        }
    }

    /// `drafting -> pending_send`
    pub fn confirm(&self, target: &str) -> Result<ReplyEntry> {
        let Resolved { entry, .. } = self.resolve(target)?;
        if entry.state != ReplyState::Drafting {
            return Err(MailHubError::InvalidState(format!(
                "reply {} is {}; only drafts can be confirmed",
                entry.id, entry.state
            )));
        }
        if entry.body.trim().is_empty() {
            return Err(MailHubError::InvalidState(format!(
                "reply {} has no draft yet",
                entry.id
            )));
        }
        if !self
            .store
            .transition_reply(entry.id, ReplyState::Drafting, ReplyState::PendingSend)?
        {
            return Err(MailHubError::InvalidState(format!("reply {} changed concurrently", entry.id)));
        }
        self.require_entry(entry.id)
    }

    pub fn abandon(&self, target: &str) -> Result<ReplyEntry> {
        let Resolved { entry, .. } = self.resolve(target)?;
        if !self.store.abandon_reply(entry.id, None)? {
            return Err(MailHubError::InvalidState(format!(
                "reply {} is {} and cannot be abandoned",
                entry.id, entry.state
            )));
        }
        tracing::info!(reply_id = entry.id, "Reply abandoned");
        self.require_entry(entry.id)
    }

    fn require_entry(&self, id: i64) -> Result<ReplyEntry> {
        self.store
            .get_reply(id)?
            .ok_or_else(|| MailHubError::NotFound(format!("reply {}", id)))
    }

    /// Send a confirmed entry.
    ///
    /// Checks run before anything is written: confirmation, target, state,
    /// payload, addressing. Only then is the entry claimed and handed to the
    /// provider. A provider failure puts the entry back to `pending_send`
    /// with the error recorded; nothing retries it.
    pub async fn send(&self, target: &str, confirmation: Option<&str>, payload: Option<&str>) -> Result<SendOutcome> {
        Confirmation::parse(confirmation)?;
        let Resolved { entry, selected_by } = self.resolve(target)?;
        let payload = payload.map(OverridePayload::from_json).transpose()?;
        self.send_entry(entry, selected_by, payload.as_ref(), SendMode::Manual).await
    }

    async fn send_entry(
        &self,
        entry: ReplyEntry,
        selected_by: SelectedBy,
        payload: Option<&OverridePayload>,
        mode: SendMode,
    ) -> Result<SendOutcome> {
        if entry.state != ReplyState::PendingSend {
            return Err(MailHubError::SendBlocked(format!(
                "reply {} is {}; only confirmed replies (pending_send) can be sent",
                entry.id, entry.state
            )));
        }
        let message = self.message_for(&entry)?;
        let account = self.account_for(&message)?;
        if account.disabled {
            return Err(MailHubError::SendBlocked(format!(
                "account {} is disabled",
                account.display_name()
            )));
        }

        let default_from = entry.from_addr.clone().or_else(|| account.address.clone());
        let default_to = entry.to_addr.clone().or_else(|| extract_address(&message.from));

        let (subject, body, from, to) = match payload {
            Some(p) => {
                if let (Some(requested), Some(own)) = (&p.from, &account.address) {
                    if !requested.eq_ignore_ascii_case(own) {
                        return Err(MailHubError::SendBlocked(format!(
                            "override 'from' must be the account address {}",
                            own
                        )));
                    }
                }
                let subject = p
                    .subject
                    .clone()
                    .unwrap_or_else(|| non_empty(&entry.subject).unwrap_or_else(|| rules::reply_subject(&message.subject)));
                (subject, p.body(), p.from.clone().or(default_from), p.to.clone().or(default_to))
            }
            None => (entry.subject.clone(), entry.body.clone(), default_from, default_to),
        };

        let from = from
            .filter(|f| addressing::is_plausible_address(f))
            .ok_or_else(|| MailHubError::SendBlocked(format!("reply {} has no resolvable sender address", entry.id)))?;
        let to = to
            .filter(|t| addressing::is_plausible_address(t))
            .ok_or_else(|| MailHubError::SendBlocked(format!("reply {} has no resolvable recipient address", entry.id)))?;
        if subject.trim().is_empty() || body.trim().is_empty() {
            return Err(MailHubError::SendBlocked(format!(
                "reply {} is missing a subject or body",
                entry.id
            )));
        }

        let ctx = AccountRegistry::new(self.store).provider_context(&account, Capability::Mail)?;
        let provider = self.providers.connect(&ctx)?;

        let claimed = self.store.claim_reply_for_send(
            entry.id,
            mode,
            &ClaimContent {
                subject: &subject,
                body: &body,
                from: &from,
                to: &to,
            },
        )?;
        if !claimed {
            return Err(MailHubError::SendBlocked(format!(
                "reply {} is no longer pending; another send may have claimed it",
                entry.id
            )));
        }

        tracing::info!(
            reply_id = entry.id,
            account_id = account.id,
            subject_len = subject.len(),
            send_mode = mode.as_str(),
            used_override = payload.is_some(),
            "Sending reply"
        );
        let outbound = OutboundMessage {
            from: from.clone(),
            to: to.clone(),
            subject: subject.clone(),
            body,
            in_reply_to: Some(message.provider_message_id.clone()),
        };
        let timeout = Duration::from_secs(self.config.sync.provider_timeout_secs.max(1));

        match bounded(timeout, provider.send(&outbound)).await {
            Ok(provider_send_id) => {
                self.store.mark_reply_sent(entry.id, &provider_send_id)?;
                tracing::info!(reply_id = entry.id, "Reply sent");
                Ok(SendOutcome {
                    id: entry.id,
                    selected_by,
                    from,
                    to,
                    subject,
                    send_mode: mode,
                    used_override: payload.is_some(),
                    provider_send_id,
                })
            }
            Err(e) => {
                tracing::warn!(reply_id = entry.id, error = %e, "Reply send failed; not retrying");
                self.store.release_reply_after_failure(entry.id, &e.to_string())?;
                Err(e.into())
            }
        }
    }

    /// Resolve any target form to one entry
    fn resolve(&self, target: &str) -> Result<Resolved> {
        match ReplyTarget::parse(target)? {
            ReplyTarget::Id(id) => Ok(Resolved {
                entry: self.require_entry(id)?,
                selected_by: SelectedBy::Id,
            }),
            ReplyTarget::Index(index) => {
                let listing = self.listing(false)?;
                let item = listing.entries.get(index - 1).ok_or_else(|| {
                    MailHubError::NotFound(format!(
                        "item {} (the list has {} entries)",
                        index,
                        listing.entries.len()
                    ))
                })?;
                tracing::debug!(index, reply_id = item.id, "List position resolved to id");
                Ok(Resolved {
                    entry: self.require_entry(item.id)?,
                    selected_by: SelectedBy::Index,
                })
            }
            ReplyTarget::Title(title) => {
                let needle = title.to_lowercase();
                let matches: Vec<i64> = self
                    .listing(false)?
                    .entries
                    .iter()
                    .filter(|item| {
                        item.new_title.to_lowercase().contains(&needle)
                            || item.source_title.to_lowercase().contains(&needle)
                    })
                    .map(|item| item.id)
                    .collect();
                match matches.as_slice() {
                    [] => Err(MailHubError::NotFound(format!("reply matching '{}'", title))),
                    [id] => Ok(Resolved {
                        entry: self.require_entry(*id)?,
                        selected_by: SelectedBy::Title,
                    }),
                    _ => Err(MailHubError::Ambiguous {
                        target: title,
                        candidates: matches,
                    }),
                }
            }
        }
    }

    /// Open entries with their sendability, oldest first.
    ///
    /// Each entry's not-ready reason is recorded on the entry.
    pub fn list(&self) -> Result<ReplyListing> {
        self.listing(true)
    }

    fn listing(&self, record_reasons: bool) -> Result<ReplyListing> {
        let entries = self.store.list_replies(&[
            ReplyState::Drafting,
            ReplyState::PendingSend,
            ReplyState::Sending,
        ])?;
        let registry = AccountRegistry::new(self.store);

        let mut listing = ReplyListing {
            entries: Vec::new(),
            sendable_ids: Vec::new(),
            not_ready: Vec::new(),
        };
        for (i, entry) in entries.into_iter().enumerate() {
            let message = self.message_for(&entry)?;
            let account = registry.get(message.account_id)?;
            let from = entry
                .from_addr
                .clone()
                .or_else(|| account.as_ref().and_then(|a| a.address.clone()))
                .filter(|a| addressing::is_plausible_address(a));
            let to = entry
                .to_addr
                .clone()
                .or_else(|| extract_address(&message.from))
                .filter(|a| addressing::is_plausible_address(a));

            let not_ready = match entry.state {
                ReplyState::Sending => Some(NotReadyReason::SendInterrupted),
                ReplyState::Drafting if entry.body.trim().is_empty() => Some(NotReadyReason::DraftEmpty),
                ReplyState::Drafting => Some(NotReadyReason::NotConfirmed),
                _ if from.is_none() => Some(NotReadyReason::MissingFrom),
                _ if to.is_none() => Some(NotReadyReason::MissingTo),
                _ => None,
            };
            if record_reasons {
                self.store
                    .set_not_ready_reason(entry.id, not_ready.map(|r| r.as_str()))?;
            }

            let new_title = non_empty(&entry.subject).unwrap_or_else(|| rules::reply_subject(&message.subject));
            let index = i + 1;
            match not_ready {
                Some(reason) => listing.not_ready.push(NotReadyEntry { id: entry.id, reason }),
                None => listing.sendable_ids.push(entry.id),
            }
            listing.entries.push(ReplyListItem {
                index,
                id: entry.id,
                message_id: entry.message_id,
                state: entry.state,
                display: format!("index {}. (Id: {}) {}", index, entry.id, new_title),
                new_title,
                source_title: message.title(),
                from_address: from,
                to_address: to,
                sendable: not_ready.is_none(),
                not_ready,
                last_error: entry.last_error.clone(),
                send_command: send_command(entry.id),
            });
        }
        Ok(listing)
    }

    /// Abandon not-ready entries untouched for longer than the configured age
    pub fn expire_not_ready(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let Some(days) = self.config.reply.not_ready_expiry_days else {
            return Ok(Vec::new());
        };
        let cutoff = now - ChronoDuration::days(i64::from(days));
        let listing = self.list()?;

        let mut expired = Vec::new();
        for item in listing.entries.iter().filter(|i| !i.sendable) {
            let Some(entry) = self.store.get_reply(item.id)? else {
                continue;
            };
            if entry.updated_at < cutoff && self.store.abandon_reply(entry.id, Some("expired"))? {
                tracing::info!(reply_id = entry.id, "Not-ready reply expired");
                expired.push(entry.id);
            }
        }
        Ok(expired)
    }

    /// Send confirmed entries with the standing confirmation phrase.
    ///
    /// Entries whose previous send failed are left for a manual decision.
    pub async fn auto_send_confirmed(&self) -> Result<Vec<AutoSendResult>> {
        if !self.config.reply.auto_send {
            return Ok(Vec::new());
        }
        Confirmation::parse(Some(&self.config.reply.auto_send_phrase))?;

        let listing = self.list()?;
        let mut results = Vec::new();
        for id in listing.sendable_ids {
            let entry = self.require_entry(id)?;
            if entry.last_error.is_some() {
                tracing::debug!(reply_id = id, "Skipping auto-send after an earlier failure");
                continue;
            }
            match self.send_entry(entry, SelectedBy::Id, None, SendMode::Auto).await {
                Ok(_) => results.push(AutoSendResult {
                    id,
                    sent: true,
                    error: None,
                }),
                Err(MailHubError::Store(e)) => return Err(MailHubError::Store(e)),
                Err(e) => results.push(AutoSendResult {
                    id,
                    sent: false,
                    error: Some(e.to_string()),
                }),
            }
        }
        Ok(results)
    }
}

/// Raw and refined drafts start from the user's own text
fn require_text(mode: ComposeMode, text: Option<&str>) -> Result<()> {
    let missing = text.map_or(true, |t| t.trim().is_empty());
    match mode {
        ComposeMode::Raw if missing => Err(MailHubError::InvalidState(
            "raw compose needs the reply text".to_string(),
        )),
        ComposeMode::Refined if missing => Err(MailHubError::InvalidState(
            "refined compose needs text to refine".to_string(),
        )),
        _ => Ok(()),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
