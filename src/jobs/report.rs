//! Run reports and statistics

use super::schedule::{LocalZone, TaskKind};
use crate::reply::AutoSendResult;
use crate::store::{EncryptedStore, ReplyState, SendMode, StoredMessage};
use crate::sync::PollReport;
use crate::triage::AnalyzedItem;
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Why a run stopped at a gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateFailure {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub kind: TaskKind,
    pub slot_id: String,
    /// False when another invocation already ran this slot
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Output of one `run`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<GateFailure>,
    pub started_at: DateTime<Utc>,
    pub polls: Vec<PollReport>,
    pub analyzed: Vec<AnalyzedItem>,
    pub expired_replies: Vec<i64>,
    pub auto_sent: Vec<AutoSendResult>,
    pub tasks: Vec<TaskRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<DailyStats>,
}

impl RunReport {
    pub fn blocked(code: impl Into<String>, message: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            ok: false,
            reason: Some(GateFailure {
                code: code.into(),
                message: message.into(),
            }),
            started_at,
            polls: Vec::new(),
            analyzed: Vec::new(),
            expired_replies: Vec::new(),
            auto_sent: Vec::new(),
            tasks: Vec::new(),
            stats: None,
        }
    }
}

/// A message in one of the statistics lists
#[derive(Debug, Clone, Serialize)]
pub struct StatsItem {
    /// 1-based position in its list
    pub index: usize,
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<i64>,
    pub title: String,
    pub display: String,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsTotals {
    pub received: usize,
    pub analyzed: usize,
    pub suggested: usize,
    pub replied: usize,
    pub suggested_not_replied: usize,
    pub auto_replied: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub totals: StatsTotals,
    pub by_tag: BTreeMap<String, usize>,
    pub replied: Vec<StatsItem>,
    pub suggested_not_replied: Vec<StatsItem>,
    pub auto_replied: Vec<StatsItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingRollup {
    /// `YYYY-MM`
    pub month: String,
    pub count: usize,
    pub items: Vec<StatsItem>,
}

fn push_item(list: &mut Vec<StatsItem>, message: &StoredMessage, reply_id: Option<i64>, commands: Vec<String>) {
    let index = list.len() + 1;
    let title = message.title();
    list.push(StatsItem {
        index,
        id: message.id,
        reply_id,
        display: format!("{}. (Id: {}) {}", index, message.id, title),
        title,
        commands,
    });
}

/// Next useful commands for a message that still wants a reply
fn pending_commands(store: &EncryptedStore, message: &StoredMessage) -> Result<(Option<i64>, Vec<String>)> {
    let Some(entry) = store.open_reply_for_message(message.id)? else {
        return Ok((
            None,
            vec![format!("mailhub reply compose {} --mode generated", message.id)],
        ));
    };
    let commands = match entry.state {
        ReplyState::Drafting if entry.body.trim().is_empty() => {
            vec![format!("mailhub reply compose {} --mode generated", message.id)]
        }
        ReplyState::Drafting => vec![
            format!("mailhub reply revise {} --mode raw --text \"...\"", entry.id),
            format!("mailhub reply confirm {}", entry.id),
        ],
        ReplyState::PendingSend => vec![format!("mailhub reply send {} --confirm \"send\"", entry.id)],
        _ => vec!["mailhub reply list".to_string()],
    };
    Ok((Some(entry.id), commands))
}

/// Statistics for one local calendar day
pub fn daily_stats(store: &EncryptedStore, zone: &LocalZone, date: NaiveDate) -> Result<DailyStats> {
    let (start, end) = zone.day_bounds(date);
    let messages = store.messages_received_between(&start, &end)?;

    let mut stats = DailyStats {
        date,
        totals: StatsTotals {
            received: messages.len(),
            ..StatsTotals::default()
        },
        by_tag: BTreeMap::new(),
        replied: Vec::new(),
        suggested_not_replied: Vec::new(),
        auto_replied: Vec::new(),
    };

    for message in &messages {
        let Some(analysis) = store.get_analysis(message.id)? else {
            *stats.by_tag.entry("unanalyzed".to_string()).or_default() += 1;
            continue;
        };
        stats.totals.analyzed += 1;
        *stats.by_tag.entry(analysis.tag.clone()).or_default() += 1;
        if analysis.suggest_reply {
            stats.totals.suggested += 1;
            if store.sent_reply_for_message(message.id)?.is_none() {
                let (reply_id, commands) = pending_commands(store, message)?;
                push_item(&mut stats.suggested_not_replied, message, reply_id, commands);
            }
        }
    }

    for reply in store.replies_sent_between(&start, &end)? {
        let Some(message) = store.get_message(reply.message_id)? else {
            continue;
        };
        push_item(&mut stats.replied, &message, Some(reply.id), Vec::new());
        if reply.send_mode == Some(SendMode::Auto) {
            push_item(&mut stats.auto_replied, &message, Some(reply.id), Vec::new());
        }
    }

    stats.totals.replied = stats.replied.len();
    stats.totals.suggested_not_replied = stats.suggested_not_replied.len();
    stats.totals.auto_replied = stats.auto_replied.len();
    Ok(stats)
}

/// Messages tagged `billing` received this month so far
pub fn billing_rollup(store: &EncryptedStore, zone: &LocalZone, now: DateTime<Utc>) -> Result<BillingRollup> {
    let (start, end) = zone.month_to_date(now);
    let mut rollup = BillingRollup {
        month: zone.to_local(now).format("%Y-%m").to_string(),
        count: 0,
        items: Vec::new(),
    };
    for message in store.messages_received_between(&start, &end)? {
        let is_billing = store
            .get_analysis(message.id)?
            .is_some_and(|a| a.tag == "billing");
        if is_billing {
            push_item(
                &mut rollup.items,
                &message,
                None,
                vec![format!("mailhub analysis record {} --tag billing", message.id)],
            );
        }
    }
    rollup.count = rollup.items.len();
    Ok(rollup)
}
