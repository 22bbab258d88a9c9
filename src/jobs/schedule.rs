//! Recurring task schedule
//!
//! A task is due when one of its `HH:MM` times has passed today (local time)
//! and the day matches its weekday / day-of-month filters. The slot id names
//! the latest such time, so every invocation inside the same slot maps to
//! the same marker.

use crate::config::{ScheduleConfig, ScheduledTaskConfig};
use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime,
    Offset, TimeZone, Timelike, Utc, Weekday,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Daily statistics snapshot
    Digest,
    /// Month-to-date rollup of billing mail
    BillingRollup,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Digest => "digest",
            TaskKind::BillingRollup => "billing_rollup",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

pub fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.trim().to_lowercase().as_str() {
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tues" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thurs" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        "sat" | "saturday" => Some(Weekday::Sat),
        "sun" | "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Where "local time" comes from
#[derive(Debug, Clone, Copy)]
pub enum LocalZone {
    Fixed(FixedOffset),
    System,
}

impl LocalZone {
    pub fn from_config(config: &ScheduleConfig) -> Self {
        match config.utc_offset_minutes {
            Some(minutes) => match FixedOffset::east_opt(minutes * 60) {
                Some(offset) => LocalZone::Fixed(offset),
                None => {
                    tracing::warn!(minutes, "Invalid UTC offset; using UTC");
                    LocalZone::Fixed(Utc.fix())
                }
            },
            None => LocalZone::System,
        }
    }

    pub fn to_local(&self, t: DateTime<Utc>) -> NaiveDateTime {
        match self {
            LocalZone::Fixed(offset) => t.with_timezone(offset).naive_local(),
            LocalZone::System => t.with_timezone(&Local).naive_local(),
        }
    }

    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let resolved = match self {
            LocalZone::Fixed(offset) => offset
                .from_local_datetime(&local)
                .earliest()
                .map(|d| d.with_timezone(&Utc)),
            LocalZone::System => Local
                .from_local_datetime(&local)
                .earliest()
                .map(|d| d.with_timezone(&Utc)),
        };
        // a local time skipped by a DST jump: treat it as UTC
        resolved.unwrap_or_else(|| Utc.from_utc_datetime(&local))
    }

    /// `[start, end)` of a local calendar day, in UTC
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = date.and_time(NaiveTime::default());
        (self.to_utc(start), self.to_utc(start + ChronoDuration::days(1)))
    }

    /// From the first of the month up to `now`
    pub fn month_to_date(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let today = self.to_local(now).date();
        let first = today.with_day(1).unwrap_or(today);
        (self.day_bounds(first).0, now)
    }
}

/// A task slot that has come due
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DueSlot {
    pub kind: TaskKind,
    /// `YYYY-MM-DD.HH:MM` in local time
    pub slot_id: String,
    pub local_date: NaiveDate,
}

/// The latest slot of `task` that has passed today, if the day matches
pub fn due_slot(task: &ScheduledTaskConfig, local_now: NaiveDateTime) -> Option<DueSlot> {
    let date = local_now.date();
    if !task.weekdays.is_empty()
        && !task
            .weekdays
            .iter()
            .filter_map(|d| parse_weekday(d))
            .any(|d| d == date.weekday())
    {
        return None;
    }
    if !task.days_of_month.is_empty() && !task.days_of_month.contains(&date.day()) {
        return None;
    }

    let now_time = NaiveTime::from_hms_opt(local_now.hour(), local_now.minute(), 0)?;
    let slot = task
        .times
        .iter()
        .filter_map(|t| parse_hhmm(t))
        .filter(|t| *t <= now_time)
        .max()?;

    Some(DueSlot {
        kind: task.kind,
        slot_id: format!("{}.{}", date.format("%Y-%m-%d"), slot.format("%H:%M")),
        local_date: date,
    })
}

/// Every configured task that is due at `now`
pub fn due_tasks(config: &ScheduleConfig, now: DateTime<Utc>) -> Vec<DueSlot> {
    let local_now = LocalZone::from_config(config).to_local(now);
    config
        .tasks
        .iter()
        .filter_map(|task| due_slot(task, local_now))
        .collect()
}
