//! Recurring schedule rules and the entries the scheduler owns.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use time::{Duration, OffsetDateTime};

use crate::domain::{error::DomainError, types::TaskType};

/// When a schedule entry becomes due.
#[derive(Debug, Clone)]
pub enum ScheduleRule {
    Cron(Box<cron::Schedule>),
    Interval(Duration),
}

impl ScheduleRule {
    /// Parse a cron expression. Standard 5-field expressions get an implied
    /// `0` seconds field; 6 and 7 field forms are passed through.
    pub fn cron(schedule_id: &str, expression: &str) -> Result<Self, DomainError> {
        let fields = expression.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {}", expression.trim()),
            6 | 7 => expression.trim().to_string(),
            other => {
                return Err(DomainError::invalid_schedule(
                    schedule_id,
                    format!("cron expression must have 5, 6 or 7 fields, got {other}"),
                ));
            }
        };

        cron::Schedule::from_str(&normalized)
            .map(|schedule| Self::Cron(Box::new(schedule)))
            .map_err(|err| {
                DomainError::invalid_schedule(schedule_id, format!("invalid cron `{expression}`: {err}"))
            })
    }

    pub fn interval(schedule_id: &str, seconds: u64) -> Result<Self, DomainError> {
        let seconds = i64::try_from(seconds)
            .ok()
            .filter(|value| *value > 0)
            .ok_or_else(|| {
                DomainError::invalid_schedule(schedule_id, "interval must be a positive number of seconds")
            })?;
        Ok(Self::Interval(Duration::seconds(seconds)))
    }

    /// Next instant strictly after `from` at which the rule would fire.
    pub fn next_after(&self, from: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            ScheduleRule::Interval(interval) => from.checked_add(*interval),
            ScheduleRule::Cron(schedule) => {
                let from = to_chrono(from)?;
                let next = schedule.after(&from).next()?;
                from_chrono(next)
            }
        }
    }

    /// Whether the rule is due at `now`. Entries that never fired count from
    /// `anchor`; interval entries fire immediately in that case.
    pub fn is_due(
        &self,
        last_fired_at: Option<OffsetDateTime>,
        anchor: OffsetDateTime,
        now: OffsetDateTime,
    ) -> bool {
        let reference = match (last_fired_at, self) {
            (Some(last), _) => last,
            (None, ScheduleRule::Interval(_)) => return true,
            (None, ScheduleRule::Cron(_)) => anchor,
        };

        self.next_after(reference)
            .map(|next| next <= now)
            .unwrap_or(false)
    }
}

/// Payload template materialised into a fresh job descriptor on every firing.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTemplate {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub schedule_id: String,
    pub rule: ScheduleRule,
    pub task_template: TaskTemplate,
    pub last_fired_at: Option<OffsetDateTime>,
    pub enabled: bool,
}

fn to_chrono(value: OffsetDateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(value.unix_timestamp(), value.nanosecond())
}

fn from_chrono(value: DateTime<Utc>) -> Option<OffsetDateTime> {
    let nanos = i128::from(value.timestamp()) * 1_000_000_000
        + i128::from(value.timestamp_subsec_nanos());
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn five_field_cron_gets_seconds_prefix() {
        let rule = ScheduleRule::cron("prices", "*/5 * * * *").expect("valid cron");
        let from = datetime!(2026-10-18 10:01:30 UTC);
        assert_eq!(rule.next_after(from), Some(datetime!(2026-10-18 10:05:00 UTC)));
    }

    #[test]
    fn rejects_malformed_cron() {
        assert!(ScheduleRule::cron("bad", "* *").is_err());
        assert!(ScheduleRule::cron("bad", "0 99 * * * *").is_err());
    }

    #[test]
    fn rejects_zero_interval() {
        assert!(ScheduleRule::interval("zero", 0).is_err());
    }

    #[test]
    fn interval_due_only_after_full_interval() {
        let rule = ScheduleRule::interval("hourly", 3600).expect("valid interval");
        let last = datetime!(2026-10-18 10:00:00 UTC);
        let anchor = datetime!(2026-10-18 09:00:00 UTC);

        assert!(rule.is_due(None, anchor, last));
        assert!(!rule.is_due(Some(last), anchor, datetime!(2026-10-18 10:59:59 UTC)));
        assert!(rule.is_due(Some(last), anchor, datetime!(2026-10-18 11:00:00 UTC)));
    }

    #[test]
    fn never_fired_cron_waits_for_first_occurrence_after_anchor() {
        let rule = ScheduleRule::cron("hourly", "0 * * * *").expect("valid cron");
        let anchor = datetime!(2026-10-18 10:15:00 UTC);

        assert!(!rule.is_due(None, anchor, datetime!(2026-10-18 10:59:00 UTC)));
        assert!(rule.is_due(None, anchor, datetime!(2026-10-18 11:00:00 UTC)));
    }
}
