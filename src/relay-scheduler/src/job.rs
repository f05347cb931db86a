//! Scheduled jobs, their schedules and recorded runs.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire once at `at`, then deactivate.
    Once { at: DateTime<Utc> },
    /// Fire every `interval_secs`, starting one interval after creation.
    Every { interval_secs: u64 },
}

impl Schedule {
    /// Parse a `once` timestamp (RFC 3339) or an `every` interval such as
    /// `90s`, `15m`, `2h` or `1d`.
    pub fn parse(kind: &str, value: &str) -> Result<Self> {
        match kind {
            "once" => DateTime::parse_from_rfc3339(value.trim())
                .map(|at| Self::Once {
                    at: at.with_timezone(&Utc),
                })
                .map_err(|e| {
                    SchedulerError::InvalidSchedule(format!(
                        "'{value}' is not an RFC 3339 timestamp: {e}"
                    ))
                }),
            "every" => parse_interval(value).map(|interval_secs| Self::Every { interval_secs }),
            "cron" => Err(SchedulerError::InvalidSchedule(
                "cron expressions are not supported; use 'every'".to_string(),
            )),
            other => Err(SchedulerError::InvalidSchedule(format!(
                "unknown schedule type '{other}' (expected once or every)"
            ))),
        }
    }

    /// First fire time for a job created at `now`.
    pub fn first_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Self::Once { at } => at,
            Self::Every { interval_secs } => now + interval(interval_secs),
        }
    }

    /// Next fire time after a scheduled run at `ran_at`, or `None` when the
    /// job is done.
    pub fn next_after(&self, ran_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Self::Once { .. } => None,
            Self::Every { interval_secs } => Some(ran_at + interval(interval_secs)),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Once { at } => write!(f, "once at {}", at.to_rfc3339()),
            Self::Every { interval_secs } => write!(f, "every {}", format_interval(*interval_secs)),
        }
    }
}

/// Longest accepted interval.
const MAX_INTERVAL_SECS: u64 = 366 * 86_400;

fn interval(secs: u64) -> TimeDelta {
    TimeDelta::seconds(secs.min(MAX_INTERVAL_SECS) as i64)
}

fn parse_interval(value: &str) -> Result<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| {
        SchedulerError::InvalidSchedule(format!("'{value}' is not an interval like 15m"))
    })?;
    let multiplier = match unit.trim() {
        "" | "s" | "sec" | "secs" => 1,
        "m" | "min" | "mins" => 60,
        "h" | "hr" | "hrs" => 3_600,
        "d" | "day" | "days" => 86_400,
        other => {
            return Err(SchedulerError::InvalidSchedule(format!(
                "unknown interval unit '{other}'"
            )));
        }
    };
    match amount.checked_mul(multiplier) {
        Some(secs) if (1..=MAX_INTERVAL_SECS).contains(&secs) => Ok(secs),
        _ => Err(SchedulerError::InvalidSchedule(format!(
            "interval '{value}' must be between 1s and 366d"
        ))),
    }
}

fn format_interval(secs: u64) -> String {
    match secs {
        s if s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s % 3_600 == 0 => format!("{}h", s / 3_600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

/// A prompt sent to a model on a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub prompt: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub schedule: Schedule,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn new(
        prompt: impl Into<String>,
        model: impl Into<String>,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: None,
            prompt: prompt.into(),
            model: model.into(),
            system_prompt: None,
            schedule,
            active: true,
            created_at: now,
            last_run: None,
            next_run: Some(schedule.first_run(now)),
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_run.is_some_and(|next| next <= now)
    }

    /// Advance the schedule after a scheduled run at `now`.
    ///
    /// Recurring jobs that fell behind fire once and skip the missed slots.
    pub(crate) fn advance(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        let mut next = self.next_run.and_then(|at| self.schedule.next_after(at));
        if let Some(at) = next
            && at <= now
        {
            next = self.schedule.next_after(now);
        }
        self.next_run = next;
        if next.is_none() {
            self.active = false;
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Outcome of one execution of a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_id: String,
    pub executed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_schedules() {
        assert_eq!(
            Schedule::parse("once", "2026-03-01T09:00:00+01:00").unwrap(),
            Schedule::Once {
                at: at("2026-03-01T08:00:00Z")
            }
        );
        assert_eq!(
            Schedule::parse("every", "15m").unwrap(),
            Schedule::Every { interval_secs: 900 }
        );
        assert_eq!(
            Schedule::parse("every", "2h").unwrap(),
            Schedule::Every {
                interval_secs: 7_200
            }
        );
        assert_eq!(
            Schedule::parse("every", "45").unwrap(),
            Schedule::Every { interval_secs: 45 }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Schedule::parse("once", "tomorrow").is_err());
        assert!(Schedule::parse("every", "0m").is_err());
        assert!(Schedule::parse("every", "5w").is_err());
        assert!(Schedule::parse("every", "m").is_err());
        assert!(Schedule::parse("every", "400d").is_err());
        assert!(matches!(
            Schedule::parse("cron", "* * * * *"),
            Err(SchedulerError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(Schedule::Every { interval_secs: 86_400 }.to_string(), "every 1d");
        assert_eq!(Schedule::Every { interval_secs: 90 }.to_string(), "every 90s");
    }

    #[test]
    fn test_once_job_deactivates_after_run() {
        let now = at("2026-01-01T00:00:00Z");
        let mut job = ScheduledJob::new(
            "hi",
            "m",
            Schedule::Once {
                at: now + TimeDelta::minutes(10),
            },
            now,
        );
        assert!(!job.is_due(now));
        let fire = now + TimeDelta::minutes(10);
        assert!(job.is_due(fire));

        job.advance(fire);
        assert!(!job.active);
        assert_eq!(job.next_run, None);
        assert_eq!(job.last_run, Some(fire));
    }

    #[test]
    fn test_recurring_job_skips_missed_slots() {
        let now = at("2026-01-01T00:00:00Z");
        let mut job = ScheduledJob::new("hi", "m", Schedule::Every { interval_secs: 60 }, now);
        assert_eq!(job.next_run, Some(now + TimeDelta::seconds(60)));

        job.advance(now + TimeDelta::seconds(61));
        assert_eq!(job.next_run, Some(now + TimeDelta::seconds(120)));

        let late = now + TimeDelta::seconds(600);
        job.advance(late);
        assert_eq!(job.next_run, Some(late + TimeDelta::seconds(60)));
        assert!(job.active);
    }
}
