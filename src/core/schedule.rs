//! Schedules and next-occurrence calculation.
//!
//! [`Recurrence`] evaluates cron expressions (5 or 6 fields), shortcuts such
//! as `@daily`, and `@every` intervals in a given timezone. [`JobSchedule`] is
//! the stored schedule record attached to a job.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use super::types::JobId;

/// Default timezone for schedules.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Errors that can occur when parsing or evaluating schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// A one-time schedule has no recurrence rule.
    #[error("schedule for job {0} has no recurrence expression")]
    MissingExpression(JobId),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

#[derive(Debug, Clone)]
enum Rule {
    Cron(Box<CronSchedule>),
    Interval(Duration),
}

/// A parsed recurrence rule bound to a timezone.
#[derive(Debug, Clone)]
pub struct Recurrence {
    expression: String,
    timezone: Tz,
    rule: Rule,
}

impl Recurrence {
    /// Parse an expression evaluated in UTC.
    ///
    /// Supports:
    /// - Standard 5-field cron: `minute hour day month weekday`
    /// - Extended 6-field cron: `second minute hour day month weekday`
    /// - Shortcuts: `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly`
    /// - Intervals: `@every 5m`, `@every 1h30m`
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, DEFAULT_TIMEZONE)
    }

    /// Parse an expression evaluated in the given IANA timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: &str,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        let rule = parse_expression(&expression)?;

        Ok(Self {
            expression,
            timezone,
            rule,
        })
    }

    /// Next occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.rule {
            Rule::Cron(schedule) => schedule
                .after(&after.with_timezone(&self.timezone))
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or(ScheduleError::NoMoreOccurrences),
            Rule::Interval(duration) => after
                .checked_add_signed(to_chrono(*duration)?)
                .ok_or(ScheduleError::NoMoreOccurrences),
        }
    }

    /// The next `n` occurrences after `after`.
    pub fn next_n_after(
        &self,
        after: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
        match &self.rule {
            Rule::Cron(schedule) => Ok(schedule
                .after(&after.with_timezone(&self.timezone))
                .take(n)
                .map(|dt| dt.with_timezone(&Utc))
                .collect()),
            Rule::Interval(duration) => {
                let step = to_chrono(*duration)?;
                let mut occurrences = Vec::with_capacity(n);
                let mut current = after;
                for _ in 0..n {
                    match current.checked_add_signed(step) {
                        Some(next) => current = next,
                        None => break,
                    }
                    occurrences.push(current);
                }
                Ok(occurrences)
            }
        }
    }

    /// Whether this is an `@every` interval.
    pub fn is_interval(&self) -> bool {
        matches!(self.rule, Rule::Interval(_))
    }

    /// The original expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The timezone name.
    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, ScheduleError> {
    chrono::Duration::from_std(duration)
        .map_err(|_| ScheduleError::InvalidInterval(format!("{:?} is out of range", duration)))
}

fn parse_expression(expression: &str) -> Result<Rule, ScheduleError> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return parse_shortcut(trimmed);
    }
    parse_cron(trimmed)
}

fn parse_shortcut(expression: &str) -> Result<Rule, ScheduleError> {
    match expression.to_lowercase().as_str() {
        "@yearly" | "@annually" => parse_cron("0 0 1 1 *"),
        "@monthly" => parse_cron("0 0 1 * *"),
        "@weekly" => parse_cron("0 0 * * SUN"),
        "@daily" | "@midnight" => parse_cron("0 0 * * *"),
        "@hourly" => parse_cron("0 * * * *"),
        s if s.starts_with("@every ") => parse_duration(s["@every ".len()..].trim()).map(Rule::Interval),
        _ => Err(ScheduleError::InvalidCron(format!(
            "unknown shortcut: {}",
            expression
        ))),
    }
}

/// Parse a duration such as `30s`, `5m`, `1h30m` or `1d`.
pub fn parse_duration(s: &str) -> Result<Duration, ScheduleError> {
    let mut total_secs: u64 = 0;
    let mut current_num = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            current_num.push(c);
            continue;
        }
        let num: u64 = current_num
            .parse()
            .map_err(|_| ScheduleError::InvalidInterval(s.to_string()))?;
        current_num.clear();

        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(ScheduleError::InvalidInterval(s.to_string())),
        };
        total_secs = total_secs.saturating_add(num.saturating_mul(unit));
    }

    if !current_num.is_empty() || total_secs == 0 {
        return Err(ScheduleError::InvalidInterval(s.to_string()));
    }

    Ok(Duration::from_secs(total_secs))
}

fn parse_cron(expression: &str) -> Result<Rule, ScheduleError> {
    let fields = expression.split_whitespace().count();
    let cron_expr = match fields {
        5 => format!("0 {}", expression),
        6 => expression.to_string(),
        _ => {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5 or 6 fields, got {}",
                fields
            )));
        }
    };

    let schedule = CronSchedule::from_str(&cron_expr)
        .map_err(|e| ScheduleError::InvalidCron(e.to_string()))?;
    Ok(Rule::Cron(Box::new(schedule)))
}

/// Kind of a stored schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Fires once at `execution_time`.
    OneTime,
    /// Fires on every cron occurrence.
    Cron,
    /// Fires on a fixed `@every` interval.
    Interval,
}

impl ScheduleType {
    /// Stable textual form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::OneTime => "one_time",
            ScheduleType::Cron => "cron",
            ScheduleType::Interval => "interval",
        }
    }

    /// Whether the schedule keeps firing after its first occurrence.
    pub fn is_recurring(&self) -> bool {
        !matches!(self, ScheduleType::OneTime)
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(ScheduleType::OneTime),
            "cron" => Ok(ScheduleType::Cron),
            "interval" => Ok(ScheduleType::Interval),
            other => Err(format!("unknown schedule type: {}", other)),
        }
    }
}

/// The stored schedule of a job.
///
/// A one-time schedule is deactivated exactly once, when it fires, and never
/// reactivated. A recurring schedule recomputes `next_execution` from
/// `last_execution` each time it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub job_id: JobId,
    pub schedule_type: ScheduleType,
    /// Cron text, shortcut or `@every` interval. Absent for one-time schedules.
    pub cron_expression: Option<String>,
    /// Fire time of a one-time schedule.
    pub execution_time: Option<DateTime<Utc>>,
    pub next_execution: Option<DateTime<Utc>>,
    pub last_execution: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// IANA timezone the expression is evaluated in.
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSchedule {
    /// A schedule that fires once at `at`.
    pub fn one_time(job_id: JobId, at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            schedule_type: ScheduleType::OneTime,
            cron_expression: None,
            execution_time: Some(at),
            next_execution: Some(at),
            last_execution: None,
            is_active: true,
            timezone: DEFAULT_TIMEZONE.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A cron or interval schedule whose first occurrence follows `now`.
    pub fn recurring(
        job_id: JobId,
        expression: impl Into<String>,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let recurrence = Recurrence::with_timezone(expression, timezone)?;
        let schedule_type = if recurrence.is_interval() {
            ScheduleType::Interval
        } else {
            ScheduleType::Cron
        };
        let next_execution = recurrence.next_after(now)?;

        Ok(Self {
            job_id,
            schedule_type,
            cron_expression: Some(recurrence.expression().to_string()),
            execution_time: None,
            next_execution: Some(next_execution),
            last_execution: None,
            is_active: true,
            timezone: recurrence.timezone().to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Parse the recurrence rule of a cron or interval schedule.
    pub fn recurrence(&self) -> Result<Recurrence, ScheduleError> {
        let expression = self
            .cron_expression
            .as_deref()
            .ok_or(ScheduleError::MissingExpression(self.job_id))?;
        Recurrence::with_timezone(expression, &self.timezone)
    }

    /// Whether the schedule is active and its next execution is at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_execution.is_some_and(|next| next <= now)
    }

    /// Record that the schedule fired at `fired_at`.
    ///
    /// One-time schedules are deactivated. Recurring schedules move
    /// `next_execution` strictly past `fired_at`; a rule with no further
    /// occurrences deactivates the schedule and returns the error.
    pub fn record_firing(&mut self, fired_at: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.last_execution = Some(fired_at);
        self.updated_at = fired_at;

        if !self.schedule_type.is_recurring() {
            self.is_active = false;
            self.next_execution = None;
            return Ok(());
        }

        match self.recurrence().and_then(|r| r.next_after(fired_at)) {
            Ok(next) => {
                self.next_execution = Some(next);
                Ok(())
            }
            Err(e) => {
                self.is_active = false;
                self.next_execution = None;
                Err(e)
            }
        }
    }

    /// Stop the schedule from firing again.
    pub fn deactivate(&mut self, at: DateTime<Utc>) {
        self.is_active = false;
        self.updated_at = at;
    }
}
