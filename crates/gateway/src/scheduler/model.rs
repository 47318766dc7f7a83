//! Automation data model — `ScheduleConfig`, `Automation`, `ExecutionRecord`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cron;
use super::validation;

/// A trigger for an automation. Parsed and validated from a tagged
/// `{type, value}` pair — cron accepts a 5- or 6-field expression, interval
/// a `<positive int><unit>` string, once an RFC3339 instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Cron { value: String },
    Interval { value: String },
    Once { value: String },
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Cron { value } => validation::validate_cron(value),
            Self::Interval { value } => parse_interval(value).map(|_| ()),
            Self::Once { value } => DateTime::parse_from_rfc3339(value)
                .map(|_| ())
                .map_err(|e| format!("invalid once timestamp '{value}': {e}")),
        }
    }
}

/// Parse an interval string like `30s`, `5m`, `2h`, `1d`.
pub fn parse_interval(value: &str) -> Result<chrono::Duration, String> {
    let bytes = value.as_bytes();
    if bytes.is_empty() {
        return Err("interval must not be empty".into());
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) || digits.starts_with('0') {
        return Err(format!("invalid interval '{value}' — expected e.g. '30s', '5m', '2h', '1d'"));
    }
    let n: i64 = digits.parse().map_err(|_| format!("interval value '{digits}' out of range"))?;
    match unit {
        "s" => Ok(chrono::Duration::seconds(n)),
        "m" => Ok(chrono::Duration::minutes(n)),
        "h" => Ok(chrono::Duration::hours(n)),
        "d" => Ok(chrono::Duration::days(n)),
        other => Err(format!("invalid interval unit '{other}' — expected one of s, m, h, d")),
    }
}

/// Compute the next fire time strictly after `after`, given the schedule
/// and (for interval triggers) the last time it actually fired.
pub fn next_fire_after(
    schedule: &ScheduleConfig,
    after: DateTime<Utc>,
    last_fire: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match schedule {
        ScheduleConfig::Cron { value } => cron::cron_next(value, &after),
        ScheduleConfig::Interval { value } => {
            let duration = parse_interval(value).ok()?;
            let baseline = last_fire.unwrap_or(after);
            let mut next = baseline + duration;
            while next <= after {
                next += duration;
            }
            Some(next)
        }
        ScheduleConfig::Once { value } => {
            let at = DateTime::parse_from_rfc3339(value).ok()?.with_timezone(&Utc);
            if last_fire.is_some() {
                None // already fired once; self-deregisters.
            } else {
                Some(at)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// A persisted automation: fires `message` as a prompt into a transient
/// session on `schedule`'s trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub message: String,
    pub schedule: ScheduleConfig,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_execution: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_execution: Option<DateTime<Utc>>,
}

impl Automation {
    pub fn new(id: impl Into<String>, project_id: impl Into<String>, name: impl Into<String>, message: impl Into<String>, schedule: ScheduleConfig) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            name: name.into(),
            message: message.into(),
            schedule,
            enabled: true,
            created_at: now,
            updated_at: now,
            last_execution: None,
            next_execution: None,
        }
    }
}

/// One firing outcome, appended to `automations/executions/<automation_id>.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub automation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
