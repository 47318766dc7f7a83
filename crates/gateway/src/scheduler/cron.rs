//! Timezone-aware cron evaluator. Accepts the conventional 5-field form
//! (min hour dom month dow) and an extended 6-field form with a leading
//! seconds field (sec min hour dom month dow).

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Parse a timezone string into a `chrono_tz::Tz`, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

/// Parse a cron field and check if a value matches.
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    // Handle */N (every N)
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value.is_multiple_of(n);
        }
    }
    // Handle comma-separated values
    for part in field.split(',') {
        // Handle range N-M
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// True if `cron` has a leading seconds field (6 fields instead of 5).
fn has_seconds_field(cron: &str) -> bool {
    cron.split_whitespace().count() == 6
}

/// Check if a **local** naive datetime matches a 5- or 6-field cron
/// expression. The 6-field form's extra leading field is seconds.
fn cron_matches_naive(cron: &str, dt: &chrono::NaiveDateTime) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    let (sec_field, rest): (Option<&str>, &[&str]) = match fields.len() {
        5 => (None, &fields[..]),
        6 => (Some(fields[0]), &fields[1..]),
        _ => return false,
    };
    if let Some(sec) = sec_field {
        if !cron_field_matches(sec, dt.second()) {
            return false;
        }
    }
    cron_field_matches(rest[0], dt.minute())
        && cron_field_matches(rest[1], dt.hour())
        && cron_field_matches(rest[2], dt.day())
        && cron_field_matches(rest[3], dt.month())
        && cron_field_matches(rest[4], dt.weekday().num_days_from_sunday())
}

/// Check if a UTC datetime matches a 5-field cron expression (UTC shorthand).
pub fn cron_matches(cron: &str, dt: &DateTime<Utc>) -> bool {
    cron_matches_naive(cron, &dt.naive_utc())
}

/// Compute next occurrence after `after` for a cron expression, evaluated in
/// the given timezone. Returns a UTC `DateTime`.
///
/// **DST handling:**
/// - Spring-forward gaps: local times that don't exist are skipped.
/// - Fall-back overlaps: the earliest (pre-transition) mapping is chosen.
pub fn cron_next_tz(cron: &str, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;

    let with_seconds = has_seconds_field(cron);
    let step = if with_seconds { chrono::Duration::seconds(1) } else { chrono::Duration::minutes(1) };

    let local_after = after.with_timezone(&tz).naive_local();
    let mut candidate = if with_seconds {
        local_after + chrono::Duration::seconds(1)
    } else {
        let next_min_secs = 60 - (local_after.second() as i64);
        (local_after + chrono::Duration::seconds(next_min_secs))
            .with_second(0)
            .unwrap_or(local_after)
    };

    let max_checks = if with_seconds { 366 * 24 * 60 * 60 } else { 366 * 24 * 60 };
    for _ in 0..max_checks {
        if cron_matches_naive(cron, &candidate) {
            // Convert back to UTC. If this local time is in a DST gap
            // (doesn't exist), skip it.
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                chrono::LocalResult::None => {
                    // DST gap — this local minute doesn't exist. Skip.
                }
            }
        }
        candidate += step;
    }
    None
}

/// Convenience: compute next occurrence using UTC (for backward compat).
pub fn cron_next(cron: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron_next_tz(cron, after, chrono_tz::UTC)
}

/// Compute up to N next occurrences, timezone-aware.
pub fn cron_next_n_tz(
    cron: &str,
    after: &DateTime<Utc>,
    n: usize,
    tz: chrono_tz::Tz,
) -> Vec<DateTime<Utc>> {
    let mut results = Vec::with_capacity(n);
    let mut cursor = *after;
    for _ in 0..n {
        match cron_next_tz(cron, &cursor, tz) {
            Some(next) => {
                results.push(next);
                cursor = next;
            }
            None => break,
        }
    }
    results
}

/// Convenience: compute up to N next occurrences using UTC.
pub fn cron_next_n(cron: &str, after: &DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
    cron_next_n_tz(cron, after, n, chrono_tz::UTC)
}
