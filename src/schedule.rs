//! Schedule gate
//!
//! A restricted crontab with exactly two fields, hour and day-of-week
//! ("9-18 1-5" is working hours, "* *" is always), evaluated in a
//! configurable timezone. Each field supports `*`, single values, ranges,
//! lists and `/step` suffixes. Groups are gated before any scanning work
//! happens for them.
//!
//! The schedule state inverts the window: `"on"` processes groups inside
//! the window, `"off"` processes them outside it. A schedule that fails to
//! parse gates the group off rather than running it at an unintended time.

use crate::error::{ConfigError, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use tracing::warn;

/// Whether the group should be processed at `now` under its schedule
/// settings. Parse failures are surfaced; callers skip the group on error.
pub fn is_active(now: DateTime<Utc>, crontab: &str, timezone: &str, state: &str) -> Result<bool> {
    let inside = inside_schedule(now, crontab, timezone)?;
    Ok((inside && state == "on") || (!inside && state == "off"))
}

/// True when `now`, converted to `timezone`, falls inside the crontab's
/// hour and day-of-week sets.
fn inside_schedule(now: DateTime<Utc>, crontab: &str, timezone: &str) -> Result<bool> {
    let tz = Tz::from_str(timezone).map_err(|_| ConfigError::InvalidValue {
        field: "cron_timezone".to_string(),
        reason: format!("unknown timezone {timezone:?}"),
    })?;
    let local = tz.from_utc_datetime(&now.naive_utc());

    let mut fields = crontab.split_whitespace();
    let (Some(hours), Some(days), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(ConfigError::InvalidValue {
            field: "cron_schedule".to_string(),
            reason: format!("expected two fields (hour, day-of-week), got {crontab:?}"),
        }
        .into());
    };

    Ok(field_matches(hours, local.hour(), 0, 23)?
        && field_matches(days, local.weekday().num_days_from_sunday(), 0, 7)?)
}

/// One crontab field against a value: comma-separated terms, each `*`, a
/// single value or a range, optionally with a `/step` suffix.
fn field_matches(field: &str, value: u32, min: u32, max: u32) -> Result<bool> {
    for term in field.split(',') {
        let (range, step) = match term.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid_field(term))?;
                if step == 0 {
                    return Err(invalid_field(term).into());
                }
                (range, step)
            }
            None => (term, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (
                parse_bound(lo, min, max, term)?,
                parse_bound(hi, min, max, term)?,
            )
        } else {
            let v = parse_bound(range, min, max, term)?;
            (v, v)
        };

        // Day-of-week allows 7 as an alias for Sunday.
        let normalize = |v: u32| if max == 7 && v == 7 { 0 } else { v };
        if (lo..=hi)
            .step_by(step as usize)
            .any(|v| normalize(v) == value)
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn parse_bound(text: &str, min: u32, max: u32, term: &str) -> Result<u32> {
    let value: u32 = text.parse().map_err(|_| invalid_field(term))?;
    if value < min || value > max {
        warn!(term, value, "crontab value out of range");
        return Err(invalid_field(term).into());
    }
    Ok(value)
}

fn invalid_field(term: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: "cron_schedule".to_string(),
        reason: format!("bad crontab term {term:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 30, 0).unwrap()
    }

    // 2024-01-10 is a Wednesday.
    #[test]
    fn working_hours_schedule_matches_weekday_office_hours() {
        let wed_noon = utc(2024, 1, 10, 12);
        assert!(is_active(wed_noon, "9-18 1-5", "UTC", "on").unwrap());
        let wed_night = utc(2024, 1, 10, 22);
        assert!(!is_active(wed_night, "9-18 1-5", "UTC", "on").unwrap());
        let sun_noon = utc(2024, 1, 14, 12);
        assert!(!is_active(sun_noon, "9-18 1-5", "UTC", "on").unwrap());
    }

    #[test]
    fn off_state_inverts_the_window() {
        let wed_noon = utc(2024, 1, 10, 12);
        assert!(!is_active(wed_noon, "9-18 1-5", "UTC", "off").unwrap());
        let wed_night = utc(2024, 1, 10, 22);
        assert!(is_active(wed_night, "9-18 1-5", "UTC", "off").unwrap());
    }

    #[test]
    fn wildcard_schedule_is_always_inside() {
        assert!(is_active(utc(2024, 1, 10, 3), "* *", "UTC", "on").unwrap());
        assert!(is_active(utc(2024, 1, 14, 23), "* *", "UTC", "on").unwrap());
    }

    #[test]
    fn timezone_shifts_the_window() {
        // 02:30 UTC on Wednesday is 11:30 in Tokyo.
        let t = utc(2024, 1, 10, 2);
        assert!(is_active(t, "9-18 1-5", "Asia/Tokyo", "on").unwrap());
        assert!(!is_active(t, "9-18 1-5", "UTC", "on").unwrap());
    }

    #[test]
    fn lists_steps_and_sunday_alias_parse() {
        let sun_noon = utc(2024, 1, 14, 12);
        assert!(is_active(sun_noon, "* 0,6", "UTC", "on").unwrap());
        assert!(is_active(sun_noon, "* 7", "UTC", "on").unwrap());
        // Even hours only.
        assert!(is_active(utc(2024, 1, 10, 12), "*/2 *", "UTC", "on").unwrap());
        assert!(!is_active(utc(2024, 1, 10, 13), "*/2 *", "UTC", "on").unwrap());
    }

    #[test]
    fn malformed_schedules_error_out() {
        let t = utc(2024, 1, 10, 12);
        assert!(is_active(t, "9-18", "UTC", "on").is_err());
        assert!(is_active(t, "25 *", "UTC", "on").is_err());
        assert!(is_active(t, "* * *", "UTC", "on").is_err());
        assert!(is_active(t, "9-18 1-5", "Mars/Olympus", "on").is_err());
    }
}
