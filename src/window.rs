//! Calendar window evaluation.
//!
//! Pure functions: no clock reads, no I/O. `now` must already be in the
//! rule's configured timezone.

use chrono::{Datelike, Timelike};

use crate::error::BotError;
use crate::types::{PeriodGranularity, RecurrenceRule};

/// True iff `now` falls on a day in `[day_start, day_end]` and its hour and
/// minute match the rule exactly. Seconds are ignored.
pub fn is_due<T: Datelike + Timelike>(rule: &RecurrenceRule, now: &T) -> bool {
    let day = now.day();
    rule.day_start <= day
        && day <= rule.day_end
        && now.hour() == rule.hour
        && now.minute() == rule.minute
}

/// Idempotency key for the calendar cycle containing `now`.
pub fn period_key<T: Datelike>(granularity: PeriodGranularity, now: &T) -> String {
    match granularity {
        PeriodGranularity::Month => format!("{:04}-{:02}", now.year(), now.month()),
        PeriodGranularity::Day => {
            format!("{:04}-{:02}-{:02}", now.year(), now.month(), now.day())
        }
    }
}

/// Month key (`YYYY-MM`) for `now`, the cycle work items belong to.
pub fn month_key<T: Datelike>(now: &T) -> String {
    period_key(PeriodGranularity::Month, now)
}

/// Reject rules that can never match or that wrap past month end.
pub fn validate_rule(rule: &RecurrenceRule) -> Result<(), BotError> {
    if !(1..=31).contains(&rule.day_start) || !(1..=31).contains(&rule.day_end) {
        return Err(BotError::Configuration(format!(
            "day range {}-{} outside 1..=31",
            rule.day_start, rule.day_end
        )));
    }
    if rule.day_start > rule.day_end {
        return Err(BotError::Configuration(format!(
            "day range {}-{} wraps past month end; split it into two rules",
            rule.day_start, rule.day_end
        )));
    }
    if rule.hour >= 24 || rule.minute >= 60 {
        return Err(BotError::Configuration(format!(
            "invalid fire time {:02}:{:02}",
            rule.hour, rule.minute
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionKind;
    use chrono::{NaiveDate, NaiveDateTime, TimeZone};

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 10, day)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    fn create_rule() -> RecurrenceRule {
        RecurrenceRule::monthly(ActionKind::CreateBatch, 17, 19, 9, 30)
    }

    #[test]
    fn test_due_on_first_day_exact_minute() {
        assert!(is_due(&create_rule(), &at(17, 9, 30, 0)));
    }

    #[test]
    fn test_due_on_last_day_any_second() {
        assert!(is_due(&create_rule(), &at(19, 9, 30, 59)));
    }

    #[test]
    fn test_not_due_day_before_window() {
        assert!(!is_due(&create_rule(), &at(16, 9, 30, 0)));
    }

    #[test]
    fn test_not_due_day_after_window() {
        assert!(!is_due(&create_rule(), &at(20, 9, 30, 0)));
    }

    #[test]
    fn test_not_due_minute_either_side() {
        assert!(!is_due(&create_rule(), &at(17, 9, 29, 59)));
        assert!(!is_due(&create_rule(), &at(17, 9, 31, 0)));
    }

    #[test]
    fn test_not_due_wrong_hour() {
        assert!(!is_due(&create_rule(), &at(18, 10, 30, 0)));
    }

    #[test]
    fn test_zoned_datetime_evaluated_in_its_own_zone() {
        let tz: chrono_tz::Tz = "America/Argentina/Buenos_Aires".parse().unwrap();
        let now = tz.with_ymd_and_hms(2025, 10, 17, 9, 30, 5).unwrap();
        assert!(is_due(&create_rule(), &now));
        // Same instant in UTC is 12:30 and must not match.
        assert!(!is_due(&create_rule(), &now.naive_utc()));
    }

    #[test]
    fn test_period_keys() {
        let now = at(7, 10, 0, 0);
        assert_eq!(period_key(PeriodGranularity::Month, &now), "2025-10");
        assert_eq!(period_key(PeriodGranularity::Day, &now), "2025-10-07");
        assert_eq!(month_key(&now), "2025-10");
    }

    #[test]
    fn test_validate_rule() {
        assert!(validate_rule(&create_rule()).is_ok());
        assert!(validate_rule(&RecurrenceRule::monthly(ActionKind::FinalReport, 0, 3, 9, 0)).is_err());
        assert!(validate_rule(&RecurrenceRule::monthly(ActionKind::FinalReport, 28, 2, 9, 0)).is_err());
        assert!(validate_rule(&RecurrenceRule::monthly(ActionKind::FinalReport, 1, 32, 9, 0)).is_err());
        assert!(validate_rule(&RecurrenceRule::monthly(ActionKind::FinalReport, 1, 3, 24, 0)).is_err());
        assert!(validate_rule(&RecurrenceRule::monthly(ActionKind::FinalReport, 1, 3, 9, 60)).is_err());
    }
}
