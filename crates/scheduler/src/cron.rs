//! Cron expression parsing and evaluation (5-field: min hour dom month dow).
//!
//! Expressions are normalized at parse time into sorted integer lists so
//! matching is a lookup rather than a re-parse. Evaluation is
//! timezone-aware: nonexistent local minutes (spring-forward gaps) are
//! skipped and ambiguous ones (fall-back overlaps) resolve to the earliest
//! mapping.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Unsatisfiable combinations (`0 0 31 2 *`) are cut off this many years out.
const HORIZON_YEARS: i64 = 4;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("invalid cron expression: {field}: {reason}")]
pub struct InvalidCronExpression {
    pub field: &'static str,
    pub reason: String,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("'{expression}' has no fire time within {HORIZON_YEARS} years of {after}")]
pub struct NoNextFireWithinHorizon {
    pub expression: String,
    pub after: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fields
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One normalized field: a wildcard or a sorted, deduplicated value list.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    Any,
    List(Vec<u8>),
}

impl CronField {
    fn matches(&self, value: u8) -> bool {
        match self {
            CronField::Any => true,
            CronField::List(values) => values.binary_search(&value).is_ok(),
        }
    }

    fn is_wildcard(&self) -> bool {
        matches!(self, CronField::Any)
    }
}

fn parse_field(
    text: &str,
    field: &'static str,
    min: u32,
    max: u32,
) -> Result<CronField, InvalidCronExpression> {
    if text == "*" {
        return Ok(CronField::Any);
    }

    let err = |reason: String| InvalidCronExpression { field, reason };
    let parse_value = |raw: &str| -> Result<u32, InvalidCronExpression> {
        let value: u32 = raw
            .parse()
            .map_err(|_| err(format!("invalid value '{raw}'")))?;
        if value < min || value > max {
            return Err(err(format!("value {value} out of range {min}..={max}")));
        }
        Ok(value)
    };

    let mut values: Vec<u8> = Vec::new();
    for part in text.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step_raw)) => {
                let step: u32 = step_raw
                    .parse()
                    .map_err(|_| err(format!("invalid step '{step_raw}'")))?;
                if step == 0 {
                    return Err(err("step must be at least 1".to_string()));
                }
                (base, step)
            }
            None => (part, 1),
        };

        let (low, high) = if base == "*" {
            (min, max)
        } else if let Some((low_raw, high_raw)) = base.split_once('-') {
            let low = parse_value(low_raw)?;
            let high = parse_value(high_raw)?;
            if low > high {
                return Err(err(format!("range {low}-{high} is inverted")));
            }
            (low, high)
        } else if part.contains('/') {
            // A step needs '*' or a range to step over.
            return Err(err(format!("step requires '*' or a range, got '{part}'")));
        } else {
            let value = parse_value(base)?;
            (value, value)
        };

        values.extend((low..=high).step_by(step as usize).map(|v| v as u8));
    }

    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(err("field has no values".to_string()));
    }
    // Full coverage is the wildcard in disguise.
    if values.len() as u32 == max - min + 1 {
        return Ok(CronField::Any);
    }
    Ok(CronField::List(values))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Expression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A parsed five-field cron expression.
///
/// Day-of-week runs 0–6 with 0 = Sunday; weekday names are not accepted.
/// When both day fields are restricted, matching either one suffices
/// (the POSIX rule); otherwise the restricted one must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    text: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpression {
    pub fn parse(text: &str) -> Result<Self, InvalidCronExpression> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(InvalidCronExpression {
                field: "expression",
                reason: format!(
                    "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                    fields.len()
                ),
            });
        }
        Ok(Self {
            // Whitespace-canonicalized original, for logging and comparison.
            text: fields.join(" "),
            minute: parse_field(fields[0], "minute", 0, 59)?,
            hour: parse_field(fields[1], "hour", 0, 23)?,
            day_of_month: parse_field(fields[2], "day-of-month", 1, 31)?,
            month: parse_field(fields[3], "month", 1, 12)?,
            day_of_week: parse_field(fields[4], "day-of-week", 0, 6)?,
        })
    }

    /// The expression as registered (single-space separated).
    pub fn text(&self) -> &str {
        &self.text
    }

    fn day_matches(&self, day_of_month: u8, day_of_week: u8) -> bool {
        if !self.day_of_month.is_wildcard() && !self.day_of_week.is_wildcard() {
            self.day_of_month.matches(day_of_month) || self.day_of_week.matches(day_of_week)
        } else {
            self.day_of_month.matches(day_of_month) && self.day_of_week.matches(day_of_week)
        }
    }

    fn matches_naive(&self, local: &NaiveDateTime) -> bool {
        self.minute.matches(local.minute() as u8)
            && self.hour.matches(local.hour() as u8)
            && self.month.matches(local.month() as u8)
            && self.day_matches(
                local.day() as u8,
                local.weekday().num_days_from_sunday() as u8,
            )
    }

    /// Does `instant`, viewed in `tz`, match? Seconds are ignored.
    pub fn matches_tz(&self, instant: &DateTime<Utc>, tz: Tz) -> bool {
        self.matches_naive(&instant.with_timezone(&tz).naive_local())
    }

    pub fn matches(&self, instant: &DateTime<Utc>) -> bool {
        self.matches_tz(instant, chrono_tz::UTC)
    }

    /// The smallest fire time strictly after `after` (whose seconds are
    /// floored), evaluated in `tz`.
    ///
    /// Walks (month, day, hour, minute) coordinates, advancing the coarsest
    /// mismatching field and resetting the finer ones, so sparse
    /// expressions skip whole months at a time.
    pub fn next_after_tz(
        &self,
        after: &DateTime<Utc>,
        tz: Tz,
    ) -> Result<DateTime<Utc>, NoNextFireWithinHorizon> {
        let local_after = floor_minute(after.with_timezone(&tz).naive_local());
        let horizon = local_after + Duration::days(366 * HORIZON_YEARS);
        let out_of_horizon = || NoNextFireWithinHorizon {
            expression: self.text.clone(),
            after: *after,
        };

        let mut candidate = local_after + Duration::minutes(1);
        loop {
            if candidate > horizon {
                return Err(out_of_horizon());
            }
            if !self.month.matches(candidate.month() as u8) {
                candidate = start_of_next_month(&candidate).ok_or_else(&out_of_horizon)?;
                continue;
            }
            if !self.day_matches(
                candidate.day() as u8,
                candidate.weekday().num_days_from_sunday() as u8,
            ) {
                candidate = start_of_next_day(&candidate).ok_or_else(&out_of_horizon)?;
                continue;
            }
            if !self.hour.matches(candidate.hour() as u8) {
                candidate = start_of_hour(&candidate) + Duration::hours(1);
                continue;
            }
            if !self.minute.matches(candidate.minute() as u8) {
                candidate += Duration::minutes(1);
                continue;
            }
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(instant) => {
                    return Ok(instant.with_timezone(&Utc))
                }
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Ok(earliest.with_timezone(&Utc))
                }
                chrono::LocalResult::None => {
                    // DST gap: this local minute does not exist.
                    candidate += Duration::minutes(1);
                }
            }
        }
    }

    pub fn next_after(
        &self,
        after: &DateTime<Utc>,
    ) -> Result<DateTime<Utc>, NoNextFireWithinHorizon> {
        self.next_after_tz(after, chrono_tz::UTC)
    }

    /// The latest fire time at or before `at`, evaluated in `tz`; `None`
    /// when there is none within the backward horizon.
    pub fn prev_at_or_before_tz(&self, at: &DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local_at = floor_minute(at.with_timezone(&tz).naive_local());
        let horizon = local_at - Duration::days(366 * HORIZON_YEARS);

        let mut candidate = local_at;
        loop {
            if candidate < horizon {
                return None;
            }
            if !self.month.matches(candidate.month() as u8) {
                candidate = start_of_month(&candidate) - Duration::minutes(1);
                continue;
            }
            if !self.day_matches(
                candidate.day() as u8,
                candidate.weekday().num_days_from_sunday() as u8,
            ) {
                candidate = start_of_day(&candidate) - Duration::minutes(1);
                continue;
            }
            if !self.hour.matches(candidate.hour() as u8) {
                candidate = start_of_hour(&candidate) - Duration::minutes(1);
                continue;
            }
            if !self.minute.matches(candidate.minute() as u8) {
                candidate -= Duration::minutes(1);
                continue;
            }
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(instant) => {
                    return Some(instant.with_timezone(&Utc))
                }
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc))
                }
                chrono::LocalResult::None => {
                    candidate -= Duration::minutes(1);
                }
            }
        }
    }

    pub fn prev_at_or_before(&self, at: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.prev_at_or_before_tz(at, chrono_tz::UTC)
    }
}

impl std::fmt::Display for CronExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

// ── Calendar stepping helpers ───────────────────────────────────────

fn floor_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn start_of_hour(t: &NaiveDateTime) -> NaiveDateTime {
    floor_minute(*t).with_minute(0).unwrap_or(*t)
}

fn start_of_day(t: &NaiveDateTime) -> NaiveDateTime {
    t.date().and_hms_opt(0, 0, 0).unwrap_or(*t)
}

fn start_of_month(t: &NaiveDateTime) -> NaiveDateTime {
    t.date()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(*t)
}

fn start_of_next_day(t: &NaiveDateTime) -> Option<NaiveDateTime> {
    t.date().succ_opt()?.and_hms_opt(0, 0, 0)
}

fn start_of_next_month(t: &NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    chrono::NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    // ── Parsing ──────────────────────────────────────────────────────

    #[test]
    fn parse_accepts_the_standard_forms() {
        assert!(CronExpression::parse("* * * * *").is_ok());
        assert!(CronExpression::parse("0 * * * *").is_ok());
        assert!(CronExpression::parse("*/5 9-17 * * 1-5").is_ok());
        assert!(CronExpression::parse("30 9 1,15 * *").is_ok());
        assert!(CronExpression::parse("0 0 * * 0").is_ok());
        assert!(CronExpression::parse("0-30/10 * * * *").is_ok());
    }

    #[test]
    fn parse_accepts_an_impossible_but_well_formed_date() {
        // February 31st never fires, but the expression itself is valid.
        assert!(CronExpression::parse("0 0 31 2 *").is_ok());
    }

    #[test]
    fn parse_rejects_malformed_expressions() {
        assert!(CronExpression::parse("* * *").is_err());
        assert!(CronExpression::parse("* * * * * *").is_err());
        assert!(CronExpression::parse("60 * * * *").is_err());
        assert!(CronExpression::parse("* 24 * * *").is_err());
        assert!(CronExpression::parse("* * 0 * *").is_err());
        assert!(CronExpression::parse("* * * 13 *").is_err());
        assert!(CronExpression::parse("* * * * 7").is_err());
        assert!(CronExpression::parse("*/0 * * * *").is_err());
        assert!(CronExpression::parse("5-2 * * * *").is_err());
        assert!(CronExpression::parse("abc * * * *").is_err());
        // Weekday names are deliberately not understood.
        assert!(CronExpression::parse("* * * * mon").is_err());
        // A step needs something to step over.
        assert!(CronExpression::parse("5/2 * * * *").is_err());
    }

    #[test]
    fn parse_reports_the_offending_field() {
        let err = CronExpression::parse("* * * * 9").unwrap_err();
        assert_eq!(err.field, "day-of-week");

        let err = CronExpression::parse("61 * * * *").unwrap_err();
        assert_eq!(err.field, "minute");
    }

    #[test]
    fn text_is_whitespace_canonicalized() {
        let expr = CronExpression::parse("  0   *  * * *  ").unwrap();
        assert_eq!(expr.text(), "0 * * * *");
        // Canonical text survives a re-parse unchanged.
        let again = CronExpression::parse(expr.text()).unwrap();
        assert_eq!(again.text(), expr.text());
    }

    #[test]
    fn full_coverage_collapses_to_wildcard() {
        let expr = CronExpression::parse("0-59 * * * 0-6").unwrap();
        assert!(expr.minute.is_wildcard());
        assert!(expr.day_of_week.is_wildcard());
        let expr = CronExpression::parse("*/1 * * * *").unwrap();
        assert!(expr.minute.is_wildcard());
    }

    #[test]
    fn lists_are_sorted_and_deduplicated() {
        let expr = CronExpression::parse("30,10,10,50 * * * *").unwrap();
        assert_eq!(expr.minute, CronField::List(vec![10, 30, 50]));
    }

    // ── Matching ─────────────────────────────────────────────────────

    #[test]
    fn matches_steps_and_ranges() {
        let every5 = CronExpression::parse("*/5 * * * *").unwrap();
        assert!(every5.matches(&at(2024, 6, 15, 10, 0, 0)));
        assert!(every5.matches(&at(2024, 6, 15, 10, 55, 0)));
        assert!(!every5.matches(&at(2024, 6, 15, 10, 3, 0)));

        let office = CronExpression::parse("0 9-17 * * *").unwrap();
        assert!(office.matches(&at(2024, 6, 15, 10, 0, 0)));
        assert!(!office.matches(&at(2024, 6, 15, 20, 0, 0)));
    }

    #[test]
    fn seconds_are_ignored_by_matching() {
        let hourly = CronExpression::parse("0 * * * *").unwrap();
        assert!(hourly.matches(&at(2024, 6, 15, 10, 0, 59)));
    }

    #[test]
    fn restricted_day_fields_match_either_way() {
        // 2024-06-15 was a Saturday (dow 6). Day 1 does not match, dow does.
        let expr = CronExpression::parse("0 0 1 * 6").unwrap();
        assert!(expr.matches(&at(2024, 6, 15, 0, 0, 0)));
        // Day matches, dow (2024-07-01 was a Monday) does not.
        assert!(expr.matches(&at(2024, 7, 1, 0, 0, 0)));
        // Neither matches: Friday the 14th.
        assert!(!expr.matches(&at(2024, 6, 14, 0, 0, 0)));
    }

    #[test]
    fn single_restricted_day_field_must_match() {
        // Only dow restricted: Saturdays only.
        let expr = CronExpression::parse("0 0 * * 6").unwrap();
        assert!(expr.matches(&at(2024, 6, 15, 0, 0, 0)));
        assert!(!expr.matches(&at(2024, 6, 14, 0, 0, 0)));

        // Only dom restricted: the 15th only.
        let expr = CronExpression::parse("0 0 15 * *").unwrap();
        assert!(expr.matches(&at(2024, 6, 15, 0, 0, 0)));
        assert!(!expr.matches(&at(2024, 6, 14, 0, 0, 0)));
    }

    // ── Next fire ────────────────────────────────────────────────────

    #[test]
    fn next_after_is_strictly_greater() {
        let hourly = CronExpression::parse("0 * * * *").unwrap();
        let t = at(2024, 6, 15, 10, 0, 0);
        let next = hourly.next_after(&t).unwrap();
        assert_eq!(next, at(2024, 6, 15, 11, 0, 0));
    }

    #[test]
    fn next_after_floors_seconds() {
        let every_minute = CronExpression::parse("* * * * *").unwrap();
        let t = at(2024, 6, 15, 10, 0, 42);
        assert_eq!(every_minute.next_after(&t).unwrap(), at(2024, 6, 15, 10, 1, 0));
    }

    #[test]
    fn next_after_crosses_day_and_month_boundaries() {
        let daily = CronExpression::parse("0 0 * * *").unwrap();
        assert_eq!(
            daily.next_after(&at(2024, 1, 31, 12, 0, 0)).unwrap(),
            at(2024, 2, 1, 0, 0, 0)
        );

        let monthly = CronExpression::parse("0 0 31 * *").unwrap();
        // February has no 31st; the next one is in March.
        assert_eq!(
            monthly.next_after(&at(2024, 1, 31, 0, 0, 0)).unwrap(),
            at(2024, 3, 31, 0, 0, 0)
        );
    }

    #[test]
    fn next_after_handles_weekday_schedules() {
        // Sundays at 00:00. From Saturday 2024-06-15, next is the 16th.
        let expr = CronExpression::parse("0 0 * * 0").unwrap();
        assert_eq!(
            expr.next_after(&at(2024, 6, 15, 0, 0, 0)).unwrap(),
            at(2024, 6, 16, 0, 0, 0)
        );
    }

    #[test]
    fn unsatisfiable_expression_hits_the_horizon() {
        let expr = CronExpression::parse("0 0 31 2 *").unwrap();
        let err = expr.next_after(&at(2021, 1, 1, 0, 0, 0)).unwrap_err();
        assert_eq!(err.expression, "0 0 31 2 *");
    }

    #[test]
    fn next_fire_always_matches_and_advances() {
        let expressions = [
            "* * * * *",
            "*/2 * * * *",
            "0 * * * *",
            "0 0 * * *",
            "30 9 1,15 * *",
            "0 12 * * 1-5",
            "*/7 3 * 2 *",
            "0 0 29 2 *",
        ];
        let starts = [
            at(2021, 1, 1, 0, 0, 0),
            at(2021, 2, 28, 23, 59, 0),
            at(2024, 12, 31, 23, 59, 59),
            at(2022, 6, 15, 10, 30, 17),
        ];
        for text in expressions {
            let expr = CronExpression::parse(text).unwrap();
            for start in starts {
                let next = expr.next_after(&start).unwrap();
                assert!(next > start, "{text}: {next} not after {start}");
                assert!(expr.matches(&next), "{text}: {next} does not match");
            }
        }
    }

    // ── Previous fire ────────────────────────────────────────────────

    #[test]
    fn prev_at_or_before_includes_the_instant_itself() {
        let hourly = CronExpression::parse("0 * * * *").unwrap();
        assert_eq!(
            hourly.prev_at_or_before(&at(2024, 6, 15, 10, 0, 0)).unwrap(),
            at(2024, 6, 15, 10, 0, 0)
        );
        assert_eq!(
            hourly.prev_at_or_before(&at(2024, 6, 15, 10, 59, 30)).unwrap(),
            at(2024, 6, 15, 10, 0, 0)
        );
    }

    #[test]
    fn prev_at_or_before_crosses_boundaries_backwards() {
        let monthly = CronExpression::parse("0 0 31 * *").unwrap();
        // Going back from mid-February lands on January 31st.
        assert_eq!(
            monthly.prev_at_or_before(&at(2024, 2, 15, 0, 0, 0)).unwrap(),
            at(2024, 1, 31, 0, 0, 0)
        );
    }

    #[test]
    fn prev_at_or_before_gives_up_beyond_the_horizon() {
        let expr = CronExpression::parse("0 0 31 2 *").unwrap();
        assert!(expr.prev_at_or_before(&at(2024, 6, 15, 0, 0, 0)).is_none());
    }

    // ── Timezone behaviour ───────────────────────────────────────────

    #[test]
    fn next_after_tz_evaluates_in_local_time() {
        let expr = CronExpression::parse("0 9 * * *").unwrap();
        let after = at(2024, 6, 15, 12, 0, 0);
        let tz: Tz = "US/Eastern".parse().unwrap();
        let next = expr.next_after_tz(&after, tz).unwrap();
        // 9:00 EDT is 13:00 UTC.
        assert_eq!(next, at(2024, 6, 15, 13, 0, 0));
    }

    #[test]
    fn spring_forward_gap_is_skipped() {
        let expr = CronExpression::parse("30 2 * * *").unwrap();
        let tz: Tz = "US/Eastern".parse().unwrap();
        // 2024-03-10: 02:30 EST does not exist; the next 02:30 is on the 11th.
        let after = at(2024, 3, 10, 6, 0, 0);
        let next = expr.next_after_tz(&after, tz).unwrap();
        assert_eq!(next, at(2024, 3, 11, 6, 30, 0));
    }

    #[test]
    fn fall_back_overlap_resolves_to_the_earliest_mapping() {
        let expr = CronExpression::parse("30 1 * * *").unwrap();
        let tz: Tz = "US/Eastern".parse().unwrap();
        // 2024-11-03: 01:30 happens twice; the EDT (earlier) one wins.
        let after = at(2024, 11, 3, 4, 0, 0);
        let next = expr.next_after_tz(&after, tz).unwrap();
        assert_eq!(next, at(2024, 11, 3, 5, 30, 0));
    }
}
