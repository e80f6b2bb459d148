//! Cron evaluation adapter over the `cron` crate.
//!
//! Accepted input is the conventional 5-column form
//! `minute hour day-of-month month day-of-week`, or 6 columns with a trailing
//! `second` column. The `cron` crate wants seconds first and has its own
//! weekday numbering, so expressions are rewritten before parsing: seconds
//! move to the front and numeric weekdays (`0-7`, Sunday = 0 or 7) become
//! day names.
//!
//! When both day-of-month and day-of-week are restricted, a day matching
//! either one fires, as in classic cron. The `cron` crate requires both, so
//! such expressions are evaluated as two schedules whose occurrences are
//! merged.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tempo_core::validate::validate_cron_syntax;
use tempo_core::ValidationError;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed, evaluable cron expression. Pure and stateless; all times UTC.
#[derive(Debug, Clone)]
pub struct CronExpression {
    /// One schedule, or the day-of-month and day-of-week halves of an
    /// either-day expression.
    schedules: Vec<Schedule>,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        validate_cron_syntax(expression)?;
        let invalid = |reason: String| ValidationError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        let schedules = normalize(expression)
            .map_err(invalid)?
            .iter()
            .map(|normalized| Schedule::from_str(normalized).map_err(|e| invalid(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { schedules })
    }

    /// Occurrences in `(start_exclusive, end_inclusive]`, strictly increasing.
    ///
    /// Lazy: callers that stop early never evaluate the rest of the range.
    pub fn occurrences_in_range(
        &self,
        start_exclusive: DateTime<Utc>,
        end_inclusive: DateTime<Utc>,
    ) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.after(start_exclusive)
            .take_while(move |occurrence| *occurrence <= end_inclusive)
    }

    /// First occurrence strictly after `after`.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.after(after).next()
    }

    /// Ordered merge of every schedule's upcoming times, without repeats.
    fn after(&self, after: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let mut streams: Vec<_> = self
            .schedules
            .iter()
            .map(|schedule| schedule.after(&after).peekable())
            .collect();
        std::iter::from_fn(move || {
            let next = streams.iter_mut().filter_map(|s| s.peek().copied()).min()?;
            for stream in &mut streams {
                stream.next_if_eq(&next);
            }
            Some(next)
        })
    }
}

/// Rewrite a syntactically valid 5/6-column expression into one or two
/// expressions in the `sec min hour dom month dow` layout of the `cron` crate.
fn normalize(expression: &str) -> Result<Vec<String>, String> {
    let columns: Vec<&str> = expression.split(' ').collect();
    let (second, rest) = match columns.as_slice() {
        [rest @ ..] if rest.len() == 5 => ("0", rest),
        [rest @ .., second] if rest.len() == 5 => (*second, rest),
        _ => return Err(format!("expected 5 or 6 columns, got {}", columns.len())),
    };
    let (minute, hour, day_of_month, month) = (rest[0], rest[1], rest[2], rest[3]);
    let weekday = weekday_names(rest[4])?;
    let layout = |dom: &str, dow: &str| format!("{second} {minute} {hour} {dom} {month} {dow}");

    if day_of_month != "*" && weekday != "*" {
        Ok(vec![layout(day_of_month, "*"), layout("*", &weekday)])
    } else {
        Ok(vec![layout(day_of_month, &weekday)])
    }
}

/// Expand a numeric day-of-week column into an explicit list of day names.
fn weekday_names(column: &str) -> Result<String, String> {
    if column == "*" {
        return Ok(column.to_string());
    }
    let (base, step) = match column.split_once('/') {
        Some((base, step)) => (base, parse_num(step)?),
        None => (column, 1),
    };
    if step == 0 {
        return Err("step must be at least 1".into());
    }

    let mut days = BTreeSet::new();
    for item in base.split(',') {
        let (lo, hi) = match (item, item.split_once('-')) {
            ("*", _) => (0, 6),
            (_, Some((lo, hi))) => (parse_num(lo)?, parse_num(hi)?),
            // `n/step` runs from n to the end of the week
            (_, None) if column.contains('/') => (parse_num(item)?, 6),
            (_, None) => {
                let day = parse_num(item)?;
                (day, day)
            }
        };
        if hi > 7 || lo > hi {
            return Err(format!("bad day-of-week range '{item}'"));
        }
        days.extend((lo..=hi).step_by(step).map(|day| day % 7));
    }

    if days.len() == DAY_NAMES.len() {
        return Ok("*".to_string());
    }
    Ok(days
        .into_iter()
        .map(|day| DAY_NAMES[day])
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_num(s: &str) -> Result<usize, String> {
    s.parse().map_err(|_| format!("'{s}' is not a number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // 2024-03-01 is a Friday.
    fn at(d: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, s).unwrap()
    }

    #[test]
    fn hourly_mark_over_two_hours_yields_two_occurrences() {
        let cron = CronExpression::parse("42 * * * *").unwrap();
        let got: Vec<_> = cron.occurrences_in_range(at(1, 8, 30, 0), at(1, 10, 30, 0)).collect();
        assert_eq!(got, vec![at(1, 8, 42, 0), at(1, 9, 42, 0)]);
    }

    #[test]
    fn range_is_exclusive_at_start_and_inclusive_at_end() {
        let cron = CronExpression::parse("42 * * * *").unwrap();
        let got: Vec<_> = cron.occurrences_in_range(at(1, 8, 42, 0), at(1, 9, 42, 0)).collect();
        assert_eq!(got, vec![at(1, 9, 42, 0)]);
        assert_eq!(cron.occurrences_in_range(at(1, 9, 0, 0), at(1, 8, 0, 0)).count(), 0);
    }

    #[test]
    fn trailing_sixth_column_is_seconds() {
        let cron = CronExpression::parse("* * * * * 30").unwrap();
        assert_eq!(cron.next_occurrence(at(1, 8, 0, 0)), Some(at(1, 8, 0, 30)));
        assert_eq!(cron.next_occurrence(at(1, 8, 0, 30)), Some(at(1, 8, 1, 30)));
    }

    #[test]
    fn weekday_zero_and_seven_are_sunday() {
        for expr in ["0 12 * * 0", "0 12 * * 7"] {
            let cron = CronExpression::parse(expr).unwrap();
            assert_eq!(cron.next_occurrence(at(1, 0, 0, 0)), Some(at(3, 12, 0, 0)), "{expr}");
        }
    }

    #[test]
    fn weekday_ranges_use_conventional_numbering() {
        // Mon-Fri, asked on Friday afternoon -> next Monday
        let cron = CronExpression::parse("0 12 * * 1-5").unwrap();
        assert_eq!(cron.next_occurrence(at(1, 13, 0, 0)), Some(at(4, 12, 0, 0)));

        // Fri-Sun, asked on Friday afternoon -> Saturday
        let cron = CronExpression::parse("0 12 * * 5-7").unwrap();
        assert_eq!(cron.next_occurrence(at(1, 13, 0, 0)), Some(at(2, 12, 0, 0)));
    }

    #[test]
    fn weekday_column_expansion() {
        assert_eq!(weekday_names("*").unwrap(), "*");
        assert_eq!(weekday_names("1-5").unwrap(), "Mon,Tue,Wed,Thu,Fri");
        assert_eq!(weekday_names("*/2").unwrap(), "Sun,Tue,Thu,Sat");
        assert_eq!(weekday_names("0,7").unwrap(), "Sun");
        assert_eq!(weekday_names("3/2").unwrap(), "Wed,Fri");
        assert!(weekday_names("5-2").is_err());
        assert!(weekday_names("8").is_err());
    }

    #[test]
    fn restricted_day_of_month_or_weekday_either_fires() {
        // 1st of the month, or any Monday
        let cron = CronExpression::parse("0 12 1 * 1").unwrap();
        assert_eq!(cron.next_occurrence(at(1, 13, 0, 0)), Some(at(4, 12, 0, 0)));

        let got: Vec<_> = cron.occurrences_in_range(at(1, 0, 0, 0), at(31, 0, 0, 0)).collect();
        assert_eq!(
            got,
            vec![at(1, 12, 0, 0), at(4, 12, 0, 0), at(11, 12, 0, 0), at(18, 12, 0, 0), at(25, 12, 0, 0)]
        );
    }

    #[test]
    fn day_matching_both_fields_fires_once() {
        // 2024-04-01 is the 1st and a Monday.
        let cron = CronExpression::parse("0 12 1 * 1").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 4, 2, 0, 0, 0).unwrap();
        let got: Vec<_> = cron.occurrences_in_range(start, end).collect();
        assert_eq!(got, vec![Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()]);
    }

    #[test]
    fn unrestricted_weekday_keeps_day_of_month_only() {
        assert_eq!(normalize("0 12 15 * *").unwrap(), vec!["0 0 12 15 * *"]);
        assert_eq!(normalize("0 12 15 * */1").unwrap(), vec!["0 0 12 15 * *"]);
        assert_eq!(
            normalize("0 12 15 * 1 30").unwrap(),
            vec!["30 0 12 15 * *", "30 0 12 * * Mon"]
        );
    }

    #[test]
    fn rejects_what_the_evaluator_cannot_represent() {
        assert!(CronExpression::parse("61 * * * *").is_err());
        assert!(CronExpression::parse("* * 32 * *").is_err());
        assert!(CronExpression::parse("not a cron").is_err());
    }
}
