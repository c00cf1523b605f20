use super::error::CronError;
use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// How far ahead `next_after` looks before giving up.
const LOOKAHEAD_MINUTES: i64 = 24 * 60;

const MONTH_ALIASES: &[(&str, u32)] = &[
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

// Cron numbering; normalised to Monday = 0 after parsing.
const WEEKDAY_ALIASES: &[(&str, u32)] = &[
    ("sun", 0),
    ("mon", 1),
    ("tue", 2),
    ("wed", 3),
    ("thu", 4),
    ("fri", 5),
    ("sat", 6),
];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    // value used for `*` and open-ended steps
    wildcard_max: u32,
    aliases: &'static [(&'static str, u32)],
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    wildcard_max: 59,
    aliases: &[],
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    wildcard_max: 23,
    aliases: &[],
};
const DAY: FieldSpec = FieldSpec {
    name: "day",
    min: 1,
    max: 31,
    wildcard_max: 31,
    aliases: &[],
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    wildcard_max: 12,
    aliases: MONTH_ALIASES,
};
const WEEKDAY: FieldSpec = FieldSpec {
    name: "weekday",
    min: 0,
    max: 7,
    wildcard_max: 6,
    aliases: WEEKDAY_ALIASES,
};

/// A parsed 5-field cron expression: minute, hour, day-of-month, month,
/// weekday.
///
/// Weekdays are stored Monday = 0 through Sunday = 6. Day-of-month and
/// weekday must *both* match; POSIX cron would OR them when both are
/// restricted. Persisted expressions rely on the AND behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minute: BTreeSet<u32>,
    hour: BTreeSet<u32>,
    day: BTreeSet<u32>,
    month: BTreeSet<u32>,
    weekday: BTreeSet<u32>,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, day, month, weekday] = parts.as_slice() else {
            return Err(CronError::FieldCount(parts.len()));
        };

        let weekday = parse_field(weekday, &WEEKDAY)?
            .into_iter()
            .map(cron_weekday_to_monday_based)
            .collect();

        Ok(Self {
            source: parts.join(" "),
            minute: parse_field(minute, &MINUTE)?,
            hour: parse_field(hour, &HOUR)?,
            day: parse_field(day, &DAY)?,
            month: parse_field(month, &MONTH)?,
            weekday,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches<T: Datelike + Timelike>(&self, t: &T) -> bool {
        self.minute.contains(&t.minute())
            && self.hour.contains(&t.hour())
            && self.day.contains(&t.day())
            && self.month.contains(&t.month())
            && self.weekday.contains(&t.weekday().num_days_from_monday())
    }

    /// First matching minute strictly after `from`, searching one day ahead.
    pub fn next_after(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        let start = from.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        (0..LOOKAHEAD_MINUTES)
            .map(|i| start + Duration::minutes(i))
            .find(|candidate| self.matches(candidate))
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn cron_weekday_to_monday_based(v: u32) -> u32 {
    match v {
        0 | 7 => 6,
        n => n - 1,
    }
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<BTreeSet<u32>, CronError> {
    let mut values = BTreeSet::new();
    for part in field.split(',').map(str::trim) {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = parse_number(step, spec)?;
                if step == 0 {
                    return Err(CronError::ZeroStep { field: spec.name });
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.wildcard_max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let v = parse_value(range, spec)?;
            // `5/15` means "from 5 to the end of the field, every 15"
            if step.is_some() {
                (v, spec.wildcard_max.max(v))
            } else {
                (v, v)
            }
        };

        if start > end {
            return Err(CronError::InvertedRange {
                field: spec.name,
                start,
                end,
            });
        }
        values.extend((start..=end).step_by(step.unwrap_or(1) as usize));
    }
    Ok(values)
}

fn parse_value(token: &str, spec: &FieldSpec) -> Result<u32, CronError> {
    let lower = token.trim().to_ascii_lowercase();
    if let Some((_, v)) = spec.aliases.iter().find(|(name, _)| *name == lower) {
        return Ok(*v);
    }
    let v = parse_number(&lower, spec)?;
    if v < spec.min || v > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value: v,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(v)
}

fn parse_number(token: &str, spec: &FieldSpec) -> Result<u32, CronError> {
    token.trim().parse().map_err(|_| CronError::InvalidValue {
        field: spec.name,
        value: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn every_fifteen_minutes() {
        let cron = CronExpression::parse("*/15 * * * *").unwrap();
        for minute in 0..60 {
            assert_eq!(
                cron.matches(&at(2024, 5, 8, 10, minute)),
                minute % 15 == 0,
                "minute {minute}"
            );
        }
    }

    #[test]
    fn weekday_ranges_are_normalised() {
        // 2024-05-08 is a Wednesday, 2024-05-11 a Saturday, 2024-05-12 a Sunday
        let weekdays = CronExpression::parse("0 9 * * 1-5").unwrap();
        assert!(weekdays.matches(&at(2024, 5, 8, 9, 0)));
        assert!(!weekdays.matches(&at(2024, 5, 11, 9, 0)));
        assert!(!weekdays.matches(&at(2024, 5, 12, 9, 0)));

        for expr in ["0 9 * * 0", "0 9 * * 7", "0 9 * * sun", "0 9 * * SUN"] {
            let cron = CronExpression::parse(expr).unwrap();
            assert!(cron.matches(&at(2024, 5, 12, 9, 0)), "{expr}");
            assert!(!cron.matches(&at(2024, 5, 11, 9, 0)), "{expr}");
        }

        let everyday = CronExpression::parse("0 9 * * 0-6").unwrap();
        for day in 6..=12 {
            assert!(everyday.matches(&at(2024, 5, day, 9, 0)));
        }

        let mon_wed = CronExpression::parse("0 9 * * mon-wed").unwrap();
        assert!(mon_wed.matches(&at(2024, 5, 6, 9, 0)));
        assert!(mon_wed.matches(&at(2024, 5, 8, 9, 0)));
        assert!(!mon_wed.matches(&at(2024, 5, 9, 9, 0)));
    }

    #[test]
    fn lists_steps_and_month_aliases() {
        let cron = CronExpression::parse("0,30 8-18/2 1 jan,jul *").unwrap();
        assert!(cron.matches(&at(2024, 1, 1, 8, 30)));
        assert!(cron.matches(&at(2024, 7, 1, 18, 0)));
        assert!(!cron.matches(&at(2024, 7, 1, 9, 0)));
        assert!(!cron.matches(&at(2024, 2, 1, 8, 0)));
    }

    #[test]
    fn day_and_weekday_must_both_match() {
        // 2024-05-13 is a Monday
        let cron = CronExpression::parse("0 0 13 * 1").unwrap();
        assert!(cron.matches(&at(2024, 5, 13, 0, 0)));
        assert!(!cron.matches(&at(2024, 6, 13, 0, 0)));
        assert!(!cron.matches(&at(2024, 5, 20, 0, 0)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(
            CronExpression::parse("* * *"),
            Err(CronError::FieldCount(3))
        );
        assert!(matches!(
            CronExpression::parse("60 * * * *"),
            Err(CronError::OutOfRange { field: "minute", .. })
        ));
        assert!(matches!(
            CronExpression::parse("*/0 * * * *"),
            Err(CronError::ZeroStep { .. })
        ));
        assert!(matches!(
            CronExpression::parse("10-5 * * * *"),
            Err(CronError::InvertedRange { .. })
        ));
        assert!(matches!(
            CronExpression::parse("* * * foo *"),
            Err(CronError::InvalidValue { field: "month", .. })
        ));
    }

    #[test]
    fn next_after_scans_forward() {
        let cron = CronExpression::parse("30 9 * * *").unwrap();
        let from = at(2024, 5, 8, 9, 30);
        assert_eq!(cron.next_after(from), Some(at(2024, 5, 9, 9, 30)));
        assert_eq!(cron.next_after(at(2024, 5, 8, 8, 0)), Some(at(2024, 5, 8, 9, 30)));

        let feb30 = CronExpression::parse("0 0 30 2 *").unwrap();
        assert_eq!(feb30.next_after(from), None);
    }
}
