//! RRULE parsing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc, Weekday};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    fn parse(value: &str) -> Option<Self> {
        Some(match value.to_ascii_uppercase().as_str() {
            "SECONDLY" => Frequency::Secondly,
            "MINUTELY" => Frequency::Minutely,
            "HOURLY" => Frequency::Hourly,
            "DAILY" => Frequency::Daily,
            "WEEKLY" => Frequency::Weekly,
            "MONTHLY" => Frequency::Monthly,
            "YEARLY" => Frequency::Yearly,
            _ => return None,
        })
    }

    /// Length of one step for the sub-daily frequencies, in seconds.
    pub(crate) fn unit_secs(self) -> Option<i64> {
        match self {
            Frequency::Secondly => Some(1),
            Frequency::Minutely => Some(60),
            Frequency::Hourly => Some(3600),
            _ => None,
        }
    }
}

/// One `BYDAY` entry, e.g. `MO`, `2TU`, `-1FR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekdayNum {
    pub ordinal: Option<i8>,
    pub weekday: Weekday,
}

/// A parsed RFC 5545 recurrence rule.
///
/// All times are UTC. Empty `by_*` lists mean "not constrained"; the expander then
/// takes the missing fields from the series anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub freq: Frequency,
    pub interval: u32,
    pub count: Option<u32>,
    pub until: Option<DateTime<Utc>>,
    pub by_second: Vec<u32>,
    pub by_minute: Vec<u32>,
    pub by_hour: Vec<u32>,
    pub by_day: Vec<WeekdayNum>,
    pub by_month_day: Vec<i32>,
    pub by_month: Vec<u32>,
    pub week_start: Weekday,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecurrenceParseError {
    #[error("recurrence rule is empty")]
    Empty,

    #[error("recurrence rule has no FREQ")]
    MissingFreq,

    #[error("malformed rule part '{0}', expected KEY=VALUE")]
    MalformedPart(String),

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("{0} appears more than once")]
    DuplicatePart(String),

    #[error("{0} is not supported")]
    Unsupported(String),

    #[error("unknown rule part {0}")]
    UnknownPart(String),

    #[error("COUNT and UNTIL cannot be combined")]
    CountWithUntil,
}

fn invalid(key: &str, value: &str) -> RecurrenceParseError {
    RecurrenceParseError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

impl FromStr for RecurrenceRule {
    type Err = RecurrenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut body = s.trim();
        if body.get(..6).is_some_and(|p| p.eq_ignore_ascii_case("RRULE:")) {
            body = &body[6..];
        }
        if body.trim().is_empty() {
            return Err(RecurrenceParseError::Empty);
        }

        let mut seen: Vec<String> = Vec::new();
        let mut freq = None;
        let mut rule = RecurrenceRule {
            freq: Frequency::Daily,
            interval: 1,
            count: None,
            until: None,
            by_second: Vec::new(),
            by_minute: Vec::new(),
            by_hour: Vec::new(),
            by_day: Vec::new(),
            by_month_day: Vec::new(),
            by_month: Vec::new(),
            week_start: Weekday::Mon,
        };

        for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| RecurrenceParseError::MalformedPart(part.to_string()))?;
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();
            if seen.contains(&key) {
                return Err(RecurrenceParseError::DuplicatePart(key));
            }
            seen.push(key.clone());

            match key.as_str() {
                "FREQ" => {
                    freq = Some(Frequency::parse(value).ok_or_else(|| invalid(&key, value))?);
                }
                "INTERVAL" => rule.interval = parse_positive(&key, value)?,
                "COUNT" => rule.count = Some(parse_positive(&key, value)?),
                "UNTIL" => rule.until = Some(parse_until(value).ok_or_else(|| invalid(&key, value))?),
                "BYSECOND" => rule.by_second = parse_sorted(&key, value, |v| in_range(v, 0, 59))?,
                "BYMINUTE" => rule.by_minute = parse_sorted(&key, value, |v| in_range(v, 0, 59))?,
                "BYHOUR" => rule.by_hour = parse_sorted(&key, value, |v| in_range(v, 0, 23))?,
                "BYMONTH" => rule.by_month = parse_sorted(&key, value, |v| in_range(v, 1, 12))?,
                "BYMONTHDAY" => rule.by_month_day = parse_sorted(&key, value, parse_month_day)?,
                "BYDAY" => rule.by_day = parse_list(&key, value, parse_weekday_num)?,
                "WKST" => rule.week_start = parse_weekday(value).ok_or_else(|| invalid(&key, value))?,
                "BYSETPOS" | "BYWEEKNO" | "BYYEARDAY" => {
                    return Err(RecurrenceParseError::Unsupported(key));
                }
                _ => return Err(RecurrenceParseError::UnknownPart(key)),
            }
        }

        rule.freq = freq.ok_or(RecurrenceParseError::MissingFreq)?;
        if rule.count.is_some() && rule.until.is_some() {
            return Err(RecurrenceParseError::CountWithUntil);
        }
        // Numbered weekdays only mean something inside a month or a year.
        if !matches!(rule.freq, Frequency::Monthly | Frequency::Yearly)
            && let Some(numbered) = rule.by_day.iter().find(|wd| wd.ordinal.is_some())
        {
            return Err(invalid(
                "BYDAY",
                &format!("{}{:?}", numbered.ordinal.unwrap_or_default(), numbered.weekday),
            ));
        }
        Ok(rule)
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u32, RecurrenceParseError> {
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(key, value)),
    }
}

fn in_range(value: &str, min: u32, max: u32) -> Option<u32> {
    value.parse::<u32>().ok().filter(|n| (min..=max).contains(n))
}

fn parse_month_day(value: &str) -> Option<i32> {
    value
        .parse::<i32>()
        .ok()
        .filter(|n| *n != 0 && (-31..=31).contains(n))
}

fn parse_list<T>(
    key: &str,
    value: &str,
    item: impl Fn(&str) -> Option<T>,
) -> Result<Vec<T>, RecurrenceParseError> {
    value
        .split(',')
        .map(|raw| item(raw.trim()).ok_or_else(|| invalid(key, raw)))
        .collect()
}

fn parse_sorted<T: Ord>(
    key: &str,
    value: &str,
    item: impl Fn(&str) -> Option<T>,
) -> Result<Vec<T>, RecurrenceParseError> {
    let mut values = parse_list(key, value, item)?;
    values.sort();
    values.dedup();
    Ok(values)
}

pub(crate) fn parse_weekday(value: &str) -> Option<Weekday> {
    Some(match value.to_ascii_uppercase().as_str() {
        "MO" => Weekday::Mon,
        "TU" => Weekday::Tue,
        "WE" => Weekday::Wed,
        "TH" => Weekday::Thu,
        "FR" => Weekday::Fri,
        "SA" => Weekday::Sat,
        "SU" => Weekday::Sun,
        _ => return None,
    })
}

fn parse_weekday_num(value: &str) -> Option<WeekdayNum> {
    if !value.is_ascii() || value.len() < 2 {
        return None;
    }
    let (ordinal, day) = value.split_at(value.len() - 2);
    let weekday = parse_weekday(day)?;
    let ordinal = match ordinal {
        "" => None,
        raw => {
            let n = raw.parse::<i8>().ok()?;
            if n == 0 || !(-53..=53).contains(&n) {
                return None;
            }
            Some(n)
        }
    };
    Some(WeekdayNum { ordinal, weekday })
}

/// `YYYYMMDD`, `YYYYMMDDTHHMMSS` or `YYYYMMDDTHHMMSSZ`, all read as UTC.
fn parse_until(value: &str) -> Option<DateTime<Utc>> {
    if value.len() == 8 {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    let raw = value.strip_suffix('Z').unwrap_or(value);
    NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S")
        .ok()
        .map(|dt| dt.and_utc())
}
