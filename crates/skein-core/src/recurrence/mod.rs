//! Recurrence expander.
//!
//! A pure function from (rule, series anchor, reference instant) to the next occurrence
//! strictly after the reference instant. The supported RFC 5545 subset covers
//! reminders and digests: FREQ (SECONDLY..YEARLY), INTERVAL, COUNT, UNTIL, BYSECOND,
//! BYMINUTE, BYHOUR, BYDAY, BYMONTHDAY, BYMONTH and WKST. Everything is evaluated in UTC.
//!
//! ```ignore
//! let rule: RecurrenceRule = "FREQ=DAILY;BYHOUR=8;BYMINUTE=30".parse()?;
//! let next = rule.next_after(series_start, Utc::now());
//! ```

mod expand;
mod rule;

pub use rule::{Frequency, RecurrenceParseError, RecurrenceRule, WeekdayNum};

use chrono::{DateTime, Utc};

impl RecurrenceRule {
    /// First occurrence strictly after `after`, for a series that started at `anchor`.
    ///
    /// The anchor is always occurrence number one, and `COUNT` includes it. Returns
    /// `None` once `COUNT` or `UNTIL` is exhausted, or when the rule can never produce
    /// another instant.
    pub fn next_after(&self, anchor: DateTime<Utc>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        expand::next_after(self, anchor.naive_utc(), after.naive_utc()).map(|at| at.and_utc())
    }
}

/// Parses `rule` and returns its next occurrence after `after`.
pub fn next_occurrence(
    rule: &str,
    anchor: DateTime<Utc>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, RecurrenceParseError> {
    let rule: RecurrenceRule = rule.parse()?;
    Ok(rule.next_after(anchor, after))
}
