//! Occurrence expansion.
//!
//! Periods are numbered from the anchor: period `k` of a DAILY rule with INTERVAL=2 is the
//! day `anchor + 2k days`, and so on. Each period expands into a sorted list of
//! candidate instants; candidates are consumed in order until one lands after the
//! reference instant.

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, Timelike, Weekday};

use super::rule::{Frequency, RecurrenceRule, WeekdayNum};

/// Upper bound on consecutive periods without a candidate. Sub-daily rules jump over
/// days and hours that cannot match, so this only trips on rules that never produce
/// another instant.
const MAX_EMPTY_PERIODS: u32 = 100_000;

const MAX_YEAR: i64 = 9999;

enum Period {
    Candidates(Vec<NaiveDateTime>),
    /// Nothing here; resume at the given period index.
    Skip(i64),
    /// Out of the representable range.
    End,
}

pub(crate) fn next_after(
    rule: &RecurrenceRule,
    anchor: NaiveDateTime,
    after: NaiveDateTime,
) -> Option<NaiveDateTime> {
    let anchor = anchor.with_nanosecond(0)?;
    let until = rule.until.map(|u| u.naive_utc());
    if rule.count.is_some_and(|count| count <= 1) {
        return None;
    }
    if anchor > after {
        return match until {
            Some(until) if anchor > until => None,
            _ => Some(anchor),
        };
    }

    // The anchor is occurrence number one.
    let mut emitted: u64 = 1;
    let mut index = match rule.count {
        None => fast_forward(rule, anchor, after),
        Some(count) => match skip_counted(rule, anchor, after) {
            Some((index, skipped)) => {
                emitted = skipped;
                if emitted >= u64::from(count) {
                    return None;
                }
                index
            }
            None => 0,
        },
    };

    let mut empty_run: u32 = 0;
    loop {
        let candidates = match period(rule, anchor, index) {
            Period::End => return None,
            Period::Skip(next) => {
                empty_run += 1;
                if empty_run > MAX_EMPTY_PERIODS {
                    return None;
                }
                index = next;
                continue;
            }
            Period::Candidates(candidates) => candidates,
        };
        if candidates.is_empty() {
            empty_run += 1;
            if empty_run > MAX_EMPTY_PERIODS {
                return None;
            }
        } else {
            empty_run = 0;
        }
        for candidate in candidates {
            if candidate <= anchor {
                continue;
            }
            if until.is_some_and(|until| candidate > until) {
                return None;
            }
            emitted += 1;
            if rule.count.is_some_and(|count| emitted > u64::from(count)) {
                return None;
            }
            if candidate > after {
                return Some(candidate);
            }
        }
        index += 1;
    }
}

/// Jump for counted rules whose periods all hold the same number of candidates.
///
/// Returns the period to resume at and the number of occurrences, anchor included, in
/// the periods before it. Every skipped period ends at or before `after`. `None` when
/// the rule has filters that make period sizes vary, or there is nothing to skip.
fn skip_counted(
    rule: &RecurrenceRule,
    anchor: NaiveDateTime,
    after: NaiveDateTime,
) -> Option<(i64, u64)> {
    let per_period = uniform_period_size(rule)?;
    let target = fast_forward(rule, anchor, after);
    if target < 2 {
        return None;
    }
    // Period 0 may hold candidates at or before the anchor, so it is walked.
    let first = match period(rule, anchor, 0) {
        Period::Candidates(candidates) => candidates.iter().filter(|c| **c > anchor).count(),
        _ => return None,
    };
    let middle = u64::try_from(target - 1).ok()?.checked_mul(per_period)?;
    let emitted = 1u64.checked_add(u64::try_from(first).ok()?)?.checked_add(middle)?;
    Some((target, emitted))
}

/// Candidates per period after the first, when no filter can thin a period out.
fn uniform_period_size(rule: &RecurrenceRule) -> Option<u64> {
    if !rule.by_month.is_empty() || !rule.by_month_day.is_empty() {
        return None;
    }
    let n = |values: &[u32]| values.len().max(1) as u64;
    let times = n(&rule.by_hour) * n(&rule.by_minute) * n(&rule.by_second);
    match rule.freq {
        Frequency::Daily if rule.by_day.is_empty() => Some(times),
        Frequency::Weekly => {
            let mut weekdays: Vec<Weekday> = rule.by_day.iter().map(|wd| wd.weekday).collect();
            weekdays.sort_by_key(|wd| wd.num_days_from_monday());
            weekdays.dedup();
            Some(weekdays.len().max(1) as u64 * times)
        }
        Frequency::Hourly if rule.by_day.is_empty() && rule.by_hour.is_empty() => {
            Some(n(&rule.by_minute) * n(&rule.by_second))
        }
        Frequency::Minutely
            if rule.by_day.is_empty() && rule.by_hour.is_empty() && rule.by_minute.is_empty() =>
        {
            Some(n(&rule.by_second))
        }
        Frequency::Secondly
            if rule.by_day.is_empty()
                && rule.by_hour.is_empty()
                && rule.by_minute.is_empty()
                && rule.by_second.is_empty() =>
        {
            Some(1)
        }
        _ => None,
    }
}

/// Index of a period that starts at or before `after`, leaving one period of slack.
fn fast_forward(rule: &RecurrenceRule, anchor: NaiveDateTime, after: NaiveDateTime) -> i64 {
    let interval = i64::from(rule.interval);
    let elapsed = match rule.freq {
        Frequency::Yearly => i64::from(after.year() - anchor.year()),
        Frequency::Monthly => {
            i64::from(after.year() - anchor.year()) * 12 + i64::from(after.month0())
                - i64::from(anchor.month0())
        }
        Frequency::Weekly => {
            (after.date() - week_start(anchor.date(), rule.week_start)).num_days() / 7
        }
        Frequency::Daily => (after.date() - anchor.date()).num_days(),
        Frequency::Hourly | Frequency::Minutely | Frequency::Secondly => {
            let unit = rule.freq.unit_secs().unwrap_or(1);
            match truncate(anchor, rule.freq) {
                Some(base) => (after - base).num_seconds() / unit,
                None => 0,
            }
        }
    };
    (elapsed / interval - 1).max(0)
}

fn period(rule: &RecurrenceRule, anchor: NaiveDateTime, index: i64) -> Period {
    let step = index.saturating_mul(i64::from(rule.interval));
    match rule.freq {
        Frequency::Yearly => {
            let year = i64::from(anchor.year()) + step;
            match i32::try_from(year) {
                Ok(year) if year <= MAX_YEAR as i32 => {
                    Period::Candidates(with_times(rule, anchor, yearly_days(rule, anchor, year)))
                }
                _ => Period::End,
            }
        }
        Frequency::Monthly => {
            let months = i64::from(anchor.month0()) + step;
            let year = i64::from(anchor.year()) + months.div_euclid(12);
            let month = (months.rem_euclid(12) + 1) as u32;
            if year > MAX_YEAR {
                return Period::End;
            }
            if !rule.by_month.is_empty() && !rule.by_month.contains(&month) {
                return Period::Candidates(Vec::new());
            }
            let days = monthly_days(rule, anchor, year as i32, month);
            Period::Candidates(with_times(rule, anchor, days))
        }
        Frequency::Weekly => {
            let first = week_start(anchor.date(), rule.week_start);
            let Some(start) = add_days(first, step.saturating_mul(7)) else {
                return Period::End;
            };
            let days = (0..7)
                .filter_map(|offset| start.checked_add_days(Days::new(offset)))
                .filter(|date| {
                    if rule.by_day.is_empty() {
                        date.weekday() == anchor.weekday()
                    } else {
                        rule.by_day.iter().any(|wd| wd.weekday == date.weekday())
                    }
                })
                .filter(|date| month_filters_match(rule, *date))
                .collect();
            Period::Candidates(with_times(rule, anchor, days))
        }
        Frequency::Daily => {
            let Some(date) = add_days(anchor.date(), step) else {
                return Period::End;
            };
            let days = if day_matches(rule, date) { vec![date] } else { Vec::new() };
            Period::Candidates(with_times(rule, anchor, days))
        }
        Frequency::Hourly | Frequency::Minutely | Frequency::Secondly => {
            sub_daily_period(rule, anchor, index)
        }
    }
}

fn sub_daily_period(rule: &RecurrenceRule, anchor: NaiveDateTime, index: i64) -> Period {
    let unit = rule.freq.unit_secs().unwrap_or(1);
    let span = i64::from(rule.interval) * unit;
    let Some(base) = truncate(anchor, rule.freq) else {
        return Period::End;
    };
    let Some(start) = chrono::Duration::try_seconds(index.saturating_mul(span))
        .and_then(|offset| base.checked_add_signed(offset))
    else {
        return Period::End;
    };
    if start.year() > MAX_YEAR as i32 {
        return Period::End;
    }

    if let Some(boundary) = sub_daily_skip_to(rule, start) {
        let gap = (boundary - base).num_seconds();
        let next = (gap + span - 1).div_euclid(span);
        return Period::Skip(next.max(index + 1));
    }

    let seconds = fields_or(&rule.by_second, anchor.second());
    let candidates = match rule.freq {
        Frequency::Hourly => {
            let minutes = fields_or(&rule.by_minute, anchor.minute());
            minutes
                .iter()
                .flat_map(|m| seconds.iter().map(move |s| (*m, *s)))
                .filter_map(|(m, s)| start.date().and_hms_opt(start.hour(), m, s))
                .collect()
        }
        Frequency::Minutely => seconds
            .iter()
            .filter_map(|s| start.date().and_hms_opt(start.hour(), start.minute(), *s))
            .collect(),
        _ => {
            if rule.by_second.is_empty() || rule.by_second.contains(&start.second()) {
                vec![start]
            } else {
                Vec::new()
            }
        }
    };
    Period::Candidates(candidates)
}

/// For sub-daily rules, the next boundary worth looking at when the period starting at
/// `start` sits in a day, hour or minute the BY* filters exclude.
fn sub_daily_skip_to(rule: &RecurrenceRule, start: NaiveDateTime) -> Option<NaiveDateTime> {
    if !day_matches(rule, start.date()) {
        return start.date().succ_opt()?.and_hms_opt(0, 0, 0);
    }
    let hour_filtered = !rule.by_hour.is_empty() && !rule.by_hour.contains(&start.hour());
    if hour_filtered {
        let hour = start.date().and_hms_opt(start.hour(), 0, 0)?;
        return hour.checked_add_signed(chrono::Duration::hours(1));
    }
    let minute_filtered = rule.freq == Frequency::Secondly
        && !rule.by_minute.is_empty()
        && !rule.by_minute.contains(&start.minute());
    if minute_filtered {
        let minute = start.date().and_hms_opt(start.hour(), start.minute(), 0)?;
        return minute.checked_add_signed(chrono::Duration::minutes(1));
    }
    None
}

fn yearly_days(rule: &RecurrenceRule, anchor: NaiveDateTime, year: i32) -> Vec<NaiveDate> {
    if rule.by_month_day.is_empty() && rule.by_day.is_empty() {
        if rule.by_month.is_empty() {
            return NaiveDate::from_ymd_opt(year, anchor.month(), anchor.day())
                .into_iter()
                .collect();
        }
        return rule
            .by_month
            .iter()
            .filter_map(|month| NaiveDate::from_ymd_opt(year, *month, anchor.day()))
            .collect();
    }

    let Some(first) = NaiveDate::from_ymd_opt(year, 1, 1) else {
        return Vec::new();
    };
    first
        .iter_days()
        .take_while(|date| date.year() == year)
        .filter(|date| rule.by_month.is_empty() || rule.by_month.contains(&date.month()))
        .filter(|date| month_day_filter_matches(rule, *date))
        .filter(|date| {
            rule.by_day.is_empty()
                || rule.by_day.iter().any(|wd| {
                    // With BYMONTH, numbered weekdays count within the month.
                    if rule.by_month.is_empty() {
                        weekday_in_year_matches(*wd, *date)
                    } else {
                        weekday_in_month_matches(*wd, *date)
                    }
                })
        })
        .collect()
}

fn monthly_days(rule: &RecurrenceRule, anchor: NaiveDateTime, year: i32, month: u32) -> Vec<NaiveDate> {
    if rule.by_month_day.is_empty() && rule.by_day.is_empty() {
        return NaiveDate::from_ymd_opt(year, month, anchor.day())
            .into_iter()
            .collect();
    }
    (1..=days_in_month(year, month))
        .filter_map(|day| NaiveDate::from_ymd_opt(year, month, day))
        .filter(|date| month_day_filter_matches(rule, *date))
        .filter(|date| {
            rule.by_day.is_empty()
                || rule.by_day.iter().any(|wd| weekday_in_month_matches(*wd, *date))
        })
        .collect()
}

/// Day-level filters for DAILY and finer frequencies.
fn day_matches(rule: &RecurrenceRule, date: NaiveDate) -> bool {
    month_filters_match(rule, date)
        && (rule.by_day.is_empty() || rule.by_day.iter().any(|wd| wd.weekday == date.weekday()))
}

fn month_filters_match(rule: &RecurrenceRule, date: NaiveDate) -> bool {
    (rule.by_month.is_empty() || rule.by_month.contains(&date.month()))
        && month_day_filter_matches(rule, date)
}

fn month_day_filter_matches(rule: &RecurrenceRule, date: NaiveDate) -> bool {
    if rule.by_month_day.is_empty() {
        return true;
    }
    let len = days_in_month(date.year(), date.month()) as i32;
    let day = date.day() as i32;
    rule.by_month_day
        .iter()
        .any(|md| if *md > 0 { *md == day } else { len + md + 1 == day })
}

fn weekday_in_month_matches(wd: WeekdayNum, date: NaiveDate) -> bool {
    if wd.weekday != date.weekday() {
        return false;
    }
    let len = days_in_month(date.year(), date.month()) as i32;
    nth_matches(wd.ordinal, date.day() as i32, len)
}

fn weekday_in_year_matches(wd: WeekdayNum, date: NaiveDate) -> bool {
    if wd.weekday != date.weekday() {
        return false;
    }
    let len = if NaiveDate::from_ymd_opt(date.year(), 2, 29).is_some() { 366 } else { 365 };
    nth_matches(wd.ordinal, date.ordinal() as i32, len)
}

/// Whether day `pos` (1-based) of a span of `len` days is the `ordinal`-th occurrence
/// of its weekday, counting from the end when negative.
fn nth_matches(ordinal: Option<i8>, pos: i32, len: i32) -> bool {
    match ordinal {
        None => true,
        Some(n) if n > 0 => (pos - 1) / 7 + 1 == i32::from(n),
        Some(n) => -((len - pos) / 7 + 1) == i32::from(n),
    }
}

fn with_times(rule: &RecurrenceRule, anchor: NaiveDateTime, days: Vec<NaiveDate>) -> Vec<NaiveDateTime> {
    let hours = fields_or(&rule.by_hour, anchor.hour());
    let minutes = fields_or(&rule.by_minute, anchor.minute());
    let seconds = fields_or(&rule.by_second, anchor.second());
    let mut out = Vec::with_capacity(days.len() * hours.len() * minutes.len() * seconds.len());
    for date in days {
        for h in &hours {
            for m in &minutes {
                for s in &seconds {
                    if let Some(at) = date.and_hms_opt(*h, *m, *s) {
                        out.push(at);
                    }
                }
            }
        }
    }
    out
}

fn fields_or(values: &[u32], fallback: u32) -> Vec<u32> {
    if values.is_empty() {
        vec![fallback]
    } else {
        values.to_vec()
    }
}

fn truncate(at: NaiveDateTime, freq: Frequency) -> Option<NaiveDateTime> {
    match freq {
        Frequency::Hourly => at.date().and_hms_opt(at.hour(), 0, 0),
        Frequency::Minutely => at.date().and_hms_opt(at.hour(), at.minute(), 0),
        _ => at.with_nanosecond(0),
    }
}

fn week_start(date: NaiveDate, wkst: Weekday) -> NaiveDate {
    let back = (7 + date.weekday().num_days_from_monday() - wkst.num_days_from_monday()) % 7;
    date.checked_sub_days(Days::new(u64::from(back)))
        .unwrap_or(date)
}

fn add_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    let days = u64::try_from(days).ok()?;
    date.checked_add_days(Days::new(days))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}
