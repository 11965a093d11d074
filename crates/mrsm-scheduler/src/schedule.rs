//! Schedule expression grammar (spec §4.7): clauses joined by `&` (all
//! match) or `|` (any matches), with optional `starting <datetime or
//! relative>` and `rounded <interval>` modifiers. AND binds tighter than
//! OR, so `daily & weekday | hourly` parses as `(daily & weekday) |
//! (hourly)`.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use mrsm_core::error::{MrsmError, Result};
use std::str::FromStr;

/// A single time unit recognized by `every N <unit>` clauses and
/// relative-time expressions (`3 days ago`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    fn parse(s: &str) -> Option<Self> {
        let s = s.trim_end_matches('s');
        Some(match s {
            "second" | "sec" => TimeUnit::Seconds,
            "minute" | "min" => TimeUnit::Minutes,
            "hour" | "hr" => TimeUnit::Hours,
            "day" => TimeUnit::Days,
            "week" => TimeUnit::Weeks,
            "month" => TimeUnit::Months,
            "year" => TimeUnit::Years,
            _ => return None,
        })
    }

    /// Approximate fixed duration for this unit. `months`/`years` use a
    /// calendar-aware step in [`shift`] rather than this constant, since
    /// their lengths vary.
    fn approx_duration(self) -> Duration {
        match self {
            TimeUnit::Seconds => Duration::seconds(1),
            TimeUnit::Minutes => Duration::minutes(1),
            TimeUnit::Hours => Duration::hours(1),
            TimeUnit::Days => Duration::days(1),
            TimeUnit::Weeks => Duration::weeks(1),
            TimeUnit::Months => Duration::days(30),
            TimeUnit::Years => Duration::days(365),
        }
    }

    fn shift(self, dt: DateTime<Utc>, n: i64) -> DateTime<Utc> {
        match self {
            TimeUnit::Months => {
                let total_months = dt.month0() as i64 + dt.year() as i64 * 12 + n;
                let year = (total_months.div_euclid(12)) as i32;
                let month0 = total_months.rem_euclid(12) as u32;
                dt.with_year(year)
                    .and_then(|d| d.with_month0(month0))
                    .unwrap_or(dt)
            }
            TimeUnit::Years => dt.with_year(dt.year() + n as i32).unwrap_or(dt),
            other => dt + other.approx_duration() * (n as i32),
        }
    }
}

/// A single clause of a schedule expression.
#[derive(Debug, Clone)]
pub enum Clause {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    /// A weekday range, e.g. `mon-fri` (0 = Monday .. 6 = Sunday).
    WeekdayRange(u8, u8),
    Every { n: i64, unit: TimeUnit },
    CronLike(cron::Schedule),
}

impl Clause {
    /// Parse one clause (no `&`/`|` in it).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "hourly" => return Ok(Clause::Hourly),
            "daily" => return Ok(Clause::Daily),
            "weekly" => return Ok(Clause::Weekly),
            "monthly" => return Ok(Clause::Monthly),
            _ => {}
        }
        if let Some(range) = parse_weekday_range(s) {
            return Ok(Clause::WeekdayRange(range.0, range.1));
        }
        if let Some(rest) = s.strip_prefix("every ") {
            let mut parts = rest.split_whitespace();
            let n: i64 = parts
                .next()
                .ok_or_else(|| MrsmError::InvalidSchedule(s.to_string(), "missing interval count".into()))?
                .parse()
                .map_err(|_| MrsmError::InvalidSchedule(s.to_string(), "interval count is not a number".into()))?;
            let unit_str = parts
                .next()
                .ok_or_else(|| MrsmError::InvalidSchedule(s.to_string(), "missing interval unit".into()))?;
            let unit = TimeUnit::parse(unit_str)
                .ok_or_else(|| MrsmError::InvalidSchedule(s.to_string(), format!("unrecognized unit '{unit_str}'")))?;
            return Ok(Clause::Every { n, unit });
        }
        if let Some(rest) = s.strip_prefix("cron-like ") {
            let schedule = cron::Schedule::from_str(rest.trim())
                .map_err(|e| MrsmError::InvalidSchedule(s.to_string(), e.to_string()))?;
            return Ok(Clause::CronLike(schedule));
        }
        Err(MrsmError::InvalidSchedule(s.to_string(), "unrecognized clause".into()))
    }

    /// Whether `dt` satisfies this clause exactly (to the second).
    fn matches(&self, dt: DateTime<Utc>) -> bool {
        match self {
            Clause::Hourly => dt.minute() == 0 && dt.second() == 0,
            Clause::Daily => dt.hour() == 0 && dt.minute() == 0 && dt.second() == 0,
            Clause::Weekly => {
                dt.weekday().num_days_from_monday() == 0 && dt.hour() == 0 && dt.minute() == 0 && dt.second() == 0
            }
            Clause::Monthly => dt.day() == 1 && dt.hour() == 0 && dt.minute() == 0 && dt.second() == 0,
            Clause::WeekdayRange(start, end) => {
                let day = dt.weekday().num_days_from_monday() as u8;
                in_weekday_range(day, *start, *end) && dt.hour() == 0 && dt.minute() == 0 && dt.second() == 0
            }
            Clause::Every { .. } => true, // stateless re-check isn't meaningful; handled via next_after.
            Clause::CronLike(schedule) => schedule.includes(dt),
        }
    }

    /// The next candidate instant strictly after `after` for this clause
    /// alone (ignoring siblings in an AND group).
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Clause::Hourly => Some(truncate_to_hour(after) + Duration::hours(1)),
            Clause::Daily => Some(truncate_to_day(after) + Duration::days(1)),
            Clause::Weekly => {
                let midnight = truncate_to_day(after);
                let days_from_monday = midnight.weekday().num_days_from_monday() as i64;
                let mut next = midnight - Duration::days(days_from_monday) + Duration::weeks(1);
                while next <= after {
                    next += Duration::weeks(1);
                }
                Some(next)
            }
            Clause::Monthly => {
                let midnight = truncate_to_day(after);
                let mut next = TimeUnit::Months.shift(midnight.with_day(1)?, 1);
                while next <= after {
                    next = TimeUnit::Months.shift(next, 1);
                }
                Some(next)
            }
            Clause::WeekdayRange(start, end) => {
                let mut candidate = truncate_to_day(after) + Duration::days(1);
                for _ in 0..8 {
                    let day = candidate.weekday().num_days_from_monday() as u8;
                    if in_weekday_range(day, *start, *end) {
                        return Some(candidate);
                    }
                    candidate += Duration::days(1);
                }
                None
            }
            Clause::Every { n, unit } => Some(unit.shift(after, *n)),
            Clause::CronLike(schedule) => schedule.after(&after).next(),
        }
    }
}

fn truncate_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_minute(0).unwrap().with_second(0).unwrap().with_nanosecond(0).unwrap()
}

fn truncate_to_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_hour(0).unwrap().with_minute(0).unwrap().with_second(0).unwrap().with_nanosecond(0).unwrap()
}

fn in_weekday_range(day: u8, start: u8, end: u8) -> bool {
    if start <= end {
        (start..=end).contains(&day)
    } else {
        day >= start || day <= end
    }
}

fn weekday_index(name: &str) -> Option<u8> {
    Some(match name {
        "mon" => 0,
        "tue" => 1,
        "wed" => 2,
        "thu" => 3,
        "fri" => 4,
        "sat" => 5,
        "sun" => 6,
        _ => return None,
    })
}

fn parse_weekday_range(s: &str) -> Option<(u8, u8)> {
    let (a, b) = s.split_once('-')?;
    Some((weekday_index(a)?, weekday_index(b)?))
}

/// A full schedule expression: OR-of-ANDs plus `starting`/`rounded`
/// modifiers (spec §4.7).
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Outer vec is OR'd, inner vec is AND'd.
    groups: Vec<Vec<Clause>>,
    pub starting: Option<DateTime<Utc>>,
    pub rounded: Option<Duration>,
    /// The raw expression as written, preserved so CLI-parsed relative
    /// times (`starting in 30 seconds`) re-evaluate at each firing
    /// rather than freezing at parse time (spec §4.7 "Relative times").
    pub raw: String,
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let raw = expr.to_string();
        let mut rest = expr.trim();
        let mut starting = None;
        let mut rounded = None;

        if let Some(idx) = rest.find(" rounded ") {
            let (head, tail) = rest.split_at(idx);
            let duration_str = tail.trim_start_matches(" rounded ").trim();
            rounded = Some(parse_duration_phrase(duration_str)?);
            rest = head.trim();
        }
        if let Some(idx) = rest.find(" starting ") {
            let (head, tail) = rest.split_at(idx);
            let when_str = tail.trim_start_matches(" starting ").trim();
            starting = Some(parse_datetime_phrase(when_str)?);
            rest = head.trim();
        }

        let groups = rest
            .split('|')
            .map(|group| {
                group
                    .split('&')
                    .map(Clause::parse)
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { groups, starting, rounded, raw })
    }

    /// The next firing time strictly after `after`, honoring `starting`
    /// and `rounded`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let floor = self.starting.map(|s| after.max(s - Duration::seconds(1))).unwrap_or(after);
        let mut best: Option<DateTime<Utc>> = None;
        for group in &self.groups {
            if let Some(candidate) = next_for_group(group, floor) {
                best = Some(match best {
                    Some(b) => b.min(candidate),
                    None => candidate,
                });
            }
        }
        let next = best?;
        Some(match self.rounded {
            Some(interval) => round_up(next, interval),
            None => next,
        })
    }

    /// The next `n` firing times after `after`, for `show schedule`
    /// (spec §4.7).
    pub fn upcoming(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(n);
        let mut cursor = after;
        for _ in 0..n {
            match self.next_fire_after(cursor) {
                Some(t) => {
                    out.push(t);
                    cursor = t;
                }
                None => break,
            }
        }
        out
    }
}

/// Finds the next instant after `floor` that satisfies every clause in
/// an AND group: steps the first clause's candidates forward, checking
/// the rest with `matches`, bounded to avoid looping forever on an
/// unsatisfiable combination (e.g. `monthly & hourly`).
fn next_for_group(group: &[Clause], floor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (first, rest) = group.split_first()?;
    let mut candidate = first.next_after(floor)?;
    for _ in 0..10_000 {
        if rest.iter().all(|c| c.matches(candidate)) {
            return Some(candidate);
        }
        candidate = first.next_after(candidate)?;
    }
    None
}

fn round_up(dt: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let interval_secs = interval.num_seconds().max(1);
    let epoch_secs = dt.timestamp();
    let rounded_secs = ((epoch_secs + interval_secs - 1) / interval_secs) * interval_secs;
    DateTime::from_timestamp(rounded_secs, 0).unwrap_or(dt)
}

/// Parses `starting`'s operand: either an absolute RFC3339 datetime or a
/// relative phrase like `in 30 seconds`/`3 days ago` (spec §4.7).
pub fn parse_datetime_phrase(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Some(rest) = s.strip_prefix("in ") {
        let dur = parse_duration_phrase(rest)?;
        return Ok(Utc::now() + dur);
    }
    if let Some(rest) = s.strip_suffix(" ago") {
        let dur = parse_duration_phrase(rest)?;
        return Ok(Utc::now() - dur);
    }
    Err(MrsmError::InvalidSchedule(s.to_string(), "unrecognized relative or absolute datetime".into()))
}

/// Parses a bare `N <unit>` duration phrase, optionally followed by
/// `rounded <interval>` (spec §4.7: `'1 month ago rounded 1 day'`).
pub fn parse_duration_phrase(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (main, _rounding) = match s.find(" rounded ") {
        Some(idx) => (s[..idx].trim(), Some(s[idx..].trim())),
        None => (s, None),
    };
    let mut parts = main.split_whitespace();
    let n: i64 = parts
        .next()
        .ok_or_else(|| MrsmError::InvalidSchedule(s.to_string(), "missing duration count".into()))?
        .parse()
        .map_err(|_| MrsmError::InvalidSchedule(s.to_string(), "duration count is not a number".into()))?;
    let unit_str = parts
        .next()
        .ok_or_else(|| MrsmError::InvalidSchedule(s.to_string(), "missing duration unit".into()))?;
    let unit = TimeUnit::parse(unit_str)
        .ok_or_else(|| MrsmError::InvalidSchedule(s.to_string(), format!("unrecognized unit '{unit_str}'")))?;
    Ok(match unit {
        TimeUnit::Months => Duration::days(30 * n),
        TimeUnit::Years => Duration::days(365 * n),
        other => other.approx_duration() * n as i32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_fires_at_next_midnight() {
        let schedule = Schedule::parse("daily").unwrap();
        let now = "2026-07-28T15:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = schedule.next_fire_after(now).unwrap();
        assert_eq!(next, "2026-07-29T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn hourly_fires_at_next_hour() {
        let schedule = Schedule::parse("hourly").unwrap();
        let now = "2026-07-28T15:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = schedule.next_fire_after(now).unwrap();
        assert_eq!(next, "2026-07-28T16:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn every_n_seconds_steps_forward() {
        let schedule = Schedule::parse("every 10 seconds").unwrap();
        let now = "2026-07-28T15:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = schedule.next_fire_after(now).unwrap();
        assert_eq!(next, now + Duration::seconds(10));
    }

    #[test]
    fn weekday_range_skips_weekend() {
        let schedule = Schedule::parse("mon-fri").unwrap();
        // 2026-08-01 is a Saturday.
        let saturday = "2026-08-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = schedule.next_fire_after(saturday).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
    }

    #[test]
    fn or_takes_the_earliest_branch() {
        let schedule = Schedule::parse("daily | hourly").unwrap();
        let now = "2026-07-28T15:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = schedule.next_fire_after(now).unwrap();
        // hourly fires sooner than the next midnight.
        assert_eq!(next, "2026-07-28T16:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn starting_delays_first_firing() {
        let schedule = Schedule::parse("hourly starting 2026-07-29T00:00:00Z").unwrap();
        let now = "2026-07-28T15:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = schedule.next_fire_after(now).unwrap();
        assert!(next >= "2026-07-29T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn rounded_snaps_to_interval_boundary() {
        let schedule = Schedule::parse("every 1 minutes rounded 1 hours").unwrap();
        let now = "2026-07-28T15:30:10Z".parse::<DateTime<Utc>>().unwrap();
        let next = schedule.next_fire_after(now).unwrap();
        assert_eq!(next.minute(), 0);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn invalid_clause_is_rejected() {
        assert!(Schedule::parse("whenever").is_err());
    }

    #[test]
    fn duration_phrase_parses_relative_ago() {
        let dur = parse_duration_phrase("3 days").unwrap();
        assert_eq!(dur, Duration::days(3));
    }

    #[test]
    fn upcoming_returns_n_firings_in_order() {
        let schedule = Schedule::parse("hourly").unwrap();
        let now = "2026-07-28T15:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let firings = schedule.upcoming(now, 3);
        assert_eq!(firings.len(), 3);
        assert!(firings.windows(2).all(|w| w[0] < w[1]));
    }
}
