//! `YYYYMMDD` date-string helpers. The wire format never carries a typed date
//! — columns are strings (spec §3) — so these are pure string/`NaiveDate`
//! conversions, used by the planner and state queryer.

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Duration, Local, NaiveDate, Utc, Weekday};

pub fn parse(yyyymmdd: &str) -> Result<NaiveDate> {
    if yyyymmdd.len() != 8 || !yyyymmdd.bytes().all(|b| b.is_ascii_digit()) {
        bail!("not a YYYYMMDD date: {yyyymmdd}");
    }
    NaiveDate::parse_from_str(yyyymmdd, "%Y%m%d")
        .with_context(|| format!("parsing date {yyyymmdd}"))
}

pub fn year_of(yyyymmdd: &str) -> Result<u16> {
    Ok(parse(yyyymmdd)?.year() as u16)
}

pub fn is_valid(yyyymmdd: &str) -> bool {
    parse(yyyymmdd).is_ok()
}

pub fn add_days(yyyymmdd: &str, days: i64) -> Result<String> {
    let date = parse(yyyymmdd)?;
    let shifted = date
        .checked_add_signed(Duration::days(days))
        .with_context(|| format!("date overflow adding {days} days to {yyyymmdd}"))?;
    Ok(format(shifted))
}

pub fn format(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

pub fn today() -> String {
    format(Utc::now().date_naive())
}

/// Current hour of the local clock (0-23), consulted by the planner's
/// market-close time-of-day tie-break.
pub fn current_local_hour() -> u32 {
    use chrono::Timelike;
    Local::now().hour()
}

/// The most recent weekday on or before `date`: Saturday rolls back one day,
/// Sunday rolls back two. A deliberately simple trading-calendar stand-in —
/// exchange holidays are out of scope.
pub fn latest_weekday_on_or_before(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date - Duration::days(2),
        _ => date,
    }
}
