//! US equity market sessions and the poll interval each one implies.

use crate::config::CollectionIntervals;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::America::New_York;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketSession {
    /// 09:30 to 16:00 Eastern on a trading day.
    Regular,
    /// Pre-market 04:00 to 09:30 and after-hours 16:00 to 20:00.
    Extended,
    Closed,
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

pub fn session_at(now: DateTime<Utc>) -> MarketSession {
    let et = now.with_timezone(&New_York);
    if !is_trading_day(et.date_naive()) {
        return MarketSession::Closed;
    }
    let t = et.time();
    if t >= hm(9, 30) && t < hm(16, 0) {
        MarketSession::Regular
    } else if (t >= hm(4, 0) && t < hm(9, 30)) || (t >= hm(16, 0) && t < hm(20, 0)) {
        MarketSession::Extended
    } else {
        MarketSession::Closed
    }
}

pub fn current_session() -> MarketSession {
    session_at(Utc::now())
}

pub fn collection_interval(session: MarketSession, intervals: &CollectionIntervals) -> Duration {
    let secs = match session {
        | MarketSession::Regular => intervals.market_hours_secs,
        | MarketSession::Extended => intervals.extended_hours_secs,
        | MarketSession::Closed => intervals.off_hours_secs,
    };
    Duration::from_secs(secs)
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }?;
    let mut day = next_month.pred_opt()?;
    while day.weekday() != weekday {
        day = day.pred_opt()?;
    }
    Some(day)
}

/// Easter Sunday, anonymous Gregorian algorithm.
fn easter(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

/// Fixed-date holiday moved to Friday or Monday when it falls on a weekend.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        | Weekday::Sat => date - ChronoDuration::days(1),
        | Weekday::Sun => date + ChronoDuration::days(1),
        | _ => date,
    }
}

pub fn us_market_holidays(year: i32) -> BTreeSet<NaiveDate> {
    let fixed = |m, d| NaiveDate::from_ymd_opt(year, m, d);

    // New Year never moves back into the previous year.
    let new_year = fixed(1, 1).map(|d| match d.weekday() {
        | Weekday::Sat => d + ChronoDuration::days(2),
        | Weekday::Sun => d + ChronoDuration::days(1),
        | _ => d,
    });

    [
        new_year,
        nth_weekday(year, 1, Weekday::Mon, 3),
        nth_weekday(year, 2, Weekday::Mon, 3),
        easter(year).map(|e| e - ChronoDuration::days(2)),
        last_weekday(year, 5, Weekday::Mon),
        fixed(6, 19).map(observed),
        fixed(7, 4).map(observed),
        nth_weekday(year, 9, Weekday::Mon, 1),
        nth_weekday(year, 11, Weekday::Thu, 4),
        fixed(12, 25).map(observed),
    ]
    .into_iter()
    .flatten()
    .collect()
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

pub fn is_holiday(date: NaiveDate) -> bool {
    us_market_holidays(date.year()).contains(&date)
}

pub fn is_trading_day(date: NaiveDate) -> bool {
    !is_weekend(date) && !is_holiday(date)
}

pub fn next_trading_day(date: NaiveDate) -> NaiveDate {
    let mut day = date + ChronoDuration::days(1);
    while !is_trading_day(day) {
        day += ChronoDuration::days(1);
    }
    day
}

pub fn previous_trading_day(date: NaiveDate) -> NaiveDate {
    let mut day = date - ChronoDuration::days(1);
    while !is_trading_day(day) {
        day -= ChronoDuration::days(1);
    }
    day
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn et(y: i32, m: u32, day: u32, h: u32, min: u32) -> DateTime<Utc> {
        New_York.with_ymd_and_hms(y, m, day, h, min, 0).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn holidays_2024() {
        let h = us_market_holidays(2024);
        for date in [
            d(2024, 1, 1),
            d(2024, 1, 15),
            d(2024, 2, 19),
            d(2024, 3, 29),
            d(2024, 5, 27),
            d(2024, 6, 19),
            d(2024, 7, 4),
            d(2024, 9, 2),
            d(2024, 11, 28),
            d(2024, 12, 25),
        ] {
            assert!(h.contains(&date), "{date} missing");
        }
        assert_eq!(h.len(), 10);
    }

    #[test]
    fn weekend_observance() {
        // 2022-01-01 was a Saturday, 2023-01-01 a Sunday.
        assert!(is_holiday(d(2022, 1, 3)));
        assert!(is_holiday(d(2023, 1, 2)));
        // 2021-07-04 Sunday -> Monday, 2022-12-25 Sunday -> Monday, 2021-12-25 Saturday -> Friday
        assert!(is_holiday(d(2021, 7, 5)));
        assert!(is_holiday(d(2022, 12, 26)));
        assert!(is_holiday(d(2021, 12, 24)));
    }

    #[rstest]
    #[case(et(2024, 3, 5, 10, 0), MarketSession::Regular)]
    #[case(et(2024, 3, 5, 9, 29), MarketSession::Extended)]
    #[case(et(2024, 3, 5, 16, 0), MarketSession::Extended)]
    #[case(et(2024, 3, 5, 20, 0), MarketSession::Closed)]
    #[case(et(2024, 3, 5, 3, 59), MarketSession::Closed)]
    #[case(et(2024, 3, 9, 11, 0), MarketSession::Closed)]
    #[case(et(2024, 12, 25, 11, 0), MarketSession::Closed)]
    fn sessions(#[case] at: DateTime<Utc>, #[case] expected: MarketSession) {
        assert_eq!(session_at(at), expected);
    }

    #[test]
    fn intervals_follow_session() {
        let intervals = CollectionIntervals::default();
        assert_eq!(collection_interval(MarketSession::Regular, &intervals), Duration::from_secs(180));
        assert_eq!(collection_interval(MarketSession::Extended, &intervals), Duration::from_secs(600));
        assert_eq!(collection_interval(MarketSession::Closed, &intervals), Duration::from_secs(1800));
    }

    #[test]
    fn trading_day_navigation() {
        // Thursday before Good Friday 2024
        assert_eq!(next_trading_day(d(2024, 3, 28)), d(2024, 4, 1));
        assert_eq!(previous_trading_day(d(2024, 1, 16)), d(2024, 1, 12));
    }
}
