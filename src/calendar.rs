//! Calendar-date normalization.
//!
//! Every date handed to a query becomes an inclusive instant window from
//! local midnight to the last millisecond of the day, in the campus offset.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};

use crate::error::{CoreError, Result};

/// Inclusive `[start, end]` window in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Inclusive range of calendar dates. Only constructible in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(CoreError::validation(format!(
                "malformed date range: {start} is after {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampusCalendar {
    offset: FixedOffset,
}

impl CampusCalendar {
    pub fn new(utc_offset_minutes: i32) -> Result<Self> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
            CoreError::validation(format!("invalid UTC offset: {utc_offset_minutes} minutes"))
        })?;
        Ok(Self { offset })
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Local midnight of `date` as a UTC instant.
    pub fn midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = date.and_time(NaiveTime::default());
        (local - self.offset_duration()).and_utc()
    }

    pub fn day(&self, date: NaiveDate) -> DayWindow {
        self.window(DateRange::single(date))
    }

    pub fn window(&self, range: DateRange) -> DayWindow {
        let start = self.midnight(range.start);
        let end = self.midnight(range.end) + Duration::days(1) - Duration::milliseconds(1);
        DayWindow { start, end }
    }

    /// Calendar date of an instant in the campus offset.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    pub fn today(&self) -> NaiveDate {
        self.local_date(Utc::now())
    }

    fn offset_duration(&self) -> Duration {
        Duration::seconds(i64::from(self.offset.local_minus_utc()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn window_spans_local_day_in_utc() {
        // UTC+05:30
        let calendar = CampusCalendar::new(330).unwrap();
        let window = calendar.day(date(2026, 3, 2));
        assert_eq!(window.start.to_rfc3339(), "2026-03-01T18:30:00+00:00");
        assert_eq!(
            window.end.timestamp_millis() - window.start.timestamp_millis(),
            86_400_000 - 1
        );
    }

    #[test]
    fn local_date_round_trips_midnight() {
        let calendar = CampusCalendar::new(-300).unwrap();
        let day = date(2026, 1, 31);
        assert_eq!(calendar.local_date(calendar.midnight(day)), day);
        assert_eq!(calendar.local_date(calendar.day(day).end), day);
    }

    #[test]
    fn reversed_range_is_rejected() {
        let err = DateRange::new(date(2026, 2, 3), date(2026, 2, 1)).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(DateRange::new(date(2026, 2, 1), date(2026, 2, 1)).is_ok());
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        assert!(CampusCalendar::new(24 * 60).is_err());
    }
}
