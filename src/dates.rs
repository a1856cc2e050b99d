use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::Serialize;
use crate::error::{ApiError, ApiResult};

/// Current UTC time without the sub-second part, the precision stored in the database.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    let nanos = now.timestamp_subsec_nanos();
    now.checked_sub_signed(TimeDelta::nanoseconds(nanos as i64)).unwrap_or(now)
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn parse_date(field: &str, value: &str) -> ApiResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::invalid(field, format!("'{value}' is not a YYYY-MM-DD date")))
}

pub fn parse_optional_date(field: &str, value: Option<&str>) -> ApiResult<Option<NaiveDate>> {
    value.map(|v| parse_date(field, v)).transpose()
}

/// Wall-clock time of day as sent by the front desk, `HH:MM` or `HH:MM:SS`.
pub fn parse_time(field: &str, value: &str) -> ApiResult<String> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map(|t| t.format("%H:%M").to_string())
        .map_err(|_| ApiError::invalid(field, format!("'{value}' is not a HH:MM time")))
}

/// Parses `YYYY-MM` into the first and last day of that month.
pub fn parse_month(field: &str, value: &str) -> ApiResult<DateRange> {
    let invalid = || ApiError::invalid(field, "month must be YYYY-MM");
    let (y, m) = value.trim().split_once('-').ok_or_else(invalid)?;
    let year = y.parse::<i32>().map_err(|_| invalid())?;
    let month = m.parse::<u32>().map_err(|_| invalid())?;
    let from = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
    Ok(DateRange { from, to: last_day_of_month(from) })
}

fn last_day_of_month(first: NaiveDate) -> NaiveDate {
    let (year, month) = if first.month() == 12 {
        (first.year() + 1, 1)
    } else {
        (first.year(), first.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.pred_opt())
        .unwrap_or(first)
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn parse(from: &str, to: &str) -> ApiResult<Self> {
        let from = parse_date("from", from)?;
        let to = parse_date("to", to)?;
        if from > to {
            return Err(ApiError::invalid("to", "must not be before 'from'"));
        }
        Ok(Self { from, to })
    }
    /// Calendar months touched by the range, each clipped to the range.
    pub fn months(&self) -> Vec<DateRange> {
        let mut ret = vec![];
        let mut first = self.from.with_day(1).unwrap_or(self.from);
        while first <= self.to {
            let last = last_day_of_month(first);
            ret.push(DateRange { from: first.max(self.from), to: last.min(self.to) });
            first = last + Duration::days(1);
        }
        ret
    }
}

/// Nursery academic years run from April 1st to March 31st of the next calendar year.
pub fn default_year_bounds(year: i32) -> (NaiveDate, NaiveDate) {
    let start = NaiveDate::from_ymd_opt(year, 4, 1).unwrap_or_default();
    let end = NaiveDate::from_ymd_opt(year + 1, 3, 31).unwrap_or_default();
    (start, end)
}

pub fn shift_years(date: NaiveDate, years: i32) -> NaiveDate {
    let year = date.year() + years;
    date.with_year(year)
        // Feb 29th has no counterpart in a common year
        .or_else(|| NaiveDate::from_ymd_opt(year, date.month(), 28))
        .unwrap_or(date)
}

#[test]
fn test_now_trimmed_to_sec() {
    assert_eq!(now().timestamp_subsec_nanos(), 0);
}

#[test]
fn test_parse_time() {
    for (s, expected) in &[("7:05", "07:05"), ("08:30", "08:30"), ("17:45:10", "17:45")] {
        assert_eq!(&parse_time("arrivalTime", s).unwrap(), expected);
    }
    assert!(parse_time("arrivalTime", "25:00").is_err());
    assert!(parse_time("arrivalTime", "noon").is_err());
}

#[test]
fn test_parse_month() {
    let r = parse_month("month", "2024-02").unwrap();
    assert_eq!(r.from, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
    assert_eq!(r.to, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    let r = parse_month("month", "2025-12").unwrap();
    assert_eq!(r.to, NaiveDate::from_ymd_opt(2025, 12, 31).unwrap());
    assert!(parse_month("month", "2025-13").is_err());
    assert!(parse_month("month", "202501").is_err());
}

#[test]
fn test_range_months() {
    let r = DateRange::parse("2025-03-15", "2025-05-10").unwrap();
    let months = r.months();
    assert_eq!(months.len(), 3);
    assert_eq!(months[0].from, NaiveDate::from_ymd_opt(2025, 3, 15).unwrap());
    assert_eq!(months[0].to, NaiveDate::from_ymd_opt(2025, 3, 31).unwrap());
    assert_eq!(months[2].to, NaiveDate::from_ymd_opt(2025, 5, 10).unwrap());
    assert!(DateRange::parse("2025-05-10", "2025-03-15").is_err());
}

#[test]
fn test_shift_years() {
    let leap = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    assert_eq!(shift_years(leap, 1), NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());
    let (start, end) = default_year_bounds(2025);
    assert_eq!(shift_years(start, 1), NaiveDate::from_ymd_opt(2026, 4, 1).unwrap());
    assert_eq!(end, NaiveDate::from_ymd_opt(2026, 3, 31).unwrap());
}
