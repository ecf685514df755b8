use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// How a period is subdivided in a stats breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    Day,
    /// Seven days starting on the configured first weekday
    Week,
    /// Calendar month (28-31 days)
    Month,
}

/// A half-open span of local calendar days: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, CoreError> {
        if start > end {
            return Err(CoreError::validation(
                "range",
                format!("start ({start}) must not be after end ({end})"),
            ));
        }
        Ok(Self { start, end })
    }

    /// Inclusive constructor: `[first, last]`.
    pub fn inclusive(first: NaiveDate, last: NaiveDate) -> Result<Self, CoreError> {
        let end = last.succ_opt().ok_or_else(|| {
            CoreError::validation("range", format!("{last} is the last representable date"))
        })?;
        Self::new(first, end)
    }

    /// A single calendar day.
    #[must_use]
    pub fn day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date.succ_opt().unwrap_or(NaiveDate::MAX),
        }
    }

    /// Every representable day.
    #[must_use]
    pub fn all() -> Self {
        Self {
            start: NaiveDate::MIN,
            end: NaiveDate::MAX,
        }
    }

    /// Every day from `start` onward.
    #[must_use]
    pub fn open_ended(start: NaiveDate) -> Self {
        Self {
            start,
            end: NaiveDate::MAX,
        }
    }

    /// The 7-day week containing `date`, starting on `week_start`.
    /// Weeks are never split at month edges. At the edges of the calendar
    /// the week is clipped to the representable days.
    #[must_use]
    pub fn week_containing(date: NaiveDate, week_start: Weekday) -> Self {
        let offset = i64::from(
            (7 + date.weekday().num_days_from_monday() - week_start.num_days_from_monday()) % 7,
        );
        Self {
            start: date
                .checked_sub_signed(Duration::days(offset))
                .unwrap_or(NaiveDate::MIN),
            end: date
                .checked_add_signed(Duration::days(7 - offset))
                .unwrap_or(NaiveDate::MAX),
        }
    }

    /// The calendar month containing `date`.
    #[must_use]
    pub fn month_containing(date: NaiveDate) -> Self {
        let start = date.with_day(1).unwrap_or(date);
        Self {
            start,
            end: first_of_next_month(start),
        }
    }

    /// The period of `granularity` containing `date`.
    #[must_use]
    pub fn containing(date: NaiveDate, granularity: Granularity, week_start: Weekday) -> Self {
        match granularity {
            Granularity::Day => Self::day(date),
            Granularity::Week => Self::week_containing(date, week_start),
            Granularity::Month => Self::month_containing(date),
        }
    }

    /// The period immediately before this one. A whole calendar month maps
    /// to the previous calendar month; anything else shifts back by its length,
    /// stopping at the first representable day.
    #[must_use]
    pub fn previous(&self) -> Self {
        if self.is_whole_month() {
            if let Some(last_of_prev) = self.start.pred_opt() {
                return Self::month_containing(last_of_prev);
            }
        }
        let len = Duration::days(self.num_days());
        Self {
            start: self.start.checked_sub_signed(len).unwrap_or(NaiveDate::MIN),
            end: self.start,
        }
    }

    #[must_use]
    pub fn is_whole_month(&self) -> bool {
        self.start.day() == 1 && self.end == first_of_next_month(self.start)
    }

    #[must_use]
    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    #[must_use]
    pub fn intersects(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d < self.end)
    }

    /// Cut this range at `granularity` boundaries. The first and last
    /// pieces are clipped to the range.
    #[must_use]
    pub fn split(&self, granularity: Granularity, week_start: Weekday) -> Vec<DateRange> {
        let mut pieces = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let natural = Self::containing(cursor, granularity, week_start);
            let end = natural.end.min(self.end);
            pieces.push(DateRange { start: cursor, end });
            cursor = end;
        }
        pieces
    }

    /// UTC instants bounding this range in zone `tz`: `[start, end)`.
    #[must_use]
    pub fn instants(&self, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
        (start_of_day(self.start, tz), start_of_day(self.end, tz))
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The local calendar day an instant falls on.
#[must_use]
pub fn local_date(at: DateTime<Utc>, tz: Tz) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

/// First instant of local day `date`. If a DST jump skips midnight, the
/// day begins at the first valid local time after it.
#[must_use]
pub fn start_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    (0..=4)
        .find_map(|step| match tz.from_local_datetime(&(midnight + Duration::minutes(30 * step))) {
            LocalResult::Single(t) => Some(t),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            LocalResult::None => None,
        })
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MAX)
}
