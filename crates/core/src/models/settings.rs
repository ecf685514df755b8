use chrono::{NaiveDate, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// User-configurable settings, stored alongside the ledger snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// IANA time zone that defines calendar days (e.g., "Europe/Warsaw").
    pub timezone: String,

    /// First day of a week for weekly periods.
    pub week_start: Weekday,

    /// First day of history for streaks. Defaults to the first event's day.
    #[serde(default)]
    pub tracking_since: Option<NaiveDate>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            week_start: Weekday::Mon,
            tracking_since: None,
        }
    }
}

impl Settings {
    /// Validate once and produce the value every service reads from.
    pub fn resolve(&self) -> Result<ResolvedSettings, CoreError> {
        let tz: Tz = self.timezone.trim().parse().map_err(|_| {
            CoreError::validation(
                "timezone",
                format!("unknown time zone '{}'", self.timezone),
            )
        })?;
        Ok(ResolvedSettings {
            tz,
            week_start: self.week_start,
            tracking_since: self.tracking_since,
        })
    }
}

/// Settings with every default applied and every field parsed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedSettings {
    pub tz: Tz,
    pub week_start: Weekday,
    pub tracking_since: Option<NaiveDate>,
}

impl Default for ResolvedSettings {
    fn default() -> Self {
        Self {
            tz: Tz::UTC,
            week_start: Weekday::Mon,
            tracking_since: None,
        }
    }
}
