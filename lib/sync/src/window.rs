//! Academic-year fetch window.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Month the academic year starts in.
const YEAR_START_MONTH: u32 = 9;

/// Days added past the nominal end of the year for late provider updates.
pub const WINDOW_GRACE_DAYS: i64 = 14;

/// The `[from, to]` range requested from a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl FetchWindow {
    /// The academic year containing `now`.
    ///
    /// Before September the year began on September 1 of the previous
    /// calendar year, otherwise on September 1 of this one. It runs to the
    /// following August 30, plus the grace period. Bounds are UTC midnight.
    #[must_use]
    pub fn academic_year_containing(now: DateTime<Utc>) -> Self {
        let start_year = if now.month() < YEAR_START_MONTH {
            now.year() - 1
        } else {
            now.year()
        };

        Self {
            from: midnight(start_year, YEAR_START_MONTH, 1),
            to: midnight(start_year + 1, 8, 30) + Duration::days(WINDOW_GRACE_DAYS),
        }
    }

    /// Returns whether `at` falls within the window, bounds included.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at <= self.to
    }
}

fn midnight(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
        .and_utc()
}
