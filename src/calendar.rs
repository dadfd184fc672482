//! Day-boundary arithmetic for the streak engine.
//!
//! Streaks are counted in *calendar days*, not 24-hour windows. Every instant is
//! truncated to its calendar day in a single fixed reference timezone before any
//! streak rule looks at it. The reference timezone is a global configuration
//! value (deliberately not per-user) so that the local and server engines
//! always agree on where a day begins.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

/// A calendar day with no time component.
///
/// Derived from an instant via [`ReferenceCalendar::day_of`]; never constructed
/// from a raw local clock.
pub type CalendarDay = NaiveDate;

/// Maps instants to calendar days in one fixed reference timezone.
///
/// Both engine modes hold exactly one of these; all day-boundary decisions go
/// through it. Total over all representable instants; there are no error
/// conditions.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceCalendar {
    tz: Tz,
}

impl ReferenceCalendar {
    /// Create a calendar anchored to the given IANA timezone.
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Calendar anchored to UTC, the default reference timezone.
    pub fn utc() -> Self {
        Self { tz: chrono_tz::UTC }
    }

    /// The reference timezone this calendar truncates into.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Truncate an instant to its calendar day in the reference timezone.
    pub fn day_of(&self, instant: DateTime<Utc>) -> CalendarDay {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// Signed whole-day difference `b - a`.
    ///
    /// Positive when `b` is after `a`, negative when before, zero on the same
    /// day.
    pub fn days_between(&self, a: CalendarDay, b: CalendarDay) -> i64 {
        (b - a).num_days()
    }
}

impl Default for ReferenceCalendar {
    fn default() -> Self {
        Self::utc()
    }
}
