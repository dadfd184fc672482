//! The streak transition function and per-record sweep rules.
//!
//! Everything in this module is a pure function from `(StreakRecord, CalendarDay)`
//! to a new record. Both engine modes, the on-device local engine and the
//! multi-tenant service, call these same functions, which is what keeps their
//! streak arithmetic equivalent despite running in different environments.
//! Callers convert instants to days with [`crate::calendar::ReferenceCalendar`]
//! before calling in; no clock is read here.

use chrono::Days;

use crate::calendar::CalendarDay;
use crate::model::StreakRecord;

/// How many trailing days of activity history `active_days` retains.
///
/// Display-only window; streak arithmetic never reads `active_days`.
pub const ACTIVE_DAYS_RETENTION: u64 = 31;

/// What a transition did to the record, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// First-ever activity for this user.
    Started,
    /// Same calendar day as the last activity; counter untouched.
    SameDay,
    /// Consecutive day; streak extended by one.
    Extended,
    /// Gap of two or more days; streak restarted at one.
    Restarted,
    /// Event day precedes the stored `last_activity_date` (clock skew,
    /// backfill). Pure no-op on the record; the event is still logged.
    Backdated,
}

/// Apply one activity on `today` to `prior`, returning the new record.
///
/// The rules, in order:
///
/// 1. No prior activity: `current_streak = 1`, streak starts today.
/// 2. `today` before `last_activity_date`: no-op (see [`TransitionKind::Backdated`]).
/// 3. Same day as last activity: counter and start date unchanged. This is the
///    structural idempotence guarantee: retried or duplicate submissions for a
///    day cannot double-count.
/// 4. Exactly one day later: streak extends, start date unchanged.
/// 5. Two or more days later: streak broken, restarts at one from today.
///
/// In every applied case `best_streak` absorbs the new `current_streak`,
/// `last_activity_date` becomes `today`, `is_at_risk` clears, and `today` joins
/// the bounded `active_days` window.
pub fn apply_activity(prior: &StreakRecord, today: CalendarDay) -> (StreakRecord, TransitionKind) {
    let mut next = prior.clone();

    let kind = match prior.last_activity_date {
        None => {
            next.current_streak = 1;
            next.streak_start_date = Some(today);
            TransitionKind::Started
        }
        Some(last) => {
            let delta = (today - last).num_days();
            if delta < 0 {
                return (next, TransitionKind::Backdated);
            }
            match delta {
                0 => TransitionKind::SameDay,
                // A zeroed record with a stale `last_activity_date` (the reset
                // sweep keeps the date) starts a fresh streak rather than
                // extending a count of zero.
                1 if prior.current_streak > 0 => {
                    next.current_streak = prior.current_streak + 1;
                    TransitionKind::Extended
                }
                _ => {
                    next.current_streak = 1;
                    next.streak_start_date = Some(today);
                    TransitionKind::Restarted
                }
            }
        }
    };

    next.best_streak = next.best_streak.max(next.current_streak);
    next.last_activity_date = Some(today);
    next.is_at_risk = false;

    next.active_days.insert(today);
    prune_active_days(&mut next, today);

    (next, kind)
}

/// Read-time at-risk check: positive streak whose last activity was exactly
/// yesterday. The local engine computes this at snapshot time instead of
/// running the at-risk sweep.
pub fn at_risk_on(record: &StreakRecord, today: CalendarDay) -> bool {
    match record.last_activity_date {
        Some(last) if record.current_streak > 0 => (today - last).num_days() == 1,
        _ => false,
    }
}

/// Per-record rule for the at-risk sweep.
///
/// Returns the updated record if the flag should be set and is not already,
/// `None` when nothing needs writing. Purely additive: this never clears the
/// flag, so re-running the sweep on the same day is a no-op.
pub fn apply_at_risk(record: &StreakRecord, today: CalendarDay) -> Option<StreakRecord> {
    if record.is_at_risk || !at_risk_on(record, today) {
        return None;
    }
    let mut next = record.clone();
    next.is_at_risk = true;
    Some(next)
}

/// Per-record rule for the reset sweep.
///
/// Zeroes a record whose last activity is two or more days stale, unless an
/// active freeze protects it. `best_streak` is never reset. Returns `None`
/// when the record is current, already zero, or frozen.
pub fn apply_reset(record: &StreakRecord, today: CalendarDay) -> Option<StreakRecord> {
    if record.current_streak == 0 || record.freeze_active {
        return None;
    }
    let last = record.last_activity_date?;
    if (today - last).num_days() < 2 {
        return None;
    }

    let mut next = record.clone();
    next.current_streak = 0;
    next.streak_start_date = None;
    next.is_at_risk = false;
    next.active_days.clear();
    Some(next)
}

/// Drop `active_days` entries older than the retention window ending at `today`.
fn prune_active_days(record: &mut StreakRecord, today: CalendarDay) {
    if let Some(cutoff) = today.checked_sub_days(Days::new(ACTIVE_DAYS_RETENTION - 1)) {
        record.active_days.retain(|d| *d >= cutoff);
    }
}
