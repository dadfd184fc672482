//! Data models for Ember.
//!
//! The two core types are [`ActivityEvent`] (one row of the append-only
//! activity log) and [`StreakRecord`] (the sole mutable derived state, one per
//! user). Everything else is request/response plumbing for the HTTP surface.
//!
//! # Invariants
//!
//! A well-formed [`StreakRecord`] always satisfies:
//!
//! - `current_streak <= best_streak`
//! - `current_streak > 0` if and only if `streak_start_date` is present
//! - `is_at_risk` implies `current_streak > 0`
//! - `best_streak` never decreases over the life of a record
//!
//! Records are mutated only through the transition function and the two sweep
//! jobs; those are the only places that need to uphold the invariants, and
//! [`StreakRecord::invariants_hold`] lets tests check them after every step.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::CalendarDay;

/// One user action counted toward a streak.
///
/// Events are immutable and append-only: they are never updated or deleted.
/// Multiple events on the same calendar day are legal and do not each increment
/// the streak: only the *day* matters, never the event count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Opaque user identifier; Ember attaches no meaning to it.
    pub user_id: String,

    /// Server-side instant when the activity occurred (UTC).
    pub occurred_at: DateTime<Utc>,

    /// Free-form tag chosen by the caller ("workout", "lesson", ...).
    ///
    /// Not validated against any enum; the core only logs it.
    pub activity_type: String,
}

/// Per-user derived streak state.
///
/// Created zeroed on user registration, mutated exclusively by the transition
/// function (on new activity) and the two sweep jobs, never deleted while the
/// user exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakRecord {
    /// Consecutive days with at least one activity event, ending at
    /// `last_activity_date`.
    pub current_streak: u32,

    /// Maximum `current_streak` ever observed. Monotonically non-decreasing;
    /// in particular, never reset by the reset sweep.
    pub best_streak: u32,

    /// Calendar day of the most recent activity, or `None` if never active.
    pub last_activity_date: Option<CalendarDay>,

    /// Calendar day the current streak began, or `None` when
    /// `current_streak == 0`.
    pub streak_start_date: Option<CalendarDay>,

    /// Set by the at-risk sweep when the last activity was exactly yesterday;
    /// cleared by new activity or by the reset sweep zeroing the record.
    pub is_at_risk: bool,

    /// Unused "skip a day" tokens. Server mode only; always 0 in local mode.
    pub freezes_available: u32,

    /// While true, the reset sweep must not zero this record even if stale.
    pub freeze_active: bool,

    /// Recent days with activity, kept for display only (trailing ~31 days).
    /// NOT authoritative for streak arithmetic.
    pub active_days: BTreeSet<CalendarDay>,
}

impl StreakRecord {
    /// A zeroed record, as created on first user registration.
    pub fn new() -> Self {
        Self {
            current_streak: 0,
            best_streak: 0,
            last_activity_date: None,
            streak_start_date: None,
            is_at_risk: false,
            freezes_available: 0,
            freeze_active: false,
            active_days: BTreeSet::new(),
        }
    }

    /// Check the structural invariants listed in the module docs.
    ///
    /// Monotonicity of `best_streak` is a property of *sequences* of records
    /// and is asserted separately in tests.
    pub fn invariants_hold(&self) -> bool {
        if self.current_streak > self.best_streak {
            return false;
        }
        if (self.current_streak > 0) != self.streak_start_date.is_some() {
            return false;
        }
        if self.is_at_risk && self.current_streak == 0 {
            return false;
        }
        true
    }
}

impl Default for StreakRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Request body for POST /activity.
///
/// The timestamp is assigned server-side; clients submit only who did what.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityRequest {
    /// The user the activity belongs to.
    pub user_id: String,

    /// Free-form activity tag (defaults to "general").
    #[serde(default = "default_activity_type")]
    pub activity_type: String,
}

fn default_activity_type() -> String {
    "general".to_string()
}

/// Request body for POST /users.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    pub user_id: String,
}

/// Response for GET /streak/{user_id}: a display-ready record snapshot.
///
/// `is_at_risk` here is the *read-time* flag: the stored value OR'd with the
/// inline "last activity was exactly yesterday" check, so snapshots taken
/// between sweep runs match what the local engine would report.
#[derive(Debug, Clone, Serialize)]
pub struct StreakSnapshot {
    pub user_id: String,
    pub current_streak: u32,
    pub best_streak: u32,
    pub last_activity_date: Option<CalendarDay>,
    pub streak_start_date: Option<CalendarDay>,
    pub is_at_risk: bool,
    pub freezes_available: u32,
    pub freeze_active: bool,
    /// Recent active days, oldest first.
    pub active_days: Vec<CalendarDay>,
}

impl StreakSnapshot {
    pub fn from_record(user_id: &str, record: &StreakRecord, at_risk_now: bool) -> Self {
        Self {
            user_id: user_id.to_string(),
            current_streak: record.current_streak,
            best_streak: record.best_streak,
            last_activity_date: record.last_activity_date,
            streak_start_date: record.streak_start_date,
            is_at_risk: record.is_at_risk || at_risk_now,
            freezes_available: record.freezes_available,
            freeze_active: record.freeze_active,
            active_days: record.active_days.iter().copied().collect(),
        }
    }
}

/// Summary returned by each sweep run, for the external scheduler's logs.
///
/// Sweeps are idempotent per record, so a partial run (crash, timeout) is
/// covered by the next scheduled run; `conflicts` counts records skipped after
/// losing a write race with a concurrent activity transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records examined (all records with a positive streak).
    pub scanned: u64,

    /// Records actually written this run.
    pub updated: u64,

    /// Records skipped after write conflicts; picked up on the next run.
    pub conflicts: u64,
}

/// Fire-and-forget change notification emitted on every committed record
/// mutation. No ordering guarantee beyond "a snapshot read after receiving this
/// reflects the latest committed state".
#[derive(Debug, Clone)]
pub struct StreakChanged {
    pub user_id: String,
}
