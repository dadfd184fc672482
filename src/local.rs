//! The local (on-device) streak engine.
//!
//! Single user, single writer, fully synchronous: every activity applies the
//! transition in memory and the caller persists the resulting record however it
//! likes (the engine can be rebuilt from a persisted record with
//! [`LocalEngine::from_record`]). There are no sweep jobs here: at-risk is
//! computed at read time, and a broken streak is reset implicitly by the next
//! activity's gap rule. Freezes are a server-mode feature; a local record keeps
//! `freezes_available == 0` and `freeze_active == false`.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::calendar::ReferenceCalendar;
use crate::model::{ActivityEvent, StreakRecord, StreakSnapshot};
use crate::transition::{TransitionKind, apply_activity, at_risk_on};

/// Single-user streak engine with an in-memory record and activity log.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    user_id: String,
    calendar: ReferenceCalendar,
    record: StreakRecord,
    log: Vec<ActivityEvent>,
}

impl LocalEngine {
    /// Fresh engine with a zeroed record, as on first app launch.
    pub fn new(user_id: impl Into<String>, calendar: ReferenceCalendar) -> Self {
        Self {
            user_id: user_id.into(),
            calendar,
            record: StreakRecord::new(),
            log: Vec::new(),
        }
    }

    /// Rebuild an engine from a previously persisted record.
    ///
    /// The log starts empty; only the derived record survives restarts, which
    /// is all the streak arithmetic needs.
    pub fn from_record(
        user_id: impl Into<String>,
        calendar: ReferenceCalendar,
        record: StreakRecord,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            calendar,
            record,
            log: Vec::new(),
        }
    }

    /// Record one activity: append to the log, then apply the transition.
    ///
    /// Synchronous and sequentially consistent: the updated record is visible
    /// to the next call as soon as this returns. Backdated events are absorbed
    /// as no-ops on the record but still appended to the log.
    pub fn record_activity(
        &mut self,
        occurred_at: DateTime<Utc>,
        activity_type: impl Into<String>,
    ) -> TransitionKind {
        let event = ActivityEvent {
            user_id: self.user_id.clone(),
            occurred_at,
            activity_type: activity_type.into(),
        };
        self.log.push(event);

        let today = self.calendar.day_of(occurred_at);
        let (next, kind) = apply_activity(&self.record, today);
        if kind == TransitionKind::Backdated {
            warn!(
                user_id = %self.user_id,
                event_day = %today,
                "Backdated activity ignored by streak counter"
            );
        }
        self.record = next;
        kind
    }

    /// Display snapshot with at-risk computed inline against `now`.
    ///
    /// The server marks at-risk via a daily sweep; locally the equivalent flag
    /// is just "streak alive and last activity was exactly yesterday",
    /// evaluated at read time.
    pub fn snapshot(&self, now: DateTime<Utc>) -> StreakSnapshot {
        let today = self.calendar.day_of(now);
        let at_risk = at_risk_on(&self.record, today);
        StreakSnapshot::from_record(&self.user_id, &self.record, at_risk)
    }

    /// The current derived record, for persistence by the caller.
    pub fn record(&self) -> &StreakRecord {
        &self.record
    }

    /// Activity events recorded this session, in submission order.
    pub fn log(&self) -> &[ActivityEvent] {
        &self.log
    }
}
