//! Ember - A daily-activity streak engine with local and server execution modes.
//!
//! # Overview
//!
//! Ember derives a "consecutive days active" streak from an append-only log of
//! activity events. The same pure transition rules run in two places:
//!
//! - [`local::LocalEngine`]: embedded, single-user, synchronous, offline (the
//!   shape an app runs on-device).
//! - [`service::StreakService`]: multi-tenant over SQLite, with the two
//!   scheduled sweep jobs (at-risk marking, stale-streak reset) and optimistic
//!   per-user write serialization.
//!
//! Both modes must agree on `current_streak` and `best_streak` for any input
//! sequence; they may differ only in how fresh the at-risk flag is. The shared
//! rules live in [`transition`] and all day-boundary decisions go through one
//! globally configured [`calendar::ReferenceCalendar`].
//!
//! # Modules
//!
//! - [`calendar`]: Instant-to-day truncation in the reference timezone
//! - [`model`]: Activity events, streak records, API types
//! - [`transition`]: The pure streak state machine and sweep rules
//! - [`local`]: Single-user on-device engine
//! - [`storage`]: SQLite storage layer
//! - [`service`]: Multi-tenant engine with sweep jobs
//! - [`api`]: HTTP API handlers

pub mod api;
pub mod calendar;
pub mod local;
pub mod model;
pub mod service;
pub mod storage;
pub mod transition;
