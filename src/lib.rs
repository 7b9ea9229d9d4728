//! slotwise — scheduling & recurrence engine for multi-tenant booking.
//!
//! The engine computes open slots, prevents double-booking under concurrent
//! requests, expands recurring patterns into concrete occurrences, detects
//! conflicts against existing bookings / blackouts / holidays, and tracks
//! recurring series as first-class aggregates. Everything around it — auth,
//! payments, notification delivery, calendar sync, HTTP — lives elsewhere
//! and talks to this crate through its public surface.

pub mod config;
pub mod engine;
pub mod journal;
pub mod limits;
pub mod locks;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reconcile;
pub mod tenant;

pub use config::EngineConfig;
pub use engine::{
    ActionScope, Engine, EngineError, GenerationReport, Obstacle, OccurrenceAction,
    OccurrenceOutcome, ReserveOptions, ReserveOutcome,
};
pub use model::{
    Appointment, AppointmentStatus, BlackoutInterval, BlackoutRecurrence, ConflictPolicy,
    EndCondition, Frequency, HolidaySnapshot, RecurrencePattern, SeriesStatus, Span, WeekHours,
};
pub use notify::{ChangeKind, NotifyHub, OccurrenceChange};
pub use tenant::TenantManager;
