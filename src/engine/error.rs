use ulid::Ulid;

use super::conflict::Obstacle;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Slot granularity does not evenly divide the working-hours span.
    InvalidGranularity {
        granularity_min: u32,
        window_min: u32,
    },
    /// Pattern would generate more occurrences than the hard cap allows.
    PatternTooLarge {
        cap: u32,
    },
    /// The candidate slot collides with the listed obstacles.
    SlotConflict(Vec<Obstacle>),
    /// Bounded alternative-slot search found nothing inside the window.
    NoAlternativeSlot,
    /// Reservation lock not acquired within the deadline. Retryable.
    LockTimeout,
    /// Overlapping blackouts give contradictory resolution policies for the
    /// same appointment; resolved most-restrictive (manual review).
    BlackoutOverlapUnresolved(Ulid),
    /// Illegal series state transition (e.g. mutating a cancelled series).
    SeriesStateViolation {
        series_id: Ulid,
        reason: &'static str,
    },
    /// Illegal appointment status transition (e.g. completing a cancelled
    /// appointment).
    InvalidTransition {
        appointment_id: Ulid,
        from: crate::model::AppointmentStatus,
    },
    LimitExceeded(&'static str),
    Journal(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidGranularity {
                granularity_min,
                window_min,
            } => write!(
                f,
                "granularity {granularity_min}min does not divide the {window_min}min working window"
            ),
            EngineError::PatternTooLarge { cap } => {
                write!(f, "pattern exceeds the {cap}-occurrence cap")
            }
            EngineError::SlotConflict(obstacles) => {
                write!(f, "slot conflicts with {} obstacle(s):", obstacles.len())?;
                for o in obstacles {
                    write!(f, " {o};")?;
                }
                Ok(())
            }
            EngineError::NoAlternativeSlot => {
                write!(f, "no open slot inside the reschedule search window")
            }
            EngineError::LockTimeout => write!(f, "reservation lock not acquired in time"),
            EngineError::BlackoutOverlapUnresolved(id) => write!(
                f,
                "overlapping blackouts disagree on auto-reschedule for appointment {id}"
            ),
            EngineError::SeriesStateViolation { series_id, reason } => {
                write!(f, "series {series_id}: {reason}")
            }
            EngineError::InvalidTransition {
                appointment_id,
                from,
            } => write!(
                f,
                "appointment {appointment_id}: illegal transition from {from:?}"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
