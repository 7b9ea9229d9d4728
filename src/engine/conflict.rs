use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::blackout;
use super::EngineError;

/// Something occupying (part of) a candidate slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Obstacle {
    /// Existing pending/confirmed appointment, buffer applied on both sides.
    Appointment { id: Ulid, span: Span },
    Blackout {
        id: Ulid,
        span: Span,
        reason: Option<String>,
    },
    Holiday { date: NaiveDate },
}

impl std::fmt::Display for Obstacle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Obstacle::Appointment { id, span } => {
                write!(f, "appointment {id} [{}, {})", span.start, span.end)
            }
            Obstacle::Blackout { id, span, reason } => {
                write!(f, "blackout {id} [{}, {})", span.start, span.end)?;
                if let Some(r) = reason {
                    write!(f, " ({r})")?;
                }
                Ok(())
            }
            Obstacle::Holiday { date } => write!(f, "holiday {date}"),
        }
    }
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() <= 0 {
        return Err(EngineError::LimitExceeded("span must have positive duration"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Every obstacle overlapping the candidate `[start, start+duration)`.
///
/// Checked in order: existing appointments (buffer applied symmetrically),
/// blackout coverage, holiday membership (unless the caller explicitly
/// allows holiday bookings). An empty result is the "bookable" signal.
/// Pure over the caller's read snapshot — no state is touched.
pub fn find_conflicts(
    rs: &ResourceState,
    globals: &[BlackoutInterval],
    candidate: &Span,
    holidays: &HolidaySnapshot,
    allow_holiday: bool,
    exclude: Option<Ulid>,
) -> Vec<Obstacle> {
    let mut obstacles = Vec::new();
    let buffer = rs.buffer;

    // 1. Existing active appointments, inflated by the buffer on each side.
    let search = candidate.padded(buffer);
    for appt in rs.overlapping(&search) {
        if !appt.status.is_active() || Some(appt.id) == exclude {
            continue;
        }
        if appt.span.padded(buffer).overlaps(candidate) {
            obstacles.push(Obstacle::Appointment {
                id: appt.id,
                span: appt.span,
            });
        }
    }

    // 2. Blackout coverage — resource-scoped and global, most-restrictive union.
    for (id, span, reason) in blackout::blocking_overlaps(rs, globals, candidate) {
        obstacles.push(Obstacle::Blackout { id, span, reason });
    }

    // 3. Holiday membership for every local date the candidate touches.
    if !allow_holiday {
        let mut date = date_of(rs.tz, candidate.start);
        let last = date_of(rs.tz, candidate.end - 1);
        while date <= last {
            if holidays.contains(date) {
                obstacles.push(Obstacle::Holiday { date });
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
    }

    obstacles
}
