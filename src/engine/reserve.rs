use ulid::Ulid;

use crate::limits::*;
use crate::locks::LockKey;
use crate::model::*;
use crate::observability;

use super::availability::nearest_open_slot;
use super::conflict::{find_conflicts, validate_span, Obstacle};
use super::{Engine, EngineError};

#[derive(Debug, Clone, Default)]
pub struct ReserveOptions {
    pub allow_holiday: bool,
    pub label: Option<String>,
    /// Set during bulk series generation.
    pub series: Option<SeriesSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Booked {
        appointment_id: Ulid,
        start: Ms,
    },
    /// Conflict at the requested time; the nearest open slot was taken
    /// instead.
    Rescheduled {
        appointment_id: Ulid,
        start: Ms,
        requested: Ms,
    },
    /// Conflict under the `Skip` policy — nothing was persisted.
    Skipped { obstacles: Vec<Obstacle> },
}

/// Result of one locked attempt at one exact time.
enum Attempt {
    Booked,
    Conflict(Vec<Obstacle>),
}

impl Engine {
    /// Reserve a slot — the only mutating, concurrency-sensitive entry point.
    ///
    /// Acquires the `(resource, time-bucket)` reservation lock, re-runs the
    /// conflict check under it (earlier availability lookups are advisory),
    /// then persists the appointment as `Pending`. The lock is released on
    /// every exit path. Idempotent per caller-supplied `id`: retrying the
    /// same id and time after a `LockTimeout` returns the existing booking.
    pub async fn reserve(
        &self,
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        duration: Ms,
        policy: ConflictPolicy,
        holidays: &HolidaySnapshot,
        opts: ReserveOptions,
    ) -> Result<ReserveOutcome, EngineError> {
        // Validation happens before any lock is taken.
        if duration <= 0 {
            return Err(EngineError::LimitExceeded("span must have positive duration"));
        }
        validate_span(&Span::new(start, start + duration))?;
        if let Some(ref l) = opts.label
            && l.len() > MAX_LABEL_LEN {
                return Err(EngineError::LimitExceeded("label too long"));
            }

        let timer = std::time::Instant::now();
        let result = self
            .reserve_inner(id, resource_id, start, duration, policy, holidays, &opts)
            .await;
        metrics::histogram!(observability::RESERVE_DURATION_SECONDS)
            .record(timer.elapsed().as_secs_f64());
        metrics::counter!(
            observability::RESERVATIONS_TOTAL,
            "outcome" => outcome_label(&result)
        )
        .increment(1);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn reserve_inner(
        &self,
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        duration: Ms,
        policy: ConflictPolicy,
        holidays: &HolidaySnapshot,
        opts: &ReserveOptions,
    ) -> Result<ReserveOutcome, EngineError> {
        let mut target = start;

        for _attempt in 0..=self.config.reschedule_attempts {
            match self
                .try_reserve_at(id, resource_id, target, duration, holidays, opts)
                .await?
            {
                Attempt::Booked if target == start => {
                    return Ok(ReserveOutcome::Booked {
                        appointment_id: id,
                        start: target,
                    });
                }
                Attempt::Booked => {
                    return Ok(ReserveOutcome::Rescheduled {
                        appointment_id: id,
                        start: target,
                        requested: start,
                    });
                }
                Attempt::Conflict(obstacles) => match policy {
                    ConflictPolicy::Reject => {
                        return Err(EngineError::SlotConflict(obstacles));
                    }
                    ConflictPolicy::Skip => {
                        return Ok(ReserveOutcome::Skipped { obstacles });
                    }
                    ConflictPolicy::RescheduleNearest => {
                        let Some(alternative) = self
                            .search_alternative(resource_id, start, duration, holidays, opts)
                            .await?
                        else {
                            return Err(EngineError::NoAlternativeSlot);
                        };
                        target = alternative;
                    }
                },
            }
        }

        // Retry budget exhausted — every found alternative got snatched.
        Err(EngineError::NoAlternativeSlot)
    }

    /// One locked check-then-book attempt at an exact time. The bucket lock
    /// narrows contention; the resource write guard underneath is what makes
    /// the conflict check authoritative.
    async fn try_reserve_at(
        &self,
        id: Ulid,
        resource_id: Ulid,
        target: Ms,
        duration: Ms,
        holidays: &HolidaySnapshot,
        opts: &ReserveOptions,
    ) -> Result<Attempt, EngineError> {
        let key = LockKey::for_start(resource_id, target, self.config.bucket_ms);
        let token = self.locks.acquire(key, self.config.lock_ttl).await?;
        let result = self
            .book_locked(id, resource_id, target, duration, holidays, opts)
            .await;
        self.locks.release(key, token).await;
        result
    }

    async fn book_locked(
        &self,
        id: Ulid,
        resource_id: Ulid,
        target: Ms,
        duration: Ms,
        holidays: &HolidaySnapshot,
        opts: &ReserveOptions,
    ) -> Result<Attempt, EngineError> {
        let span = Span::new(target, target + duration);
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write_owned().await;

        if let Some(existing) = guard.appointment(id) {
            // Same key retried (e.g. after LockTimeout) — already booked.
            if existing.span == span && existing.status.is_active() {
                return Ok(Attempt::Booked);
            }
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many appointments on resource"));
        }

        let globals = self.globals_snapshot();
        let obstacles = find_conflicts(&guard, &globals, &span, holidays, opts.allow_holiday, None);
        if !obstacles.is_empty() {
            return Ok(Attempt::Conflict(obstacles));
        }

        let event = Event::AppointmentBooked {
            id,
            resource_id,
            span,
            series: opts.series,
            label: opts.label.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Attempt::Booked)
    }

    /// Bounded nearest-slot search against a read snapshot.
    async fn search_alternative(
        &self,
        resource_id: Ulid,
        around: Ms,
        duration: Ms,
        holidays: &HolidaySnapshot,
        opts: &ReserveOptions,
    ) -> Result<Option<Ms>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let globals = self.globals_snapshot();
        Ok(nearest_open_slot(
            &guard,
            &globals,
            around,
            duration,
            self.config.search_window_days,
            self.config.search_granularity_min,
            holidays,
            opts.allow_holiday,
            None,
        ))
    }
}

fn outcome_label(result: &Result<ReserveOutcome, EngineError>) -> &'static str {
    match result {
        Ok(ReserveOutcome::Booked { .. }) => "booked",
        Ok(ReserveOutcome::Rescheduled { .. }) => "rescheduled",
        Ok(ReserveOutcome::Skipped { .. }) => "skipped",
        Err(EngineError::SlotConflict(_)) => "conflict",
        Err(EngineError::NoAlternativeSlot) => "no_alternative",
        Err(EngineError::LockTimeout) => "lock_timeout",
        Err(_) => "error",
    }
}
