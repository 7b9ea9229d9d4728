use std::sync::Arc;

use chrono::NaiveDate;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::find_conflicts;
use super::recurrence::{occurrence_starts, validate_pattern};
use super::reserve::{ReserveOptions, ReserveOutcome};
use super::{now_ms, Engine, EngineError};

/// What bulk generation did with each planned occurrence.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub series_id: Ulid,
    /// (sequence, appointment id, actual start)
    pub booked: Vec<(u32, Ulid, Ms)>,
    /// (sequence, requested start) — conflict under the Skip policy.
    pub skipped: Vec<(u32, Ms)>,
    /// (sequence, requested start, error)
    pub failed: Vec<(u32, Ms, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccurrenceAction {
    Reschedule { to: Ms },
    Cancel,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionScope {
    Single,
    RemainingSeries,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OccurrenceOutcome {
    Updated { appointment_id: Ulid },
    Moved { appointment_id: Ulid, start: Ms },
    Bulk { affected: u32 },
}

impl Engine {
    /// Create a recurring series: expand the pattern, reserve every
    /// occurrence under the pattern's conflict policy, and report what got
    /// booked, skipped and failed. In-flight reservations are capped so a
    /// large series cannot starve other bookings on the same resource.
    pub async fn create_series(
        &self,
        series_id: Ulid,
        resource_id: Ulid,
        pattern: RecurrencePattern,
        start_date: NaiveDate,
        holidays: &HolidaySnapshot,
    ) -> Result<GenerationReport, EngineError> {
        if self.series.len() >= MAX_SERIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many series"));
        }
        if self.series.contains_key(&series_id) {
            return Err(EngineError::AlreadyExists(series_id));
        }
        validate_pattern(&pattern)?;

        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let tz = rs.read().await.tz;
        let starts = occurrence_starts(tz, &pattern, start_date, holidays)?;
        if starts.is_empty() {
            return Err(EngineError::LimitExceeded("pattern yields no occurrences"));
        }

        let total_planned = starts.len() as u32;
        let created_at = now_ms();
        let event = Event::SeriesCreated {
            id: series_id,
            resource_id,
            pattern: pattern.clone(),
            total_planned,
            at: created_at,
        };
        self.journal_append(&event).await?;
        self.series.insert(
            series_id,
            Arc::new(RwLock::new(SeriesState {
                id: series_id,
                resource_id,
                pattern: pattern.clone(),
                status: SeriesStatus::Active,
                total_planned,
                completed_count: 0,
                cancelled_count: 0,
                appointments: Vec::new(),
                created_at,
                updated_at: created_at,
            })),
        );

        let semaphore = Arc::new(Semaphore::new(self.config.series_inflight.max(1)));
        let reservations = starts.iter().enumerate().map(|(i, &start)| {
            let semaphore = semaphore.clone();
            let pattern = &pattern;
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let appt_id = Ulid::new();
                let opts = ReserveOptions {
                    allow_holiday: !pattern.skip_holidays,
                    label: None,
                    series: Some(SeriesSlot {
                        series_id,
                        sequence: i as u32,
                    }),
                };
                let outcome = self
                    .reserve(
                        appt_id,
                        resource_id,
                        start,
                        pattern.duration,
                        pattern.policy,
                        holidays,
                        opts,
                    )
                    .await;
                (i as u32, start, outcome)
            }
        });
        let outcomes = join_all(reservations).await;

        let mut report = GenerationReport {
            series_id,
            booked: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        };
        for (sequence, requested, outcome) in outcomes {
            match outcome {
                Ok(ReserveOutcome::Booked {
                    appointment_id,
                    start,
                })
                | Ok(ReserveOutcome::Rescheduled {
                    appointment_id,
                    start,
                    ..
                }) => report.booked.push((sequence, appointment_id, start)),
                Ok(ReserveOutcome::Skipped { .. }) => report.skipped.push((sequence, requested)),
                Err(e) => report.failed.push((sequence, requested, e.to_string())),
            }
        }

        // Skips and failures shrink the plan so completion bookkeeping
        // tracks what actually exists.
        let booked_count = report.booked.len() as u32;
        if booked_count != total_planned {
            let adjust = Event::SeriesPlanAdjusted {
                id: series_id,
                total_planned: booked_count,
            };
            self.journal_append(&adjust).await?;
            if let Some(arc) = self.get_series(&series_id) {
                let mut guard = arc.write().await;
                guard.total_planned = booked_count;
            }
        }

        metrics::counter!(observability::SERIES_CREATED_TOTAL).increment(1);
        metrics::histogram!(observability::SERIES_BATCH_SIZE).record(booked_count as f64);
        Ok(report)
    }

    // ── Series status machine ────────────────────────────

    pub async fn pause_series(&self, series_id: Ulid) -> Result<(), EngineError> {
        self.transition_series(series_id, SeriesStatus::Paused, SeriesStatus::Active)
            .await
    }

    pub async fn resume_series(&self, series_id: Ulid) -> Result<(), EngineError> {
        self.transition_series(series_id, SeriesStatus::Active, SeriesStatus::Paused)
            .await
    }

    async fn transition_series(
        &self,
        series_id: Ulid,
        to: SeriesStatus,
        expected: SeriesStatus,
    ) -> Result<(), EngineError> {
        let arc = self
            .get_series(&series_id)
            .ok_or(EngineError::NotFound(series_id))?;
        let mut guard = arc.write().await;
        if guard.status != expected {
            return Err(EngineError::SeriesStateViolation {
                series_id,
                reason: match guard.status {
                    SeriesStatus::Cancelled => "series is cancelled",
                    SeriesStatus::Completed => "series is completed",
                    _ => "series not in the expected state",
                },
            });
        }
        let at = now_ms();
        let event = Event::SeriesStatusChanged {
            id: series_id,
            status: to,
            at,
        };
        self.journal_append(&event).await?;
        guard.status = to;
        guard.updated_at = at;
        Ok(())
    }

    /// Cancel the series and every future active occurrence in one atomic
    /// step (a single journal record applied under both write guards).
    /// Past occurrences keep their history.
    pub async fn cancel_series(&self, series_id: Ulid) -> Result<u32, EngineError> {
        let arc = self
            .get_series(&series_id)
            .ok_or(EngineError::NotFound(series_id))?;
        let (resource_id, status) = {
            let guard = arc.read().await;
            (guard.resource_id, guard.status)
        };
        if matches!(status, SeriesStatus::Cancelled) {
            return Err(EngineError::SeriesStateViolation {
                series_id,
                reason: "series is cancelled",
            });
        }

        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write_owned().await;

        let now = now_ms();
        let from_sequence = guard
            .appointments
            .iter()
            .filter(|a| a.status.is_active() && a.span.start >= now)
            .filter_map(|a| a.series.filter(|s| s.series_id == series_id))
            .map(|s| s.sequence)
            .min()
            .unwrap_or(u32::MAX);

        self.truncate_series_locked(&mut guard, series_id, resource_id, from_sequence)
            .await
    }

    async fn truncate_series_locked(
        &self,
        guard: &mut ResourceState,
        series_id: Ulid,
        resource_id: Ulid,
        from_sequence: u32,
    ) -> Result<u32, EngineError> {
        let affected = guard
            .appointments
            .iter()
            .filter(|a| {
                a.status.is_active()
                    && a.series
                        .is_some_and(|s| s.series_id == series_id && s.sequence >= from_sequence)
            })
            .count() as u32;

        let event = Event::SeriesTruncated {
            id: series_id,
            resource_id,
            from_sequence,
            at: now_ms(),
        };
        self.persist_and_apply(guard, &event).await?;
        Ok(affected)
    }

    // ── Occurrence management ────────────────────────────

    /// Apply an action to one occurrence or to all remaining occurrences of
    /// its series. `RemainingSeries` touches future `Pending`/`Confirmed`
    /// occurrences only — the past stays untouched.
    pub async fn manage_occurrence(
        &self,
        action: OccurrenceAction,
        appointment_id: Ulid,
        scope: ActionScope,
        holidays: &HolidaySnapshot,
    ) -> Result<OccurrenceOutcome, EngineError> {
        match scope {
            ActionScope::Single => match action {
                OccurrenceAction::Cancel => {
                    self.set_appointment_status(appointment_id, AppointmentStatus::Cancelled)
                        .await?;
                    Ok(OccurrenceOutcome::Updated { appointment_id })
                }
                OccurrenceAction::Complete => {
                    self.set_appointment_status(appointment_id, AppointmentStatus::Completed)
                        .await?;
                    Ok(OccurrenceOutcome::Updated { appointment_id })
                }
                OccurrenceAction::Reschedule { to } => {
                    let start = self
                        .reschedule_appointment(appointment_id, to, holidays, false)
                        .await?;
                    Ok(OccurrenceOutcome::Moved {
                        appointment_id,
                        start,
                    })
                }
            },
            ActionScope::RemainingSeries => {
                self.manage_remaining(action, appointment_id, holidays).await
            }
        }
    }

    async fn manage_remaining(
        &self,
        action: OccurrenceAction,
        appointment_id: Ulid,
        holidays: &HolidaySnapshot,
    ) -> Result<OccurrenceOutcome, EngineError> {
        let (resource_id, mut guard) = self.resolve_appointment_write(&appointment_id).await?;
        let appt = guard
            .appointment(appointment_id)
            .ok_or(EngineError::NotFound(appointment_id))?;
        let slot = appt.series.ok_or(EngineError::LimitExceeded(
            "appointment is not part of a series",
        ))?;
        let anchor_start = appt.span.start;

        let series_arc = self
            .get_series(&slot.series_id)
            .ok_or(EngineError::NotFound(slot.series_id))?;
        let series_status = series_arc.read().await.status;
        if series_status == SeriesStatus::Cancelled {
            return Err(EngineError::SeriesStateViolation {
                series_id: slot.series_id,
                reason: "series is cancelled",
            });
        }

        match action {
            OccurrenceAction::Cancel => {
                let affected = self
                    .truncate_series_locked(&mut guard, slot.series_id, resource_id, slot.sequence)
                    .await?;
                Ok(OccurrenceOutcome::Bulk { affected })
            }
            OccurrenceAction::Complete => {
                let targets: Vec<Ulid> = guard
                    .appointments
                    .iter()
                    .filter(|a| {
                        a.status.is_active()
                            && a.series.is_some_and(|s| {
                                s.series_id == slot.series_id && s.sequence >= slot.sequence
                            })
                    })
                    .map(|a| a.id)
                    .collect();
                let mut affected = 0;
                for id in targets {
                    let event = Event::AppointmentStatusChanged {
                        id,
                        resource_id,
                        status: AppointmentStatus::Completed,
                    };
                    self.persist_and_apply(&mut guard, &event).await?;
                    affected += 1;
                }
                Ok(OccurrenceOutcome::Bulk { affected })
            }
            OccurrenceAction::Reschedule { to } => {
                let delta = to - anchor_start;
                self.shift_remaining(&mut guard, resource_id, slot, delta, holidays)
                    .await
            }
        }
    }

    /// Shift every remaining occurrence by the same delta. Validate-all
    /// first, then apply-all under the same resource guard — either every
    /// target moves or none do.
    async fn shift_remaining(
        &self,
        guard: &mut ResourceState,
        resource_id: Ulid,
        slot: SeriesSlot,
        delta: Ms,
        holidays: &HolidaySnapshot,
    ) -> Result<OccurrenceOutcome, EngineError> {
        let moving: Vec<(Ulid, Span)> = guard
            .appointments
            .iter()
            .filter(|a| {
                a.status.is_active()
                    && a.series
                        .is_some_and(|s| s.series_id == slot.series_id && s.sequence >= slot.sequence)
            })
            .map(|a| {
                (
                    a.id,
                    Span::new(a.span.start + delta, a.span.end + delta),
                )
            })
            .collect();

        let globals = self.globals_snapshot();
        for (id, new_span) in &moving {
            let obstacles: Vec<_> = find_conflicts(guard, &globals, new_span, holidays, false, Some(*id))
                .into_iter()
                // Other members of the batch move with us — their old spans
                // are not obstacles.
                .filter(|o| match o {
                    super::conflict::Obstacle::Appointment { id: oid, .. } => {
                        !moving.iter().any(|(mid, _)| mid == oid)
                    }
                    _ => true,
                })
                .collect();
            if !obstacles.is_empty() {
                return Err(EngineError::SlotConflict(obstacles));
            }
        }

        let mut affected = 0;
        for (id, new_span) in moving {
            let event = Event::AppointmentRescheduled {
                id,
                resource_id,
                span: new_span,
            };
            self.persist_and_apply(guard, &event).await?;
            affected += 1;
        }
        Ok(OccurrenceOutcome::Bulk { affected })
    }
}
