use std::sync::Arc;

use chrono_tz::Tz;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::locks::LockKey;
use crate::model::*;
use crate::reconcile::ReconcileTask;

use super::conflict::{find_conflicts, validate_span};
use super::{blackout, now_ms, Engine, EngineError};

impl Engine {
    // ── Resource registry ────────────────────────────────

    /// Register a bookable resource (working hours + timezone read model).
    /// The organization service upstream is the writer of record.
    pub async fn register_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        tz: Tz,
        hours: WeekHours,
        buffer: Ms,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("resource name too long"));
            }
        if buffer < 0 {
            return Err(EngineError::LimitExceeded("buffer must be non-negative"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceRegistered {
            id,
            name: name.clone(),
            tz,
            hours,
            buffer,
        };
        self.journal_append(&event).await?;
        let rs = ResourceState::new(id, name, tz, hours, buffer);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        Ok(())
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        hours: WeekHours,
        buffer: Ms,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("resource name too long"));
            }
        if buffer < 0 {
            return Err(EngineError::LimitExceeded("buffer must be non-negative"));
        }
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        let event = Event::ResourceUpdated {
            id,
            name,
            hours,
            buffer,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Blackouts ────────────────────────────────────────

    /// Create a blackout for one resource (or tenant-wide with
    /// `resource_id: None`). Returns how many existing active appointments
    /// the new blackout landed on; those are reconciled asynchronously —
    /// auto-rescheduled or flagged for review, never silently dropped.
    pub async fn create_blackout(
        &self,
        resource_id: Option<Ulid>,
        blackout: BlackoutInterval,
    ) -> Result<usize, EngineError> {
        blackout::validate_blackout(&blackout)?;

        let affected = match resource_id {
            Some(rid) => {
                let rs = self.get_resource(&rid).ok_or(EngineError::NotFound(rid))?;
                let mut guard = rs.write().await;
                if guard.blackouts.len() >= MAX_BLACKOUTS_PER_RESOURCE {
                    return Err(EngineError::LimitExceeded("too many blackouts on resource"));
                }
                let event = Event::BlackoutCreated {
                    resource_id: Some(rid),
                    blackout: blackout.clone(),
                };
                self.persist_and_apply(&mut guard, &event).await?;
                count_hit_appointments(&guard, &blackout, now_ms())
            }
            None => {
                let event = Event::BlackoutCreated {
                    resource_id: None,
                    blackout: blackout.clone(),
                };
                self.journal_append(&event).await?;
                self.push_global_blackout(blackout.clone());

                let mut affected = 0;
                for entry in self.state.iter() {
                    let rs = entry.value().clone();
                    let guard = rs.read().await;
                    affected += count_hit_appointments(&guard, &blackout, now_ms());
                }
                affected
            }
        };

        if affected > 0 {
            self.enqueue_reconcile(ReconcileTask {
                resource_id,
                blackout_id: blackout.id,
            });
        }
        Ok(affected)
    }

    pub async fn remove_blackout(&self, id: Ulid) -> Result<(), EngineError> {
        if let Some(resource_id) = self.resource_for_entity(&id) {
            let rs = self
                .get_resource(&resource_id)
                .ok_or(EngineError::NotFound(resource_id))?;
            let mut guard = rs.write().await;
            let event = Event::BlackoutRemoved {
                id,
                resource_id: Some(resource_id),
            };
            return self.persist_and_apply(&mut guard, &event).await;
        }
        if self.remove_global_blackout(id) {
            let event = Event::BlackoutRemoved {
                id,
                resource_id: None,
            };
            return self.journal_append(&event).await;
        }
        Err(EngineError::NotFound(id))
    }

    // ── Single-occurrence lifecycle ──────────────────────

    pub(super) async fn set_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<Ulid, EngineError> {
        let (resource_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let appt = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        if !appt.status.is_active() {
            return Err(EngineError::InvalidTransition {
                appointment_id: id,
                from: appt.status,
            });
        }
        let event = Event::AppointmentStatusChanged {
            id,
            resource_id,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(resource_id)
    }

    /// Move one appointment to a new start, keeping its duration. The new
    /// slot is re-checked under the reservation lock like any fresh booking.
    pub(crate) async fn reschedule_appointment(
        &self,
        id: Ulid,
        new_start: Ms,
        holidays: &HolidaySnapshot,
        allow_holiday: bool,
    ) -> Result<Ms, EngineError> {
        let resource_id = self
            .resource_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;

        let key = LockKey::for_start(resource_id, new_start, self.config.bucket_ms);
        let token = self.locks.acquire(key, self.config.lock_ttl).await?;
        let result = self
            .reschedule_locked(id, resource_id, new_start, holidays, allow_holiday)
            .await;
        self.locks.release(key, token).await;
        result
    }

    async fn reschedule_locked(
        &self,
        id: Ulid,
        resource_id: Ulid,
        new_start: Ms,
        holidays: &HolidaySnapshot,
        allow_holiday: bool,
    ) -> Result<Ms, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write_owned().await;

        let appt = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        if !appt.status.is_active() {
            return Err(EngineError::InvalidTransition {
                appointment_id: id,
                from: appt.status,
            });
        }
        let span = Span::new(new_start, new_start + appt.span.duration_ms());
        validate_span(&span)?;

        let globals = self.globals_snapshot();
        let obstacles = find_conflicts(&guard, &globals, &span, holidays, allow_holiday, Some(id));
        if !obstacles.is_empty() {
            return Err(EngineError::SlotConflict(obstacles));
        }

        let event = Event::AppointmentRescheduled {
            id,
            resource_id,
            span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(new_start)
    }

    /// Flag an appointment for manual review (reconciler fallback path).
    pub(crate) async fn flag_appointment(
        &self,
        id: Ulid,
        reason: String,
    ) -> Result<(), EngineError> {
        let (resource_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let event = Event::AppointmentFlagged {
            id,
            resource_id,
            reason,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    fn push_global_blackout(&self, blackout: BlackoutInterval) {
        self.with_globals_mut(|globals| globals.push(blackout));
    }

    fn remove_global_blackout(&self, id: Ulid) -> bool {
        self.with_globals_mut(|globals| {
            let before = globals.len();
            globals.retain(|b| b.id != id);
            globals.len() != before
        })
    }
}

/// Future active appointments the blackout lands on.
fn count_hit_appointments(rs: &ResourceState, blackout: &BlackoutInterval, now: Ms) -> usize {
    rs.appointments
        .iter()
        .filter(|a| {
            a.status.is_active()
                && a.span.start >= now
                && blackout::hits_span(rs.tz, blackout, &a.span)
        })
        .count()
}
