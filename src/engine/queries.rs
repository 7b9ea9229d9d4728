use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{availability, blackout, conflict, recurrence, Engine, EngineError};

impl Engine {
    /// Ordered candidate start times for a booking on one calendar date.
    /// A point-in-time snapshot — `reserve` re-checks under the lock.
    pub async fn get_open_slots(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        granularity_min: u32,
        duration: Ms,
        holidays: &HolidaySnapshot,
        allow_holiday: bool,
    ) -> Result<Vec<Ms>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let globals = self.globals_snapshot();
        availability::open_slots(
            &guard,
            &globals,
            date,
            granularity_min,
            duration,
            holidays,
            allow_holiday,
            None,
        )
    }

    /// All obstacles a candidate booking would collide with. Empty means
    /// bookable (advisory — see `reserve`).
    pub async fn find_conflicts(
        &self,
        resource_id: Ulid,
        start: Ms,
        duration: Ms,
        holidays: &HolidaySnapshot,
        allow_holiday: bool,
    ) -> Result<Vec<conflict::Obstacle>, EngineError> {
        if duration <= 0 {
            return Err(EngineError::LimitExceeded("span must have positive duration"));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let globals = self.globals_snapshot();
        Ok(conflict::find_conflicts(
            &guard,
            &globals,
            &Span::new(start, start + duration),
            holidays,
            allow_holiday,
            None,
        ))
    }

    /// Dry-run of the pattern expander — occurrence start instants without
    /// persisting anything. The same expansion drives `create_series`, so
    /// previewed starts match what a conflict-free creation would book.
    pub async fn preview_pattern(
        &self,
        resource_id: Ulid,
        pattern: &RecurrencePattern,
        start_date: NaiveDate,
        limit: Option<usize>,
        holidays: &HolidaySnapshot,
    ) -> Result<Vec<Ms>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let tz = rs.read().await.tz;
        let mut starts = recurrence::occurrence_starts(tz, pattern, start_date, holidays)?;
        if let Some(n) = limit {
            starts.truncate(n);
        }
        Ok(starts)
    }

    /// Union of blocked time for a resource over a range (blackouts only;
    /// holidays are a date-set test layered on top by the caller).
    pub async fn blocked_ranges(
        &self,
        resource_id: Ulid,
        range: Span,
    ) -> Result<Vec<Span>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let globals = self.globals_snapshot();
        blackout::blocked_ranges(&guard, &globals, &range)
    }

    pub async fn is_blocked(&self, resource_id: Ulid, at: Ms) -> Result<bool, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let globals = self.globals_snapshot();
        Ok(blackout::is_blocked(&guard, &globals, at))
    }

    pub fn resource_ids(&self) -> Vec<Ulid> {
        self.state.iter().map(|e| *e.key()).collect()
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out = Vec::new();
        for id in self.resource_ids() {
            let Some(rs) = self.get_resource(&id) else {
                continue;
            };
            let guard = rs.read().await;
            out.push(ResourceInfo {
                id: guard.id,
                name: guard.name.clone(),
                tz: guard.tz,
                hours: guard.hours,
                buffer: guard.buffer,
            });
        }
        out
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<AppointmentInfo, EngineError> {
        let resource_id = self
            .resource_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let appt = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        Ok(appointment_info(resource_id, appt))
    }

    /// Appointments on a resource overlapping the window, in start order.
    pub async fn appointments_in(
        &self,
        resource_id: Ulid,
        window: Span,
    ) -> Result<Vec<AppointmentInfo>, EngineError> {
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard
            .overlapping(&window)
            .map(|a| appointment_info(resource_id, a))
            .collect())
    }

    /// Aggregated series status for dashboards.
    pub async fn series_report(&self, series_id: Ulid) -> Result<SeriesReport, EngineError> {
        let arc = self
            .get_series(&series_id)
            .ok_or(EngineError::NotFound(series_id))?;
        let guard = arc.read().await;
        Ok(SeriesReport {
            id: guard.id,
            resource_id: guard.resource_id,
            status: guard.status,
            total_planned: guard.total_planned,
            completed_count: guard.completed_count,
            cancelled_count: guard.cancelled_count,
            appointments: guard.appointments.iter().map(|(_, id)| *id).collect(),
        })
    }
}

fn appointment_info(resource_id: Ulid, appt: &Appointment) -> AppointmentInfo {
    AppointmentInfo {
        id: appt.id,
        resource_id,
        span: appt.span,
        status: appt.status,
        series: appt.series,
        original_start: appt.original_start,
        needs_review: appt.needs_review,
    }
}
