use std::collections::HashSet;

use chrono::{NaiveDate, TimeZone, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Inflate by `pad` on both sides, clamping the start at zero.
    pub fn padded(&self, pad: Ms) -> Span {
        Span::new((self.start - pad).max(0), self.end + pad)
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    /// Active appointments occupy their slot; terminal ones free it.
    pub fn is_active(&self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }
}

/// Position of an appointment inside a recurring series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesSlot {
    pub series_id: Ulid,
    pub sequence: u32,
}

/// A single scheduled occurrence. Never deleted — cancellation is a status
/// transition, so history survives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub span: Span,
    pub status: AppointmentStatus,
    pub series: Option<SeriesSlot>,
    /// Previous start time, set once the appointment has been rescheduled.
    pub original_start: Option<Ms>,
    pub label: Option<String>,
    /// Set by the reconciler when a blackout landed on this appointment and
    /// auto-reschedule was off or found no slot.
    pub needs_review: bool,
}

// ── Blackouts & holidays ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlackoutRecurrence {
    None,
    Weekly,
    Monthly,
    Yearly,
}

/// An unavailability window anchored on a calendar date in the resource's
/// timezone. `window` is minutes from midnight; `None` means the full day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutInterval {
    pub id: Ulid,
    pub anchor: NaiveDate,
    pub window: Option<(u32, u32)>,
    pub recurrence: BlackoutRecurrence,
    pub reason: Option<String>,
    pub auto_reschedule: bool,
}

/// Versioned, immutable holiday date set. Callers pass a snapshot handle
/// into each engine call — there is no hidden global holiday cache.
#[derive(Debug, Clone, Default)]
pub struct HolidaySnapshot {
    pub version: u64,
    dates: HashSet<NaiveDate>,
}

impl HolidaySnapshot {
    pub fn new(version: u64, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            version,
            dates: dates.into_iter().collect(),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

// ── Recurrence patterns ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Weekly { weekdays: Vec<Weekday> },
    Biweekly { weekdays: Vec<Weekday> },
    /// Same day-of-month each month; months missing the day are skipped,
    /// never clamped.
    MonthlyByDate { day: u32 },
    /// E.g. "2nd Tuesday": nth is 1-based, 1..=5.
    MonthlyByWeekday { weekday: Weekday, nth: u8 },
    CustomIntervalDays { interval: u32 },
}

/// Fixed end date XOR fixed occurrence count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndCondition {
    Until(NaiveDate),
    Count(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    Reject,
    RescheduleNearest,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub frequency: Frequency,
    /// Preferred start, minutes from midnight in the resource's timezone.
    pub time_of_day: u32,
    pub duration: Ms,
    pub end: EndCondition,
    pub skip_holidays: bool,
    pub skip_weekends: bool,
    pub policy: ConflictPolicy,
}

// ── Series ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

/// The aggregate binding a pattern to its generated appointments.
#[derive(Debug, Clone)]
pub struct SeriesState {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub pattern: RecurrencePattern,
    pub status: SeriesStatus,
    pub total_planned: u32,
    pub completed_count: u32,
    pub cancelled_count: u32,
    /// `(sequence, appointment id)`, kept sorted by sequence. Bulk
    /// generation may land occurrences out of order.
    pub appointments: Vec<(u32, Ulid)>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl SeriesState {
    /// Record an occurrence at its sequence position.
    pub fn insert_occurrence(&mut self, sequence: u32, appointment_id: Ulid) {
        let pos = self
            .appointments
            .binary_search_by_key(&sequence, |(seq, _)| *seq)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, (sequence, appointment_id));
    }
}

// ── Resources ────────────────────────────────────────────────────

/// Per-weekday open/close in minutes from midnight, Monday first.
/// `None` means closed that day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekHours(pub [Option<(u32, u32)>; 7]);

impl WeekHours {
    /// Same open/close Monday–Friday, closed weekends.
    pub fn weekdays(open_min: u32, close_min: u32) -> Self {
        let mut days = [Some((open_min, close_min)); 7];
        days[5] = None;
        days[6] = None;
        WeekHours(days)
    }

    pub fn every_day(open_min: u32, close_min: u32) -> Self {
        WeekHours([Some((open_min, close_min)); 7])
    }

    pub fn on(&self, weekday: Weekday) -> Option<(u32, u32)> {
        self.0[weekday.num_days_from_monday() as usize]
    }
}

/// In-memory state of one bookable resource. Appointments are kept sorted
/// by `span.start`; blackouts are unordered (there are few of them).
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub tz: Tz,
    pub hours: WeekHours,
    /// Buffer applied symmetrically before and after each active appointment.
    pub buffer: Ms,
    pub appointments: Vec<Appointment>,
    pub blackouts: Vec<BlackoutInterval>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>, tz: Tz, hours: WeekHours, buffer: Ms) -> Self {
        Self {
            id,
            name,
            tz,
            hours,
            buffer,
            appointments: Vec::new(),
            blackouts: Vec::new(),
        }
    }

    /// Insert an appointment maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appt: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appt.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appt);
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Remove and re-insert under the new span, preserving sort order.
    /// `original_start` keeps the first scheduled time across repeated moves.
    pub fn move_appointment(&mut self, id: Ulid, span: Span) {
        if let Some(pos) = self.appointments.iter().position(|a| a.id == id) {
            let mut appt = self.appointments.remove(pos);
            appt.original_start = appt.original_start.or(Some(appt.span.start));
            appt.span = span;
            self.insert_appointment(appt);
        }
    }

    /// Appointments whose span overlaps the query window, in start order.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// Spans of active appointments near the query, inflated by the buffer
    /// on both sides and sorted by start. `exclude` leaves one appointment
    /// out — used when searching a new slot for that same appointment.
    pub fn active_padded(&self, query: &Span, exclude: Option<Ulid>) -> Vec<Span> {
        let buffer = self.buffer;
        let padded_query = query.padded(buffer);
        let mut spans: Vec<Span> = self
            .overlapping(&padded_query)
            .filter(|a| a.status.is_active() && Some(a.id) != exclude)
            .map(|a| a.span.padded(buffer))
            .collect();
        spans.sort_by_key(|s| s.start);
        spans
    }

    pub fn remove_blackout(&mut self, id: Ulid) -> Option<BlackoutInterval> {
        if let Some(pos) = self.blackouts.iter().position(|b| b.id == id) {
            Some(self.blackouts.remove(pos))
        } else {
            None
        }
    }
}

/// Resolve a local (date, minutes-from-midnight) to unix ms in `tz`.
///
/// DST gaps make some local times nonexistent — those resolve to `None` and
/// callers skip the slot. Ambiguous times (fall-back) take the earlier
/// instant.
pub fn local_ms(tz: Tz, date: NaiveDate, minutes: u32) -> Option<Ms> {
    let naive = date.and_hms_opt(minutes / 60, minutes % 60, 0)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// The calendar date an instant falls on in `tz`.
pub fn date_of(tz: Tz, at: Ms) -> NaiveDate {
    tz.timestamp_millis_opt(at)
        .earliest()
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

// ── Journal record format ────────────────────────────────────────

/// The event types — flat, no nesting. This is the journal record format;
/// replaying the log in order rebuilds all engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        name: Option<String>,
        tz: Tz,
        hours: WeekHours,
        buffer: Ms,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        hours: WeekHours,
        buffer: Ms,
    },
    AppointmentBooked {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        series: Option<SeriesSlot>,
        label: Option<String>,
    },
    AppointmentRescheduled {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
    },
    AppointmentStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: AppointmentStatus,
    },
    AppointmentFlagged {
        id: Ulid,
        resource_id: Ulid,
        reason: String,
    },
    BlackoutCreated {
        /// `None` targets every resource of the tenant.
        resource_id: Option<Ulid>,
        blackout: BlackoutInterval,
    },
    BlackoutRemoved {
        id: Ulid,
        resource_id: Option<Ulid>,
    },
    SeriesCreated {
        id: Ulid,
        resource_id: Ulid,
        pattern: RecurrencePattern,
        total_planned: u32,
        at: Ms,
    },
    SeriesStatusChanged {
        id: Ulid,
        status: SeriesStatus,
        at: Ms,
    },
    /// Written after bulk generation when some planned occurrences failed,
    /// so completion bookkeeping tracks what actually got booked.
    SeriesPlanAdjusted {
        id: Ulid,
        total_planned: u32,
    },
    /// Bulk cancel of every active occurrence with sequence >= from_sequence.
    /// One record so the cascade is atomic across crash/replay.
    SeriesTruncated {
        id: Ulid,
        resource_id: Ulid,
        from_sequence: u32,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub tz: Tz,
    pub hours: WeekHours,
    pub buffer: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub status: AppointmentStatus,
    pub series: Option<SeriesSlot>,
    pub original_start: Option<Ms>,
    pub needs_review: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesReport {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub status: SeriesStatus,
    pub total_planned: u32,
    pub completed_count: u32,
    pub cancelled_count: u32,
    pub appointments: Vec<Ulid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn appt(start: Ms, end: Ms, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            span: Span::new(start, end),
            status,
            series: None,
            original_start: None,
            label: None,
            needs_review: false,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn span_padded_clamps_at_zero() {
        let s = Span::new(100, 200).padded(500);
        assert_eq!(s, Span::new(0, 700));
    }

    #[test]
    fn appointment_ordering() {
        let mut rs = ResourceState::new(
            Ulid::new(),
            None,
            chrono_tz::UTC,
            WeekHours::every_day(0, 1440),
            0,
        );
        for start in [300, 100, 200] {
            rs.insert_appointment(appt(start, start + 50, AppointmentStatus::Pending));
        }
        let starts: Vec<Ms> = rs.appointments.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_respects_half_open() {
        let mut rs = ResourceState::new(
            Ulid::new(),
            None,
            chrono_tz::UTC,
            WeekHours::every_day(0, 1440),
            0,
        );
        rs.insert_appointment(appt(100, 200, AppointmentStatus::Confirmed));
        assert!(rs.overlapping(&Span::new(200, 300)).next().is_none());
        assert_eq!(rs.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn active_padded_skips_terminal_statuses() {
        let mut rs = ResourceState::new(
            Ulid::new(),
            None,
            chrono_tz::UTC,
            WeekHours::every_day(0, 1440),
            10,
        );
        rs.insert_appointment(appt(100, 200, AppointmentStatus::Cancelled));
        rs.insert_appointment(appt(300, 400, AppointmentStatus::Confirmed));
        let padded = rs.active_padded(&Span::new(0, 1000), None);
        assert_eq!(padded, vec![Span::new(290, 410)]);
    }

    #[test]
    fn move_appointment_records_original_start() {
        let mut rs = ResourceState::new(
            Ulid::new(),
            None,
            chrono_tz::UTC,
            WeekHours::every_day(0, 1440),
            0,
        );
        let a = appt(100, 200, AppointmentStatus::Confirmed);
        let id = a.id;
        rs.insert_appointment(a);
        rs.move_appointment(id, Span::new(500, 600));
        let moved = rs.appointment(id).unwrap();
        assert_eq!(moved.span, Span::new(500, 600));
        assert_eq!(moved.original_start, Some(100));
    }

    #[test]
    fn week_hours_lookup() {
        let hours = WeekHours::weekdays(9 * 60, 17 * 60);
        assert_eq!(hours.on(Weekday::Mon), Some((540, 1020)));
        assert_eq!(hours.on(Weekday::Sat), None);
        assert_eq!(hours.on(Weekday::Sun), None);
    }

    #[test]
    fn local_ms_utc() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        let at = local_ms(chrono_tz::UTC, date, 14 * 60).unwrap();
        assert_eq!(date_of(chrono_tz::UTC, at), date);
        assert_eq!(at % DAY_MS, 14 * HOUR_MS);
    }

    #[test]
    fn local_ms_dst_gap_is_none() {
        // US/Eastern 2025-03-09: 02:30 does not exist (spring forward).
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert!(local_ms(chrono_tz::US::Eastern, date, 2 * 60 + 30).is_none());
        assert!(local_ms(chrono_tz::US::Eastern, date, 3 * 60).is_some());
    }

    #[test]
    fn holiday_snapshot_membership() {
        let d = NaiveDate::from_ymd_opt(2025, 1, 20).unwrap();
        let snap = HolidaySnapshot::new(1, [d]);
        assert!(snap.contains(d));
        assert!(!snap.contains(d.succ_opt().unwrap()));
        assert_eq!(snap.version, 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            span: Span::new(1000, 2000),
            series: Some(SeriesSlot {
                series_id: Ulid::new(),
                sequence: 3,
            }),
            label: Some("cut + shave".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
