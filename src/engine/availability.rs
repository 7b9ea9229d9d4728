use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::blackout;
use super::EngineError;

// ── Interval algebra ──────────────────────────────────────────────
// The shared core: blackout merging, slot carving and the conflict
// detector all run on these two functions.

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Subtract sorted disjoint `to_remove` intervals from sorted `base`.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

// ── Open-slot computation ─────────────────────────────────────────

/// The working-hours window of `date` in the resource's timezone, or `None`
/// if the resource is closed that day (or the window falls into a DST gap).
pub fn day_window(rs: &ResourceState, date: NaiveDate) -> Option<(Span, u32)> {
    let (open, close) = rs.hours.on(date.weekday())?;
    if open >= close {
        return None;
    }
    let start = local_ms(rs.tz, date, open)?;
    let end = local_ms(rs.tz, date, close)?;
    (start < end).then_some((Span::new(start, end), close - open))
}

/// Candidate start times for a booking of `duration` on `date`, stepped on
/// the `granularity_min` grid inside working hours, excluding anything
/// already consumed by an active appointment (buffer applied) or a blackout.
///
/// Read-only, computed against a point-in-time snapshot — a returned slot is
/// advisory until `reserve` re-checks it under the lock.
pub fn open_slots(
    rs: &ResourceState,
    globals: &[BlackoutInterval],
    date: NaiveDate,
    granularity_min: u32,
    duration: Ms,
    holidays: &HolidaySnapshot,
    allow_holiday: bool,
    exclude: Option<Ulid>,
) -> Result<Vec<Ms>, EngineError> {
    let Some((window, window_min)) = day_window(rs, date) else {
        return Ok(Vec::new());
    };
    if granularity_min == 0 || window_min % granularity_min != 0 {
        return Err(EngineError::InvalidGranularity {
            granularity_min,
            window_min,
        });
    }
    if !allow_holiday && holidays.contains(date) {
        return Ok(Vec::new());
    }
    if duration <= 0 || duration > window.duration_ms() {
        return Ok(Vec::new());
    }

    let mut blocked = rs.active_padded(&window, exclude);
    blocked.extend(blackout::blocked_ranges(rs, globals, &window)?);
    blocked.sort_by_key(|s| s.start);
    let free = subtract_intervals(&[window], &merge_overlapping(&blocked));

    let step = granularity_min as Ms * MINUTE_MS;
    let mut slots = Vec::new();
    let mut fi = 0;
    let mut start = window.start;
    while start + duration <= window.end {
        let candidate = Span::new(start, start + duration);
        while fi < free.len() && free[fi].end < candidate.end {
            fi += 1;
        }
        if fi < free.len() && free[fi].contains_span(&candidate) {
            slots.push(start);
        }
        start += step;
    }
    Ok(slots)
}

/// Nearest open slot to `around` within ±`window_days`, scanning days
/// outward by distance and comparing candidates by |start − around|.
/// Days whose working window doesn't fit the search granularity are
/// treated as closed rather than failing the whole search.
#[allow(clippy::too_many_arguments)]
pub fn nearest_open_slot(
    rs: &ResourceState,
    globals: &[BlackoutInterval],
    around: Ms,
    duration: Ms,
    window_days: u32,
    granularity_min: u32,
    holidays: &HolidaySnapshot,
    allow_holiday: bool,
    exclude: Option<Ulid>,
) -> Option<Ms> {
    let anchor = date_of(rs.tz, around);

    for offset in 0..=window_days as i64 {
        let mut best: Option<Ms> = None;
        let days: &[i64] = if offset == 0 { &[0] } else { &[offset, -offset] };
        for delta in days {
            let Some(date) = anchor
                .checked_add_signed(chrono::Duration::days(*delta)) else {
                    continue;
                };
            let slots = match open_slots(
                rs,
                globals,
                date,
                granularity_min,
                duration,
                holidays,
                allow_holiday,
                exclude,
            ) {
                Ok(slots) => slots,
                Err(EngineError::InvalidGranularity { .. }) => continue,
                Err(_) => continue,
            };
            for s in slots {
                if best.is_none_or(|b| (s - around).abs() < (b - around).abs()) {
                    best = Some(s);
                }
            }
        }
        if best.is_some() {
            return best;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppointmentStatus, WeekHours};

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;

    fn chair(buffer: Ms) -> ResourceState {
        ResourceState::new(
            Ulid::new(),
            Some("Chair 1".into()),
            chrono_tz::UTC,
            WeekHours::every_day(9 * 60, 17 * 60),
            buffer,
        )
    }

    fn book(rs: &mut ResourceState, start: Ms, end: Ms) {
        rs.insert_appointment(crate::model::Appointment {
            id: Ulid::new(),
            span: Span::new(start, end),
            status: AppointmentStatus::Confirmed,
            series: None,
            original_start: None,
            label: None,
            needs_review: false,
        });
    }

    fn jan6() -> NaiveDate {
        // A Monday.
        NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
    }

    fn day_start(date: NaiveDate) -> Ms {
        local_ms(chrono_tz::UTC, date, 0).unwrap()
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![
            Span::new(100, 200),
            Span::new(400, 500),
            Span::new(800, 900),
        ];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }

    // ── open_slots ───────────────────────────────────────

    #[test]
    fn full_day_open() {
        let rs = chair(0);
        let snap = HolidaySnapshot::default();
        let slots = open_slots(&rs, &[], jan6(), 60, 60 * M, &snap, false, None).unwrap();
        // 09:00..17:00 hourly, last start 16:00
        assert_eq!(slots.len(), 8);
        let base = day_start(jan6());
        assert_eq!(slots[0], base + 9 * H);
        assert_eq!(slots[7], base + 16 * H);
    }

    #[test]
    fn booking_consumes_slots() {
        let mut rs = chair(0);
        let base = day_start(jan6());
        book(&mut rs, base + 10 * H, base + 10 * H + 30 * M);
        let snap = HolidaySnapshot::default();
        let slots = open_slots(&rs, &[], jan6(), 60, 60 * M, &snap, false, None).unwrap();
        // The 10:00 hour is partially consumed → that start disappears.
        assert!(!slots.contains(&(base + 10 * H)));
        assert!(slots.contains(&(base + 9 * H)));
        assert!(slots.contains(&(base + 11 * H)));
    }

    #[test]
    fn buffer_blocks_adjacent_slot() {
        let mut rs = chair(15 * M);
        let base = day_start(jan6());
        book(&mut rs, base + 10 * H, base + 11 * H);
        let snap = HolidaySnapshot::default();
        let slots = open_slots(&rs, &[], jan6(), 60, 60 * M, &snap, false, None).unwrap();
        // 09:00 start would end at 10:00, inside the 15min pre-buffer.
        assert!(!slots.contains(&(base + 9 * H)));
        // 11:00 start begins inside the 15min post-buffer.
        assert!(!slots.contains(&(base + 11 * H)));
        assert!(slots.contains(&(base + 12 * H)));
    }

    #[test]
    fn granularity_must_divide_window() {
        let rs = chair(0);
        let snap = HolidaySnapshot::default();
        // 8h window, 7min granularity → 480 % 7 != 0
        let result = open_slots(&rs, &[], jan6(), 7, 30 * M, &snap, false, None);
        assert!(matches!(
            result,
            Err(EngineError::InvalidGranularity {
                granularity_min: 7,
                window_min: 480
            })
        ));
    }

    #[test]
    fn zero_granularity_rejected() {
        let rs = chair(0);
        let snap = HolidaySnapshot::default();
        let result = open_slots(&rs, &[], jan6(), 0, 30 * M, &snap, false, None);
        assert!(matches!(result, Err(EngineError::InvalidGranularity { .. })));
    }

    #[test]
    fn closed_day_has_no_slots() {
        let mut rs = chair(0);
        rs.hours = WeekHours::weekdays(9 * 60, 17 * 60);
        let saturday = NaiveDate::from_ymd_opt(2025, 1, 4).unwrap();
        let snap = HolidaySnapshot::default();
        let slots = open_slots(&rs, &[], saturday, 30, 30 * M, &snap, false, None).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn holiday_closes_day_unless_allowed() {
        let rs = chair(0);
        let snap = HolidaySnapshot::new(1, [jan6()]);
        let closed = open_slots(&rs, &[], jan6(), 60, 30 * M, &snap, false, None).unwrap();
        assert!(closed.is_empty());
        let open = open_slots(&rs, &[], jan6(), 60, 30 * M, &snap, true, None).unwrap();
        assert!(!open.is_empty());
    }

    #[test]
    fn blackout_window_consumes_slots() {
        let mut rs = chair(0);
        rs.blackouts.push(BlackoutInterval {
            id: Ulid::new(),
            anchor: jan6(),
            window: Some((12 * 60, 13 * 60)),
            recurrence: BlackoutRecurrence::None,
            reason: Some("lunch".into()),
            auto_reschedule: false,
        });
        let snap = HolidaySnapshot::default();
        let slots = open_slots(&rs, &[], jan6(), 60, 60 * M, &snap, false, None).unwrap();
        let base = day_start(jan6());
        assert!(!slots.contains(&(base + 12 * H)));
        assert!(slots.contains(&(base + 11 * H)));
        assert!(slots.contains(&(base + 13 * H)));
    }

    #[test]
    fn excluded_appointment_frees_its_slot() {
        let mut rs = chair(0);
        let base = day_start(jan6());
        let id = Ulid::new();
        rs.insert_appointment(crate::model::Appointment {
            id,
            span: Span::new(base + 10 * H, base + 11 * H),
            status: AppointmentStatus::Confirmed,
            series: None,
            original_start: None,
            label: None,
            needs_review: false,
        });
        let snap = HolidaySnapshot::default();
        let without = open_slots(&rs, &[], jan6(), 60, 60 * M, &snap, false, None).unwrap();
        assert!(!without.contains(&(base + 10 * H)));
        let with = open_slots(&rs, &[], jan6(), 60, 60 * M, &snap, false, Some(id)).unwrap();
        assert!(with.contains(&(base + 10 * H)));
    }

    // ── nearest_open_slot ────────────────────────────────

    #[test]
    fn nearest_prefers_same_day() {
        let rs = chair(0);
        let base = day_start(jan6());
        let snap = HolidaySnapshot::default();
        let found = nearest_open_slot(
            &rs, &[], base + 10 * H, 30 * M, 14, 30, &snap, false, None,
        );
        assert_eq!(found, Some(base + 10 * H));
    }

    #[test]
    fn nearest_skips_fully_booked_day() {
        let mut rs = chair(0);
        let base = day_start(jan6());
        book(&mut rs, base + 9 * H, base + 17 * H);
        let snap = HolidaySnapshot::default();
        let found = nearest_open_slot(
            &rs, &[], base + 10 * H, 30 * M, 14, 30, &snap, false, None,
        )
        .unwrap();
        // Next or previous day, whichever slot is closest to 10:00 Monday.
        assert_ne!(date_of(rs.tz, found), jan6());
        let prev_day_close = base - 7 * H; // Sunday 17:00
        assert_eq!(found, prev_day_close - 30 * M);
    }

    #[test]
    fn nearest_gives_up_when_resource_closed() {
        let mut rs = chair(0);
        rs.hours = WeekHours([None; 7]);
        let base = day_start(jan6());
        let snap = HolidaySnapshot::default();
        let found = nearest_open_slot(
            &rs, &[], base + 10 * H, 30 * M, 5, 30, &snap, false, None,
        );
        assert_eq!(found, None);
    }
}
