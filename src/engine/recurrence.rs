use chrono::{Datelike, NaiveDate, Weekday};
use chrono_tz::Tz;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

// ── Shared date arithmetic ───────────────────────────────────────
// The blackout registry expands its recurring intervals with the same
// helpers the pattern expander steps with.

/// Whether a recurring rule anchored at `anchor` lands on `date`.
/// Monthly recurrences on the 29th–31st skip months missing that day —
/// same skip-not-clamp behavior as `MonthlyByDate` patterns.
pub(crate) fn recurring_date_matches(
    rule: BlackoutRecurrence,
    anchor: NaiveDate,
    date: NaiveDate,
) -> bool {
    if date < anchor {
        return false;
    }
    match rule {
        BlackoutRecurrence::None => date == anchor,
        BlackoutRecurrence::Weekly => date.weekday() == anchor.weekday(),
        BlackoutRecurrence::Monthly => date.day() == anchor.day(),
        BlackoutRecurrence::Yearly => {
            date.month() == anchor.month() && date.day() == anchor.day()
        }
    }
}

/// The nth (1-based) `weekday` of a month, or `None` when the month has no
/// nth occurrence (e.g. no 5th Friday).
pub(crate) fn nth_weekday_of_month(
    year: i32,
    month: u32,
    weekday: Weekday,
    nth: u8,
) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (weekday.num_days_from_monday() + 7
        - first.weekday().num_days_from_monday())
        % 7;
    let day = 1 + offset + 7 * (nth as u32 - 1);
    NaiveDate::from_ymd_opt(year, month, day)
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 { (year + 1, 1) } else { (year, month + 1) }
}

// ── Pattern validation ───────────────────────────────────────────

/// Rejected synchronously, before any lock is taken or journal record
/// written.
pub fn validate_pattern(p: &RecurrencePattern) -> Result<(), EngineError> {
    match &p.frequency {
        Frequency::Weekly { weekdays } | Frequency::Biweekly { weekdays } => {
            if weekdays.is_empty() {
                return Err(EngineError::LimitExceeded("weekday set empty"));
            }
        }
        Frequency::MonthlyByDate { day } => {
            if !(1..=31).contains(day) {
                return Err(EngineError::LimitExceeded("day-of-month out of range"));
            }
        }
        Frequency::MonthlyByWeekday { nth, .. } => {
            if !(1..=5).contains(nth) {
                return Err(EngineError::LimitExceeded("nth weekday out of range"));
            }
        }
        Frequency::CustomIntervalDays { interval } => {
            if *interval == 0 {
                return Err(EngineError::LimitExceeded("interval must be positive"));
            }
        }
    }
    if p.time_of_day >= 24 * 60 {
        return Err(EngineError::LimitExceeded("time-of-day out of range"));
    }
    if p.duration <= 0 || p.duration > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("occurrence duration out of range"));
    }
    match p.end {
        EndCondition::Count(0) => Err(EngineError::LimitExceeded("occurrence count must be positive")),
        EndCondition::Count(n) if n > MAX_OCCURRENCES => Err(EngineError::PatternTooLarge {
            cap: MAX_OCCURRENCES,
        }),
        _ => Ok(()),
    }
}

// ── Expansion ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Cursor {
    /// Day-stepping frequencies (weekly, biweekly, custom interval).
    Daily(NaiveDate),
    /// Month-stepping frequencies.
    Monthly { year: i32, month: u32 },
}

/// A lazy, finite, restartable occurrence stream. All state lives in the
/// cursor — two expansions of the same `(pattern, start)` produce identical
/// sequences, and previews run concurrently without coordination.
#[derive(Debug, Clone)]
pub struct Expansion<'a> {
    pattern: &'a RecurrencePattern,
    start: NaiveDate,
    cursor: Cursor,
    emitted: u32,
    steps: u32,
}

impl<'a> Expansion<'a> {
    pub fn new(pattern: &'a RecurrencePattern, start: NaiveDate) -> Self {
        let cursor = match pattern.frequency {
            Frequency::Weekly { .. }
            | Frequency::Biweekly { .. }
            | Frequency::CustomIntervalDays { .. } => Cursor::Daily(start),
            Frequency::MonthlyByDate { .. } | Frequency::MonthlyByWeekday { .. } => {
                Cursor::Monthly {
                    year: start.year(),
                    month: start.month(),
                }
            }
        };
        Self {
            pattern,
            start,
            cursor,
            emitted: 0,
            steps: 0,
        }
    }

    /// Produce the next candidate date from the cursor, advancing it.
    /// `None` means the cursor position yields nothing (wrong weekday,
    /// missing day-of-month) — the stream itself is not finished.
    fn step(&mut self) -> Result<Option<NaiveDate>, EngineError> {
        self.steps += 1;
        match (&mut self.cursor, &self.pattern.frequency) {
            (Cursor::Daily(date), Frequency::Weekly { weekdays })
            | (Cursor::Daily(date), Frequency::Biweekly { weekdays }) => {
                if self.steps > MAX_EXPANSION_SCAN_DAYS {
                    return Err(EngineError::PatternTooLarge {
                        cap: MAX_OCCURRENCES,
                    });
                }
                let current = *date;
                *date = current
                    .succ_opt()
                    .ok_or(EngineError::LimitExceeded("date overflow"))?;

                let stride = match self.pattern.frequency {
                    Frequency::Biweekly { .. } => 2,
                    _ => 1,
                };
                let week_index = (current - self.start).num_days() / 7;
                let hit = weekdays.contains(&current.weekday()) && week_index % stride == 0;
                Ok(hit.then_some(current))
            }
            (Cursor::Daily(date), Frequency::CustomIntervalDays { interval }) => {
                if self.steps > MAX_EXPANSION_SCAN_DAYS {
                    return Err(EngineError::PatternTooLarge {
                        cap: MAX_OCCURRENCES,
                    });
                }
                let current = *date;
                *date = current
                    .checked_add_days(chrono::Days::new(*interval as u64))
                    .ok_or(EngineError::LimitExceeded("date overflow"))?;
                Ok(Some(current))
            }
            (Cursor::Monthly { year, month }, freq) => {
                if self.steps > MAX_EXPANSION_SCAN_MONTHS {
                    return Err(EngineError::PatternTooLarge {
                        cap: MAX_OCCURRENCES,
                    });
                }
                let (y, m) = (*year, *month);
                (*year, *month) = next_month(y, m);

                let candidate = match freq {
                    // Months missing the day are skipped, never clamped.
                    Frequency::MonthlyByDate { day } => NaiveDate::from_ymd_opt(y, m, *day),
                    Frequency::MonthlyByWeekday { weekday, nth } => {
                        nth_weekday_of_month(y, m, *weekday, *nth)
                    }
                    _ => unreachable!("monthly cursor only for monthly frequencies"),
                };
                Ok(candidate.filter(|d| *d >= self.start))
            }
            // `new` pairs each frequency with its cursor shape.
            (Cursor::Daily(_), _) => unreachable!("daily cursor only for day-stepping frequencies"),
        }
    }

    /// Next occurrence date, or `None` once the end condition is reached.
    ///
    /// Candidates filtered out by `skip_holidays`/`skip_weekends` do not
    /// count toward the occurrence quota — a skipped Monday pushes the
    /// series one slot further out instead of shrinking it.
    pub fn next_occurrence(
        &mut self,
        holidays: &HolidaySnapshot,
    ) -> Result<Option<NaiveDate>, EngineError> {
        if let EndCondition::Count(n) = self.pattern.end
            && self.emitted >= n {
                return Ok(None);
            }

        loop {
            let Some(candidate) = self.step()? else {
                continue;
            };
            if let EndCondition::Until(until) = self.pattern.end
                && candidate > until {
                    return Ok(None);
                }
            if self.pattern.skip_weekends
                && matches!(candidate.weekday(), Weekday::Sat | Weekday::Sun)
            {
                continue;
            }
            if self.pattern.skip_holidays && holidays.contains(candidate) {
                continue;
            }
            if self.emitted >= MAX_OCCURRENCES {
                return Err(EngineError::PatternTooLarge {
                    cap: MAX_OCCURRENCES,
                });
            }
            self.emitted += 1;
            return Ok(Some(candidate));
        }
    }
}

/// Expand the full pattern into its occurrence dates.
pub fn expand(
    pattern: &RecurrencePattern,
    start: NaiveDate,
    holidays: &HolidaySnapshot,
) -> Result<Vec<NaiveDate>, EngineError> {
    validate_pattern(pattern)?;
    let mut expansion = Expansion::new(pattern, start);
    let mut dates = Vec::new();
    while let Some(date) = expansion.next_occurrence(holidays)? {
        dates.push(date);
    }
    Ok(dates)
}

/// Occurrence start instants in the resource's timezone. Dates whose
/// preferred time falls into a DST gap are dropped — that local time does
/// not exist. Series creation and `preview_pattern` both call this, which
/// is what makes preview output and persisted starts agree.
pub fn occurrence_starts(
    tz: Tz,
    pattern: &RecurrencePattern,
    start: NaiveDate,
    holidays: &HolidaySnapshot,
) -> Result<Vec<Ms>, EngineError> {
    let dates = expand(pattern, start, holidays)?;
    Ok(dates
        .into_iter()
        .filter_map(|d| local_ms(tz, d, pattern.time_of_day))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn weekly_mondays(count: u32) -> RecurrencePattern {
        RecurrencePattern {
            frequency: Frequency::Weekly {
                weekdays: vec![Weekday::Mon],
            },
            time_of_day: 14 * 60,
            duration: 30 * MINUTE_MS,
            end: EndCondition::Count(count),
            skip_holidays: false,
            skip_weekends: false,
            policy: ConflictPolicy::Reject,
        }
    }

    #[test]
    fn weekly_mondays_six() {
        let p = weekly_mondays(6);
        let got = expand(&p, date(2025, 1, 6), &HolidaySnapshot::default()).unwrap();
        assert_eq!(
            got,
            vec![
                date(2025, 1, 6),
                date(2025, 1, 13),
                date(2025, 1, 20),
                date(2025, 1, 27),
                date(2025, 2, 3),
                date(2025, 2, 10),
            ]
        );
    }

    #[test]
    fn skipped_holiday_does_not_consume_quota() {
        let mut p = weekly_mondays(6);
        p.skip_holidays = true;
        let holidays = HolidaySnapshot::new(1, [date(2025, 1, 20)]);
        let got = expand(&p, date(2025, 1, 6), &holidays).unwrap();
        // 2025-01-20 excluded, one extra Monday appended to keep 6.
        assert_eq!(
            got,
            vec![
                date(2025, 1, 6),
                date(2025, 1, 13),
                date(2025, 1, 27),
                date(2025, 2, 3),
                date(2025, 2, 10),
                date(2025, 2, 17),
            ]
        );
    }

    #[test]
    fn expansion_is_idempotent() {
        let mut p = weekly_mondays(10);
        p.skip_holidays = true;
        let holidays = HolidaySnapshot::new(7, [date(2025, 1, 20), date(2025, 2, 17)]);
        let first = expand(&p, date(2025, 1, 6), &holidays).unwrap();
        let second = expand(&p, date(2025, 1, 6), &holidays).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn biweekly_alternates_weeks() {
        let p = RecurrencePattern {
            frequency: Frequency::Biweekly {
                weekdays: vec![Weekday::Mon],
            },
            end: EndCondition::Count(3),
            ..weekly_mondays(3)
        };
        let got = expand(&p, date(2025, 1, 6), &HolidaySnapshot::default()).unwrap();
        assert_eq!(
            got,
            vec![date(2025, 1, 6), date(2025, 1, 20), date(2025, 2, 3)]
        );
    }

    #[test]
    fn weekly_multiple_weekdays() {
        let p = RecurrencePattern {
            frequency: Frequency::Weekly {
                weekdays: vec![Weekday::Mon, Weekday::Thu],
            },
            end: EndCondition::Count(4),
            ..weekly_mondays(4)
        };
        let got = expand(&p, date(2025, 1, 6), &HolidaySnapshot::default()).unwrap();
        assert_eq!(
            got,
            vec![
                date(2025, 1, 6),
                date(2025, 1, 9),
                date(2025, 1, 13),
                date(2025, 1, 16),
            ]
        );
    }

    #[test]
    fn monthly_by_date_31st_skips_february() {
        let p = RecurrencePattern {
            frequency: Frequency::MonthlyByDate { day: 31 },
            end: EndCondition::Count(4),
            ..weekly_mondays(4)
        };
        let got = expand(&p, date(2025, 1, 31), &HolidaySnapshot::default()).unwrap();
        // February, April and June have no 31st — skipped, not clamped.
        assert_eq!(
            got,
            vec![
                date(2025, 1, 31),
                date(2025, 3, 31),
                date(2025, 5, 31),
                date(2025, 7, 31),
            ]
        );
    }

    #[test]
    fn monthly_by_weekday_second_tuesday() {
        let p = RecurrencePattern {
            frequency: Frequency::MonthlyByWeekday {
                weekday: Weekday::Tue,
                nth: 2,
            },
            end: EndCondition::Count(3),
            ..weekly_mondays(3)
        };
        let got = expand(&p, date(2025, 1, 1), &HolidaySnapshot::default()).unwrap();
        assert_eq!(
            got,
            vec![date(2025, 1, 14), date(2025, 2, 11), date(2025, 3, 11)]
        );
    }

    #[test]
    fn monthly_fifth_monday_skips_short_months() {
        let p = RecurrencePattern {
            frequency: Frequency::MonthlyByWeekday {
                weekday: Weekday::Mon,
                nth: 5,
            },
            end: EndCondition::Count(3),
            ..weekly_mondays(3)
        };
        let got = expand(&p, date(2025, 1, 1), &HolidaySnapshot::default()).unwrap();
        // 2025: five Mondays in March, June, September only (within range).
        assert_eq!(
            got,
            vec![date(2025, 3, 31), date(2025, 6, 30), date(2025, 9, 29)]
        );
    }

    #[test]
    fn custom_interval_stride() {
        let p = RecurrencePattern {
            frequency: Frequency::CustomIntervalDays { interval: 10 },
            end: EndCondition::Count(3),
            ..weekly_mondays(3)
        };
        let got = expand(&p, date(2025, 1, 6), &HolidaySnapshot::default()).unwrap();
        assert_eq!(
            got,
            vec![date(2025, 1, 6), date(2025, 1, 16), date(2025, 1, 26)]
        );
    }

    #[test]
    fn custom_interval_skip_weekends() {
        let p = RecurrencePattern {
            frequency: Frequency::CustomIntervalDays { interval: 5 },
            end: EndCondition::Count(4),
            skip_weekends: true,
            ..weekly_mondays(4)
        };
        // From Mon 2025-01-06 stride 5: Jan 6 (Mon), 11 (Sat, skipped),
        // 16 (Thu), 21 (Tue), 26 (Sun, skipped), 31 (Fri).
        let got = expand(&p, date(2025, 1, 6), &HolidaySnapshot::default()).unwrap();
        assert_eq!(
            got,
            vec![
                date(2025, 1, 6),
                date(2025, 1, 16),
                date(2025, 1, 21),
                date(2025, 1, 31),
            ]
        );
    }

    #[test]
    fn until_bound_stops_expansion() {
        let p = RecurrencePattern {
            end: EndCondition::Until(date(2025, 1, 27)),
            ..weekly_mondays(0)
        };
        let got = expand(&p, date(2025, 1, 6), &HolidaySnapshot::default()).unwrap();
        assert_eq!(got.len(), 4);
        assert_eq!(*got.last().unwrap(), date(2025, 1, 27));
    }

    #[test]
    fn count_above_cap_rejected() {
        let p = weekly_mondays(MAX_OCCURRENCES + 1);
        let err = expand(&p, date(2025, 1, 6), &HolidaySnapshot::default()).unwrap_err();
        assert!(matches!(err, EngineError::PatternTooLarge { .. }));
    }

    #[test]
    fn until_beyond_cap_rejected() {
        let p = RecurrencePattern {
            end: EndCondition::Until(date(2045, 1, 1)),
            ..weekly_mondays(0)
        };
        let err = expand(&p, date(2025, 1, 6), &HolidaySnapshot::default()).unwrap_err();
        assert!(matches!(err, EngineError::PatternTooLarge { .. }));
    }

    #[test]
    fn zero_count_rejected() {
        let p = weekly_mondays(0);
        let err = expand(&p, date(2025, 1, 6), &HolidaySnapshot::default()).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
    }

    #[test]
    fn empty_weekday_set_rejected() {
        let p = RecurrencePattern {
            frequency: Frequency::Weekly { weekdays: vec![] },
            ..weekly_mondays(3)
        };
        assert!(matches!(
            validate_pattern(&p),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn occurrence_starts_use_resource_timezone() {
        let p = weekly_mondays(2);
        let starts = occurrence_starts(
            chrono_tz::UTC,
            &p,
            date(2025, 1, 6),
            &HolidaySnapshot::default(),
        )
        .unwrap();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[0] % DAY_MS, 14 * HOUR_MS);
        assert_eq!(starts[1] - starts[0], 7 * DAY_MS);
    }

    #[test]
    fn blackout_arithmetic_matches_expander() {
        let anchor = date(2025, 1, 31);
        // Monthly recurrence on the 31st: February has no 31st, no match.
        assert!(recurring_date_matches(
            BlackoutRecurrence::Monthly,
            anchor,
            date(2025, 3, 31)
        ));
        assert!(!recurring_date_matches(
            BlackoutRecurrence::Monthly,
            anchor,
            date(2025, 2, 28)
        ));
        // Weekly matches the anchor's weekday, never before the anchor.
        assert!(recurring_date_matches(
            BlackoutRecurrence::Weekly,
            date(2025, 1, 6),
            date(2025, 1, 13)
        ));
        assert!(!recurring_date_matches(
            BlackoutRecurrence::Weekly,
            date(2025, 1, 6),
            date(2024, 12, 30)
        ));
    }

    #[test]
    fn nth_weekday_overflow_is_none() {
        // February 2025 has four Fridays.
        assert_eq!(nth_weekday_of_month(2025, 2, Weekday::Fri, 5), None);
        assert_eq!(
            nth_weekday_of_month(2025, 2, Weekday::Fri, 4),
            Some(date(2025, 2, 28))
        );
    }
}
