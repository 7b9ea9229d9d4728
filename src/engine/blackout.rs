use chrono::NaiveDate;
use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::merge_overlapping;
use super::recurrence::recurring_date_matches;
use super::EngineError;

/// Local midnight-to-midnight bounds of a date. DST can make midnight
/// nonexistent; fall forward up to two hours before giving up.
pub(crate) fn day_bounds(tz: Tz, date: NaiveDate) -> Option<Span> {
    let start = (0..=120)
        .step_by(60)
        .find_map(|m| local_ms(tz, date, m))?;
    let next = date.succ_opt()?;
    let end = (0..=120).step_by(60).find_map(|m| local_ms(tz, next, m))?;
    (start < end).then(|| Span::new(start, end))
}

/// Whether this blackout (one-off or recurring) lands on `date`.
/// Recurring expansion reuses the pattern expander's date arithmetic.
pub fn occurs_on(b: &BlackoutInterval, date: NaiveDate) -> bool {
    recurring_date_matches(b.recurrence, b.anchor, date)
}

/// The blocked span this blackout produces on `date`, if it occurs there.
pub fn span_on_day(tz: Tz, b: &BlackoutInterval, date: NaiveDate) -> Option<Span> {
    if !occurs_on(b, date) {
        return None;
    }
    match b.window {
        None => day_bounds(tz, date),
        Some((open, close)) => {
            let start = local_ms(tz, date, open)?;
            let end = local_ms(tz, date, close)?;
            (start < end).then(|| Span::new(start, end))
        }
    }
}

pub(crate) fn validate_blackout(b: &BlackoutInterval) -> Result<(), EngineError> {
    if let Some((open, close)) = b.window {
        if open >= close || close > 24 * 60 {
            return Err(EngineError::LimitExceeded("blackout window malformed"));
        }
    }
    if let Some(ref reason) = b.reason
        && reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("blackout reason too long"));
        }
    Ok(())
}

fn local_dates(tz: Tz, range: &Span) -> impl Iterator<Item = NaiveDate> {
    let first = date_of(tz, range.start);
    let last = date_of(tz, range.end - 1);
    std::iter::successors(Some(first), move |d| {
        d.succ_opt().filter(|next| *next <= last)
    })
}

/// Per-blackout spans overlapping `candidate`, with identity and reason kept
/// for conflict reporting. Resource-scoped and global blackouts both count.
pub fn blocking_overlaps(
    rs: &ResourceState,
    globals: &[BlackoutInterval],
    candidate: &Span,
) -> Vec<(Ulid, Span, Option<String>)> {
    let mut hits = Vec::new();
    for b in rs.blackouts.iter().chain(globals.iter()) {
        for date in local_dates(rs.tz, candidate) {
            if let Some(span) = span_on_day(rs.tz, b, date)
                && span.overlaps(candidate) {
                    hits.push((b.id, span, b.reason.clone()));
                }
        }
    }
    hits
}

/// Union of blocked time over `range`, merged into disjoint spans.
/// Overlapping blackouts reconcile deterministically: most-restrictive wins,
/// so a partial-day blackout abutting a holiday or another blackout produces
/// the union of blocked time, never a gap.
pub fn blocked_ranges(
    rs: &ResourceState,
    globals: &[BlackoutInterval],
    range: &Span,
) -> Result<Vec<Span>, EngineError> {
    if range.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    let mut blocked = Vec::new();
    for b in rs.blackouts.iter().chain(globals.iter()) {
        for date in local_dates(rs.tz, range) {
            if let Some(span) = span_on_day(rs.tz, b, date)
                && span.overlaps(range) {
                    blocked.push(Span::new(
                        span.start.max(range.start),
                        span.end.min(range.end),
                    ));
                }
        }
    }
    blocked.sort_by_key(|s| s.start);
    Ok(merge_overlapping(&blocked))
}

/// Whether one specific blackout blocks any part of `span`. Used when a
/// freshly created blackout is matched against existing appointments.
pub fn hits_span(tz: Tz, b: &BlackoutInterval, span: &Span) -> bool {
    local_dates(tz, span).any(|date| span_on_day(tz, b, date).is_some_and(|s| s.overlaps(span)))
}

/// Is this instant inside any blackout for the resource?
pub fn is_blocked(rs: &ResourceState, globals: &[BlackoutInterval], at: Ms) -> bool {
    let date = date_of(rs.tz, at);
    rs.blackouts
        .iter()
        .chain(globals.iter())
        .any(|b| span_on_day(rs.tz, b, date).is_some_and(|s| s.contains_instant(at)))
}
