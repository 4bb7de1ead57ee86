use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};

use crate::model::*;

use super::EngineError;

// ── Window authoring ──────────────────────────────────────────────

/// Creation-time check for a new window. Only active siblings count;
/// windows toggled back on later are never re-checked.
pub(crate) fn check_window(
    ts: &TutorState,
    day: Weekday,
    start: NaiveTime,
    end: NaiveTime,
) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::InvalidRange);
    }
    if let Some(existing) = ts
        .windows_on(day)
        .find(|w| w.active && w.overlaps(start, end))
    {
        return Err(EngineError::Overlap(existing.id));
    }
    Ok(())
}

/// Windows grouped by weekday, Monday first, each day ordered by start.
/// Days without windows are omitted.
pub fn group_by_day(windows: &[AvailabilityWindow]) -> Vec<DaySchedule> {
    let mut days: Vec<DaySchedule> = Vec::new();
    for window in windows {
        match days.last_mut() {
            Some(last) if last.day == window.day => last.windows.push(window.clone()),
            _ => days.push(DaySchedule {
                day: window.day,
                windows: vec![window.clone()],
            }),
        }
    }
    days
}

// ── Open slots ────────────────────────────────────────────────────

/// Free stretches of each active window on `date`, after removing
/// confirmed bookings and anything before `now`. Windows stay separate.
pub fn open_slots(
    ts: &TutorState,
    date: NaiveDate,
    zone: FixedOffset,
    now: DateTime<Utc>,
) -> Vec<OpenSlot> {
    let day = chrono::Datelike::weekday(&date);
    let mut slots = Vec::new();

    for window in ts.windows_on(day).filter(|w| w.active) {
        let Some(span) = window_span_on(window, date, zone) else {
            continue;
        };
        let mut taken: Vec<Span> = ts
            .overlapping(&span)
            .filter(|b| b.status == BookingStatus::Confirmed)
            .map(|b| b.span)
            .collect();
        if now > span.start {
            taken.push(Span::new(span.start, now.min(span.end)));
        }
        taken.sort_by_key(|s| s.start);
        let taken = merge_overlapping(&taken);

        for free in subtract_intervals(&[span], &taken) {
            slots.push(OpenSlot {
                window_id: window.id,
                span: free,
            });
        }
    }
    slots
}

fn window_span_on(window: &AvailabilityWindow, date: NaiveDate, zone: FixedOffset) -> Option<Span> {
    let start = date.and_time(window.start).and_local_timezone(zone).single()?;
    let end = date.and_time(window.end).and_local_timezone(zone).single()?;
    Some(Span::new(start.with_timezone(&Utc), end.with_timezone(&Utc)))
}

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    for &b in base {
        let mut cursor = b.start;
        for r in to_remove {
            if r.end <= cursor || r.start >= b.end {
                continue;
            }
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            if cursor >= b.end {
                break;
            }
        }
        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }
    result
}
