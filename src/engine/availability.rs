use ulid::Ulid;

use crate::model::*;

// ── Overlap & free-range sweeps over half-open stays ─────────────

/// Id of the earliest blocking booking that overlaps `stay`, if any.
///
/// `blocking` may contain bookings in any status; only the blocking set counts.
pub fn first_conflict(blocking: &[Booking], stay: &StayRange) -> Option<Ulid> {
    blocking
        .iter()
        .filter(|b| b.status.is_blocking() && b.stay.overlaps(stay))
        .min_by_key(|b| (b.stay.check_in, b.id))
        .map(|b| b.id)
}

/// Merge sorted ranges that overlap or touch into disjoint ranges.
pub fn merge_overlapping(sorted: &[StayRange]) -> Vec<StayRange> {
    let mut merged: Vec<StayRange> = Vec::new();
    for &range in sorted {
        match merged.last_mut() {
            Some(last) if range.check_in <= last.check_out => {
                last.check_out = last.check_out.max(range.check_out);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// `base` minus `remove`. Both inputs sorted and disjoint.
pub fn subtract_ranges(base: &[StayRange], remove: &[StayRange]) -> Vec<StayRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for b in base {
        let mut cursor = b.check_in;
        while ri < remove.len() && remove[ri].check_out <= cursor {
            ri += 1;
        }
        let mut j = ri;
        while j < remove.len() && remove[j].check_in < b.check_out {
            let r = remove[j];
            if r.check_in > cursor {
                result.push(StayRange::new(cursor, r.check_in));
            }
            cursor = cursor.max(r.check_out);
            j += 1;
        }
        if cursor < b.check_out {
            result.push(StayRange::new(cursor, b.check_out));
        }
    }
    result
}

/// Nights inside `window` not occupied by any blocking booking.
pub fn free_ranges(window: &StayRange, bookings: &[Booking]) -> Vec<StayRange> {
    let mut taken: Vec<StayRange> = bookings
        .iter()
        .filter(|b| b.status.is_blocking() && b.stay.overlaps(window))
        .map(|b| {
            StayRange::new(
                b.stay.check_in.max(window.check_in),
                b.stay.check_out.min(window.check_out),
            )
        })
        .collect();
    taken.sort_by_key(|r| r.check_in);
    subtract_ranges(&[*window], &merge_overlapping(&taken))
}
