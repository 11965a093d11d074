//! Chunk-bounds arithmetic shared by [`crate::verify`] and
//! [`crate::dedup`] (spec §4.6): a half-open `[begin, end)` traversal of
//! a pipe's datetime axis in fixed-size slices.

use mrsm_core::dtype::Value;

/// Compare two datetime-axis values. Only the variants a `datetime`
/// column can actually hold are meaningful; anything else sorts equal
/// (mirrors `mrsm_pipes::filter`'s internal comparator, duplicated here
/// since that one isn't exported across the crate boundary).
pub fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::DateTimeUtc(x), Value::DateTimeUtc(y)) => x.cmp(y),
        (Value::DateTimeNaive(x), Value::DateTimeNaive(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Add (or, with a negative duration, subtract) a `chrono::Duration`
/// from a datetime-axis value, matching the integer-unit convention
/// spec §4.4 describes for `int`-typed datetime columns (1 backtrack
/// "minute" maps to 1 integer unit).
pub fn shift_value(v: &Value, delta: chrono::Duration) -> Value {
    match v {
        Value::DateTimeUtc(dt) => Value::DateTimeUtc(*dt + delta),
        Value::DateTimeNaive(dt) => Value::DateTimeNaive(*dt + delta),
        Value::Int(i) => Value::Int(i + delta.num_seconds().max(if delta.num_seconds() < 0 { -1 } else { 1 })),
        Value::Float(f) => Value::Float(f + delta.num_seconds() as f64),
        other => other.clone(),
    }
}

/// Divide `[oldest, newest]` into half-open `[begin, end)` chunks of
/// width `chunk_interval`, in ascending order. The final chunk's `end`
/// is exactly `newest` (not `newest` rounded up) so the traversal never
/// reads past the requested bound.
pub fn chunk_bounds(oldest: &Value, newest: &Value, chunk_interval: chrono::Duration) -> Vec<(Value, Value)> {
    if chunk_interval <= chrono::Duration::zero() {
        return vec![(oldest.clone(), newest.clone())];
    }
    let mut out = Vec::new();
    let mut cursor = oldest.clone();
    loop {
        let next = shift_value(&cursor, chunk_interval);
        if compare_values(&next, newest) != std::cmp::Ordering::Less {
            out.push((cursor, newest.clone()));
            break;
        }
        out.push((cursor.clone(), next.clone()));
        cursor = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_bounds_covers_the_whole_range() {
        let oldest = Value::Int(0);
        let newest = Value::Int(100);
        let bounds = chunk_bounds(&oldest, &newest, chrono::Duration::seconds(30));
        assert_eq!(bounds.first().unwrap().0, Value::Int(0));
        assert_eq!(bounds.last().unwrap().1, Value::Int(100));
        for pair in bounds.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn zero_interval_yields_a_single_chunk() {
        let bounds = chunk_bounds(&Value::Int(0), &Value::Int(10), chrono::Duration::zero());
        assert_eq!(bounds.len(), 1);
    }
}
