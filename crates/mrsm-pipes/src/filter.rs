//! The filter-existing algorithm (spec §4.3): divide an incoming batch
//! into unseen / update / delta rows by joining against what's already
//! stored on the index columns.
//!
//! This module is pure — it never performs I/O. The caller (`mrsm-sync`)
//! is responsible for fetching `existing` via `Instance::get_data` over
//! the window and params filter this module computes.

use mrsm_core::dataframe::{enforce_dtypes, RecordBatch, Row};
use mrsm_core::dtype::{Dtype, Value};
use mrsm_core::error::MrsmError;
use std::collections::BTreeMap;

/// The `(unseen, update, delta)` output of [`filter_existing`] (spec
/// §4.3 step 7).
#[derive(Debug, Clone, Default)]
pub struct FilterResult {
    /// Rows absent from the target by index tuple — to insert.
    pub unseen: RecordBatch,
    /// Rows present in the target whose non-index columns differ —
    /// to update.
    pub update: RecordBatch,
    /// `unseen ∪ update`, optionally dtype-coerced.
    pub delta: RecordBatch,
}

/// Compute the half-open datetime window `[begin, end)` to read existing
/// rows over (spec §4.3 step 2): `begin` is the batch's minimum, `end` is
/// the maximum plus one backtrack unit.
pub fn datetime_window(batch: &RecordBatch, datetime_col: &str, backtrack: chrono::Duration) -> Option<(Value, Value)> {
    let mut values: Vec<&Value> = batch
        .rows
        .iter()
        .filter_map(|r| r.get(datetime_col))
        .filter(|v| !v.is_null())
        .collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| compare_values(a, b));
    let min = values.first().copied().cloned()?;
    let max = values.last().copied().cloned()?;
    Some((min, bump_value(&max, backtrack)))
}

fn bump_value(v: &Value, backtrack: chrono::Duration) -> Value {
    match v {
        Value::DateTimeUtc(dt) => Value::DateTimeUtc(*dt + backtrack),
        Value::DateTimeNaive(dt) => Value::DateTimeNaive(*dt + backtrack),
        Value::Int(i) => Value::Int(i + backtrack.num_seconds().max(1)),
        Value::Float(f) => Value::Float(f + backtrack.num_seconds().max(1) as f64),
        other => other.clone(),
    }
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::DateTimeUtc(x), Value::DateTimeUtc(y)) => x.cmp(y),
        (Value::DateTimeNaive(x), Value::DateTimeNaive(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Build the params filter from distinct index-tuple values (spec §4.3
/// step 3): columns whose distinct-value count exceeds `cap` are dropped
/// from the filter entirely.
pub fn params_filter(batch: &RecordBatch, index_columns: &[String], cap: usize) -> BTreeMap<String, Vec<Value>> {
    batch.distinct_index_values(index_columns, cap)
}

/// Options controlling [`filter_existing`] beyond the index columns
/// (spec §4.3 steps 6-7).
#[derive(Debug, Clone)]
pub struct FilterOptions {
    /// Emit the full incoming document for a changed row instead of just
    /// the columns that actually differ.
    pub include_unchanged_columns: bool,
    /// Apply `enforce_dtypes` to `delta` before returning (opt-in; skipped
    /// for speed by default per spec §4.3 step 7).
    pub enforce_dtypes: bool,
    /// `enforce` parameter passed through to `enforce_dtypes` when
    /// `enforce_dtypes` above is true.
    pub enforce: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            include_unchanged_columns: false,
            enforce_dtypes: false,
            enforce: true,
        }
    }
}

/// Divide `batch` into unseen/update/delta against `existing` rows,
/// joined on `index_columns` (spec §4.3).
///
/// * If `index_columns` is empty, returns `unseen=batch, update=∅,
///   delta=batch` per step 1 — callers are expected to have already
///   warned about this (no indices means no idempotence).
/// * Null-valued index columns are coalesced to a deterministic sentinel
///   per dtype before the join, so `NULL == NULL` (step 5).
/// * Duplicate index tuples within `batch` collapse to their last
///   occurrence before the anti-join (the "Tie-breaking" rule).
pub fn filter_existing(
    batch: &RecordBatch,
    existing: &RecordBatch,
    index_columns: &[String],
    index_dtypes: &BTreeMap<String, Dtype>,
    opts: &FilterOptions,
    dtypes: &mut BTreeMap<String, Dtype>,
) -> Result<FilterResult, MrsmError> {
    if index_columns.is_empty() {
        return Ok(FilterResult {
            unseen: batch.clone(),
            update: RecordBatch::default(),
            delta: batch.clone(),
        });
    }

    let deduped = batch.dedup_by_index(index_columns);
    let mut incoming = deduped.clone();
    let mut stored = existing.clone();
    incoming.coalesce_null_indices(index_dtypes);
    stored.coalesce_null_indices(index_dtypes);

    let stored_by_key: BTreeMap<Vec<Option<Value>>, &Row> = stored
        .rows
        .iter()
        .map(|row| (index_key(row, index_columns), row))
        .collect();

    let mut unseen_rows = Vec::new();
    let mut update_rows = Vec::new();

    for (original, row) in deduped.rows.iter().zip(incoming.rows.iter()) {
        let key = index_key(row, index_columns);
        match stored_by_key.get(&key) {
            None => unseen_rows.push(original.clone()),
            Some(existing_row) => {
                if row_differs(row, existing_row, index_columns) {
                    if opts.include_unchanged_columns {
                        update_rows.push(original.clone());
                    } else {
                        update_rows.push(changed_columns_only(original, existing_row, index_columns));
                    }
                }
            }
        }
    }

    let unseen = RecordBatch::new(unseen_rows);
    let update = RecordBatch::new(update_rows);
    let mut delta_rows = unseen.rows.clone();
    delta_rows.extend(update.rows.clone());
    let mut delta = RecordBatch::new(delta_rows);

    if opts.enforce_dtypes {
        enforce_dtypes(&mut delta, dtypes, opts.enforce)?;
    }

    Ok(FilterResult { unseen, update, delta })
}

fn index_key(row: &Row, index_columns: &[String]) -> Vec<Option<Value>> {
    index_columns.iter().map(|c| row.get(c).cloned()).collect()
}

/// A row "differs" when any non-index column present in `incoming` has a
/// value not equal to its counterpart in `stored` (spec §4.3 step 6).
/// Columns absent from `incoming` are treated as unchanged.
fn row_differs(incoming: &Row, stored: &Row, index_columns: &[String]) -> bool {
    incoming.iter().any(|(col, val)| {
        if index_columns.contains(col) {
            return false;
        }
        stored.get(col).map(|sv| sv != val).unwrap_or(true)
    })
}

fn changed_columns_only(incoming: &Row, stored: &Row, index_columns: &[String]) -> Row {
    let mut out = Row::new();
    for col in index_columns {
        if let Some(v) = incoming.get(col) {
            out.insert(col.clone(), v.clone());
        }
    }
    for (col, val) in incoming.iter() {
        if index_columns.contains(col) {
            continue;
        }
        let changed = stored.get(col).map(|sv| sv != val).unwrap_or(true);
        if changed {
            out.insert(col.clone(), val.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn idx_dtypes() -> BTreeMap<String, Dtype> {
        [("id".to_string(), Dtype::Int)].into_iter().collect()
    }

    #[test]
    fn empty_index_columns_returns_everything_as_unseen() {
        let batch = RecordBatch::from_json_rows(&[json!({"v": 1})]).unwrap();
        let mut dtypes = BTreeMap::new();
        let result = filter_existing(
            &batch,
            &RecordBatch::default(),
            &[],
            &BTreeMap::new(),
            &FilterOptions::default(),
            &mut dtypes,
        )
        .unwrap();
        assert_eq!(result.unseen.len(), 1);
        assert!(result.update.is_empty());
        assert_eq!(result.delta.len(), 1);
    }

    #[test]
    fn new_index_tuple_is_unseen() {
        let batch = RecordBatch::from_json_rows(&[json!({"id": 1, "v": 10})]).unwrap();
        let mut dtypes = BTreeMap::new();
        let result = filter_existing(
            &batch,
            &RecordBatch::default(),
            &["id".to_string()],
            &idx_dtypes(),
            &FilterOptions::default(),
            &mut dtypes,
        )
        .unwrap();
        assert_eq!(result.unseen.len(), 1);
        assert!(result.update.is_empty());
    }

    #[test]
    fn identical_row_is_neither_unseen_nor_update() {
        let batch = RecordBatch::from_json_rows(&[json!({"id": 1, "v": 10})]).unwrap();
        let existing = RecordBatch::from_json_rows(&[json!({"id": 1, "v": 10})]).unwrap();
        let mut dtypes = BTreeMap::new();
        let result = filter_existing(
            &batch,
            &existing,
            &["id".to_string()],
            &idx_dtypes(),
            &FilterOptions::default(),
            &mut dtypes,
        )
        .unwrap();
        assert!(result.unseen.is_empty());
        assert!(result.update.is_empty());
        assert!(result.delta.is_empty());
    }

    #[test]
    fn changed_non_index_column_is_an_update() {
        let batch = RecordBatch::from_json_rows(&[json!({"id": 1, "v": 100})]).unwrap();
        let existing = RecordBatch::from_json_rows(&[json!({"id": 1, "v": 10})]).unwrap();
        let mut dtypes = BTreeMap::new();
        let result = filter_existing(
            &batch,
            &existing,
            &["id".to_string()],
            &idx_dtypes(),
            &FilterOptions::default(),
            &mut dtypes,
        )
        .unwrap();
        assert!(result.unseen.is_empty());
        assert_eq!(result.update.len(), 1);
        assert_eq!(result.update.rows[0]["v"], Value::Int(100));
    }

    #[test]
    fn duplicate_index_tuple_collapses_to_last_occurrence() {
        let batch = RecordBatch::from_json_rows(&[
            json!({"id": 1, "v": 10}),
            json!({"id": 1, "v": 20}),
        ])
        .unwrap();
        let mut dtypes = BTreeMap::new();
        let result = filter_existing(
            &batch,
            &RecordBatch::default(),
            &["id".to_string()],
            &idx_dtypes(),
            &FilterOptions::default(),
            &mut dtypes,
        )
        .unwrap();
        assert_eq!(result.unseen.len(), 1);
        assert_eq!(result.unseen.rows[0]["v"], Value::Int(20));
    }

    #[test]
    fn null_index_rows_join_against_each_other() {
        let batch = RecordBatch::from_json_rows(&[json!({"id": serde_json::Value::Null, "v": 1})]).unwrap();
        let existing = RecordBatch::from_json_rows(&[json!({"id": serde_json::Value::Null, "v": 1})]).unwrap();
        let mut dtypes = BTreeMap::new();
        let result = filter_existing(
            &batch,
            &existing,
            &["id".to_string()],
            &idx_dtypes(),
            &FilterOptions::default(),
            &mut dtypes,
        )
        .unwrap();
        assert!(result.unseen.is_empty());
        assert!(result.update.is_empty());
    }

    #[test]
    fn datetime_window_adds_backtrack_to_max() {
        let mut batch = RecordBatch::from_json_rows(&[
            json!({"dt": "2023-01-01T00:00:00Z"}),
            json!({"dt": "2023-01-02T00:00:00Z"}),
        ])
        .unwrap();
        let mut dt = BTreeMap::from([("dt".to_string(), Dtype::DateTimeUtc)]);
        enforce_dtypes(&mut batch, &mut dt, true).unwrap();
        let (begin, end) = datetime_window(&batch, "dt", chrono::Duration::minutes(60)).unwrap();
        let Value::DateTimeUtc(begin) = begin else { panic!() };
        let Value::DateTimeUtc(end) = end else { panic!() };
        assert_eq!(begin.to_rfc3339(), "2023-01-01T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2023-01-02T01:00:00+00:00");
    }

    #[test]
    fn params_filter_drops_columns_over_cap() {
        let rows: Vec<serde_json::Value> = (0..5).map(|i| json!({"id": i})).collect();
        let batch = RecordBatch::from_json_rows(&rows).unwrap();
        let filter = params_filter(&batch, &["id".to_string()], 3);
        assert!(!filter.contains_key("id"));
    }
}
