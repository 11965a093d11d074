//! Dataframe utilities: semantic row batches, projection, filtering,
//! null-coalescence, chunk generators, and dtype coercion over a whole
//! batch (spec §4.1, "Dataframe utilities" in §2's component table).

use crate::dtype::{Dtype, Value};
use crate::error::MrsmError;
use std::collections::BTreeMap;

/// A single row: column name -> value.
pub type Row = BTreeMap<String, Value>;

/// A bounded row collection — the unit a fetch, a filter, or a chunk
/// generator passes around.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub rows: Vec<Row>,
}

impl RecordBatch {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Parse a batch from loosely-typed JSON rows. Each JSON value is
    /// mapped to the [`Value`] variant its JSON shape naturally implies;
    /// [`enforce_dtypes`] is responsible for coercing to the pipe's
    /// declared dtypes afterwards.
    pub fn from_json_rows(rows: &[serde_json::Value]) -> Result<Self, MrsmError> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let obj = row.as_object().ok_or_else(|| {
                MrsmError::Configuration("batch row is not a JSON object".into())
            })?;
            let mut r = Row::new();
            for (k, v) in obj {
                r.insert(k.clone(), Value::from_json_raw(v));
            }
            out.push(r);
        }
        Ok(Self::new(out))
    }

    /// Project down to the given columns; missing columns are simply
    /// absent from the resulting rows (never inserted as null).
    pub fn project(&self, columns: &[String]) -> RecordBatch {
        let cols: std::collections::HashSet<&str> = columns.iter().map(|s| s.as_str()).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .filter(|(k, _)| cols.contains(k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .collect();
        RecordBatch::new(rows)
    }

    /// Keep only rows whose values for `columns` are all present and
    /// match one of the allowed value sets in `params` (used to build and
    /// then apply the filter-existing params filter, spec §4.3 step 3-4).
    pub fn filter_by_params(&self, params: &BTreeMap<String, Vec<Value>>) -> RecordBatch {
        let rows = self
            .rows
            .iter()
            .filter(|row| {
                params.iter().all(|(col, allowed)| match row.get(col) {
                    Some(v) => allowed.contains(v),
                    None => false,
                })
            })
            .cloned()
            .collect();
        RecordBatch::new(rows)
    }

    /// Distinct values observed per index column, capped at `cap` entries
    /// per column. Columns that exceed the cap are omitted entirely (spec
    /// §4.3 step 3: "the correctness of subsequent steps does not depend
    /// on it").
    pub fn distinct_index_values(
        &self,
        index_columns: &[String],
        cap: usize,
    ) -> BTreeMap<String, Vec<Value>> {
        let mut out = BTreeMap::new();
        for col in index_columns {
            let mut seen: Vec<Value> = Vec::new();
            let mut over_cap = false;
            for row in &self.rows {
                if let Some(v) = row.get(col) {
                    if !seen.contains(v) {
                        seen.push(v.clone());
                        if seen.len() > cap {
                            over_cap = true;
                            break;
                        }
                    }
                }
            }
            if !over_cap {
                out.insert(col.clone(), seen);
            }
        }
        out
    }

    /// Replace every null in an index column with a deterministic
    /// sentinel value chosen per dtype, so that `NULL == NULL` becomes
    /// true for the filter-existing anti-join (spec §4.3 step 5).
    pub fn coalesce_null_indices(&mut self, index_dtypes: &BTreeMap<String, Dtype>) {
        for row in &mut self.rows {
            for (col, dtype) in index_dtypes {
                let is_null = row.get(col).map(|v| v.is_null()).unwrap_or(true);
                if is_null {
                    row.insert(col.clone(), null_sentinel(dtype));
                }
            }
        }
    }

    /// Split into fixed-size chunks (a chunk generator over row count; the
    /// datetime-windowed variant lives in `mrsm-sync`, which already has
    /// the axis column name in scope).
    pub fn chunks(&self, size: usize) -> Vec<RecordBatch> {
        if size == 0 {
            return vec![self.clone()];
        }
        self.rows
            .chunks(size)
            .map(|c| RecordBatch::new(c.to_vec()))
            .collect()
    }

    /// Deduplicate rows that share the same index-tuple, keeping the last
    /// occurrence (spec §4.3 "Tie-breaking").
    pub fn dedup_by_index(&self, index_columns: &[String]) -> RecordBatch {
        let mut last_by_key: BTreeMap<Vec<Option<Value>>, usize> = BTreeMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            let key: Vec<Option<Value>> = index_columns.iter().map(|c| row.get(c).cloned()).collect();
            last_by_key.insert(key, i);
        }
        let mut indices: Vec<usize> = last_by_key.into_values().collect();
        indices.sort_unstable();
        RecordBatch::new(indices.into_iter().map(|i| self.rows[i].clone()).collect())
    }
}

/// Deterministic per-dtype sentinel used to stand in for a null index
/// value during the anti-join. Chosen to be out-of-band for its dtype
/// (e.g. empty string for `str`, the nil UUID, the Unix epoch).
pub fn null_sentinel(dtype: &Dtype) -> Value {
    match dtype {
        Dtype::Int => Value::Int(i64::MIN),
        Dtype::Float => Value::Float(f64::NEG_INFINITY),
        Dtype::Numeric { .. } => Value::Numeric(rust_decimal::Decimal::MIN),
        Dtype::Bool => Value::Bool(false),
        Dtype::Str => Value::Str(String::new()),
        Dtype::Bytes => Value::Bytes(Vec::new()),
        Dtype::Uuid => Value::Uuid(uuid::Uuid::nil()),
        Dtype::Json => Value::Json(serde_json::Value::Null),
        Dtype::DateTimeNaive => Value::DateTimeNaive(chrono::NaiveDateTime::UNIX_EPOCH),
        Dtype::DateTimeUtc => Value::DateTimeUtc(chrono::DateTime::UNIX_EPOCH),
    }
}

/// Coerce every row of `batch` to the dtypes declared in `dtypes`,
/// mutating both in place. Idempotent: applying twice yields the same
/// batch and the same dtype map (spec §4.1).
///
/// * `dtypes` is mutated with inferred dtypes for columns that appear in
///   the batch but have no declared dtype yet (dynamic columns, spec §4.4
///   schema evolution — the caller diffs this map against the stored
///   schema to decide `ALTER TABLE` statements).
/// * When a cell can't be coerced: if `enforce` is true, returns
///   [`MrsmError::DtypeMismatch`]; otherwise the column's dtype widens to
///   `Str` and the original value passes through unchanged.
pub fn enforce_dtypes(
    batch: &mut RecordBatch,
    dtypes: &mut BTreeMap<String, Dtype>,
    enforce: bool,
) -> Result<(), MrsmError> {
    // Pass 1: infer dtypes for unseen columns and widen numeric columns
    // that observe an incompatible-but-widenable numeric value.
    for row in &batch.rows {
        for (col, val) in row.iter() {
            if val.is_null() {
                continue;
            }
            let observed = match val.dtype() {
                Some(d) => d,
                None => continue,
            };
            match dtypes.get(col) {
                None => {
                    dtypes.insert(col.clone(), observed);
                }
                Some(existing) => {
                    if *existing != observed {
                        if let Some(widened) = existing.widen(&observed) {
                            dtypes.insert(col.clone(), widened);
                        }
                    }
                }
            }
        }
    }

    // Pass 2: coerce every cell to its column's (possibly just-widened)
    // dtype.
    for row in &mut batch.rows {
        let cols: Vec<String> = row.keys().cloned().collect();
        for col in cols {
            let Some(target) = dtypes.get(&col) else {
                continue;
            };
            let raw = row.get(&col).cloned().unwrap_or(Value::Null);
            if raw.is_null() {
                continue;
            }
            match coerce_cell(&raw, target) {
                Ok(coerced) => {
                    row.insert(col.clone(), coerced);
                }
                Err(reason) => {
                    if enforce {
                        return Err(MrsmError::DtypeMismatch {
                            column: col.clone(),
                            expected: target.to_string(),
                            actual: reason,
                        });
                    } else {
                        dtypes.insert(col.clone(), Dtype::Str);
                        // value passes through unchanged (already `raw`).
                    }
                }
            }
        }
    }
    Ok(())
}

/// Coerce a single raw value to `target`. Returns `Err(description)` of
/// the value's actual shape when coercion is impossible.
fn coerce_cell(raw: &Value, target: &Dtype) -> Result<Value, String> {
    use Value::*;
    match (raw, target) {
        (v, _) if v.dtype().as_ref() == Some(target) => Ok(v.clone()),
        (Int(i), Dtype::Float) => Ok(Float(*i as f64)),
        (Int(i), Dtype::Numeric { .. }) => Ok(Numeric(rust_decimal::Decimal::from(*i))),
        (Float(f), Dtype::Int) => {
            if f.fract() == 0.0 {
                Ok(Int(*f as i64))
            } else {
                Err(format!("non-integral float {f}"))
            }
        }
        (Float(f), Dtype::Numeric { .. }) => rust_decimal::Decimal::try_from(*f)
            .map(Numeric)
            .map_err(|_| format!("unrepresentable float {f}")),
        (Numeric(d), Dtype::Int) => d
            .to_string()
            .parse::<i64>()
            .map(Int)
            .map_err(|_| format!("non-integral decimal {d}")),
        (Numeric(d), Dtype::Float) => {
            use rust_decimal::prelude::ToPrimitive;
            d.to_f64().map(Float).ok_or_else(|| format!("decimal {d} out of f64 range"))
        }
        (Str(s), Dtype::Int) => s.parse::<i64>().map(Int).map_err(|_| s.clone()),
        (Str(s), Dtype::Float) => s.parse::<f64>().map(Float).map_err(|_| s.clone()),
        (Str(s), Dtype::Numeric { .. }) => {
            s.parse::<rust_decimal::Decimal>().map(Numeric).map_err(|_| s.clone())
        }
        (Str(s), Dtype::Bool) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "t" | "yes" => Ok(Bool(true)),
            "false" | "0" | "f" | "no" => Ok(Bool(false)),
            _ => Err(s.clone()),
        },
        (Int(i), Dtype::Bool) => Ok(Bool(*i != 0)),
        (Str(s), Dtype::Uuid) => uuid::Uuid::parse_str(s).map(Uuid).map_err(|_| s.clone()),
        (Str(s), Dtype::Bytes) => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(s)
                .map(Bytes)
                .map_err(|_| s.clone())
        }
        (Str(s), Dtype::DateTimeNaive) => parse_naive_datetime(s)
            .map(DateTimeNaive)
            .map_err(|_| s.clone()),
        (Str(s), Dtype::DateTimeUtc) => parse_utc_datetime(s)
            .map(DateTimeUtc)
            .map_err(|_| s.clone()),
        (DateTimeNaive(ndt), Dtype::DateTimeUtc) => {
            Ok(DateTimeUtc(chrono::DateTime::from_naive_utc_and_offset(*ndt, chrono::Utc)))
        }
        (DateTimeUtc(dt), Dtype::DateTimeNaive) => Ok(DateTimeNaive(dt.naive_utc())),
        (v, Dtype::Str) => Ok(Str(display_value(v))),
        (v, Dtype::Json) => Ok(Json(value_to_json(v))),
        (v, _) => Err(display_value(v)),
    }
}

fn parse_naive_datetime(s: &str) -> Result<chrono::NaiveDateTime, ()> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").map(|d| d.and_hms_opt(0, 0, 0).unwrap())
        })
        .map_err(|_| ())
}

/// Parse an RFC3339-ish datetime string and normalize to UTC. Mixed UTC
/// offsets across a batch are normalized here, independently, before any
/// stripping of tz info happens downstream (spec §4.1).
fn parse_utc_datetime(s: &str) -> Result<chrono::DateTime<chrono::Utc>, ()> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .or_else(|_| {
            parse_naive_datetime(s).map(|ndt| chrono::DateTime::from_naive_utc_and_offset(ndt, chrono::Utc))
        })
        .map_err(|_| ())
}

fn display_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Numeric(d) => d.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Str(s) => s.clone(),
        Value::Bytes(b) => format!("{b:?}"),
        Value::Uuid(u) => u.to_string(),
        Value::Json(j) => j.to_string(),
        Value::DateTimeNaive(dt) => dt.to_string(),
        Value::DateTimeUtc(dt) => dt.to_rfc3339(),
    }
}

fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Int(i) => serde_json::json!(i),
        Value::Float(f) => serde_json::json!(f),
        Value::Numeric(d) => serde_json::Value::String(d.to_string()),
        Value::Bool(b) => serde_json::json!(b),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::String(format!("{b:?}")),
        Value::Uuid(u) => serde_json::Value::String(u.to_string()),
        Value::Json(j) => j.clone(),
        Value::DateTimeNaive(dt) => serde_json::Value::String(dt.to_string()),
        Value::DateTimeUtc(dt) => serde_json::Value::String(dt.to_rfc3339()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dtypes(pairs: &[(&str, Dtype)]) -> BTreeMap<String, Dtype> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn enforce_dtypes_is_idempotent() {
        let mut batch = RecordBatch::from_json_rows(&[json!({"id": 1, "v": 10.5})]).unwrap();
        let mut dt = dtypes(&[("id", Dtype::Int), ("v", Dtype::Float)]);
        enforce_dtypes(&mut batch, &mut dt, true).unwrap();
        let once = batch.clone();
        enforce_dtypes(&mut batch, &mut dt, true).unwrap();
        assert_eq!(format!("{:?}", once.rows), format!("{:?}", batch.rows));
    }

    #[test]
    fn widens_int_column_on_float_value() {
        let mut batch = RecordBatch::from_json_rows(&[json!({"id": 1, "foo": 10})]).unwrap();
        let mut dt = dtypes(&[("id", Dtype::Int), ("foo", Dtype::Int)]);
        enforce_dtypes(&mut batch, &mut dt, true).unwrap();

        let mut batch2 = RecordBatch::from_json_rows(&[json!({"id": 1, "foo": 20.5})]).unwrap();
        enforce_dtypes(&mut batch2, &mut dt, true).unwrap();
        assert!(matches!(dt["foo"], Dtype::Numeric { .. }));
    }

    #[test]
    fn enforce_true_fails_on_bad_int() {
        let mut batch = RecordBatch::from_json_rows(&[json!({"id": "foo"})]).unwrap();
        let mut dt = dtypes(&[("id", Dtype::Int)]);
        let err = enforce_dtypes(&mut batch, &mut dt, true).unwrap_err();
        assert!(matches!(err, MrsmError::DtypeMismatch { .. }));
    }

    #[test]
    fn enforce_false_widens_to_text_on_bad_int() {
        let mut batch = RecordBatch::from_json_rows(&[json!({"id": "foo"})]).unwrap();
        let mut dt = dtypes(&[("id", Dtype::Int)]);
        enforce_dtypes(&mut batch, &mut dt, false).unwrap();
        assert_eq!(dt["id"], Dtype::Str);
        assert_eq!(batch.rows[0]["id"], Value::Str("foo".into()));
    }

    #[test]
    fn json_roundtrips_through_canonical_encoder() {
        let v = json!({"a": 1, "b": [1,2,3]});
        let mut batch = RecordBatch::from_json_rows(&[json!({"doc": v})]).unwrap();
        let mut dt = dtypes(&[("doc", Dtype::Json)]);
        enforce_dtypes(&mut batch, &mut dt, true).unwrap();
        if let Value::Json(parsed) = &batch.rows[0]["doc"] {
            assert_eq!(parsed, &v);
        } else {
            panic!("expected json value");
        }
    }

    #[test]
    fn mixed_utc_offsets_normalize_to_utc() {
        let mut batch = RecordBatch::from_json_rows(&[
            json!({"dt": "2023-01-01T00:00:00+00:00"}),
            json!({"dt": "2023-01-02T00:00:00+01:00"}),
        ])
        .unwrap();
        let mut dt = dtypes(&[("dt", Dtype::DateTimeUtc)]);
        enforce_dtypes(&mut batch, &mut dt, true).unwrap();
        let Value::DateTimeUtc(a) = batch.rows[0]["dt"] else { panic!() };
        let Value::DateTimeUtc(b) = batch.rows[1]["dt"] else { panic!() };
        assert_eq!(a.to_rfc3339(), "2023-01-01T00:00:00+00:00");
        assert_eq!(b.to_rfc3339(), "2023-01-01T23:00:00+00:00");
    }

    #[test]
    fn null_coalescence_makes_nulls_equal() {
        let mut batch =
            RecordBatch::from_json_rows(&[json!({"id": serde_json::Value::Null, "v": 1})]).unwrap();
        let idx_dtypes = dtypes(&[("id", Dtype::Int)]);
        batch.coalesce_null_indices(&idx_dtypes);
        assert_eq!(batch.rows[0]["id"], Value::Int(i64::MIN));
    }

    #[test]
    fn dedup_by_index_keeps_last_occurrence() {
        let batch = RecordBatch::from_json_rows(&[
            json!({"id": 1, "v": 10}),
            json!({"id": 1, "v": 20}),
        ])
        .unwrap();
        let deduped = batch.dedup_by_index(&["id".to_string()]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped.rows[0]["v"], Value::Int(20));
    }

    #[test]
    fn distinct_index_values_respects_cap() {
        let rows: Vec<serde_json::Value> = (0..5).map(|i| json!({"id": i})).collect();
        let batch = RecordBatch::from_json_rows(&rows).unwrap();
        let distinct = batch.distinct_index_values(&["id".to_string()], 3);
        assert!(!distinct.contains_key("id"));

        let distinct = batch.distinct_index_values(&["id".to_string()], 10);
        assert_eq!(distinct["id"].len(), 5);
    }
}
