//! In-memory `Instance` fake (spec §4.2's "in-memory Valkey-like KV"
//! instance; also the generic test double for `mrsm-sync`).
//!
//! Grounded on the teacher's `fakes.rs` — a `Mutex`-guarded `HashMap`
//! standing in behind the trait, with the same contract the real
//! backend honors.

use async_trait::async_trait;
use mrsm_core::dataframe::{RecordBatch, Row};
use mrsm_core::dtype::{Dtype, Value};
use mrsm_core::error::{MrsmError, Result};
use mrsm_core::success::SuccessTuple;
use mrsm_pipes::{Pipe, PipeKeys};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::instance::{Capabilities, Instance};
use crate::types::{GetDataOptions, PipesFilter, Window};

struct PipeState {
    pipe: Pipe,
    columns_types: BTreeMap<String, Dtype>,
    rows: Vec<Row>,
}

/// In-process storage backend. Not thread-unsafe across processes (no
/// persistence), but fully concurrency-safe within one: every operation
/// takes the same coarse lock, matching the teacher's fakes' "single
/// mutex, simple and correct" tradeoff.
#[derive(Default)]
pub struct MemoryInstance {
    pipes: Mutex<BTreeMap<PipeKeys, PipeState>>,
}

impl MemoryInstance {
    pub fn new() -> Self {
        Self::default()
    }
}

fn row_matches_window(row: &Row, datetime_col: Option<&str>, window: &Window) -> bool {
    let Some(col) = datetime_col else { return true };
    let Some(val) = row.get(col) else { return true };
    if let Some(begin) = &window.begin {
        if compare(val, begin) == std::cmp::Ordering::Less {
            return false;
        }
    }
    if let Some(end) = &window.end {
        if compare(val, end) != std::cmp::Ordering::Less {
            return false;
        }
    }
    true
}

fn compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::DateTimeUtc(x), Value::DateTimeUtc(y)) => x.cmp(y),
        (Value::DateTimeNaive(x), Value::DateTimeNaive(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn row_matches_params(row: &Row, params: &BTreeMap<String, Vec<Value>>) -> bool {
    params.iter().all(|(col, allowed)| match row.get(col) {
        Some(v) => allowed.contains(v),
        None => false,
    })
}

#[async_trait]
impl Instance for MemoryInstance {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_in_place: false,
            is_thread_safe: true,
            is_instance: true,
            thread_safety_factor: 8,
        }
    }

    async fn register_pipe(&self, pipe: &Pipe) -> Result<SuccessTuple> {
        let mut pipes = self.pipes.lock().unwrap();
        if pipes.contains_key(&pipe.keys) {
            return Err(MrsmError::AlreadyExists(pipe.keys.to_string()));
        }
        pipes.insert(
            pipe.keys.clone(),
            PipeState {
                pipe: pipe.clone(),
                columns_types: pipe.dtypes.clone(),
                rows: Vec::new(),
            },
        );
        Ok(SuccessTuple::ok(format!("registered pipe '{}'", pipe.keys)))
    }

    async fn edit_pipe(&self, pipe: &Pipe) -> Result<SuccessTuple> {
        let mut pipes = self.pipes.lock().unwrap();
        let state = pipes
            .get_mut(&pipe.keys)
            .ok_or_else(|| MrsmError::NotFound(pipe.keys.to_string()))?;
        state.pipe = pipe.clone();
        Ok(SuccessTuple::ok(format!("edited pipe '{}'", pipe.keys)))
    }

    async fn delete_pipe(&self, keys: &PipeKeys) -> Result<SuccessTuple> {
        let mut pipes = self.pipes.lock().unwrap();
        pipes
            .remove(keys)
            .ok_or_else(|| MrsmError::NotFound(keys.to_string()))?;
        Ok(SuccessTuple::ok(format!("deleted pipe '{keys}'")))
    }

    async fn fetch_pipes_keys(&self, filter: &PipesFilter) -> Result<Vec<PipeKeys>> {
        let pipes = self.pipes.lock().unwrap();
        Ok(pipes
            .values()
            .filter(|s| matches_filter(&s.pipe, filter))
            .map(|s| s.pipe.keys.clone())
            .collect())
    }

    async fn get_pipe_attributes(&self, keys: &PipeKeys) -> Result<Option<Pipe>> {
        let pipes = self.pipes.lock().unwrap();
        Ok(pipes.get(keys).map(|s| s.pipe.clone()))
    }

    async fn pipe_exists(&self, pipe: &Pipe) -> Result<bool> {
        let pipes = self.pipes.lock().unwrap();
        Ok(pipes.contains_key(&pipe.keys))
    }

    async fn get_columns_types(&self, pipe: &Pipe) -> Result<BTreeMap<String, Dtype>> {
        let pipes = self.pipes.lock().unwrap();
        Ok(pipes
            .get(&pipe.keys)
            .map(|s| s.columns_types.clone())
            .unwrap_or_default())
    }

    async fn create_indices(&self, _pipe: &Pipe) -> Result<SuccessTuple> {
        // No physical indices in the in-memory fake; index columns are
        // always scanned directly.
        Ok(SuccessTuple::ok("indices are implicit in memory"))
    }

    async fn drop_indices(&self, _pipe: &Pipe) -> Result<SuccessTuple> {
        Ok(SuccessTuple::ok("indices are implicit in memory"))
    }

    async fn drop_pipe(&self, pipe: &Pipe) -> Result<SuccessTuple> {
        let mut pipes = self.pipes.lock().unwrap();
        if let Some(state) = pipes.get_mut(&pipe.keys) {
            state.rows.clear();
        }
        Ok(SuccessTuple::ok(format!("dropped table for '{}'", pipe.keys)))
    }

    async fn add_column(&self, pipe: &Pipe, column: &str, dtype: &Dtype) -> Result<SuccessTuple> {
        crate::instance::check_static_schema(pipe, column)?;
        let mut pipes = self.pipes.lock().unwrap();
        let state = pipes
            .get_mut(&pipe.keys)
            .ok_or_else(|| MrsmError::NotFound(pipe.keys.to_string()))?;
        state.columns_types.insert(column.to_string(), dtype.clone());
        Ok(SuccessTuple::ok(format!("added column '{column}'")))
    }

    async fn alter_column_type(&self, pipe: &Pipe, column: &str, dtype: &Dtype) -> Result<SuccessTuple> {
        let mut pipes = self.pipes.lock().unwrap();
        let state = pipes
            .get_mut(&pipe.keys)
            .ok_or_else(|| MrsmError::NotFound(pipe.keys.to_string()))?;
        state.columns_types.insert(column.to_string(), dtype.clone());
        Ok(SuccessTuple::ok(format!("widened column '{column}' to {dtype}")))
    }

    async fn get_sync_time(
        &self,
        pipe: &Pipe,
        params: &BTreeMap<String, Vec<Value>>,
        newest: bool,
        _remote: bool,
    ) -> Result<Option<Value>> {
        let Some(dt_col) = pipe.datetime_column() else {
            return Ok(None);
        };
        let pipes = self.pipes.lock().unwrap();
        let Some(state) = pipes.get(&pipe.keys) else {
            return Ok(None);
        };
        let mut values: Vec<&Value> = state
            .rows
            .iter()
            .filter(|r| row_matches_params(r, params))
            .filter_map(|r| r.get(dt_col))
            .filter(|v| !v.is_null())
            .collect();
        if values.is_empty() {
            return Ok(None);
        }
        values.sort_by(|a, b| compare(a, b));
        Ok(if newest {
            values.last().copied().cloned()
        } else {
            values.first().copied().cloned()
        })
    }

    async fn get_rowcount(&self, pipe: &Pipe, window: &Window, _remote: bool) -> Result<i64> {
        let pipes = self.pipes.lock().unwrap();
        let Some(state) = pipes.get(&pipe.keys) else {
            return Ok(0);
        };
        let dt_col = pipe.datetime_column();
        Ok(state
            .rows
            .iter()
            .filter(|r| row_matches_window(r, dt_col, window))
            .count() as i64)
    }

    async fn get_data(&self, pipe: &Pipe, options: &GetDataOptions) -> Result<RecordBatch> {
        let pipes = self.pipes.lock().unwrap();
        let Some(state) = pipes.get(&pipe.keys) else {
            return Ok(RecordBatch::default());
        };
        let dt_col = pipe.datetime_column();
        let mut rows: Vec<Row> = state
            .rows
            .iter()
            .filter(|r| row_matches_window(r, dt_col, &options.window))
            .filter(|r| row_matches_params(r, &options.params))
            .cloned()
            .collect();

        if let Some(col) = dt_col {
            rows.sort_by(|a, b| match (a.get(col), b.get(col)) {
                (Some(x), Some(y)) => compare(x, y),
                _ => std::cmp::Ordering::Equal,
            });
            if options.order_descending {
                rows.reverse();
            }
        }
        if let Some(limit) = options.limit {
            rows.truncate(limit);
        }

        let mut batch = RecordBatch::new(rows);
        if let Some(select) = &options.select {
            batch = batch.project(select);
        }
        if let Some(omit) = &options.omit {
            let keep: Vec<String> = state
                .columns_types
                .keys()
                .filter(|c| !omit.contains(c))
                .cloned()
                .collect();
            batch = batch.project(&keep);
        }
        Ok(batch)
    }

    async fn sync_pipe(&self, pipe: &Pipe, unseen: &RecordBatch, update: &RecordBatch) -> Result<SuccessTuple> {
        let index_columns = pipe.index_columns();
        let mut pipes = self.pipes.lock().unwrap();
        let state = pipes
            .entry(pipe.keys.clone())
            .or_insert_with(|| PipeState {
                pipe: pipe.clone(),
                columns_types: pipe.dtypes.clone(),
                rows: Vec::new(),
            });

        for row in &update.rows {
            if index_columns.is_empty() {
                continue;
            }
            let key: Vec<Option<Value>> = index_columns.iter().map(|c| row.get(c).cloned()).collect();
            if let Some(existing) = state.rows.iter_mut().find(|r| {
                let existing_key: Vec<Option<Value>> = index_columns.iter().map(|c| r.get(c).cloned()).collect();
                existing_key == key
            }) {
                for (col, val) in row.iter() {
                    existing.insert(col.clone(), val.clone());
                }
            } else {
                state.rows.push(row.clone());
            }
        }
        state.rows.extend(unseen.rows.iter().cloned());

        for col in unseen.rows.iter().chain(update.rows.iter()).flat_map(|r| r.keys()) {
            state.columns_types.entry(col.clone()).or_insert(Dtype::Str);
        }

        Ok(SuccessTuple::ok(format!(
            "inserted {}, updated {} row(s)",
            unseen.len(),
            update.len()
        )))
    }

    async fn clear_pipe(&self, pipe: &Pipe, window: &Window) -> Result<SuccessTuple> {
        let mut pipes = self.pipes.lock().unwrap();
        let Some(state) = pipes.get_mut(&pipe.keys) else {
            return Ok(SuccessTuple::ok("pipe has no rows"));
        };
        let dt_col = pipe.datetime_column();
        let before = state.rows.len();
        state.rows.retain(|r| !row_matches_window(r, dt_col, window));
        Ok(SuccessTuple::ok(format!("cleared {} row(s)", before - state.rows.len())))
    }
}

fn matches_filter(pipe: &Pipe, filter: &PipesFilter) -> bool {
    if !filter.connector_patterns.is_empty()
        && !filter
            .connector_patterns
            .iter()
            .any(|p| glob_match(p, &pipe.keys.connector.label))
    {
        return false;
    }
    if !filter.metric_patterns.is_empty() && !filter.metric_patterns.iter().any(|p| glob_match(p, &pipe.keys.metric)) {
        return false;
    }
    if !filter.location_patterns.is_empty() {
        let loc = pipe.keys.location.as_deref().unwrap_or("");
        if !filter.location_patterns.iter().any(|p| glob_match(p, loc)) {
            return false;
        }
    }
    if !filter.tags.is_empty() && !filter.tags.iter().all(|t| pipe.parameters.tags.contains(t)) {
        return false;
    }
    true
}

/// Minimal glob matcher supporting `*` and a leading `_` negation
/// (spec §6: "each accepting globs and negation with a leading `_`").
fn glob_match(pattern: &str, value: &str) -> bool {
    if let Some(rest) = pattern.strip_prefix('_') {
        return !glob_match(rest, value);
    }
    if pattern == "*" {
        return true;
    }
    match pattern.split_once('*') {
        Some((prefix, suffix)) => value.starts_with(prefix) && value.ends_with(suffix),
        None => pattern == value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrsm_pipes::ConnectorKey;
    use serde_json::json;

    fn sample_pipe() -> Pipe {
        let keys = PipeKeys::new(
            ConnectorKey::new("sql", "main"),
            "temp",
            None,
            ConnectorKey::new("sql", "main"),
        );
        let mut p = Pipe::new(keys);
        p.columns.insert("datetime".into(), "dt".into());
        p.columns.insert("id".into(), "id".into());
        p.dtypes.insert("dt".into(), Dtype::DateTimeUtc);
        p.dtypes.insert("id".into(), Dtype::Int);
        p
    }

    #[tokio::test]
    async fn register_then_duplicate_fails() {
        let inst = MemoryInstance::new();
        let pipe = sample_pipe();
        assert!(inst.register_pipe(&pipe).await.unwrap().is_ok());
        let err = inst.register_pipe(&pipe).await.unwrap_err();
        assert!(matches!(err, MrsmError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn sync_then_idempotent_sync_is_noop() {
        let inst = MemoryInstance::new();
        let pipe = sample_pipe();
        inst.register_pipe(&pipe).await.unwrap();

        let batch = RecordBatch::from_json_rows(&[
            json!({"dt": "2022-06-26T00:00:00Z", "id": 1, "v": 10}),
        ])
        .unwrap();
        inst.sync_pipe(&pipe, &batch, &RecordBatch::default()).await.unwrap();
        let count = inst
            .get_rowcount(&pipe, &Window::default(), false)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn clear_pipe_removes_rows_in_window() {
        let inst = MemoryInstance::new();
        let pipe = sample_pipe();
        inst.register_pipe(&pipe).await.unwrap();
        let batch =
            RecordBatch::from_json_rows(&[json!({"dt": "2022-06-26T00:00:00Z", "id": 1, "v": 10})]).unwrap();
        inst.sync_pipe(&pipe, &batch, &RecordBatch::default()).await.unwrap();
        inst.clear_pipe(&pipe, &Window::default()).await.unwrap();
        let count = inst.get_rowcount(&pipe, &Window::default(), false).await.unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn glob_match_supports_wildcard_and_negation() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("foo*", "foobar"));
        assert!(!glob_match("_foo*", "foobar"));
        assert!(glob_match("_foo*", "barbaz"));
    }
}
