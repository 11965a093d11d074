//! The sync pipeline (spec §4.4): resolve a source, fetch a (possibly
//! nested) chunk stream, filter each chunk against the target, evolve
//! the target's schema as needed, and apply inserts/updates through a
//! bounded worker pool.
//!
//! Grounded on `aivcs-ci/src/pipeline.rs` (an orchestrator struct
//! driving a multi-stage run and recording a result struct) and
//! `aivcs-ci/src/runner.rs` (bounded concurrent execution + a timeout
//! wrapper around each unit of work — there per CI stage, here per
//! sync chunk).

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use mrsm_core::dataframe::RecordBatch;
use mrsm_core::dtype::{Dtype, Value};
use mrsm_core::error::{MrsmError, Result};
use mrsm_core::success::SuccessTuple;
use mrsm_pipes::filter::{datetime_window, filter_existing, params_filter, FilterOptions};
use mrsm_pipes::Pipe;
use mrsm_storage::{GetDataOptions, Instance, Window};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

/// One element of a fetch's chunk stream. A fetch may hand back either
/// a row batch directly, or another chunk stream nested one level
/// (spec §4.4 "Nested generators", GLOSSARY "Batch"/"Chunk").
pub enum Chunk {
    Rows(RecordBatch),
    Nested(ChunkStream),
}

pub type ChunkStream = BoxStream<'static, Result<Chunk>>;

/// Supplies the row data a pipe's sync pulls from: a plugin-registered
/// `fetch()` or another connector's `fetch()` (spec §1, §4.4 step 1).
/// The in-place fast path (§4.5) never calls a `Fetcher` at all.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, pipe: &Pipe, begin: Option<Value>, end: Option<Value>) -> Result<ChunkStream>;
}

/// A detached pre/post-sync hook (spec §4.4 steps 4 & 6, §9 "Hooks as
/// detached workers"): dispatched to a `tokio` task the pipeline never
/// awaits for its result, only logs on failure.
#[async_trait]
pub trait SyncHook: Send + Sync {
    async fn call(&self, pipe: &Pipe, context: HookContext) -> Result<SuccessTuple>;
}

#[derive(Debug, Clone)]
pub struct HookContext {
    pub sync_timestamp: chrono::DateTime<Utc>,
    pub sync_complete_timestamp: Option<chrono::DateTime<Utc>>,
    pub sync_duration: Option<Duration>,
    pub success: Option<SuccessTuple>,
}

/// Options controlling one `sync()` call (spec §4.4 entry signature).
#[derive(Clone)]
pub struct SyncOptions {
    pub workers: usize,
    /// Caps `effective_workers` when the backend reports a smaller
    /// thread-safety factor or connection pool headroom (spec §4.4 step
    /// 5, §5 "Shared resources").
    pub pool_available: usize,
    pub skip_check_existing: bool,
    pub enforce: bool,
    pub timeout: Option<Duration>,
    pub begin: Option<Value>,
    pub end: Option<Value>,
    pub max_retries: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            pool_available: usize::MAX,
            skip_check_existing: false,
            enforce: true,
            timeout: None,
            begin: None,
            end: None,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub success: SuccessTuple,
    pub chunks_applied: usize,
    pub rows_inserted: usize,
    pub rows_updated: usize,
}

/// `effective_workers = min(requested_workers, backend.thread_safety_factor,
/// pool_available)` (spec §4.4 step 5, §5).
pub fn effective_workers(options: &SyncOptions, instance: &dyn Instance) -> usize {
    let caps = instance.capabilities();
    let factor = if caps.thread_safety_factor == 0 { usize::MAX } else { caps.thread_safety_factor };
    options.workers.min(factor).min(options.pool_available).max(1)
}

/// Drive `pipe`'s full sync: resolve `begin`, invoke `fetcher`, and
/// apply every chunk the (possibly nested) stream yields through a
/// bounded worker pool (spec §4.4).
pub async fn sync(
    instance: Arc<dyn Instance>,
    pipe: Pipe,
    fetcher: Arc<dyn Fetcher>,
    options: SyncOptions,
    pre_hook: Option<Arc<dyn SyncHook>>,
    post_hook: Option<Arc<dyn SyncHook>>,
) -> Result<SyncOutcome> {
    let sync_timestamp = Utc::now();

    dispatch_hook(
        pre_hook,
        pipe.clone(),
        HookContext {
            sync_timestamp,
            sync_complete_timestamp: None,
            sync_duration: None,
            success: None,
        },
    );

    let run = run_sync(instance.clone(), pipe.clone(), fetcher, options.clone());
    let result = match options.timeout {
        Some(d) => match tokio::time::timeout(d, run).await {
            Ok(r) => r,
            Err(_) => Err(MrsmError::TimedOut(d)),
        },
        None => run.await,
    };

    let sync_complete_timestamp = Utc::now();
    let success = match &result {
        Ok(outcome) => outcome.success.clone(),
        Err(e) => SuccessTuple::fail(e.to_string()),
    };
    dispatch_hook(
        post_hook,
        pipe,
        HookContext {
            sync_timestamp,
            sync_complete_timestamp: Some(sync_complete_timestamp),
            sync_duration: (sync_complete_timestamp - sync_timestamp).to_std().ok(),
            success: Some(success),
        },
    );

    result
}

fn dispatch_hook(hook: Option<Arc<dyn SyncHook>>, pipe: Pipe, context: HookContext) {
    let Some(hook) = hook else { return };
    tokio::spawn(async move {
        if let Err(e) = hook.call(&pipe, context).await {
            tracing::warn!(pipe = %pipe.keys, error = %e, "sync hook failed");
        }
    });
}

async fn run_sync(instance: Arc<dyn Instance>, pipe: Pipe, fetcher: Arc<dyn Fetcher>, options: SyncOptions) -> Result<SyncOutcome> {
    let begin = resolve_begin(instance.as_ref(), &pipe, &options).await?;
    let stream = fetcher.fetch(&pipe, begin, options.end.clone()).await?;
    let rows_stream = flatten_chunks(stream);

    let chunks_applied = Arc::new(AtomicUsize::new(0));
    let rows_inserted = Arc::new(AtomicUsize::new(0));
    let rows_updated = Arc::new(AtomicUsize::new(0));
    let failures: Arc<tokio::sync::Mutex<Vec<String>>> = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    let mut rows_stream = Box::pin(rows_stream);

    if pipe.parameters.upsert {
        // Chunks within a pipe may commit out of arrival order only when
        // `upsert=true` (spec §4.4 "Concurrency contract"): an upsert is
        // commutative on the index tuple, so reordering can't strand a
        // stale value.
        let workers = effective_workers(&options, instance.as_ref());
        let semaphore = Arc::new(tokio::sync::Semaphore::new(workers));
        let mut join_set = tokio::task::JoinSet::new();
        while let Some(batch_result) = rows_stream.next().await {
            let batch = match batch_result {
                Ok(b) => b,
                Err(e) => {
                    failures.lock().await.push(e.to_string());
                    continue;
                }
            };
            let permit = semaphore.clone().acquire_owned().await.map_err(|e| MrsmError::Backend(e.to_string()))?;
            let instance = instance.clone();
            let pipe = pipe.clone();
            let options = options.clone();
            let chunks_applied = chunks_applied.clone();
            let rows_inserted = rows_inserted.clone();
            let rows_updated = rows_updated.clone();
            let failures = failures.clone();

            join_set.spawn(async move {
                let _permit = permit;
                match apply_chunk_with_retry(instance.as_ref(), &pipe, batch, &options).await {
                    Ok((inserted, updated)) => {
                        chunks_applied.fetch_add(1, AtomicOrdering::Relaxed);
                        rows_inserted.fetch_add(inserted, AtomicOrdering::Relaxed);
                        rows_updated.fetch_add(updated, AtomicOrdering::Relaxed);
                    }
                    Err(e) => {
                        failures.lock().await.push(e.to_string());
                    }
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    } else {
        // `upsert=false`: apply serially, in stream arrival order, so a
        // later chunk's value for the same index tuple always wins.
        while let Some(batch_result) = rows_stream.next().await {
            let batch = match batch_result {
                Ok(b) => b,
                Err(e) => {
                    failures.lock().await.push(e.to_string());
                    continue;
                }
            };
            match apply_chunk_with_retry(instance.as_ref(), &pipe, batch, &options).await {
                Ok((inserted, updated)) => {
                    chunks_applied.fetch_add(1, AtomicOrdering::Relaxed);
                    rows_inserted.fetch_add(inserted, AtomicOrdering::Relaxed);
                    rows_updated.fetch_add(updated, AtomicOrdering::Relaxed);
                }
                Err(e) => {
                    failures.lock().await.push(e.to_string());
                }
            }
        }
    }

    let failures = failures.lock().await.clone();
    let success = if failures.is_empty() {
        SuccessTuple::ok(format!(
            "synced '{}': {} chunk(s), {} inserted, {} updated",
            pipe.keys,
            chunks_applied.load(AtomicOrdering::Relaxed),
            rows_inserted.load(AtomicOrdering::Relaxed),
            rows_updated.load(AtomicOrdering::Relaxed),
        ))
    } else {
        SuccessTuple::fail(format!("{} chunk(s) failed: {}", failures.len(), failures.join("; ")))
    };

    Ok(SyncOutcome {
        success,
        chunks_applied: chunks_applied.load(AtomicOrdering::Relaxed),
        rows_inserted: rows_inserted.load(AtomicOrdering::Relaxed),
        rows_updated: rows_updated.load(AtomicOrdering::Relaxed),
    })
}

/// `begin = get_sync_time(pipe) - backtrack_interval` when not supplied
/// (spec §4.4 step 2).
async fn resolve_begin(instance: &dyn Instance, pipe: &Pipe, options: &SyncOptions) -> Result<Option<Value>> {
    if options.begin.is_some() {
        return Ok(options.begin.clone());
    }
    let newest = instance.get_sync_time(pipe, &BTreeMap::new(), true, false).await?;
    Ok(newest.map(|v| crate::chunks::shift_value(&v, -pipe.parameters.backtrack_duration())))
}

/// Flatten a (possibly nested, one level or more) chunk stream
/// depth-first (spec §4.4 "Nested generators": "consumes lazily
/// depth-first"). A manual stack stands in for recursive `async fn`
/// calls, which Rust can't express over a trait-object stream.
pub fn flatten_chunks(root: ChunkStream) -> BoxStream<'static, Result<RecordBatch>> {
    Box::pin(async_stream::try_stream! {
        let mut stack: Vec<ChunkStream> = vec![root];
        while let Some(mut top) = stack.pop() {
            match top.next().await {
                Some(Ok(Chunk::Rows(batch))) => {
                    stack.push(top);
                    yield batch;
                }
                Some(Ok(Chunk::Nested(inner))) => {
                    stack.push(top);
                    stack.push(inner);
                }
                Some(Err(e)) => Err(e)?,
                None => {}
            }
        }
    })
}

/// Apply one chunk: dtype coercion, filter-existing (unless
/// `skip_check_existing`), schema evolution, and the actual
/// insert/update, retried up to `max_retries` times with exponential
/// backoff (spec §4.4 step 5). Returns `(rows_inserted, rows_updated)`.
async fn apply_chunk_with_retry(
    instance: &dyn Instance,
    pipe: &Pipe,
    mut batch: RecordBatch,
    options: &SyncOptions,
) -> Result<(usize, usize)> {
    let mut attempt = 0;
    loop {
        match apply_chunk(instance, pipe, batch.clone(), options).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if attempt < options.max_retries && is_retryable(&e) => {
                attempt += 1;
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt)) + jitter();
                tracing::warn!(pipe = %pipe.keys, attempt, error = %e, "retrying chunk after backoff");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_retryable(err: &MrsmError) -> bool {
    matches!(err, MrsmError::Transient(_) | MrsmError::ConnectorUnavailable(_))
}

fn jitter() -> Duration {
    use rand::Rng;
    Duration::from_millis(rand::thread_rng().gen_range(0..=50))
}

async fn apply_chunk(instance: &dyn Instance, pipe: &Pipe, mut batch: RecordBatch, options: &SyncOptions) -> Result<(usize, usize)> {
    let mut dtypes = pipe.dtypes.clone();
    if options.enforce {
        mrsm_core::dataframe::enforce_dtypes(&mut batch, &mut dtypes, pipe.parameters.enforce)?;
    }

    let (unseen, update) = if options.skip_check_existing {
        (batch.clone(), RecordBatch::default())
    } else {
        let index_columns = pipe.index_columns();
        let existing = fetch_existing(instance, pipe, &batch, &index_columns).await?;
        let result = filter_existing(
            &batch,
            &existing,
            &index_columns,
            &pipe.index_dtypes(),
            &FilterOptions::default(),
            &mut dtypes,
        )?;
        (result.unseen, result.update)
    };

    evolve_schema(instance, pipe, &dtypes).await?;

    if unseen.is_empty() && update.is_empty() {
        return Ok((0, 0));
    }
    instance.sync_pipe(pipe, &unseen, &update).await?;
    Ok((unseen.len(), update.len()))
}

/// Read the existing rows a chunk's index tuples might collide with
/// (spec §4.3 steps 2-4): a datetime window plus a capped params
/// filter built from the chunk's own distinct index values.
async fn fetch_existing(instance: &dyn Instance, pipe: &Pipe, batch: &RecordBatch, index_columns: &[String]) -> Result<RecordBatch> {
    if index_columns.is_empty() {
        return Ok(RecordBatch::default());
    }
    let mut options = GetDataOptions::default();
    if let Some(dt_col) = pipe.datetime_column() {
        if let Some((begin, end)) = datetime_window(batch, dt_col, pipe.parameters.backtrack_duration()) {
            options.window = Window::new(Some(begin), Some(end));
        }
    }
    options.params = params_filter(batch, index_columns, pipe.parameters.distinct_value_cap);
    let mut select = index_columns.to_vec();
    select.extend(pipe.dtypes.keys().cloned());
    select.sort();
    select.dedup();
    options.select = Some(select);
    instance.get_data(pipe, &options).await
}

/// Diff `dtypes` (the batch's just-coerced, possibly-widened schema)
/// against the target's current physical schema and issue
/// `ALTER TABLE ADD COLUMN` / `ALTER COLUMN TYPE` as needed (spec §4.4
/// step 5; spec §3 invariant 2 for `static` pipes).
async fn evolve_schema(instance: &dyn Instance, pipe: &Pipe, dtypes: &BTreeMap<String, Dtype>) -> Result<()> {
    let current = instance.get_columns_types(pipe).await?;
    let existing_columns: std::collections::BTreeSet<String> = current.keys().cloned().collect();
    let rejected = pipe.reject_new_columns(&existing_columns);
    if !rejected.is_empty() {
        return Err(MrsmError::SchemaConflict {
            column: rejected.join(", "),
            reason: "pipe is static; new columns are not permitted".to_string(),
        });
    }

    for (column, dtype) in dtypes {
        match current.get(column) {
            None => {
                instance.add_column(pipe, column, dtype).await?;
            }
            Some(existing) if existing != dtype => {
                if let Some(widened) = existing.widen(dtype) {
                    if &widened != existing {
                        instance.alter_column_type(pipe, column, &widened).await?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use mrsm_storage::MemoryInstance;

    fn sample_pipe() -> Pipe {
        use mrsm_pipes::{ConnectorKey, PipeKeys};
        let keys = PipeKeys::new(
            ConnectorKey::new("sql", "source"),
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

    struct StaticFetcher(Vec<serde_json::Value>);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, _pipe: &Pipe, _begin: Option<Value>, _end: Option<Value>) -> Result<ChunkStream> {
            let batch = RecordBatch::from_json_rows(&self.0).unwrap();
            Ok(Box::pin(stream::once(async { Ok(Chunk::Rows(batch)) })))
        }
    }

    #[tokio::test]
    async fn sync_inserts_new_rows() {
        let instance: Arc<dyn Instance> = Arc::new(MemoryInstance::new());
        let pipe = sample_pipe();
        instance.register_pipe(&pipe).await.unwrap();
        let fetcher = Arc::new(StaticFetcher(vec![
            serde_json::json!({"dt": "2022-06-26T00:00:00Z", "id": 1, "v": 10}),
        ]));

        let outcome = sync(instance.clone(), pipe.clone(), fetcher, SyncOptions::default(), None, None)
            .await
            .unwrap();
        assert!(outcome.success.is_ok());
        assert_eq!(outcome.rows_inserted, 1);

        let count = instance.get_rowcount(&pipe, &Window::default(), false).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn sync_same_batch_twice_is_idempotent() {
        let instance: Arc<dyn Instance> = Arc::new(MemoryInstance::new());
        let pipe = sample_pipe();
        instance.register_pipe(&pipe).await.unwrap();
        let row = serde_json::json!({"dt": "2022-06-26T00:00:00Z", "id": 1, "v": 10});
        for _ in 0..2 {
            let fetcher = Arc::new(StaticFetcher(vec![row.clone()]));
            sync(instance.clone(), pipe.clone(), fetcher, SyncOptions::default(), None, None)
                .await
                .unwrap();
        }
        let count = instance.get_rowcount(&pipe, &Window::default(), false).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn sync_dynamic_column_widens_schema() {
        let instance: Arc<dyn Instance> = Arc::new(MemoryInstance::new());
        let mut pipe = sample_pipe();
        pipe.dtypes.remove("v");
        instance.register_pipe(&pipe).await.unwrap();

        let fetcher1 = Arc::new(StaticFetcher(vec![
            serde_json::json!({"dt": "2022-06-26T00:00:00Z", "id": 1, "a": 10.0}),
        ]));
        sync(instance.clone(), pipe.clone(), fetcher1, SyncOptions::default(), None, None)
            .await
            .unwrap();

        let fetcher2 = Arc::new(StaticFetcher(vec![
            serde_json::json!({"dt": "2022-06-26T00:00:00Z", "id": 1, "b": 20.0}),
        ]));
        sync(instance.clone(), pipe.clone(), fetcher2, SyncOptions::default(), None, None)
            .await
            .unwrap();

        let columns = instance.get_columns_types(&pipe).await.unwrap();
        assert!(columns.contains_key("a"));
        assert!(columns.contains_key("b"));
    }

    #[test]
    fn effective_workers_respects_pool_headroom() {
        let options = SyncOptions {
            workers: 8,
            pool_available: 2,
            ..Default::default()
        };
        let instance = MemoryInstance::new();
        assert_eq!(effective_workers(&options, &instance), 2);
    }

    struct SequentialFetcher(Vec<serde_json::Value>);

    #[async_trait]
    impl Fetcher for SequentialFetcher {
        async fn fetch(&self, _pipe: &Pipe, _begin: Option<Value>, _end: Option<Value>) -> Result<ChunkStream> {
            let chunks: Vec<Result<Chunk>> = self
                .0
                .iter()
                .map(|row| Ok(Chunk::Rows(RecordBatch::from_json_rows(std::slice::from_ref(row)).unwrap())))
                .collect();
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    #[tokio::test]
    async fn sync_applies_chunks_in_arrival_order_when_upsert_is_false() {
        let instance: Arc<dyn Instance> = Arc::new(MemoryInstance::new());
        let mut pipe = sample_pipe();
        pipe.parameters.upsert = false;
        instance.register_pipe(&pipe).await.unwrap();

        // Same index tuple (dt, id) arrives twice with different `v`;
        // arrival order must decide the final value, not completion order.
        let fetcher = Arc::new(SequentialFetcher(vec![
            serde_json::json!({"dt": "2022-06-26T00:00:00Z", "id": 1, "v": 10}),
            serde_json::json!({"dt": "2022-06-26T00:00:00Z", "id": 1, "v": 100}),
        ]));
        sync(instance.clone(), pipe.clone(), fetcher, SyncOptions::default(), None, None)
            .await
            .unwrap();

        let mut options = GetDataOptions::default();
        options.select = Some(vec!["dt".into(), "id".into(), "v".into()]);
        let data = instance.get_data(&pipe, &options).await.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data.rows[0].get("v"), Some(&Value::Float(100.0)));
    }

    #[tokio::test]
    async fn nested_chunk_streams_flatten_depth_first() {
        let inner = stream::iter(vec![
            Ok(Chunk::Rows(RecordBatch::from_json_rows(&[serde_json::json!({"id": 1})]).unwrap())),
            Ok(Chunk::Rows(RecordBatch::from_json_rows(&[serde_json::json!({"id": 2})]).unwrap())),
        ]);
        let outer: ChunkStream = Box::pin(stream::iter(vec![Ok(Chunk::Nested(Box::pin(inner)))]));
        let flattened: Vec<RecordBatch> = flatten_chunks(outer).map(|r| r.unwrap()).collect().await;
        assert_eq!(flattened.len(), 2);
    }
}
