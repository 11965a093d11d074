//! The in-place sync fast path (spec §4.5): when a pipe's connector and
//! instance are the same backend (`PipeKeys::is_inplace_eligible`), skip
//! materializing rows through the application entirely and let the
//! backend itself compute the anti-join via `Instance::sync_pipe_inplace`.
//!
//! Grounded on `aivcs-ci/src/pipeline.rs`'s early-exit "nothing changed,
//! skip the rest of the run" branch, generalized to "the backend can
//! skip the rest of the pipeline".

use mrsm_core::error::{MrsmError, Result};
use mrsm_core::success::SuccessTuple;
use mrsm_pipes::Pipe;
use mrsm_storage::Instance;

use crate::pipeline::{sync, Fetcher, SyncOptions, SyncOutcome};
use std::sync::Arc;

/// Build the source-side query `sync_pipe_inplace` diffs against the
/// target. `source_table` is the connector-side table or view backing
/// the pipe; an optional datetime lower bound narrows it to the same
/// `begin` the ordinary pipeline would have fetched from (spec §4.4
/// step 2, reused here since in-place sync still respects backtracking).
pub fn wrap_source_query(source_table: &str, datetime_column: Option<&str>, begin: Option<&str>) -> String {
    match (datetime_column, begin) {
        (Some(col), Some(b)) => format!("SELECT * FROM {source_table} WHERE {col} >= {b}"),
        _ => format!("SELECT * FROM {source_table}"),
    }
}

/// Run the in-place fast path if the pipe is eligible and the instance
/// supports it; otherwise fall back to the ordinary fetch/filter/apply
/// pipeline via `fallback_fetcher` (spec §4.4 step 1: "if in-place
/// eligible, attempt §4.5 first; on `None` capability, continue with the
/// regular pipeline").
pub async fn sync_inplace(
    instance: Arc<dyn Instance>,
    pipe: Pipe,
    source_query: &str,
    fallback_fetcher: Arc<dyn Fetcher>,
    options: SyncOptions,
) -> Result<SyncOutcome> {
    if !pipe.keys.is_inplace_eligible() {
        return Err(MrsmError::Configuration(format!(
            "pipe '{}' is not in-place eligible: connector and instance differ",
            pipe.keys
        )));
    }

    match instance.sync_pipe_inplace(&pipe, source_query).await? {
        Some(success) => Ok(SyncOutcome {
            success,
            chunks_applied: 1,
            rows_inserted: 0,
            rows_updated: 0,
        }),
        None => {
            tracing::debug!(pipe = %pipe.keys, "backend has no in-place fast path; falling back to materialized sync");
            sync(instance, pipe, fallback_fetcher, options, None, None).await
        }
    }
}

/// Try the in-place fast path; on any error, retry once via the
/// materialized pipeline rather than failing the whole sync outright
/// (spec §4.5: the fast path is an optimization, never a requirement).
pub async fn sync_inplace_or_materialize(
    instance: Arc<dyn Instance>,
    pipe: Pipe,
    source_query: &str,
    fallback_fetcher: Arc<dyn Fetcher>,
    options: SyncOptions,
) -> Result<SuccessTuple> {
    if pipe.keys.is_inplace_eligible() {
        match sync_inplace(instance.clone(), pipe.clone(), source_query, fallback_fetcher.clone(), options.clone()).await {
            Ok(outcome) => return Ok(outcome.success),
            Err(e) => {
                tracing::warn!(pipe = %pipe.keys, error = %e, "in-place sync failed, falling back to materialized sync");
            }
        }
    }
    let outcome = sync(instance, pipe, fallback_fetcher, options, None, None).await?;
    Ok(outcome.success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Chunk, ChunkStream};
    use async_trait::async_trait;
    use futures::stream;
    use mrsm_core::dataframe::RecordBatch;
    use mrsm_core::dtype::Value;
    use mrsm_pipes::{ConnectorKey, PipeKeys};
    use mrsm_storage::MemoryInstance;

    struct EmptyFetcher;
    #[async_trait]
    impl Fetcher for EmptyFetcher {
        async fn fetch(&self, _pipe: &Pipe, _begin: Option<Value>, _end: Option<Value>) -> Result<ChunkStream> {
            Ok(Box::pin(stream::empty::<Result<Chunk>>()))
        }
    }

    #[test]
    fn wrap_source_query_includes_the_datetime_predicate_when_given() {
        let q = wrap_source_query("raw_metrics", Some("dt"), Some("'2022-01-01'"));
        assert!(q.contains("WHERE dt >= '2022-01-01'"));
    }

    #[test]
    fn wrap_source_query_falls_back_to_select_star() {
        let q = wrap_source_query("raw_metrics", None, None);
        assert_eq!(q, "SELECT * FROM raw_metrics");
    }

    #[tokio::test]
    async fn non_eligible_pipe_is_rejected() {
        let instance: Arc<dyn Instance> = Arc::new(MemoryInstance::new());
        let keys = PipeKeys::new(ConnectorKey::new("sql", "source"), "temp", None, ConnectorKey::new("sql", "main"));
        let pipe = Pipe::new(keys);
        let err = sync_inplace(instance, pipe, "SELECT 1", Arc::new(EmptyFetcher), SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MrsmError::Configuration(_)));
    }

    #[tokio::test]
    async fn eligible_pipe_without_backend_support_falls_back() {
        let instance: Arc<dyn Instance> = Arc::new(MemoryInstance::new());
        let same = ConnectorKey::new("sql", "main");
        let keys = PipeKeys::new(same.clone(), "temp", None, same);
        let pipe = Pipe::new(keys);
        instance.register_pipe(&pipe).await.unwrap();
        let outcome = sync_inplace(instance, pipe, "SELECT * FROM temp", Arc::new(EmptyFetcher), SyncOptions::default())
            .await
            .unwrap();
        assert!(outcome.success.is_ok());
    }
}
