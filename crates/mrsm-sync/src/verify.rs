//! The verify traversal (spec §4.6): walk a pipe's datetime axis in
//! fixed-size chunks, comparing local and remote rowcounts, and resync
//! any chunk whose counts disagree. Resumable — callers may re-enter
//! with a `resume_from` cursor after a crash or cancellation.
//!
//! Grounded on `aivcs-ci/src/runner.rs`'s bounded sequential stage loop,
//! generalized from "run each CI stage in order" to "check each
//! datetime chunk in order".

use std::sync::Arc;

use mrsm_core::dtype::Value;
use mrsm_core::error::{MrsmError, Result};
use mrsm_core::success::SuccessTuple;
use mrsm_pipes::Pipe;
use mrsm_storage::{Instance, Window};

use crate::chunks::chunk_bounds;
use crate::pipeline::{sync, Fetcher, SyncOptions};

/// Options controlling [`verify`] (spec §4.6).
#[derive(Clone)]
pub struct VerifyOptions {
    pub chunk_interval: chrono::Duration,
    /// Skip a chunk whose local rowcount is already >= the remote's,
    /// trusting that extra local rows are legitimate (e.g. late-arriving
    /// writes from a concurrent sync) rather than resyncing it anyway.
    pub skip_chunks_with_greater_rowcounts: bool,
    /// Only compare rowcounts; never resync a mismatched chunk. Useful
    /// for a read-only audit pass.
    pub check_rowcounts_only: bool,
    /// Resume the traversal from this cursor instead of the pipe's
    /// oldest value (spec §4.6 "resumable").
    pub resume_from: Option<Value>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            chunk_interval: chrono::Duration::days(1),
            skip_chunks_with_greater_rowcounts: false,
            check_rowcounts_only: false,
            resume_from: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub success: SuccessTuple,
    pub chunks_checked: usize,
    pub chunks_resynced: usize,
    /// The last chunk's `end` bound successfully processed — pass back
    /// as `VerifyOptions::resume_from` to continue after an interruption.
    pub last_checked: Option<Value>,
}

/// Compare local vs. remote rowcounts chunk by chunk and resync any
/// chunk that disagrees, by refetching just that chunk's window through
/// `fetcher` (spec §4.6).
pub async fn verify(
    instance: Arc<dyn Instance>,
    pipe: Pipe,
    fetcher: Arc<dyn Fetcher>,
    options: VerifyOptions,
) -> Result<VerifyOutcome> {
    let Some(datetime_col) = pipe.datetime_column() else {
        return Err(MrsmError::Configuration(format!(
            "pipe '{}' has no datetime column; verify requires one to chunk over",
            pipe.keys
        )));
    };
    let _ = datetime_col;

    let oldest = match &options.resume_from {
        Some(v) => v.clone(),
        None => match instance.get_sync_time(&pipe, &Default::default(), false, false).await? {
            Some(v) => v,
            None => {
                return Ok(VerifyOutcome {
                    success: SuccessTuple::ok(format!("pipe '{}' has no local data to verify", pipe.keys)),
                    chunks_checked: 0,
                    chunks_resynced: 0,
                    last_checked: None,
                })
            }
        },
    };
    let Some(newest) = instance.get_sync_time(&pipe, &Default::default(), true, true).await? else {
        return Ok(VerifyOutcome {
            success: SuccessTuple::ok(format!("pipe '{}' has no remote data to verify against", pipe.keys)),
            chunks_checked: 0,
            chunks_resynced: 0,
            last_checked: None,
        });
    };

    let bounds = chunk_bounds(&oldest, &newest, options.chunk_interval);
    let mut chunks_checked = 0;
    let mut chunks_resynced = 0;
    let mut last_checked = None;
    let mut mismatches = Vec::new();

    for (begin, end) in bounds {
        let window = Window::new(Some(begin.clone()), Some(end.clone()));
        let local = instance.get_rowcount(&pipe, &window, false).await?;
        let remote = instance.get_rowcount(&pipe, &window, true).await?;
        chunks_checked += 1;
        last_checked = Some(end.clone());

        let disagrees = local != remote && !(options.skip_chunks_with_greater_rowcounts && local >= remote);
        if !disagrees {
            continue;
        }
        mismatches.push((begin.clone(), end.clone(), local, remote));
        if options.check_rowcounts_only {
            continue;
        }

        let chunk_options = SyncOptions {
            begin: Some(begin),
            end: Some(end),
            ..SyncOptions::default()
        };
        sync(instance.clone(), pipe.clone(), fetcher.clone(), chunk_options, None, None).await?;
        chunks_resynced += 1;
    }

    let success = if mismatches.is_empty() {
        SuccessTuple::ok(format!("pipe '{}' verified: {} chunk(s), no discrepancies", pipe.keys, chunks_checked))
    } else if options.check_rowcounts_only {
        SuccessTuple::fail(format!(
            "pipe '{}': {} of {} chunk(s) disagree (local != remote rowcount)",
            pipe.keys,
            mismatches.len(),
            chunks_checked
        ))
    } else {
        SuccessTuple::ok(format!(
            "pipe '{}' verified: {} chunk(s), {} resynced",
            pipe.keys, chunks_checked, chunks_resynced
        ))
    };

    Ok(VerifyOutcome {
        success,
        chunks_checked,
        chunks_resynced,
        last_checked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Chunk, ChunkStream};
    use async_trait::async_trait;
    use futures::stream;
    use mrsm_core::dataframe::RecordBatch;
    use mrsm_core::dtype::Dtype;
    use mrsm_pipes::{ConnectorKey, PipeKeys};
    use mrsm_storage::MemoryInstance;

    fn sample_pipe() -> Pipe {
        let keys = PipeKeys::new(ConnectorKey::new("sql", "source"), "temp", None, ConnectorKey::new("sql", "main"));
        let mut p = Pipe::new(keys);
        p.columns.insert("datetime".into(), "dt".into());
        p.dtypes.insert("dt".into(), Dtype::DateTimeUtc);
        p
    }

    struct NoopFetcher;
    #[async_trait]
    impl Fetcher for NoopFetcher {
        async fn fetch(&self, _pipe: &Pipe, _begin: Option<Value>, _end: Option<Value>) -> Result<ChunkStream> {
            Ok(Box::pin(stream::empty::<Result<Chunk>>()))
        }
    }

    #[tokio::test]
    async fn verify_on_empty_pipe_reports_nothing_to_check() {
        let instance: Arc<dyn Instance> = Arc::new(MemoryInstance::new());
        let pipe = sample_pipe();
        instance.register_pipe(&pipe).await.unwrap();
        let outcome = verify(instance, pipe, Arc::new(NoopFetcher), VerifyOptions::default()).await.unwrap();
        assert_eq!(outcome.chunks_checked, 0);
        assert!(outcome.success.is_ok());
    }

    #[tokio::test]
    async fn verify_without_a_datetime_column_is_rejected() {
        let instance: Arc<dyn Instance> = Arc::new(MemoryInstance::new());
        let keys = PipeKeys::new(ConnectorKey::new("sql", "source"), "temp", None, ConnectorKey::new("sql", "main"));
        let pipe = Pipe::new(keys);
        instance.register_pipe(&pipe).await.unwrap();
        let err = verify(instance, pipe, Arc::new(NoopFetcher), VerifyOptions::default()).await.unwrap_err();
        assert!(matches!(err, MrsmError::Configuration(_)));
    }

    #[tokio::test]
    async fn verify_with_matching_local_and_remote_data_finds_no_discrepancies() {
        let instance: Arc<dyn Instance> = Arc::new(MemoryInstance::new());
        let pipe = sample_pipe();
        instance.register_pipe(&pipe).await.unwrap();
        let batch = RecordBatch::from_json_rows(&[serde_json::json!({"dt": "2022-06-26T00:00:00Z"})]).unwrap();
        instance.sync_pipe(&pipe, &batch, &RecordBatch::default()).await.unwrap();

        let outcome = verify(instance, pipe, Arc::new(NoopFetcher), VerifyOptions::default()).await.unwrap();
        assert!(outcome.success.is_ok());
        assert_eq!(outcome.chunks_resynced, 0);
    }
}
