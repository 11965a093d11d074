//! The deduplicate traversal (spec §4.6): walk a pipe's datetime axis in
//! fixed-size chunks and deduplicate each one via
//! [`mrsm_storage::Instance::deduplicate_pipe`] — chunked so a pipe with
//! a huge local history never materializes the whole thing in memory at
//! once.
//!
//! Grounded on `aivcs-ci/src/runner.rs`'s bounded sequential stage loop,
//! the same shape [`crate::verify`] reuses.

use std::sync::Arc;

use mrsm_core::error::Result;
use mrsm_core::success::SuccessTuple;
use mrsm_pipes::Pipe;
use mrsm_storage::{Instance, Window};

use crate::chunks::chunk_bounds;

#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub success: SuccessTuple,
    pub chunks_processed: usize,
}

/// Deduplicate `pipe`'s entire local history in `chunk_interval`-wide
/// slices, or just `window` when given (spec §4.6). Each chunk's
/// duplicates are resolved last-write-wins, matching
/// `Instance::deduplicate_pipe`'s default implementation.
pub async fn deduplicate(instance: Arc<dyn Instance>, pipe: Pipe, window: Option<Window>, chunk_interval: chrono::Duration) -> Result<DedupOutcome> {
    let window = match window {
        Some(w) => w,
        None => full_window(instance.as_ref(), &pipe).await?,
    };

    let (Some(oldest), Some(newest)) = (window.begin.clone(), window.end.clone()) else {
        return Ok(DedupOutcome {
            success: SuccessTuple::ok(format!("pipe '{}' has no local data to deduplicate", pipe.keys)),
            chunks_processed: 0,
        });
    };

    let bounds = chunk_bounds(&oldest, &newest, chunk_interval);
    let mut chunks_processed = 0;
    let mut removed_total = 0usize;
    let mut messages = Vec::new();

    for (begin, end) in bounds {
        let chunk_window = Window::new(Some(begin), Some(end));
        let result = instance.deduplicate_pipe(&pipe, &chunk_window).await?;
        chunks_processed += 1;
        if let Some(count) = parse_removed_count(&result.message) {
            removed_total += count;
        } else if !result.is_ok() {
            messages.push(result.message);
        }
    }

    let success = if messages.is_empty() {
        SuccessTuple::ok(format!(
            "pipe '{}' deduplicated: {} chunk(s), {} duplicate(s) removed",
            pipe.keys, chunks_processed, removed_total
        ))
    } else {
        SuccessTuple::fail(format!("{} chunk(s) failed to deduplicate: {}", messages.len(), messages.join("; ")))
    };

    Ok(DedupOutcome { success, chunks_processed })
}

async fn full_window(instance: &dyn Instance, pipe: &Pipe) -> Result<Window> {
    use std::collections::BTreeMap;
    let oldest = instance.get_sync_time(pipe, &BTreeMap::new(), false, false).await?;
    let newest = instance.get_sync_time(pipe, &BTreeMap::new(), true, false).await?;
    Ok(Window::new(oldest, newest))
}

fn parse_removed_count(message: &str) -> Option<usize> {
    let prefix = "removed ";
    let rest = message.strip_prefix(prefix)?;
    let count_str = rest.split_whitespace().next()?;
    count_str.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrsm_core::dataframe::RecordBatch;
    use mrsm_core::dtype::Dtype;
    use mrsm_pipes::{ConnectorKey, PipeKeys};
    use mrsm_storage::MemoryInstance;

    fn sample_pipe() -> Pipe {
        let keys = PipeKeys::new(ConnectorKey::new("sql", "source"), "temp", None, ConnectorKey::new("sql", "main"));
        let mut p = Pipe::new(keys);
        p.columns.insert("datetime".into(), "dt".into());
        p.columns.insert("id".into(), "id".into());
        p.dtypes.insert("dt".into(), Dtype::DateTimeUtc);
        p.dtypes.insert("id".into(), Dtype::Int);
        p
    }

    #[tokio::test]
    async fn deduplicate_empty_pipe_reports_nothing_to_do() {
        let instance: Arc<dyn Instance> = Arc::new(MemoryInstance::new());
        let pipe = sample_pipe();
        instance.register_pipe(&pipe).await.unwrap();
        let outcome = deduplicate(instance, pipe, None, chrono::Duration::days(1)).await.unwrap();
        assert_eq!(outcome.chunks_processed, 0);
        assert!(outcome.success.is_ok());
    }

    #[tokio::test]
    async fn deduplicate_removes_duplicate_index_tuples() {
        let instance: Arc<dyn Instance> = Arc::new(MemoryInstance::new());
        let pipe = sample_pipe();
        instance.register_pipe(&pipe).await.unwrap();

        let batch = RecordBatch::from_json_rows(&[
            serde_json::json!({"dt": "2022-06-26T00:00:00Z", "id": 1, "v": 1}),
            serde_json::json!({"dt": "2022-06-26T00:00:00Z", "id": 1, "v": 2}),
        ])
        .unwrap();
        instance.sync_pipe(&pipe, &batch, &RecordBatch::default()).await.unwrap();

        let outcome = deduplicate(instance.clone(), pipe.clone(), None, chrono::Duration::days(1)).await.unwrap();
        assert!(outcome.success.is_ok());

        let count = instance.get_rowcount(&pipe, &Window::default(), false).await.unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn parse_removed_count_extracts_the_number() {
        assert_eq!(parse_removed_count("removed 3 duplicate row(s)"), Some(3));
        assert_eq!(parse_removed_count("no duplicates found"), None);
    }
}
