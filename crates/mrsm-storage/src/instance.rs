//! The `Instance` backend contract (spec §4.2): the interface exposed by
//! any storage a pipe can be bound to. Grounded on the teacher's
//! `CasStore`/`RunLedger`/`ReleaseRegistry` trait shape
//! (`oxidized-state/src/storage_traits.rs`) — required methods plus
//! default (generic) implementations for the operations marked
//! *optional* in the spec table, which degrade to the required
//! primitives when a backend doesn't supply a fast path.

use async_trait::async_trait;
use mrsm_core::dataframe::RecordBatch;
use mrsm_core::dtype::Dtype;
use mrsm_core::error::{MrsmError, Result};
use mrsm_core::success::SuccessTuple;
use mrsm_pipes::{Pipe, PipeKeys};
use std::collections::BTreeMap;

use crate::types::{GetDataOptions, PipesFilter, Window};

/// Capability flags a connector/instance reports about itself (spec §9
/// "Plugin dispatch": `supports_in_place`, `is_thread_safe`, `is_instance`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub supports_in_place: bool,
    pub is_thread_safe: bool,
    pub is_instance: bool,
    /// How many concurrent operations this backend's connection pool can
    /// sustain (spec §4.4 `effective_workers` computation).
    pub thread_safety_factor: usize,
}

/// Storage backend capable of persisting pipes and their rows (spec
/// §4.2, GLOSSARY).
///
/// Methods fall into two groups:
/// - **Required**: every instance must implement these.
/// - **Optional** (documented per-method below): ship a generic
///   implementation here built on the required primitives; a backend
///   overrides one only to provide a faster native path.
#[async_trait]
pub trait Instance: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    // -- registry ----------------------------------------------------

    async fn register_pipe(&self, pipe: &Pipe) -> Result<SuccessTuple>;
    async fn edit_pipe(&self, pipe: &Pipe) -> Result<SuccessTuple>;
    async fn delete_pipe(&self, keys: &PipeKeys) -> Result<SuccessTuple>;
    async fn fetch_pipes_keys(&self, filter: &PipesFilter) -> Result<Vec<PipeKeys>>;
    async fn get_pipe_attributes(&self, keys: &PipeKeys) -> Result<Option<Pipe>>;

    /// Cheap reachability check. Spec says "cached 5s" — the 5s TTL is
    /// the caller's (`mrsm-sync`'s) responsibility; this method itself
    /// always performs the live check.
    async fn pipe_exists(&self, pipe: &Pipe) -> Result<bool>;

    // -- schema --------------------------------------------------------

    async fn get_columns_types(&self, pipe: &Pipe) -> Result<BTreeMap<String, Dtype>>;
    async fn create_indices(&self, pipe: &Pipe) -> Result<SuccessTuple>;
    async fn drop_indices(&self, pipe: &Pipe) -> Result<SuccessTuple>;
    async fn drop_pipe(&self, pipe: &Pipe) -> Result<SuccessTuple>;
    async fn add_column(&self, pipe: &Pipe, column: &str, dtype: &Dtype) -> Result<SuccessTuple>;
    async fn alter_column_type(&self, pipe: &Pipe, column: &str, dtype: &Dtype) -> Result<SuccessTuple>;

    // -- reads -----------------------------------------------------------

    /// `newest=true` returns the max, `false` the min, of the datetime
    /// axis. `remote=true` means query the source definition rather than
    /// the stored target (spec §4.2) — for most instances this is
    /// identical to `remote=false`; connectors that wrap another system
    /// override the behavior.
    async fn get_sync_time(
        &self,
        pipe: &Pipe,
        params: &BTreeMap<String, Vec<mrsm_core::dtype::Value>>,
        newest: bool,
        remote: bool,
    ) -> Result<Option<mrsm_core::dtype::Value>>;

    async fn get_rowcount(&self, pipe: &Pipe, window: &Window, remote: bool) -> Result<i64>;

    async fn get_data(&self, pipe: &Pipe, options: &GetDataOptions) -> Result<RecordBatch>;

    // -- writes ----------------------------------------------------------

    /// Apply `unseen` (insert) and `update` (update) rows. When
    /// `pipe.parameters.upsert` is set, callers pass the full delta as
    /// `unseen` and an empty `update` batch, and the implementation
    /// issues a single upsert statement per chunk (spec §4.4 step 5).
    async fn sync_pipe(&self, pipe: &Pipe, unseen: &RecordBatch, update: &RecordBatch) -> Result<SuccessTuple>;

    async fn clear_pipe(&self, pipe: &Pipe, window: &Window) -> Result<SuccessTuple>;

    /// *Optional*: source==target fast path executed entirely in the
    /// backend (spec §4.5). `None` means "not supported, caller should
    /// fall back to materializing rows via `get_data`/`sync_pipe`."
    async fn sync_pipe_inplace(&self, _pipe: &Pipe, _source_query: &str) -> Result<Option<SuccessTuple>> {
        Ok(None)
    }

    /// *Optional*: dedup by full-index equality within the window (spec
    /// §4.2). Default implementation reads the window, computes
    /// duplicates in memory via [`RecordBatch::dedup_by_index`], clears
    /// the window, and re-syncs the deduplicated representatives
    /// (last-write-wins) — the generic path spec §4.6 describes.
    async fn deduplicate_pipe(&self, pipe: &Pipe, window: &Window) -> Result<SuccessTuple> {
        let index_columns = pipe.index_columns();
        if index_columns.is_empty() {
            return Ok(SuccessTuple::ok("no index columns; nothing to deduplicate"));
        }
        let options = GetDataOptions::with_window(window.clone());
        let existing = self.get_data(pipe, &options).await?;
        let before = existing.len();
        let deduped = existing.dedup_by_index(&index_columns);
        if deduped.len() == before {
            return Ok(SuccessTuple::ok("no duplicates found"));
        }
        self.clear_pipe(pipe, window).await?;
        self.sync_pipe(pipe, &deduped, &RecordBatch::default()).await?;
        Ok(SuccessTuple::ok(format!(
            "removed {} duplicate row(s)",
            before - deduped.len()
        )))
    }
}

/// Looks up a physical column's dtype, erroring with `SchemaConflict`
/// when a `static` pipe is asked to add a column outside its declared
/// set (spec §3 invariant 2). Shared by every `Instance` impl's
/// `add_column`/`alter_column_type` callers in `mrsm-sync`.
pub fn check_static_schema(pipe: &Pipe, column: &str) -> Result<()> {
    if pipe.parameters.static_schema {
        return Err(MrsmError::SchemaConflict {
            column: column.to_string(),
            reason: "pipe is static; schema changes are not permitted".to_string(),
        });
    }
    Ok(())
}
