//! The sync pipeline (spec §4.4), in-place fast path (spec §4.5), and
//! the verify/deduplicate batch traversals (spec §4.6).
//!
//! Grounded on `aivcs-ci/src/pipeline.rs`'s orchestrator-driving-a-run
//! shape and `aivcs-ci/src/runner.rs`'s bounded-concurrent-execution +
//! timeout wrapper, generalized from "one CI stage" to "one sync chunk".

pub mod chunks;
pub mod dedup;
pub mod inplace;
pub mod pipeline;
pub mod verify;

pub use chunks::chunk_bounds;
pub use dedup::deduplicate;
pub use inplace::{sync_inplace, wrap_source_query};
pub use pipeline::{sync, Chunk, ChunkStream, Fetcher, HookContext, SyncHook, SyncOptions, SyncOutcome};
pub use verify::{verify, VerifyOptions, VerifyOutcome};
