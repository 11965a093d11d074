//! The `Instance` backend contract and its implementations: an
//! in-memory fake for tests and small deployments, and a SQL-backed
//! instance driving any dialect in `mrsm-sql` through `sqlx` (spec
//! §4.2, §4.5, §6).

pub mod instance;
pub mod memory;
pub mod registry;
pub mod sql;
pub mod types;

pub use instance::{check_static_schema, Capabilities, Instance};
pub use memory::MemoryInstance;
pub use registry::{RegistrySchema, TemporaryTableEntry};
pub use sql::SqlInstance;
pub use types::{GetDataOptions, PipesFilter, Window};
