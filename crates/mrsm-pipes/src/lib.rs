//! The Pipe data model (spec §3): identity, attributes, the parameters
//! TTL cache, and the filter-existing algorithm (spec §4.3) that divides
//! an incoming batch into unseen/update/delta rows.

pub mod filter;
pub mod params;
pub mod pipe;

pub use filter::{filter_existing, FilterResult};
pub use params::{ParamsCache, PipeParameters};
pub use pipe::{ConnectorKey, Pipe, PipeKeys};
