//! Free-form pipe parameters and the local TTL cache layered on top of
//! the registry copy (spec §3 invariant 5).

use crate::pipe::PipeKeys;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default distinct-value cap per index column in the filter-existing
/// params filter (spec §4.3 step 3, DESIGN.md Open Question decision).
pub const DEFAULT_DISTINCT_VALUE_CAP: usize = 250;

/// Default local parameters-cache TTL (spec §3 invariant 5).
pub const DEFAULT_PARAMS_TTL: Duration = Duration::from_secs(60);

/// Default temp-table reaper TTL for the internal namespace (spec §3
/// "Lifecycle").
pub const DEFAULT_TEMP_TABLE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Free-form metadata attached to a pipe (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeParameters {
    pub upsert: bool,
    pub autoincrement: bool,
    /// `static` in spec prose; renamed to avoid the Rust keyword.
    #[serde(rename = "static")]
    pub static_schema: bool,
    pub enforce: bool,
    pub null_indices: bool,
    pub verify_chunk_minutes: i64,
    pub fetch_backtrack_minutes: i64,
    pub tags: BTreeSet<String>,
    pub children: Vec<PipeKeys>,
    pub parents: Vec<PipeKeys>,
    pub schema: Option<String>,
    /// Index-name format string (spec §3, §6: default `IX_{target}_{column_names}`).
    pub index_template: String,
    /// Distinct-value cap for the filter-existing params filter.
    pub distinct_value_cap: usize,
    /// Arbitrary caller-supplied metadata not modeled above.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for PipeParameters {
    fn default() -> Self {
        Self {
            upsert: false,
            autoincrement: false,
            static_schema: false,
            // Default true per spec §3.
            enforce: true,
            null_indices: false,
            verify_chunk_minutes: 1440,
            fetch_backtrack_minutes: 1440,
            tags: BTreeSet::new(),
            children: Vec::new(),
            parents: Vec::new(),
            schema: None,
            index_template: "IX_{target}_{column_names}".to_string(),
            distinct_value_cap: DEFAULT_DISTINCT_VALUE_CAP,
            extra: serde_json::Map::new(),
        }
    }
}

impl PipeParameters {
    pub fn backtrack_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.fetch_backtrack_minutes)
    }

    pub fn verify_chunk_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.verify_chunk_minutes)
    }

    /// Render the unique-upsert index name (prefix `UQ_`, spec §6).
    pub fn unique_index_name(&self, target: &str, columns: &[String]) -> String {
        self.render_index_name("UQ", target, columns)
    }

    /// Render a regular index name from `index_template`.
    pub fn index_name(&self, target: &str, columns: &[String]) -> String {
        self.render_index_name("IX", target, columns)
    }

    fn render_index_name(&self, prefix: &str, target: &str, columns: &[String]) -> String {
        self.index_template
            .replace("{target}", target)
            .replace("{column_names}", &columns.join("_"))
            .replacen("IX", prefix, 1)
    }
}

/// Patches `patch` on top of `base`, field by field — the "local
/// in-memory parameters are patched on top of the registry copy" rule
/// (spec §3 invariant 5). Collections replace wholesale; scalars that
/// equal the `Default` sentinel are treated as "not set" and inherited
/// from `base`. `extra` deep-merges via `mrsm_core::config::merge_patch`.
pub fn patch_parameters(base: &PipeParameters, patch: &serde_json::Value) -> PipeParameters {
    let mut doc = serde_json::to_value(base).unwrap_or(serde_json::Value::Null);
    mrsm_core::config::merge_patch(&mut doc, patch);
    serde_json::from_value(doc).unwrap_or_else(|_| base.clone())
}

struct CacheEntry {
    parameters: PipeParameters,
    fetched_at: Instant,
}

/// Local TTL cache over a pipe's registry parameters (spec §3 invariant
/// 5). Refreshed on a TTL (default 60s); explicit `edit`/`update` writes
/// through and invalidates immediately.
pub struct ParamsCache {
    ttl: Duration,
    entries: Mutex<BTreeMap<PipeKeys, CacheEntry>>,
}

impl ParamsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Get cached parameters if still within TTL, without consulting the
    /// registry. The caller is expected to call [`Self::refresh`] (or
    /// re-fetch from the registry) on a miss.
    pub fn get(&self, keys: &PipeKeys) -> Option<PipeParameters> {
        let entries = self.entries.lock().unwrap();
        entries.get(keys).and_then(|entry| {
            if entry.fetched_at.elapsed() < self.ttl {
                Some(entry.parameters.clone())
            } else {
                None
            }
        })
    }

    /// Populate (or replace) the cache from a freshly fetched registry
    /// copy, resetting the TTL clock.
    pub fn refresh(&self, keys: PipeKeys, parameters: PipeParameters) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            keys,
            CacheEntry {
                parameters,
                fetched_at: Instant::now(),
            },
        );
    }

    /// An explicit `edit`/`update` writes through immediately and resets
    /// the TTL clock — equivalent to `refresh`, named separately to make
    /// the call site's intent explicit (spec §3 invariant 5: "invalidates
    /// caches immediately").
    pub fn write_through(&self, keys: PipeKeys, parameters: PipeParameters) {
        self.refresh(keys, parameters);
    }

    pub fn invalidate(&self, keys: &PipeKeys) {
        self.entries.lock().unwrap().remove(keys);
    }
}

impl Default for ParamsCache {
    fn default() -> Self {
        Self::new(DEFAULT_PARAMS_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::ConnectorKey;

    fn keys() -> PipeKeys {
        PipeKeys::new(ConnectorKey::new("sql", "a"), "m", None, ConnectorKey::new("sql", "a"))
    }

    #[test]
    fn default_enforce_is_true() {
        assert!(PipeParameters::default().enforce);
    }

    #[test]
    fn cache_miss_before_any_refresh() {
        let cache = ParamsCache::new(Duration::from_secs(60));
        assert!(cache.get(&keys()).is_none());
    }

    #[test]
    fn cache_hit_after_refresh() {
        let cache = ParamsCache::new(Duration::from_secs(60));
        cache.refresh(keys(), PipeParameters::default());
        assert!(cache.get(&keys()).is_some());
    }

    #[test]
    fn cache_expires_after_ttl() {
        let cache = ParamsCache::new(Duration::from_millis(1));
        cache.refresh(keys(), PipeParameters::default());
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get(&keys()).is_none());
    }

    #[test]
    fn invalidate_clears_entry_immediately() {
        let cache = ParamsCache::new(Duration::from_secs(60));
        cache.refresh(keys(), PipeParameters::default());
        cache.invalidate(&keys());
        assert!(cache.get(&keys()).is_none());
    }

    #[test]
    fn patch_overrides_scalar_fields() {
        let base = PipeParameters::default();
        let patched = patch_parameters(&base, &serde_json::json!({"upsert": true}));
        assert!(patched.upsert);
        assert!(!base.upsert);
    }

    #[test]
    fn index_name_renders_template() {
        let params = PipeParameters::default();
        let name = params.index_name("metrics", &["dt".to_string(), "id".to_string()]);
        assert_eq!(name, "IX_metrics_dt_id");
        let unique = params.unique_index_name("metrics", &["dt".to_string()]);
        assert_eq!(unique, "UQ_metrics_dt");
    }
}
