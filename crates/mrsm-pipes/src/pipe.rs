//! Pipe identity and attributes (spec §3).

use crate::params::PipeParameters;
use mrsm_core::error::MrsmError;
use mrsm_core::Dtype;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// `type:label` reference to a connector or instance, e.g. `sql:main`,
/// `api:prod`. The label defaults to `main` when omitted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectorKey {
    pub connector_type: String,
    pub label: String,
}

impl ConnectorKey {
    pub fn new(connector_type: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            label: label.into(),
        }
    }

    /// Parse `"type:label"` or bare `"type"` (label defaults to `main`).
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((ty, label)) => Self::new(ty, label),
            None => Self::new(s, "main"),
        }
    }
}

impl fmt::Display for ConnectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connector_type, self.label)
    }
}

/// The identity triple `(connector, metric, location)` bound to an
/// instance (spec §3 invariant 1). Combined with `instance_keys`, this
/// uniquely addresses a pipe in the registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PipeKeys {
    pub connector: ConnectorKey,
    pub metric: String,
    pub location: Option<String>,
    pub instance: ConnectorKey,
}

impl PipeKeys {
    pub fn new(
        connector: ConnectorKey,
        metric: impl Into<String>,
        location: Option<String>,
        instance: ConnectorKey,
    ) -> Self {
        Self {
            connector,
            metric: metric.into(),
            location,
            instance,
        }
    }

    /// Default target table name derived from the keys (spec §3:
    /// `target`'s "default derived from keys").
    pub fn target_table_name(&self) -> String {
        match &self.location {
            Some(loc) => format!("{}_{}_{}", self.connector.label, self.metric, loc),
            None => format!("{}_{}", self.connector.label, self.metric),
        }
    }

    /// Whether this pipe's connector and instance are the same connector
    /// reference — the pre-condition for the in-place sync fast path
    /// (spec §4.4 step 1, §4.5).
    pub fn is_inplace_eligible(&self) -> bool {
        self.connector == self.instance
    }
}

impl fmt::Display for PipeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{}/{}/{}", self.connector, self.metric, loc),
            None => write!(f, "{}/{}", self.connector, self.metric),
        }
    }
}

/// Recognized semantic index roles (spec §3). `Other` carries
/// user-defined roles like `id` or `station`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexRole {
    Datetime,
    Primary,
    Other(String),
}

impl fmt::Display for IndexRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexRole::Datetime => write!(f, "datetime"),
            IndexRole::Primary => write!(f, "primary"),
            IndexRole::Other(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for IndexRole {
    fn from(s: &str) -> Self {
        match s {
            "datetime" => IndexRole::Datetime,
            "primary" => IndexRole::Primary,
            other => IndexRole::Other(other.to_string()),
        }
    }
}

/// The reserved composite-index name covering the full index set, used
/// for upserts (spec §3: "one reserved composite named `unique`").
pub const UNIQUE_INDEX_NAME: &str = "unique";

/// A pipe: identity, columns (role -> physical name), named composite
/// indices, dtypes, target table, and free-form parameters (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipe {
    pub keys: PipeKeys,
    /// Semantic index role -> physical column name. Every value here is
    /// an index column.
    pub columns: BTreeMap<String, String>,
    /// Named composite indices (name -> ordered columns). Synthesized
    /// from `columns` on first access if empty.
    pub indices: BTreeMap<String, Vec<String>>,
    pub dtypes: BTreeMap<String, Dtype>,
    pub target: Option<String>,
    pub parameters: PipeParameters,
}

impl Pipe {
    pub fn new(keys: PipeKeys) -> Self {
        Self {
            keys,
            columns: BTreeMap::new(),
            indices: BTreeMap::new(),
            dtypes: BTreeMap::new(),
            target: None,
            parameters: PipeParameters::default(),
        }
    }

    /// The physical target table name, honoring an explicit override or
    /// falling back to the keys-derived default (spec §3: "honored for
    /// both reads and writes").
    pub fn target_table(&self) -> String {
        self.target.clone().unwrap_or_else(|| self.keys.target_table_name())
    }

    pub fn datetime_column(&self) -> Option<&str> {
        self.columns.get("datetime").map(String::as_str)
    }

    pub fn primary_column(&self) -> Option<&str> {
        self.columns.get("primary").map(String::as_str)
    }

    /// All physical column names that `columns` designates as index
    /// columns, deduplicated, in a stable order (role-key order).
    pub fn index_columns(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        for col in self.columns.values() {
            if seen.insert(col.clone()) {
                out.push(col.clone());
            }
        }
        out
    }

    /// Named composite indices, synthesizing one-index-per-role from
    /// `columns` when `indices` is empty, plus the reserved `unique`
    /// composite (full index set) when `upsert = true` (spec §3).
    pub fn resolved_indices(&self) -> BTreeMap<String, Vec<String>> {
        let mut out = if self.indices.is_empty() {
            self.columns
                .iter()
                .map(|(role, col)| (role.clone(), vec![col.clone()]))
                .collect()
        } else {
            self.indices.clone()
        };
        if self.parameters.upsert {
            out.entry(UNIQUE_INDEX_NAME.to_string())
                .or_insert_with(|| self.index_columns());
        }
        out
    }

    /// Dtypes of just the index columns, for the null-coalescence and
    /// filter-existing steps (spec §4.3).
    pub fn index_dtypes(&self) -> BTreeMap<String, Dtype> {
        self.index_columns()
            .into_iter()
            .filter_map(|col| self.dtypes.get(&col).cloned().map(|d| (col, d)))
            .collect()
    }

    /// Spec §3 invariant 3: if `datetime` is set, its dtype must be
    /// monotonic-capable (a timestamp, or `int` when pinned).
    pub fn check_datetime_monotonic(&self) -> Result<(), MrsmError> {
        let Some(dt_col) = self.datetime_column() else {
            return Ok(());
        };
        match self.dtypes.get(dt_col) {
            Some(dtype) if dtype.is_monotonic_capable() => Ok(()),
            Some(dtype) => Err(MrsmError::SchemaConflict {
                column: dt_col.to_string(),
                reason: format!("datetime column dtype {dtype} is not monotonic-capable"),
            }),
            // No declared dtype yet defaults to the aware-UTC default
            // (spec §3: "default for `datetime` role"), which is
            // monotonic-capable.
            None => Ok(()),
        }
    }

    /// Spec §3 invariant 2: a `static` pipe must reject any column not
    /// already present in `existing_columns` or declared in `dtypes`/
    /// `indices`. Returns the offending column names.
    pub fn reject_new_columns(&self, existing_columns: &std::collections::BTreeSet<String>) -> Vec<String> {
        if !self.parameters.static_schema {
            return Vec::new();
        }
        self.dtypes
            .keys()
            .filter(|c| !existing_columns.contains(*c))
            .cloned()
            .collect()
    }

    /// Spec §3 invariant 4: when `autoincrement = true`, a missing
    /// primary-key value is eligible for issuance; an existing one must
    /// never be overwritten. Returns whether `row` needs an issued value.
    pub fn needs_autoincrement_value(&self, row: &mrsm_core::dataframe::Row) -> bool {
        if !self.parameters.autoincrement {
            return false;
        }
        let Some(pk) = self.primary_column() else {
            return false;
        };
        !row.contains_key(pk) || row.get(pk).map(|v| v.is_null()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> PipeKeys {
        PipeKeys::new(
            ConnectorKey::new("sql", "source"),
            "temperature",
            Some("nyc".into()),
            ConnectorKey::new("sql", "main"),
        )
    }

    #[test]
    fn target_table_defaults_from_keys() {
        let p = Pipe::new(keys());
        assert_eq!(p.target_table(), "source_temperature_nyc");
    }

    #[test]
    fn target_table_honors_explicit_override() {
        let mut p = Pipe::new(keys());
        p.target = Some("custom_table".into());
        assert_eq!(p.target_table(), "custom_table");
    }

    #[test]
    fn resolved_indices_synthesizes_from_columns_when_empty() {
        let mut p = Pipe::new(keys());
        p.columns.insert("datetime".into(), "dt".into());
        p.columns.insert("id".into(), "station_id".into());
        let idx = p.resolved_indices();
        assert_eq!(idx.get("datetime"), Some(&vec!["dt".to_string()]));
        assert_eq!(idx.get("id"), Some(&vec!["station_id".to_string()]));
    }

    #[test]
    fn resolved_indices_adds_unique_composite_when_upsert() {
        let mut p = Pipe::new(keys());
        p.columns.insert("datetime".into(), "dt".into());
        p.columns.insert("id".into(), "id".into());
        p.parameters.upsert = true;
        let idx = p.resolved_indices();
        let unique = idx.get(UNIQUE_INDEX_NAME).unwrap();
        assert!(unique.contains(&"dt".to_string()));
        assert!(unique.contains(&"id".to_string()));
    }

    #[test]
    fn datetime_monotonic_check_rejects_str() {
        let mut p = Pipe::new(keys());
        p.columns.insert("datetime".into(), "dt".into());
        p.dtypes.insert("dt".into(), Dtype::Str);
        assert!(p.check_datetime_monotonic().is_err());
    }

    #[test]
    fn datetime_monotonic_check_accepts_int() {
        let mut p = Pipe::new(keys());
        p.columns.insert("datetime".into(), "dt".into());
        p.dtypes.insert("dt".into(), Dtype::Int);
        assert!(p.check_datetime_monotonic().is_ok());
    }

    #[test]
    fn static_pipe_rejects_new_columns() {
        let mut p = Pipe::new(keys());
        p.parameters.static_schema = true;
        p.dtypes.insert("new_col".into(), Dtype::Int);
        let existing = std::collections::BTreeSet::new();
        let rejected = p.reject_new_columns(&existing);
        assert_eq!(rejected, vec!["new_col".to_string()]);
    }

    #[test]
    fn non_static_pipe_never_rejects() {
        let mut p = Pipe::new(keys());
        p.dtypes.insert("new_col".into(), Dtype::Int);
        let existing = std::collections::BTreeSet::new();
        assert!(p.reject_new_columns(&existing).is_empty());
    }

    #[test]
    fn autoincrement_only_applies_when_primary_missing() {
        let mut p = Pipe::new(keys());
        p.columns.insert("primary".into(), "id".into());
        p.parameters.autoincrement = true;
        let mut row = mrsm_core::dataframe::Row::new();
        assert!(p.needs_autoincrement_value(&row));
        row.insert("id".into(), mrsm_core::Value::Int(5));
        assert!(!p.needs_autoincrement_value(&row));
    }

    #[test]
    fn inplace_eligible_when_connector_equals_instance() {
        let same = ConnectorKey::new("sql", "main");
        let k = PipeKeys::new(same.clone(), "m", None, same);
        assert!(k.is_inplace_eligible());
        assert!(!keys().is_inplace_eligible());
    }

    #[test]
    fn connector_key_parse_defaults_label_to_main() {
        assert_eq!(ConnectorKey::parse("sql"), ConnectorKey::new("sql", "main"));
        assert_eq!(ConnectorKey::parse("sql:prod"), ConnectorKey::new("sql", "prod"));
    }
}
