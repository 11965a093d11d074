//! Shared request/response shapes for the [`crate::Instance`] contract
//! (spec §4.2).

use mrsm_core::dtype::Value;
use std::collections::BTreeMap;

/// A half-open `[begin, end)` window over a pipe's datetime axis.
#[derive(Debug, Clone, Default)]
pub struct Window {
    pub begin: Option<Value>,
    pub end: Option<Value>,
}

impl Window {
    pub fn new(begin: Option<Value>, end: Option<Value>) -> Self {
        Self { begin, end }
    }

    pub fn is_unbounded(&self) -> bool {
        self.begin.is_none() && self.end.is_none()
    }
}

/// Filter passed to `fetch_pipes_keys` (spec §4.2): keys, tags, and
/// params all narrow the match; an empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct PipesFilter {
    pub connector_patterns: Vec<String>,
    pub metric_patterns: Vec<String>,
    pub location_patterns: Vec<String>,
    pub tags: Vec<String>,
}

/// Options controlling a `get_data` read (spec §4.2).
#[derive(Debug, Clone, Default)]
pub struct GetDataOptions {
    pub select: Option<Vec<String>>,
    pub omit: Option<Vec<String>>,
    pub window: Window,
    pub params: BTreeMap<String, Vec<Value>>,
    pub order_descending: bool,
    pub limit: Option<usize>,
}

impl GetDataOptions {
    pub fn with_window(window: Window) -> Self {
        Self {
            window,
            ..Default::default()
        }
    }
}
