//! Configuration loading and patch-layering (spec §6, §9).
//!
//! Precedence, lowest to highest:
//!
//! 1. the on-disk config file (`$MRSM_ROOT_DIR/config.json`, or the path
//!    named by `MRSM_CONFIG` when it points at a file rather than inline
//!    JSON),
//! 2. `MRSM_CONFIG` when it holds inline JSON,
//! 3. `MRSM_PATCH` (always inline JSON, always merged last),
//! 4. `MRSM_<TYPE>_<LABEL>` environment variables, which patch a single
//!    leaf under `connectors.<type>.<label>`.
//!
//! Patches are deep-merged: objects merge key-by-key recursively, any
//! other value (including arrays) replaces the base outright.

use crate::error::MrsmError;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Deep-merge `patch` into `base` in place. Object keys recurse; anything
/// else in `patch` overwrites `base` wholesale, including `null` (which
/// deletes the key, matching JSON-merge-patch semantics, RFC 7396).
pub fn merge_patch(base: &mut Json, patch: &Json) {
    match (base, patch) {
        (Json::Object(base_map), Json::Object(patch_map)) => {
            for (k, v) in patch_map {
                if v.is_null() {
                    base_map.remove(k);
                    continue;
                }
                match base_map.get_mut(k) {
                    Some(existing) => merge_patch(existing, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base_slot, patch_val) => {
            *base_slot = patch_val.clone();
        }
    }
}

/// Resolve a `{a:b:c}` symlink reference — a string value elsewhere in the
/// config pointing at another key path — to its target's dot-path.
/// Returns `None` when `s` isn't a symlink reference.
pub fn parse_symlink(s: &str) -> Option<Vec<String>> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    Some(inner.split(':').map(|p| p.trim().to_string()).collect())
}

/// Look up a dot/colon path (`["connectors", "sql", "main"]`) in a JSON
/// document, following at most one level of `{a:b:c}` symlink indirection.
pub fn resolve_path<'a>(doc: &'a Json, path: &[String]) -> Option<&'a Json> {
    let mut cur = doc;
    for key in path {
        cur = cur.as_object()?.get(key.as_str())?;
    }
    if let Json::String(s) = cur {
        if let Some(target) = parse_symlink(s) {
            return resolve_path(doc, &target);
        }
    }
    Some(cur)
}

/// In-memory configuration document plus the environment variables that
/// shaped it, assembled by [`Config::load`].
#[derive(Debug, Clone)]
pub struct Config {
    pub document: Json,
    pub root_dir: PathBuf,
}

impl Config {
    /// Build a config from the environment, following the precedence
    /// order documented on this module.
    pub fn load() -> Result<Self, MrsmError> {
        let root_dir = std::env::var("MRSM_ROOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_root_dir());

        let mut document = Self::load_file(&root_dir.join("config.json")).unwrap_or(Json::Object(Default::default()));

        if let Ok(raw) = std::env::var("MRSM_CONFIG") {
            let inline = Self::parse_inline_or_path(&raw)?;
            merge_patch(&mut document, &inline);
        }

        if let Ok(raw) = std::env::var("MRSM_PATCH") {
            let patch: Json = serde_json::from_str(&raw)
                .map_err(|e| MrsmError::Configuration(format!("MRSM_PATCH is not valid JSON: {e}")))?;
            merge_patch(&mut document, &patch);
        }

        for (key, label, value) in connector_env_vars() {
            let mut patch = Json::Object(Default::default());
            let leaf = serde_json::json!({ label: value });
            patch
                .as_object_mut()
                .unwrap()
                .insert("connectors".into(), serde_json::json!({ key: leaf }));
            merge_patch(&mut document, &patch);
        }

        Ok(Self { document, root_dir })
    }

    fn load_file(path: &Path) -> Result<Json, MrsmError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MrsmError::Configuration(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| MrsmError::Configuration(format!("parsing {}: {e}", path.display())))
    }

    fn parse_inline_or_path(raw: &str) -> Result<Json, MrsmError> {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            serde_json::from_str(trimmed)
                .map_err(|e| MrsmError::Configuration(format!("MRSM_CONFIG is not valid JSON: {e}")))
        } else {
            Self::load_file(Path::new(trimmed))
        }
    }

    /// Fetch a dot-path (`connectors.sql.main`) from the merged document,
    /// resolving `{a:b:c}` symlinks along the way.
    pub fn get(&self, path: &str) -> Option<&Json> {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        resolve_path(&self.document, &segments)
    }
}

fn default_root_dir() -> PathBuf {
    dirs_home().join(".mrsm")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

/// Parse `MRSM_<TYPE>_<LABEL>=<json-or-scalar>` environment variables into
/// `(type, label, value)` triples (spec §6).
fn connector_env_vars() -> Vec<(String, String, Json)> {
    let mut out = Vec::new();
    for (key, val) in std::env::vars() {
        let Some(rest) = key.strip_prefix("MRSM_") else {
            continue;
        };
        if matches!(rest, "CONFIG" | "PATCH" | "ROOT_DIR" | "PLUGINS_DIR" | "NOASK") {
            continue;
        }
        let Some((ty, label)) = rest.split_once('_') else {
            continue;
        };
        let value: Json = serde_json::from_str(&val).unwrap_or_else(|_| Json::String(val.clone()));
        out.push((ty.to_ascii_lowercase(), label.to_ascii_lowercase(), value));
    }
    out
}

/// `MRSM_NOASK` — when set truthy, the CLI never prompts interactively and
/// treats unanswered confirmations as declined.
pub fn noask() -> bool {
    std::env::var("MRSM_NOASK")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// `MRSM_PLUGINS_DIR` — where plugin packages are discovered from. Not
/// read by the core crate itself (plugin loading is external, spec §1),
/// but surfaced here since it shares the `MRSM_*` namespace.
pub fn plugins_dir() -> Option<PathBuf> {
    std::env::var("MRSM_PLUGINS_DIR").ok().map(PathBuf::from)
}

#[allow(dead_code)]
type ConnectorLabelMap = BTreeMap<String, BTreeMap<String, Json>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_overwrites_scalars() {
        let mut base = json!({"a": 1, "b": 2});
        merge_patch(&mut base, &json!({"a": 99}));
        assert_eq!(base, json!({"a": 99, "b": 2}));
    }

    #[test]
    fn merge_patch_recurses_into_objects() {
        let mut base = json!({"connectors": {"sql": {"host": "localhost", "port": 5432}}});
        merge_patch(&mut base, &json!({"connectors": {"sql": {"port": 5433}}}));
        assert_eq!(
            base,
            json!({"connectors": {"sql": {"host": "localhost", "port": 5433}}})
        );
    }

    #[test]
    fn merge_patch_null_deletes_key() {
        let mut base = json!({"a": 1, "b": 2});
        merge_patch(&mut base, &json!({"a": null}));
        assert_eq!(base, json!({"b": 2}));
    }

    #[test]
    fn parse_symlink_extracts_path_segments() {
        assert_eq!(
            parse_symlink("{connectors:sql:main}"),
            Some(vec!["connectors".into(), "sql".into(), "main".into()])
        );
        assert_eq!(parse_symlink("plain string"), None);
    }

    #[test]
    fn resolve_path_follows_one_symlink_hop() {
        let doc = json!({
            "connectors": {"sql": {"main": {"host": "db1"}}},
            "default": "{connectors:sql:main}",
        });
        let resolved = resolve_path(&doc, &["default".to_string()]).unwrap();
        assert_eq!(resolved, &json!({"host": "db1"}));
    }
}
