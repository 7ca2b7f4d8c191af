//! Merge of settings objects, key by key at the top level.
//!
//! Ignored keys never travel: the local value stays local and the remote
//! value stays remote.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use super::merge::{three_way, Changes};

/// A key both sides changed differently.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingConflict {
    /// Setting name.
    pub key: String,
    /// Local value, `None` if removed locally.
    pub local_value: Option<Value>,
    /// Remote value, `None` if removed remotely.
    pub remote_value: Option<Value>,
}

/// Outcome of [`merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsMergeResult {
    /// New local settings.
    pub local: Map<String, Value>,
    /// New remote settings.
    pub remote: Map<String, Value>,
    /// Keys left unresolved. Each side keeps its own value.
    pub conflicts: Vec<SettingConflict>,
    /// Whether `local` differs from the input.
    pub has_local_changed: bool,
    /// Whether `remote` differs from the input.
    pub has_remote_changed: bool,
}

fn syncable(map: &Map<String, Value>, ignored: &HashSet<&str>) -> BTreeMap<String, Value> {
    map.iter()
        .filter(|(key, _)| !ignored.contains(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn apply(target: &mut Map<String, Value>, changes: &Changes<Value>) {
    for key in &changes.removed {
        target.remove(key);
    }
    for (key, value) in changes.added.iter().chain(&changes.updated) {
        target.insert(key.clone(), value.clone());
    }
}

/// Merge local and remote settings against `base`.
///
/// `remote` is `None` before the first sync and is then treated as empty.
pub fn merge(
    local: &Map<String, Value>,
    remote: Option<&Map<String, Value>>,
    base: Option<&Map<String, Value>>,
    ignored: &[String],
) -> SettingsMergeResult {
    let ignored: HashSet<&str> = ignored.iter().map(String::as_str).collect();
    let empty = Map::new();
    let remote_in = remote.unwrap_or(&empty);

    let local_sync = syncable(local, &ignored);
    let remote_sync = syncable(remote_in, &ignored);
    let base_sync = base.map(|base| syncable(base, &ignored));

    let result = three_way(&local_sync, &remote_sync, base_sync.as_ref());

    let mut merged_local = local.clone();
    apply(&mut merged_local, &result.local);
    let mut merged_remote = remote_in.clone();
    apply(&mut merged_remote, &result.remote);

    let conflicts = result
        .conflicts
        .iter()
        .map(|key| SettingConflict {
            key: key.clone(),
            local_value: local_sync.get(key).cloned(),
            remote_value: remote_sync.get(key).cloned(),
        })
        .collect();

    SettingsMergeResult {
        has_local_changed: merged_local != *local,
        has_remote_changed: remote.is_none() || merged_remote != *remote_in,
        local: merged_local,
        remote: merged_remote,
        conflicts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_unchanged() {
        let s = settings(json!({"editor.fontSize": 12}));
        let result = merge(&s, Some(&s), Some(&s), &[]);
        assert!(!result.has_local_changed);
        assert!(!result.has_remote_changed);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_first_sync_pushes_local() {
        let local = settings(json!({"a": 1, "b": true}));
        let result = merge(&local, None, None, &[]);

        assert_eq!(result.remote, local);
        assert!(result.has_remote_changed);
        assert!(!result.has_local_changed);
    }

    #[test]
    fn test_changes_cross_over() {
        let base = settings(json!({"a": 1, "b": 1}));
        let local = settings(json!({"a": 2, "b": 1}));
        let remote = settings(json!({"a": 1, "b": 1, "c": [1]}));

        let result = merge(&local, Some(&remote), Some(&base), &[]);

        assert_eq!(result.local, settings(json!({"a": 2, "b": 1, "c": [1]})));
        assert_eq!(result.remote, result.local);
        assert!(result.has_local_changed && result.has_remote_changed);
    }

    #[test]
    fn test_ignored_keys_stay_put() {
        let base = settings(json!({"theme": "dark"}));
        let local = settings(json!({"theme": "light", "window.zoom": 2}));
        let remote = settings(json!({"theme": "dark", "window.zoom": 0}));

        let result = merge(&local, Some(&remote), Some(&base), &["window.zoom".to_string()]);

        assert_eq!(result.local, local);
        assert_eq!(result.remote, settings(json!({"theme": "light", "window.zoom": 0})));
        assert!(!result.has_local_changed);
    }

    #[test]
    fn test_conflict_keeps_both_values() {
        let base = settings(json!({"tabSize": 4}));
        let local = settings(json!({"tabSize": 2}));
        let remote = settings(json!({"tabSize": 8}));

        let result = merge(&local, Some(&remote), Some(&base), &[]);

        assert_eq!(
            result.conflicts,
            vec![SettingConflict {
                key: "tabSize".into(),
                local_value: Some(json!(2)),
                remote_value: Some(json!(8)),
            }]
        );
        assert_eq!(result.local, local);
        assert_eq!(result.remote, remote);
    }
}
