//! Merge of installed extension lists.
//!
//! Extensions are matched by identifier, case-insensitively. When both
//! sides changed the same extension differently the local state wins and
//! is pushed to the remote list.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::merge::three_way;

/// One synced extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncExtension {
    /// Publisher-qualified id, e.g. `rust-lang.rust-analyzer`.
    pub identifier: String,
    /// Installed version, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Whether the extension is installed but disabled.
    #[serde(default)]
    pub disabled: bool,
}

impl SyncExtension {
    /// An enabled extension without version.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            version: None,
            disabled: false,
        }
    }

    fn key(&self) -> String {
        self.identifier.to_lowercase()
    }
}

/// Outcome of [`merge`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtensionsMergeResult {
    /// Install locally.
    pub added: Vec<SyncExtension>,
    /// Uninstall locally, by identifier.
    pub removed: Vec<String>,
    /// Change version or enablement locally.
    pub updated: Vec<SyncExtension>,
    /// New remote list, `None` when the remote list is already current.
    pub remote: Option<Vec<SyncExtension>>,
}

/// Compares by state only; the identifier's case is ignored.
#[derive(Clone)]
struct Entry(SyncExtension);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.0.version == other.0.version && self.0.disabled == other.0.disabled
    }
}

fn keyed(extensions: &[SyncExtension], ignored: &HashSet<String>) -> BTreeMap<String, Entry> {
    extensions
        .iter()
        .filter(|e| !ignored.contains(&e.key()))
        .map(|e| (e.key(), Entry(e.clone())))
        .collect()
}

/// Merge local and remote extension lists against `base`.
///
/// `remote` is `None` before the first sync; the local list is then
/// published as is. Ignored identifiers (case-insensitive) are never
/// installed, removed or published, and remote entries for them are kept.
pub fn merge(
    local: &[SyncExtension],
    remote: Option<&[SyncExtension]>,
    base: Option<&[SyncExtension]>,
    ignored: &[String],
) -> ExtensionsMergeResult {
    let ignored: HashSet<String> = ignored.iter().map(|id| id.to_lowercase()).collect();
    let local_map = keyed(local, &ignored);

    let Some(remote) = remote else {
        return ExtensionsMergeResult {
            remote: Some(local_map.into_values().map(|e| e.0).collect()),
            ..Default::default()
        };
    };

    let remote_map = keyed(remote, &ignored);
    let base_map = base.map(|base| keyed(base, &ignored));
    let result = three_way(&local_map, &remote_map, base_map.as_ref());

    let mut new_remote: BTreeMap<String, SyncExtension> =
        remote.iter().map(|e| (e.key(), e.clone())).collect();
    let before = new_remote.clone();
    for key in &result.remote.removed {
        new_remote.remove(key);
    }
    for (key, entry) in result.remote.added.iter().chain(&result.remote.updated) {
        new_remote.insert(key.clone(), entry.0.clone());
    }
    for key in &result.conflicts {
        if let Some(entry) = local_map.get(key) {
            tracing::debug!("Extension {} changed on both sides, keeping local", key);
            new_remote.insert(key.clone(), entry.0.clone());
        }
    }

    ExtensionsMergeResult {
        added: result.local.added.into_values().map(|e| e.0).collect(),
        removed: result
            .local
            .removed
            .iter()
            .filter_map(|key| local_map.get(key).map(|e| e.0.identifier.clone()))
            .collect(),
        updated: result.local.updated.into_values().map(|e| e.0).collect(),
        remote: (new_remote != before).then(|| new_remote.into_values().collect()),
    }
}
