//! Generic three-way merge over keyed values.
//!
//! Both sides are diffed against a common base. A key changed on one side
//! only is copied to the other; a key changed on both sides is a conflict
//! unless both changes agree. A removal racing an update resolves to the
//! update.

use std::collections::{BTreeMap, BTreeSet};

/// Edits to apply to one side to bring it up to date.
#[derive(Debug, Clone, PartialEq)]
pub struct Changes<V> {
    /// Keys to create.
    pub added: BTreeMap<String, V>,
    /// Keys whose value must be replaced.
    pub updated: BTreeMap<String, V>,
    /// Keys to delete.
    pub removed: BTreeSet<String>,
}

impl<V> Default for Changes<V> {
    fn default() -> Self {
        Self {
            added: BTreeMap::new(),
            updated: BTreeMap::new(),
            removed: BTreeSet::new(),
        }
    }
}

impl<V: Clone> Changes<V> {
    /// Whether there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Apply the edits to `target`.
    pub fn apply_to(&self, target: &mut BTreeMap<String, V>) {
        for key in &self.removed {
            target.remove(key);
        }
        for (key, value) in self.added.iter().chain(&self.updated) {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Outcome of [`three_way`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult<V> {
    /// Apply to the local side.
    pub local: Changes<V>,
    /// Apply to the remote side.
    pub remote: Changes<V>,
    /// Keys both sides changed differently. Left untouched on both sides.
    pub conflicts: BTreeSet<String>,
}

impl<V: Clone> MergeResult<V> {
    /// Whether the merge left nothing to do.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty() && self.conflicts.is_empty()
    }
}

#[derive(Debug)]
enum Change<'a, V> {
    Added(&'a V),
    Updated(&'a V),
    Removed,
}

fn diff<'a, V: PartialEq>(
    base: &BTreeMap<String, V>,
    side: &'a BTreeMap<String, V>,
) -> BTreeMap<&'a str, Change<'a, V>>
where
    V: 'a,
{
    let mut changes = BTreeMap::new();
    for (key, value) in side {
        match base.get(key) {
            None => {
                changes.insert(key.as_str(), Change::Added(value));
            }
            Some(old) if old != value => {
                changes.insert(key.as_str(), Change::Updated(value));
            }
            Some(_) => {}
        }
    }
    changes
}

/// Merge `local` and `remote` against `base`.
///
/// A missing `base` (first sync) is treated as empty, so keys present on
/// both sides with different values conflict.
pub fn three_way<V: Clone + PartialEq>(
    local: &BTreeMap<String, V>,
    remote: &BTreeMap<String, V>,
    base: Option<&BTreeMap<String, V>>,
) -> MergeResult<V> {
    let empty = BTreeMap::new();
    let base = base.unwrap_or(&empty);

    let mut local_changes = diff(base, local);
    let mut remote_changes = diff(base, remote);
    // `diff` only sees keys present on the side; removals come from the base.
    for key in base.keys() {
        if !local.contains_key(key) {
            local_changes.insert(key.as_str(), Change::Removed);
        }
        if !remote.contains_key(key) {
            remote_changes.insert(key.as_str(), Change::Removed);
        }
    }

    let mut result = MergeResult {
        local: Changes::default(),
        remote: Changes::default(),
        conflicts: BTreeSet::new(),
    };

    let keys: BTreeSet<&str> = local_changes
        .keys()
        .chain(remote_changes.keys())
        .copied()
        .collect();

    for key in keys {
        match (local_changes.get(key), remote_changes.get(key)) {
            (Some(change), None) => record(&mut result.remote, key, change),
            (None, Some(change)) => record(&mut result.local, key, change),
            (Some(Change::Removed), Some(Change::Removed)) => {}
            (Some(Change::Removed), Some(Change::Added(v) | Change::Updated(v))) => {
                result.local.added.insert(key.to_string(), (*v).clone());
            }
            (Some(Change::Added(v) | Change::Updated(v)), Some(Change::Removed)) => {
                result.remote.added.insert(key.to_string(), (*v).clone());
            }
            (
                Some(Change::Added(l) | Change::Updated(l)),
                Some(Change::Added(r) | Change::Updated(r)),
            ) => {
                if l != r {
                    result.conflicts.insert(key.to_string());
                }
            }
            (None, None) => {}
        }
    }

    result
}

fn record<V: Clone>(target: &mut Changes<V>, key: &str, change: &Change<'_, V>) {
    match change {
        Change::Added(v) => {
            target.added.insert(key.to_string(), (*v).clone());
        }
        Change::Updated(v) => {
            target.updated.insert(key.to_string(), (*v).clone());
        }
        Change::Removed => {
            target.removed.insert(key.to_string());
        }
    }
}
