//! Merge of snippet files, keyed by file name.

use std::collections::BTreeMap;

use super::merge::{three_way, Changes, MergeResult};

/// Snippet file name to file content.
pub type Snippets = BTreeMap<String, String>;

/// Merge local and remote snippet files.
///
/// `remote` is `None` when nothing was synced yet: every local file is
/// then added remotely and nothing changes locally.
pub fn merge(local: &Snippets, remote: Option<&Snippets>, base: Option<&Snippets>) -> MergeResult<String> {
    match remote {
        Some(remote) => three_way(local, remote, base),
        None => MergeResult {
            local: Changes::default(),
            remote: Changes {
                added: local.clone(),
                ..Changes::default()
            },
            conflicts: Default::default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn snippets(entries: &[(&str, &str)]) -> Snippets {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_first_sync_uploads_everything() {
        let local = snippets(&[("rust.json", "{}"), ("go.json", "{}")]);

        let result = merge(&local, None, None);

        assert_eq!(result.remote.added, local);
        assert!(result.local.is_empty());
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_edits_on_both_sides() {
        let base = snippets(&[("a.json", "1"), ("b.json", "1"), ("c.json", "1")]);
        let local = snippets(&[("a.json", "2"), ("b.json", "1"), ("c.json", "L")]);
        let remote = snippets(&[("a.json", "1"), ("c.json", "R"), ("d.json", "1")]);

        let result = merge(&local, Some(&remote), Some(&base));

        assert_eq!(result.remote.updated, snippets(&[("a.json", "2")]));
        assert_eq!(result.local.removed, BTreeSet::from(["b.json".to_string()]));
        assert_eq!(result.local.added, snippets(&[("d.json", "1")]));
        assert_eq!(result.conflicts, BTreeSet::from(["c.json".to_string()]));
    }
}
