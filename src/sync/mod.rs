//! Three-way merges for synchronizing editor state between machines.
//!
//! All merges are pure: they take the local state, the last synced remote
//! state and the common base, and return the edits for each side.
//!
//! - [`merge::three_way`] - generic keyed merge used by the others
//! - [`settings::merge`] - top-level settings keys
//! - [`extensions::merge`] - installed extensions
//! - [`snippets::merge`] - snippet files

pub mod extensions;
pub mod merge;
pub mod settings;
pub mod snippets;

pub use extensions::{ExtensionsMergeResult, SyncExtension};
pub use merge::{three_way, Changes, MergeResult};
pub use settings::{SettingConflict, SettingsMergeResult};
