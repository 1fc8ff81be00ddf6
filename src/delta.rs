//! Change detection: difference a current index against the snapshot taken
//! at the end of the prior pass.

use crate::types::{Delta, Index};

/// A path is modified when the snapshot never saw it or saw it with a
/// strictly older mtime; equal mtimes mean unchanged, so untouched files
/// are never re-staged. A path is removed when the snapshot has it and the
/// current index does not.
pub fn diff(current: &Index, last: &Index) -> Delta {
    let mut delta = Delta::default();

    for (path, entry) in current {
        let changed = match last.get(path) {
            None => true,
            Some(prev) => prev.mtime < entry.mtime,
        };
        if changed {
            delta.modified.insert(path.clone(), entry.clone());
        }
    }

    for (path, entry) in last {
        if !current.contains_key(path) {
            delta.removed.insert(path.clone(), entry.clone());
        }
    }

    delta
}
