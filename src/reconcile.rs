//! Classification of change sets against the opposite side's current state.
//!
//! The reconciler is a pure classifier: it stages the entries that should be
//! applied for one `(action, direction)` phase and mutates the opposite
//! index optimistically so that later phases within the same pass see the
//! post-apply world. It never touches the filesystem or the remote store,
//! with one exception: filling a local content hash on first demand.

use crate::index::LocalIndex;
use crate::logging;
use crate::types::{Action, ConflictReason, ConflictSkip, Direction, Entry, Index, Op};

enum Classified {
    /// Apply this entry; the opposite index has been updated.
    Stage(Entry),
    /// Nothing to do (idempotent or already absent).
    Skip,
    /// Deliberate no-op with a structured reason.
    Conflict(ConflictReason),
    /// Local I/O prevented classification; the path is skipped this pass.
    Unreadable(String),
}

/// Classify every entry of `changes` for the given phase. Returns the
/// staged sub-index handed to the applier. Conflict-skips are appended to
/// `conflicts` and logged; unreadable paths are logged and dropped.
pub fn reconcile(
    changes: &Index,
    op: Op,
    local: &mut LocalIndex,
    remote: &mut Index,
    conflicts: &mut Vec<ConflictSkip>,
) -> Index {
    let mut staged = Index::new();

    for (path, src) in changes {
        let outcome = match op.action() {
            Action::Add => classify_add(path, src, op, local, remote),
            Action::Del => classify_del(path, src, op, local, remote),
        };
        match outcome {
            Classified::Stage(entry) => {
                staged.insert(path.clone(), entry);
            }
            Classified::Skip => {}
            Classified::Conflict(reason) => {
                logging::warn_kv(
                    "conflict skip",
                    &[("op", op.label()), ("path", path), ("reason", reason.as_str())],
                );
                conflicts.push(ConflictSkip {
                    path: path.clone(),
                    op,
                    reason,
                });
            }
            Classified::Unreadable(err) => {
                logging::warn_kv("unreadable, skipped", &[("op", op.label()), ("path", path), ("error", &err)]);
            }
        }
    }

    staged
}

fn classify_add(
    path: &str,
    src: &Entry,
    op: Op,
    local: &mut LocalIndex,
    remote: &mut Index,
) -> Classified {
    let dst = match op.direction() {
        Direction::Up => remote.get(path).cloned(),
        Direction::Down => local.get(path).cloned(),
    };

    let Some(dst) = dst else {
        return stage_add(path, src, op, local, remote);
    };
    if src.is_folder && dst.is_folder {
        return Classified::Skip;
    }

    // Content equality is checked first so same-size pairs get their local
    // hash filled; the snapshot then carries it for later delete
    // arbitration.
    let differs = match content_differs(src, &dst, op.direction(), local) {
        Ok(d) => d,
        Err(err) => return Classified::Unreadable(format!("{err:#}")),
    };
    if differs && dst.mtime < src.mtime {
        stage_add(path, src, op, local, remote)
    } else {
        Classified::Conflict(match op.direction() {
            Direction::Up => ConflictReason::RemoteNewer,
            Direction::Down => ConflictReason::LocalNewer,
        })
    }
}

fn stage_add(
    path: &str,
    src: &Entry,
    op: Op,
    local: &mut LocalIndex,
    remote: &mut Index,
) -> Classified {
    match op.direction() {
        Direction::Up => {
            // Hash before staging so the uploaded version is identified in
            // the end-of-pass snapshot.
            if !src.is_folder {
                if let Err(err) = local.ensure_hash(path) {
                    return Classified::Unreadable(format!("{err:#}"));
                }
            }
            let entry = local.get(path).cloned().unwrap_or_else(|| src.clone());
            remote.insert(path.to_string(), entry.clone());
            Classified::Stage(entry)
        }
        Direction::Down => {
            local.insert(src.clone());
            Classified::Stage(src.clone())
        }
    }
}

fn classify_del(
    path: &str,
    src: &Entry,
    op: Op,
    local: &mut LocalIndex,
    remote: &mut Index,
) -> Classified {
    let dst = match op.direction() {
        Direction::Up => remote.get(path).cloned(),
        Direction::Down => local.get(path).cloned(),
    };
    // Already absent on the other side: nothing to propagate.
    let Some(dst) = dst else {
        return Classified::Skip;
    };

    let matches = match delete_target_matches(src, &dst, op.direction(), local) {
        Ok(m) => m,
        Err(err) => return Classified::Unreadable(format!("{err:#}")),
    };
    if matches {
        match op.direction() {
            Direction::Up => {
                remote.remove(path);
            }
            Direction::Down => {
                local.remove(path);
            }
        }
        Classified::Stage(dst)
    } else {
        Classified::Conflict(ConflictReason::UnexpectedTarget)
    }
}

/// A delete is only propagated when the other side still holds the version
/// that was deleted; otherwise it has a newer independent edit and wins.
fn delete_target_matches(
    src: &Entry,
    dst: &Entry,
    direction: Direction,
    local: &mut LocalIndex,
) -> anyhow::Result<bool> {
    if src.is_folder != dst.is_folder {
        return Ok(false);
    }
    // Folder timestamps are not comparable across sides (the listing has
    // none); the applier's non-recursive rmdir is the safety net.
    if src.is_folder {
        return Ok(true);
    }
    let (src_hash, dst_hash) = match direction {
        // The local file is gone; its hash comes from the snapshot.
        Direction::Up => (src.content_hash.clone(), dst.content_hash.clone()),
        Direction::Down => (src.content_hash.clone(), local.ensure_hash(&dst.path)?),
    };
    let equal = matches!((src_hash, dst_hash), (Some(a), Some(b)) if a == b);
    Ok(equal && src.mtime >= dst.mtime)
}

fn content_differs(
    src: &Entry,
    dst: &Entry,
    direction: Direction,
    local: &mut LocalIndex,
) -> anyhow::Result<bool> {
    if src.is_folder != dst.is_folder {
        return Ok(true);
    }
    if src.is_folder {
        return Ok(false);
    }
    if src.size != dst.size {
        return Ok(true);
    }
    let (src_hash, dst_hash) = match direction {
        Direction::Up => (local.ensure_hash(&src.path)?, dst.content_hash.clone()),
        Direction::Down => (src.content_hash.clone(), local.ensure_hash(&dst.path)?),
    };
    match (src_hash, dst_hash) {
        (Some(a), Some(b)) => Ok(a != b),
        // Without both hashes equality cannot be proven; treat as differing.
        _ => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher;
    use crate::testutil::{make_temp_dir, set_file_mtime_secs};
    use crate::types::Index;
    use std::fs;
    use std::path::Path;

    fn local_index(root: &Path, files: &[(&str, &[u8], f64)]) -> LocalIndex {
        for (rel, bytes, mtime) in files {
            let abs = crate::paths::fs_path(root, rel);
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&abs, bytes).unwrap();
            set_file_mtime_secs(&abs, *mtime);
        }
        LocalIndex::build(root, &Index::new()).unwrap()
    }

    fn remote_file(path: &str, bytes: &[u8], mtime: f64) -> Entry {
        Entry::file(path, bytes.len() as u64, mtime, Some(hasher::hash_bytes(bytes)))
    }

    #[test]
    fn add_with_no_target_stages_and_mutates_opposite() {
        let root = make_temp_dir();
        let mut local = local_index(&root, &[("a.txt", b"hello", 100.0)]);
        let mut remote = Index::new();
        let mut conflicts = Vec::new();

        let changes = local.entries().clone();
        let staged = reconcile(&changes, Op::UploadAdd, &mut local, &mut remote, &mut conflicts);

        assert_eq!(staged.len(), 1);
        assert!(conflicts.is_empty());
        // Optimistic mutation: the remote index already sees the file, with
        // the hash filled in.
        assert_eq!(
            remote["a.txt"].content_hash.as_deref(),
            Some(hasher::hash_bytes(b"hello").as_str())
        );
        assert_eq!(staged["a.txt"], remote["a.txt"]);
    }

    #[test]
    fn add_folder_on_folder_is_idempotent() {
        let root = make_temp_dir();
        fs::create_dir_all(root.join("d")).unwrap();
        let mut local = LocalIndex::build(&root, &Index::new()).unwrap();
        let mut remote = Index::new();
        remote.insert("d".into(), Entry::folder("d", 0.0));
        let mut conflicts = Vec::new();

        let changes = local.entries().clone();
        let staged = reconcile(&changes, Op::UploadAdd, &mut local, &mut remote, &mut conflicts);
        assert!(staged.is_empty());
        assert!(conflicts.is_empty());
    }

    #[test]
    fn add_onto_newer_target_is_a_conflict_skip() {
        let root = make_temp_dir();
        let mut local = local_index(&root, &[("a.txt", b"local", 100.0)]);
        let mut remote = Index::new();
        remote.insert("a.txt".into(), remote_file("a.txt", b"remote!", 200.0));
        let mut conflicts = Vec::new();

        let changes = local.entries().clone();
        let staged = reconcile(&changes, Op::UploadAdd, &mut local, &mut remote, &mut conflicts);

        assert!(staged.is_empty());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].reason, ConflictReason::RemoteNewer);
        // The remote index keeps its own version.
        assert_eq!(remote["a.txt"].mtime, 200.0);
    }

    #[test]
    fn add_over_older_differing_target_overwrites() {
        let root = make_temp_dir();
        let mut local = local_index(&root, &[("a.txt", b"new content", 300.0)]);
        let mut remote = Index::new();
        remote.insert("a.txt".into(), remote_file("a.txt", b"old", 200.0));
        let mut conflicts = Vec::new();

        let changes = local.entries().clone();
        let staged = reconcile(&changes, Op::UploadAdd, &mut local, &mut remote, &mut conflicts);

        assert_eq!(staged.len(), 1);
        assert!(conflicts.is_empty());
        assert_eq!(remote["a.txt"].mtime, 300.0);
    }

    #[test]
    fn add_equal_content_not_newer_skips_as_conflict_and_fills_hash() {
        let root = make_temp_dir();
        let mut local = local_index(&root, &[("a.txt", b"same", 100.0)]);
        let mut remote = Index::new();
        remote.insert("a.txt".into(), remote_file("a.txt", b"same", 100.0));
        let mut conflicts = Vec::new();

        let changes = local.entries().clone();
        let staged = reconcile(&changes, Op::UploadAdd, &mut local, &mut remote, &mut conflicts);

        assert!(staged.is_empty());
        assert_eq!(conflicts.len(), 1);
        // The equality check hashed the local file; the snapshot will carry it.
        assert!(local.get("a.txt").unwrap().content_hash.is_some());
    }

    #[test]
    fn download_add_stages_into_local_index() {
        let root = make_temp_dir();
        let mut local = LocalIndex::build(&root, &Index::new()).unwrap();
        let mut remote = Index::new();
        let entry = remote_file("c.txt", b"world", 150.0);
        remote.insert("c.txt".into(), entry.clone());
        let mut conflicts = Vec::new();

        let changes = remote.clone();
        let staged = reconcile(&changes, Op::DownloadAdd, &mut local, &mut remote, &mut conflicts);

        assert_eq!(staged.len(), 1);
        assert_eq!(local.get("c.txt"), Some(&entry));
    }

    #[test]
    fn delete_with_absent_target_skips_silently() {
        let root = make_temp_dir();
        let mut local = LocalIndex::build(&root, &Index::new()).unwrap();
        let mut remote = Index::new();
        let mut conflicts = Vec::new();

        let mut removed = Index::new();
        removed.insert("gone.txt".into(), remote_file("gone.txt", b"x", 100.0));
        let staged = reconcile(&removed, Op::UploadDel, &mut local, &mut remote, &mut conflicts);

        assert!(staged.is_empty());
        assert!(conflicts.is_empty());
    }

    #[test]
    fn delete_of_matching_target_stages_and_removes() {
        let root = make_temp_dir();
        let mut local = LocalIndex::build(&root, &Index::new()).unwrap();
        let mut remote = Index::new();
        remote.insert("d.txt".into(), remote_file("d.txt", b"bytes", 100.0));
        let mut conflicts = Vec::new();

        // Snapshot entry for the locally deleted file: same hash, same mtime.
        let mut removed = Index::new();
        removed.insert(
            "d.txt".into(),
            Entry::file("d.txt", 5, 100.0, Some(hasher::hash_bytes(b"bytes"))),
        );
        let staged = reconcile(&removed, Op::UploadDel, &mut local, &mut remote, &mut conflicts);

        assert_eq!(staged.len(), 1);
        assert!(conflicts.is_empty());
        assert!(!remote.contains_key("d.txt"));
    }

    #[test]
    fn delete_of_diverged_target_is_unexpected_target() {
        let root = make_temp_dir();
        let mut local = LocalIndex::build(&root, &Index::new()).unwrap();
        let mut remote = Index::new();
        // Remote was modified after the local delete was observed.
        remote.insert("e.txt".into(), remote_file("e.txt", b"edited", 300.0));
        let mut conflicts = Vec::new();

        let mut removed = Index::new();
        removed.insert(
            "e.txt".into(),
            Entry::file("e.txt", 5, 100.0, Some(hasher::hash_bytes(b"bytes"))),
        );
        let staged = reconcile(&removed, Op::UploadDel, &mut local, &mut remote, &mut conflicts);

        assert!(staged.is_empty());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].reason, ConflictReason::UnexpectedTarget);
        assert!(remote.contains_key("e.txt"));
    }

    #[test]
    fn download_delete_removes_unchanged_local_file() {
        let root = make_temp_dir();
        let mut local = local_index(&root, &[("f.txt", b"stale", 100.0)]);
        let mut remote = Index::new();
        let mut conflicts = Vec::new();

        let mut removed = Index::new();
        removed.insert("f.txt".into(), remote_file("f.txt", b"stale", 100.0));
        let staged = reconcile(&removed, Op::DownloadDel, &mut local, &mut remote, &mut conflicts);

        assert_eq!(staged.len(), 1);
        assert!(local.get("f.txt").is_none());
    }

    #[test]
    fn download_delete_keeps_locally_edited_file() {
        let root = make_temp_dir();
        let mut local = local_index(&root, &[("f.txt", b"fresh local edit", 400.0)]);
        let mut remote = Index::new();
        let mut conflicts = Vec::new();

        let mut removed = Index::new();
        removed.insert("f.txt".into(), remote_file("f.txt", b"stale", 100.0));
        let staged = reconcile(&removed, Op::DownloadDel, &mut local, &mut remote, &mut conflicts);

        assert!(staged.is_empty());
        assert_eq!(conflicts[0].reason, ConflictReason::UnexpectedTarget);
        assert!(local.get("f.txt").is_some());
    }

    #[test]
    fn folder_delete_propagates_both_ways() {
        let root = make_temp_dir();
        fs::create_dir_all(root.join("keepme")).unwrap();
        let mut local = LocalIndex::build(&root, &Index::new()).unwrap();
        let mut remote = Index::new();
        remote.insert("gone".into(), Entry::folder("gone", 0.0));
        let mut conflicts = Vec::new();

        let mut removed = Index::new();
        removed.insert("gone".into(), Entry::folder("gone", 1234.5));
        let staged = reconcile(&removed, Op::UploadDel, &mut local, &mut remote, &mut conflicts);
        assert_eq!(staged.len(), 1);

        // Downward: remote folder (mtime 0) deleted, local folder has a real
        // mtime; the folder rule ignores timestamps.
        let mut removed = Index::new();
        removed.insert("keepme".into(), Entry::folder("keepme", 0.0));
        let staged = reconcile(&removed, Op::DownloadDel, &mut local, &mut remote, &mut conflicts);
        assert_eq!(staged.len(), 1);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn classification_is_deterministic() {
        let build = || {
            local_index(
                &make_temp_dir(),
                &[("a.txt", b"one", 100.0), ("b.txt", b"two", 200.0)],
            )
        };
        let mut remote_template = Index::new();
        remote_template.insert("a.txt".into(), remote_file("a.txt", b"one!", 50.0));
        remote_template.insert("b.txt".into(), remote_file("b.txt", b"newer", 900.0));

        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let mut local = build();
            let mut remote = remote_template.clone();
            let mut conflicts = Vec::new();
            let changes = local.entries().clone();
            let staged =
                reconcile(&changes, Op::UploadAdd, &mut local, &mut remote, &mut conflicts);
            outcomes.push((
                staged.keys().cloned().collect::<Vec<_>>(),
                conflicts.iter().map(|c| c.path.clone()).collect::<Vec<_>>(),
            ));
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }
}
