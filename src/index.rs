//! Index builders: walk the local tree and page through the remote listing,
//! producing a path→entry map per side.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::hasher;
use crate::paths;
use crate::remote::{RemoteKind, RemoteStore};
use crate::types::{round_mtime, Entry, Index};

/// The current local index plus the root it was built from, so content
/// hashes can be filled lazily on first demand.
#[derive(Debug)]
pub struct LocalIndex {
    root: PathBuf,
    entries: Index,
}

impl LocalIndex {
    /// Walk `root` recursively. Entries from `prior` are reused verbatim
    /// when the live `(mtime, size)` still match, which preserves any
    /// already-computed content hash. Symlinks and special files are
    /// treated as absent; unreadable entries are logged and omitted.
    pub fn build(root: &Path, prior: &Index) -> Result<Self> {
        let mut entries = Index::new();

        for item in WalkDir::new(root).min_depth(1) {
            let item = match item {
                Ok(i) => i,
                Err(err) => {
                    crate::logging::warn(format!("local walk skipped entry: {err}"));
                    continue;
                }
            };
            let ftype = item.file_type();
            if ftype.is_symlink() || (!ftype.is_file() && !ftype.is_dir()) {
                continue;
            }
            let Some(rel) = paths::rel_from_fs(item.path(), root) else {
                continue;
            };
            let meta = match item.metadata() {
                Ok(m) => m,
                Err(err) => {
                    crate::logging::warn(format!("local stat failed for {rel}: {err}"));
                    continue;
                }
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| round_mtime(d.as_secs_f64()))
                .unwrap_or(0.0);
            let is_folder = ftype.is_dir();
            let size = if is_folder { 0 } else { meta.len() };

            let entry = match prior.get(&rel) {
                Some(prev)
                    if prev.is_folder == is_folder
                        && prev.size == size
                        && prev.mtime == mtime =>
                {
                    prev.clone()
                }
                _ if is_folder => Entry::folder(rel.clone(), mtime),
                _ => Entry::file(rel.clone(), size, mtime, None),
            };
            entries.insert(rel, entry);
        }

        Ok(LocalIndex {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &Index {
        &self.entries
    }

    pub fn get(&self, rel: &str) -> Option<&Entry> {
        self.entries.get(rel)
    }

    pub fn insert(&mut self, entry: Entry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn remove(&mut self, rel: &str) {
        self.entries.remove(rel);
    }

    /// Absolute filesystem location of an indexed path.
    pub fn abs(&self, rel: &str) -> PathBuf {
        paths::fs_path(&self.root, rel)
    }

    /// Content hash of an indexed file, computing and memoizing it on first
    /// demand. Folders yield `None`.
    pub fn ensure_hash(&mut self, rel: &str) -> Result<Option<String>> {
        let Some(entry) = self.entries.get_mut(rel) else {
            anyhow::bail!("no local entry for {rel}");
        };
        if entry.is_folder {
            return Ok(None);
        }
        if entry.content_hash.is_none() {
            let abs = paths::fs_path(&self.root, rel);
            let hash =
                hasher::hash_file(&abs).with_context(|| format!("hash local file {rel}"))?;
            entry.content_hash = Some(hash);
        }
        Ok(entry.content_hash.clone())
    }

    pub fn into_entries(self) -> Index {
        self.entries
    }
}

/// Page through the remote listing and build the remote index. The root
/// itself and tombstone entries are skipped; file entries keep the
/// server-provided hash, timestamp and size.
pub async fn remote_index<S: RemoteStore + ?Sized>(store: &S, remote_root: &str) -> Result<Index> {
    let mut entries = Index::new();
    let mut page = store
        .list(remote_root, true)
        .await
        .context("list remote folder")?;

    loop {
        for item in &page.entries {
            let rel = match paths::rel_from_api(&item.path_display, remote_root) {
                Some(rel) => rel,
                None => continue,
            };
            let entry = match item.kind {
                RemoteKind::Folder => Entry::folder(rel.clone(), 0.0),
                RemoteKind::File => Entry::file(
                    rel.clone(),
                    item.size,
                    item.server_modified.map(round_mtime).unwrap_or(0.0),
                    item.content_hash.clone(),
                ),
                RemoteKind::Deleted => continue,
            };
            entries.insert(rel, entry);
        }
        if !page.has_more {
            break;
        }
        page = store
            .list_continue(&page.cursor)
            .await
            .context("continue remote listing")?;
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_temp_dir, set_file_mtime_secs, MemoryStore};
    use std::fs;

    #[test]
    fn build_walks_files_and_folders() {
        let root = make_temp_dir();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/c.txt"), b"hello").unwrap();
        fs::write(root.join("top.txt"), b"x").unwrap();

        let idx = LocalIndex::build(&root, &Index::new()).unwrap();
        let entries = idx.entries();
        assert_eq!(entries.len(), 4);
        assert!(entries["a"].is_folder);
        assert!(entries["a/b"].is_folder);
        let c = &entries["a/b/c.txt"];
        assert!(!c.is_folder);
        assert_eq!(c.size, 5);
        assert!(c.mtime > 0.0);
        assert!(c.content_hash.is_none());
    }

    #[test]
    fn unchanged_entries_are_reused_verbatim() {
        let root = make_temp_dir();
        fs::write(root.join("a.txt"), b"hello").unwrap();
        set_file_mtime_secs(&root.join("a.txt"), 1_700_000_000.0);

        let mut first = LocalIndex::build(&root, &Index::new()).unwrap();
        first.ensure_hash("a.txt").unwrap();
        let prior = first.into_entries();
        assert!(prior["a.txt"].content_hash.is_some());

        let second = LocalIndex::build(&root, &prior).unwrap();
        // Same (mtime, size): the prior entry including its hash survives.
        assert_eq!(second.entries()["a.txt"], prior["a.txt"]);
    }

    #[test]
    fn changed_mtime_drops_the_cached_hash() {
        let root = make_temp_dir();
        fs::write(root.join("a.txt"), b"hello").unwrap();
        set_file_mtime_secs(&root.join("a.txt"), 1_700_000_000.0);

        let mut first = LocalIndex::build(&root, &Index::new()).unwrap();
        first.ensure_hash("a.txt").unwrap();
        let prior = first.into_entries();

        set_file_mtime_secs(&root.join("a.txt"), 1_700_000_100.0);
        let second = LocalIndex::build(&root, &prior).unwrap();
        assert!(second.entries()["a.txt"].content_hash.is_none());
        assert_eq!(second.entries()["a.txt"].mtime, 1_700_000_100.0);
    }

    #[test]
    fn ensure_hash_computes_once() {
        let root = make_temp_dir();
        fs::write(root.join("a.txt"), b"hello").unwrap();
        let mut idx = LocalIndex::build(&root, &Index::new()).unwrap();

        let h1 = idx.ensure_hash("a.txt").unwrap().unwrap();
        assert_eq!(h1, crate::hasher::hash_bytes(b"hello"));

        // Rewriting the file is not noticed; the memoized hash stays.
        fs::write(root.join("a.txt"), b"other").unwrap();
        let h2 = idx.ensure_hash("a.txt").unwrap().unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn symlinks_are_absent() {
        let root = make_temp_dir();
        fs::write(root.join("real.txt"), b"x").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("link.txt")).unwrap();

        let idx = LocalIndex::build(&root, &Index::new()).unwrap();
        assert!(idx.get("real.txt").is_some());
        assert!(idx.get("link.txt").is_none());
    }

    #[tokio::test]
    async fn remote_index_pages_and_skips_root() {
        let store = MemoryStore::new();
        store.put_file("/a/b.txt", b"hello", 100.0);
        store.put_file("/c.txt", b"world", 200.0);
        store.mkdir("/a");
        store.set_page_size(2);

        let idx = remote_index(&store, "").await.unwrap();
        assert_eq!(idx.len(), 3);
        assert!(idx["a"].is_folder);
        assert_eq!(idx["a/b.txt"].size, 5);
        assert_eq!(idx["a/b.txt"].mtime, 100.0);
        assert_eq!(
            idx["a/b.txt"].content_hash.as_deref(),
            Some(crate::hasher::hash_bytes(b"hello").as_str())
        );
        assert!(store.calls().iter().any(|c| c.starts_with("list_continue")));
    }

    #[tokio::test]
    async fn remote_index_scopes_to_remote_root() {
        let store = MemoryStore::new();
        store.mkdir("/backup");
        store.put_file("/backup/a.txt", b"in", 100.0);
        store.put_file("/other/b.txt", b"out", 100.0);

        let idx = remote_index(&store, "/backup").await.unwrap();
        assert_eq!(idx.len(), 1);
        assert!(idx.contains_key("a.txt"));
    }
}
