//! Shared test fixtures: a temp-dir helper and an in-memory remote store
//! that records the exact call sequence it receives.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::hasher;
use crate::remote::{ListPage, RemoteEntry, RemoteKind, RemoteStore};

pub fn test_config(local_folder: &Path) -> Config {
    Config {
        app_key: "test-key".to_string(),
        app_secret: "test-secret".to_string(),
        refresh_token: "test-refresh".to_string(),
        local_folder: local_folder.to_path_buf(),
        dropbox_folder: String::new(),
        interval_seconds: 1,
        debug: false,
        api_url: Config::default_api_url().to_string(),
        content_url: Config::default_content_url().to_string(),
        call_timeout_seconds: 60,
        log_file: None,
        config_path: None,
    }
}

pub fn make_temp_dir() -> PathBuf {
    let mut root = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    root.push(format!("dropsync-test-{nanos}"));
    std::fs::create_dir_all(&root).unwrap();
    root
}

pub fn set_file_mtime_secs(path: &Path, secs: f64) {
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round() as u32;
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(whole, nanos)).unwrap();
}

#[derive(Debug, Clone)]
struct MemoryFile {
    bytes: Vec<u8>,
    server_modified: f64,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, MemoryFile>,
    folders: BTreeSet<String>,
    calls: Vec<String>,
    sessions: HashMap<String, Vec<u8>>,
    jobs: HashMap<String, usize>,
    pages: HashMap<String, ListPage>,
    deleted: Vec<String>,
    /// Pending listing pages are this long; default is everything at once.
    page_size: usize,
    /// Delete jobs report complete on the Nth status check.
    delete_check_delay: usize,
    /// Server clock stamped onto uploads.
    clock: f64,
    next_id: u64,
    fail_uploads: BTreeSet<String>,
    fail_listing: bool,
    fail_deletes: bool,
}

/// In-memory [`RemoteStore`]. Paths are absolute API paths (`/a/b.txt`);
/// the namespace root is the empty string, as on the wire.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: Mutex::new(MemoryState {
                page_size: usize::MAX,
                delete_check_delay: 1,
                ..MemoryState::default()
            }),
        }
    }

    pub fn put_file(&self, path: &str, bytes: &[u8], server_modified: f64) {
        let mut st = self.state.lock().unwrap();
        st.files.insert(
            path.to_string(),
            MemoryFile {
                bytes: bytes.to_vec(),
                server_modified,
            },
        );
        add_parent_folders(&mut st.folders, path);
    }

    pub fn mkdir(&self, path: &str) {
        self.state.lock().unwrap().folders.insert(path.to_string());
    }

    pub fn set_page_size(&self, n: usize) {
        self.state.lock().unwrap().page_size = n;
    }

    pub fn set_delete_check_delay(&self, n: usize) {
        self.state.lock().unwrap().delete_check_delay = n;
    }

    pub fn set_clock(&self, secs: f64) {
        self.state.lock().unwrap().clock = secs;
    }

    /// Make uploads of this API path fail.
    pub fn fail_upload(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_uploads
            .insert(path.to_string());
    }

    /// Make listing calls fail, as an expired-credentials stand-in.
    pub fn set_fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_deletes = fail;
    }

    pub fn clear_upload_failures(&self) {
        self.state.lock().unwrap().fail_uploads.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn deleted_paths(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn file_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|f| f.bytes.clone())
    }

    pub fn has_folder(&self, path: &str) -> bool {
        self.state.lock().unwrap().folders.contains(path)
    }

    pub fn stat_blocking(&self, path: &str) -> Option<RemoteEntry> {
        let st = self.state.lock().unwrap();
        entry_for(&st, path)
    }
}

fn add_parent_folders(folders: &mut BTreeSet<String>, path: &str) {
    let mut prefix = String::new();
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        prefix.push('/');
        prefix.push_str(part);
        folders.insert(prefix.clone());
    }
}

fn entry_for(st: &MemoryState, path: &str) -> Option<RemoteEntry> {
    if let Some(f) = st.files.get(path) {
        return Some(RemoteEntry {
            path_display: path.to_string(),
            kind: RemoteKind::File,
            size: f.bytes.len() as u64,
            server_modified: Some(f.server_modified),
            content_hash: Some(hasher::hash_bytes(&f.bytes)),
        });
    }
    if st.folders.contains(path) {
        return Some(RemoteEntry {
            path_display: path.to_string(),
            kind: RemoteKind::Folder,
            size: 0,
            server_modified: None,
            content_hash: None,
        });
    }
    None
}

fn under_root(path: &str, root: &str) -> bool {
    root.is_empty() || (path.starts_with(root) && path[root.len()..].starts_with('/'))
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list(&self, root: &str, _recursive: bool) -> Result<ListPage> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("list {root}"));
        if st.fail_listing {
            anyhow::bail!("list folder: token refresh failed");
        }

        let mut entries: Vec<RemoteEntry> = Vec::new();
        let folder_paths: Vec<String> = st
            .folders
            .iter()
            .filter(|p| under_root(p, root))
            .cloned()
            .collect();
        for p in folder_paths {
            entries.push(entry_for(&st, &p).unwrap());
        }
        let file_paths: Vec<String> = st
            .files
            .keys()
            .filter(|p| under_root(p, root))
            .cloned()
            .collect();
        for p in file_paths {
            entries.push(entry_for(&st, &p).unwrap());
        }

        let page_size = st.page_size;
        if entries.len() <= page_size {
            return Ok(ListPage {
                entries,
                cursor: String::new(),
                has_more: false,
            });
        }

        let mut pages: Vec<Vec<RemoteEntry>> = Vec::new();
        for chunk in entries.chunks(page_size) {
            pages.push(chunk.to_vec());
        }
        let first = pages.remove(0);
        let mut cursor = String::new();
        // Chain the remaining pages behind generated cursors, last first.
        let mut next_cursor = String::new();
        for page in pages.into_iter().rev() {
            st.next_id += 1;
            let id = format!("cursor-{}", st.next_id);
            st.pages.insert(
                id.clone(),
                ListPage {
                    entries: page,
                    cursor: next_cursor.clone(),
                    has_more: !next_cursor.is_empty(),
                },
            );
            next_cursor = id.clone();
            cursor = id;
        }
        Ok(ListPage {
            entries: first,
            cursor,
            has_more: true,
        })
    }

    async fn list_continue(&self, cursor: &str) -> Result<ListPage> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("list_continue {cursor}"));
        st.pages
            .remove(cursor)
            .ok_or_else(|| anyhow::anyhow!("unknown cursor {cursor}"))
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("stat {path}"));
        Ok(entry_for(&st, path))
    }

    async fn upload(&self, path: &str, bytes: Vec<u8>, _overwrite: bool) -> Result<RemoteEntry> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("upload {path} {}", bytes.len()));
        if st.fail_uploads.contains(path) {
            anyhow::bail!("upload rejected: {path}");
        }
        let clock = st.clock;
        st.files.insert(
            path.to_string(),
            MemoryFile {
                bytes,
                server_modified: clock,
            },
        );
        add_parent_folders(&mut st.folders, path);
        Ok(entry_for(&st, path).unwrap())
    }

    async fn session_start(&self, bytes: Vec<u8>) -> Result<String> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("session_start {}", bytes.len()));
        st.next_id += 1;
        let id = format!("session-{}", st.next_id);
        st.sessions.insert(id.clone(), bytes);
        Ok(id)
    }

    async fn session_append(&self, session_id: &str, offset: u64, bytes: Vec<u8>) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("session_append {offset} {}", bytes.len()));
        let buf = st
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow::anyhow!("unknown session {session_id}"))?;
        anyhow::ensure!(buf.len() as u64 == offset, "offset mismatch");
        buf.extend_from_slice(&bytes);
        Ok(())
    }

    async fn session_finish(
        &self,
        session_id: &str,
        offset: u64,
        bytes: Vec<u8>,
        path: &str,
        _overwrite: bool,
    ) -> Result<RemoteEntry> {
        let mut st = self.state.lock().unwrap();
        st.calls
            .push(format!("session_finish {offset} {} {path}", bytes.len()));
        let mut buf = st
            .sessions
            .remove(session_id)
            .ok_or_else(|| anyhow::anyhow!("unknown session {session_id}"))?;
        anyhow::ensure!(buf.len() as u64 == offset, "offset mismatch");
        buf.extend_from_slice(&bytes);
        let clock = st.clock;
        st.files.insert(
            path.to_string(),
            MemoryFile {
                bytes: buf,
                server_modified: clock,
            },
        );
        add_parent_folders(&mut st.folders, path);
        Ok(entry_for(&st, path).unwrap())
    }

    async fn download_to(&self, path: &str, local_path: &Path) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("download_to {path}"));
        let f = st
            .files
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("download target missing: {path}"))?;
        std::fs::write(local_path, &f.bytes)?;
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("create_folder {path}"));
        st.folders.insert(path.to_string());
        Ok(())
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<String> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("delete_batch {}", paths.len()));
        if st.fail_deletes {
            anyhow::bail!("delete batch rejected");
        }
        for path in paths {
            st.files.remove(path);
            if st.folders.remove(path) {
                // Folder deletes take everything underneath with them.
                let doomed: Vec<String> = st
                    .files
                    .keys()
                    .filter(|p| under_root(p, path))
                    .cloned()
                    .collect();
                for p in doomed {
                    st.files.remove(&p);
                }
                let doomed: Vec<String> = st
                    .folders
                    .iter()
                    .filter(|p| under_root(p, path))
                    .cloned()
                    .collect();
                for p in doomed {
                    st.folders.remove(&p);
                }
            }
            st.deleted.push(path.clone());
        }
        st.next_id += 1;
        let id = format!("job-{}", st.next_id);
        let delay = st.delete_check_delay;
        st.jobs.insert(id.clone(), delay);
        Ok(id)
    }

    async fn delete_batch_check(&self, job_id: &str) -> Result<bool> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("delete_batch_check {job_id}"));
        let remaining = st
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| anyhow::anyhow!("unknown job {job_id}"))?;
        *remaining = remaining.saturating_sub(1);
        Ok(*remaining == 0)
    }
}
