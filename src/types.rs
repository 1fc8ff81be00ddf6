use std::collections::BTreeMap;

/// Mapping from canonical relative POSIX path to the entry observed there.
/// Ordered so that a parent folder always iterates before its children.
pub type Index = BTreeMap<String, Entry>;

/// A file or folder observed on one side of the sync.
///
/// Folders carry `size = 0` and no content hash. Local file entries start
/// with `content_hash = None`; the hash is filled on first demand and kept
/// for the lifetime of the entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub path: String,
    pub is_folder: bool,
    pub size: u64,
    /// Seconds since the Unix epoch, rounded to 0.1 s. Remote folders have
    /// no server timestamp and carry 0.
    pub mtime: f64,
    pub content_hash: Option<String>,
}

impl Entry {
    pub fn folder(path: impl Into<String>, mtime: f64) -> Self {
        Entry {
            path: path.into(),
            is_folder: true,
            size: 0,
            mtime,
            content_hash: None,
        }
    }

    pub fn file(path: impl Into<String>, size: u64, mtime: f64, content_hash: Option<String>) -> Self {
        Entry {
            path: path.into(),
            is_folder: false,
            size,
            mtime,
            content_hash,
        }
    }
}

/// Round an epoch timestamp to 0.1 s so that filesystem and server clocks
/// compare stably across passes.
pub fn round_mtime(secs: f64) -> f64 {
    (secs * 10.0).round() / 10.0
}

/// Per-side change sets derived from the current index and the prior
/// snapshot. `modified` includes creations; `removed` holds the snapshot
/// entries whose paths have disappeared.
#[derive(Debug, Default, Clone)]
pub struct Delta {
    pub modified: Index,
    pub removed: Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Del,
}

/// One reconciliation phase: what happens and which way it flows. The four
/// variants run in declaration order within a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    UploadAdd,
    UploadDel,
    DownloadAdd,
    DownloadDel,
}

impl Op {
    pub fn direction(self) -> Direction {
        match self {
            Op::UploadAdd | Op::UploadDel => Direction::Up,
            Op::DownloadAdd | Op::DownloadDel => Direction::Down,
        }
    }

    pub fn action(self) -> Action {
        match self {
            Op::UploadAdd | Op::DownloadAdd => Action::Add,
            Op::UploadDel | Op::DownloadDel => Action::Del,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Op::UploadAdd => "upload",
            Op::UploadDel => "delete-remote",
            Op::DownloadAdd => "download",
            Op::DownloadDel => "delete-local",
        }
    }
}

/// Why a staged change was deliberately not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    RemoteNewer,
    LocalNewer,
    UnexpectedTarget,
    TargetMissing,
}

impl ConflictReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictReason::RemoteNewer => "remote_newer",
            ConflictReason::LocalNewer => "local_newer",
            ConflictReason::UnexpectedTarget => "unexpected_target",
            ConflictReason::TargetMissing => "target_missing",
        }
    }
}

/// A deliberate no-op recorded during classification or apply. Never an
/// error; the pass continues.
#[derive(Debug, Clone)]
pub struct ConflictSkip {
    pub path: String,
    pub op: Op,
    pub reason: ConflictReason,
}

/// A per-path operation failure. The pass continues; the next pass will
/// re-reconcile the path.
#[derive(Debug, Clone)]
pub struct OpFailure {
    pub path: String,
    pub op: Op,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_mtime_to_tenths() {
        assert_eq!(round_mtime(1716559923.4449), 1716559923.4);
        assert_eq!(round_mtime(1716559923.46), 1716559923.5);
        assert_eq!(round_mtime(0.0), 0.0);
    }

    #[test]
    fn round_mtime_is_stable() {
        let a = round_mtime(1716559923.449);
        let b = round_mtime(round_mtime(1716559923.449));
        assert_eq!(a, b);
    }

    #[test]
    fn op_axes() {
        assert_eq!(Op::UploadAdd.direction(), Direction::Up);
        assert_eq!(Op::UploadAdd.action(), Action::Add);
        assert_eq!(Op::UploadDel.action(), Action::Del);
        assert_eq!(Op::DownloadAdd.direction(), Direction::Down);
        assert_eq!(Op::DownloadDel.label(), "delete-local");
    }

    #[test]
    fn folder_entries_carry_no_hash() {
        let e = Entry::folder("a/b", 12.0);
        assert!(e.is_folder);
        assert_eq!(e.size, 0);
        assert!(e.content_hash.is_none());
    }
}
