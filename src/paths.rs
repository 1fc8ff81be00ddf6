//! Path handling. The canonical in-memory form is POSIX relative: forward
//! slashes, no leading or trailing slash, no `.` or `..` components. The
//! remote API side uses absolute paths under the configured remote root,
//! where the root itself renders as the empty string.

use std::path::{Component, Path, PathBuf};

/// Convert an absolute filesystem path under `root` to canonical relative
/// form. Returns `None` for the root itself or paths outside it.
pub fn rel_from_fs(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for c in rel.components() {
        match c {
            Component::Normal(p) => parts.push(p.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Absolute filesystem location of a canonical relative path.
pub fn fs_path(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in rel.split('/') {
        out.push(part);
    }
    out
}

/// Nesting depth of a canonical relative path. Top-level entries have
/// depth 0.
pub fn depth(rel: &str) -> usize {
    rel.matches('/').count()
}

/// Normalize the configured remote folder: `""` and `"/"` both mean the
/// user's root and normalize to the empty string; anything else gets a
/// leading slash and no trailing slash.
pub fn normalize_remote_root(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// Remote API path for a canonical relative path. An empty `rel` names the
/// root itself, which the API expects as the bare root string.
pub fn api_path(remote_root: &str, rel: &str) -> String {
    if rel.is_empty() {
        remote_root.to_string()
    } else {
        format!("{remote_root}/{rel}")
    }
}

/// Canonical relative path for a remote `path_display`. Returns `None` for
/// the root itself and for paths outside the root. The root prefix is
/// matched case-insensitively because the store preserves creation case in
/// display paths.
pub fn rel_from_api(path_display: &str, remote_root: &str) -> Option<String> {
    if path_display.len() < remote_root.len() || !path_display.is_char_boundary(remote_root.len())
    {
        return None;
    }
    let (head, rest) = path_display.split_at(remote_root.len());
    if !head.eq_ignore_ascii_case(remote_root) {
        return None;
    }
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    if rest.is_empty() || (!remote_root.is_empty() && !path_display[remote_root.len()..].starts_with('/')) {
        None
    } else {
        Some(rest.to_string())
    }
}

/// True when `anc` is a proper path-prefix ancestor of `rel`.
pub fn is_ancestor(anc: &str, rel: &str) -> bool {
    rel.len() > anc.len() + 1 && rel.starts_with(anc) && rel.as_bytes()[anc.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel_from_fs_joins_with_forward_slashes() {
        let root = Path::new("/data/box");
        assert_eq!(
            rel_from_fs(Path::new("/data/box/a/b.txt"), root),
            Some("a/b.txt".to_string())
        );
        assert_eq!(rel_from_fs(root, root), None);
        assert_eq!(rel_from_fs(Path::new("/data/other/x"), root), None);
    }

    #[test]
    fn depth_counts_separators() {
        assert_eq!(depth("a"), 0);
        assert_eq!(depth("a/b"), 1);
        assert_eq!(depth("a/b/c.txt"), 2);
    }

    #[test]
    fn remote_root_normalization() {
        assert_eq!(normalize_remote_root(""), "");
        assert_eq!(normalize_remote_root("/"), "");
        assert_eq!(normalize_remote_root("/backup/"), "/backup");
        assert_eq!(normalize_remote_root("backup/photos"), "/backup/photos");
    }

    #[test]
    fn api_path_renders_root_as_empty() {
        assert_eq!(api_path("", ""), "");
        assert_eq!(api_path("", "a/b.txt"), "/a/b.txt");
        assert_eq!(api_path("/backup", ""), "/backup");
        assert_eq!(api_path("/backup", "a"), "/backup/a");
    }

    #[test]
    fn rel_from_api_strips_root() {
        assert_eq!(rel_from_api("/a/b.txt", ""), Some("a/b.txt".to_string()));
        assert_eq!(rel_from_api("/backup/a", "/backup"), Some("a".to_string()));
        assert_eq!(rel_from_api("/Backup/a", "/backup"), Some("a".to_string()));
        assert_eq!(rel_from_api("/backup", "/backup"), None);
        assert_eq!(rel_from_api("/backups/a", "/backup"), None);
        assert_eq!(rel_from_api("/", ""), None);
    }

    #[test]
    fn ancestor_is_proper_prefix() {
        assert!(is_ancestor("a", "a/b"));
        assert!(is_ancestor("a/b", "a/b/c"));
        assert!(!is_ancestor("a", "a"));
        assert!(!is_ancestor("a", "ab/c"));
        assert!(!is_ancestor("a/b", "a"));
    }
}
