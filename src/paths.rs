// Path normalization and ordering
//
// Catalog paths are POSIX-normalized relative paths: forward slashes, no
// leading separator, no `.`/`..` segments, always contained in the photo
// root. Albums are directories; the root itself is not an item.

use std::cmp::Ordering;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, ShoeboxError};

/// Normalize an absolute path to a catalog-relative POSIX path. Rejects
/// paths outside the root and any `..` traversal.
pub fn normalize_rel(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        ShoeboxError::Validation(format!("path outside photo root: {}", path.display()))
    })?;

    let mut parts: Vec<String> = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(p) => parts.push(p.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(ShoeboxError::Validation(format!(
                    "unsupported path segment in {}",
                    path.display()
                )))
            }
        }
    }

    if parts.is_empty() {
        return Err(ShoeboxError::Validation("path is the photo root".into()));
    }
    Ok(parts.join("/"))
}

pub fn rel_to_abs(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in rel.split('/') {
        out.push(part);
    }
    out
}

/// File name portion of a relative path.
pub fn basename(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

/// Ancestor album paths of a relative path, nearest last. For "a/b/c.jpg"
/// this is ["a", "a/b"]; the root has no row and is not included.
pub fn parent_albums(rel: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut prefix = String::new();
    let parts: Vec<&str> = rel.split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(part);
        out.push(prefix.clone());
    }
    out
}

/// Cache-tag chain for a path: the root tag plus one per ancestor album and
/// one for the containing album of the path itself if it is a directory.
/// For "a/b/c.jpg": ["album:/", "album:/a", "album:/a/b"].
pub fn album_tag_chain(rel: &str) -> Vec<String> {
    let mut tags = vec!["album:/".to_string()];
    for album in parent_albums(rel) {
        tags.push(format!("album:/{}", album));
    }
    tags
}

/// Escape LIKE wildcards in a literal path so it can be used with
/// `LIKE ? ESCAPE '\'` prefix patterns.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Compare two relative paths in deterministic walk order: preorder DFS
/// with siblings sorted by name. Component-wise byte comparison gives
/// exactly that order ("b" < "b.txt" and "b" before "b/x").
pub fn walk_order_cmp(a: &str, b: &str) -> Ordering {
    let mut ia = a.split('/');
    let mut ib = b.split('/');
    loop {
        match (ia.next(), ib.next()) {
            (Some(ca), Some(cb)) => match ca.cmp(cb) {
                Ordering::Equal => continue,
                other => return other,
            },
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rejects_outside_root() {
        let root = Path::new("/photos");
        assert!(normalize_rel(root, Path::new("/etc/passwd")).is_err());
        assert!(normalize_rel(root, Path::new("/photos")).is_err());
        assert_eq!(
            normalize_rel(root, Path::new("/photos/a/b.jpg")).unwrap(),
            "a/b.jpg"
        );
    }

    #[test]
    fn test_parent_albums() {
        assert_eq!(parent_albums("a/b/c.jpg"), vec!["a", "a/b"]);
        assert!(parent_albums("top.jpg").is_empty());
    }

    #[test]
    fn test_album_tag_chain() {
        assert_eq!(
            album_tag_chain("a/b/c.jpg"),
            vec!["album:/", "album:/a", "album:/a/b"]
        );
        assert_eq!(album_tag_chain("top.jpg"), vec!["album:/"]);
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a/b"), "a/b");
        assert_eq!(escape_like("100%_done"), "100\\%\\_done");
    }

    #[test]
    fn test_walk_order() {
        // A directory sorts before a sibling whose name extends it, and its
        // contents stay contiguous.
        assert_eq!(walk_order_cmp("b", "b.txt"), Ordering::Less);
        assert_eq!(walk_order_cmp("b/x", "b.txt"), Ordering::Less);
        assert_eq!(walk_order_cmp("b", "b/x"), Ordering::Less);
        assert_eq!(walk_order_cmp("a/2.jpg", "a/10.jpg"), Ordering::Greater);
        assert_eq!(walk_order_cmp("a", "a"), Ordering::Equal);
    }
}
