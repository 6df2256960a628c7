// Photo tree walk
//
// Lazy, deterministic traversal of the photo root: preorder DFS with
// siblings sorted by name, hidden and system directories pruned, only
// supported media files yielded. The order matches `paths::walk_order_cmp`
// so a resume cursor can be compared against any entry.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::debug;
use walkdir::{DirEntry, WalkDir};

use crate::constants::IGNORED_DIRS;
use crate::media::{classify_file, ItemKind};
use crate::paths;

#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub rel: String,
    pub abs: PathBuf,
    pub kind: ItemKind,
    pub mtime_ms: i64,
}

fn is_hidden_or_system(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() {
        name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref())
    } else {
        name.starts_with('.')
    }
}

pub fn mtime_ms_of(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Lazy iterator over albums and media under the photo root, in walk order.
pub fn walk_media(photos_dir: &Path) -> impl Iterator<Item = WalkEntry> + '_ {
    WalkDir::new(photos_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden_or_system(e))
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("Walk error: {}", e);
                    return None;
                }
            };

            let kind = if entry.file_type().is_dir() {
                ItemKind::Album
            } else if entry.file_type().is_file() {
                classify_file(entry.path())?
            } else {
                return None;
            };

            let rel = paths::normalize_rel(photos_dir, entry.path()).ok()?;
            let mtime_ms = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            Some(WalkEntry {
                rel,
                abs: entry.path().to_path_buf(),
                kind,
                mtime_ms,
            })
        })
}

/// Count all indexable entries; the prescan that sizes `total_files`.
pub fn prescan_count(photos_dir: &Path) -> u64 {
    walk_media(photos_dir).count() as u64
}
