// Video pipeline handoff
//
// Transcoding itself is a separate subsystem; the indexer only posts newly
// discovered video paths to it. Paths are normalized and bounds-checked
// against the photo root before handoff.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{info, warn};

use crate::paths;

/// Contract with the video postprocessing pipeline.
pub trait VideoPipeline: Send + Sync {
    /// Enqueue freshly indexed videos. `thumbs_dir` is where poster frames
    /// land, mirroring the photo tree.
    fn enqueue(&self, rel_paths: Vec<String>, thumbs_dir: &Path);
}

/// Default pipeline used until a transcoder is wired in: logs and drops.
pub struct LoggingVideoPipeline;

impl VideoPipeline for LoggingVideoPipeline {
    fn enqueue(&self, rel_paths: Vec<String>, _thumbs_dir: &Path) {
        if !rel_paths.is_empty() {
            info!("Video pipeline handoff: {} new videos", rel_paths.len());
        }
    }
}

/// Test double collecting everything that was handed off.
#[derive(Default)]
pub struct RecordingVideoPipeline {
    pub enqueued: Mutex<Vec<String>>,
}

impl VideoPipeline for RecordingVideoPipeline {
    fn enqueue(&self, rel_paths: Vec<String>, _thumbs_dir: &Path) {
        self.enqueued.lock().unwrap().extend(rel_paths);
    }
}

/// Validate and normalize candidate video paths before handoff. Anything
/// that escapes the photo root is dropped with a warning.
pub fn sanitize_video_paths(photos_dir: &Path, candidates: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(candidates.len());
    for rel in candidates {
        let abs: PathBuf = paths::rel_to_abs(photos_dir, rel);
        match paths::normalize_rel(photos_dir, &abs) {
            Ok(normalized) => out.push(normalized),
            Err(e) => warn!("Dropping video path {}: {}", rel, e),
        }
    }
    out
}
