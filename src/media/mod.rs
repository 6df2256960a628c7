// Media classification and dimension probing

pub mod dimcache;

pub use dimcache::DimensionCache;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::constants::{
    PHOTO_EXTENSIONS, REJECTED_EXTENSIONS, SENTINEL_DIMENSION, VIDEO_EXTENSIONS,
};
use crate::error::{Result, ShoeboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Album,
    Photo,
    Video,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Album => "album",
            ItemKind::Photo => "photo",
            ItemKind::Video => "video",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "album" => Some(ItemKind::Album),
            "photo" => Some(ItemKind::Photo),
            "video" => Some(ItemKind::Video),
            _ => None,
        }
    }

    pub fn is_media(&self) -> bool {
        !matches!(self, ItemKind::Album)
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// Classify a file path by extension. None for anything the catalog does
/// not index.
pub fn classify_file(path: &Path) -> Option<ItemKind> {
    let ext = extension_of(path)?;
    if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
        Some(ItemKind::Photo)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(ItemKind::Video)
    } else {
        None
    }
}

/// Transcoder output and database files must never re-enter the index; the
/// watcher would loop on our own writes.
pub fn is_rejected_file(path: &Path) -> bool {
    match extension_of(path) {
        Some(ext) => REJECTED_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: i64,
    pub height: i64,
}

impl Dimensions {
    /// Fallback when a file cannot be opened or parsed; indexing proceeds
    /// and the dimension backfill repairs the row later.
    pub fn sentinel() -> Self {
        Self {
            width: SENTINEL_DIMENSION,
            height: SENTINEL_DIMENSION,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.width <= SENTINEL_DIMENSION && self.height <= SENTINEL_DIMENSION
    }
}

/// Probe the pixel dimensions of a media file.
pub fn probe_dimensions(path: &Path, kind: ItemKind) -> Result<Dimensions> {
    match kind {
        ItemKind::Photo => probe_image(path),
        ItemKind::Video => probe_video(path),
        ItemKind::Album => Err(ShoeboxError::Validation(
            "albums have no dimensions".into(),
        )),
    }
}

fn probe_image(path: &Path) -> Result<Dimensions> {
    let size = imagesize::size(path)
        .map_err(|e| ShoeboxError::Probe(format!("{}: {}", path.display(), e)))?;
    Ok(Dimensions {
        width: size.width as i64,
        height: size.height as i64,
    })
}

/// Locate the ffprobe binary: `SHOEBOX_FFPROBE_PATH` override, then a
/// sidecar next to the server executable (or its `bin/`), then PATH.
fn ffprobe_path() -> PathBuf {
    if let Some(raw) = std::env::var_os("SHOEBOX_FFPROBE_PATH") {
        let override_path = PathBuf::from(raw);
        if override_path.exists() {
            return override_path;
        }
    }

    let name = if cfg!(windows) { "ffprobe.exe" } else { "ffprobe" };
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        for candidate in [exe_dir.join(name), exe_dir.join("bin").join(name)] {
            if candidate.exists() {
                return candidate;
            }
        }
    }

    PathBuf::from(name)
}

/// Whether a runnable ffprobe was found. Probed once per process; without
/// it every video indexes with sentinel dimensions, which the health
/// surface reports.
pub fn ffprobe_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        Command::new(ffprobe_path())
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    })
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
}

/// Run ffprobe and take the first video stream's dimensions.
fn probe_video(path: &Path) -> Result<Dimensions> {
    let output = Command::new(ffprobe_path())
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-select_streams",
            "v",
        ])
        .arg(path)
        .output()
        .map_err(|e| ShoeboxError::Probe(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ShoeboxError::Probe(format!("ffprobe failed: {}", stderr)));
    }

    let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| ShoeboxError::Probe(format!("Failed to parse ffprobe output: {}", e)))?;

    for stream in probe.streams.unwrap_or_default() {
        if stream.codec_type.as_deref() == Some("video") {
            if let (Some(w), Some(h)) = (stream.width, stream.height) {
                if w >= 1 && h >= 1 {
                    return Ok(Dimensions {
                        width: w,
                        height: h,
                    });
                }
            }
        }
    }

    Err(ShoeboxError::Probe(format!(
        "no video stream in {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_file() {
        assert_eq!(classify_file(Path::new("a/x.jpg")), Some(ItemKind::Photo));
        assert_eq!(classify_file(Path::new("a/x.JPG")), Some(ItemKind::Photo));
        assert_eq!(classify_file(Path::new("a/x.mp4")), Some(ItemKind::Video));
        assert_eq!(classify_file(Path::new("a/x.txt")), None);
        assert_eq!(classify_file(Path::new("a/noext")), None);
    }

    #[test]
    fn test_rejected_files() {
        // HLS output and database files are never indexable
        assert!(is_rejected_file(Path::new("stream.m3u8")));
        assert!(is_rejected_file(Path::new("seg-001.ts")));
        assert!(is_rejected_file(Path::new("main.db")));
        assert!(is_rejected_file(Path::new("upload.tmp")));
        assert!(!is_rejected_file(Path::new("x.jpg")));
    }

    #[test]
    fn test_ffprobe_path_env_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let fake = dir.path().join("ffprobe");
        std::fs::write(&fake, b"").unwrap();

        std::env::set_var("SHOEBOX_FFPROBE_PATH", &fake);
        assert_eq!(ffprobe_path(), fake);
        std::env::remove_var("SHOEBOX_FFPROBE_PATH");

        // Without the override (and no sidecar) the resolver falls back to
        // a bare name for PATH lookup.
        let resolved = ffprobe_path();
        assert!(resolved.file_name().is_some());
    }

    #[test]
    fn test_probe_image_png() {
        // Smallest valid PNG header imagesize can read
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.png");
        // 1x1 PNG
        let png: &[u8] = &[
            0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48,
            0x44, 0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00,
            0x00, 0x1F, 0x15, 0xC4, 0x89,
        ];
        std::fs::write(&path, png).unwrap();

        let dims = probe_image(&path).unwrap();
        assert_eq!(
            dims,
            Dimensions {
                width: 1,
                height: 1
            }
        );
    }

    #[test]
    fn test_probe_image_garbage_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.jpg");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(probe_image(&path).is_err());
    }
}
