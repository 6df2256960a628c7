// Content fingerprinting using BLAKE3
//
// Fingerprints disambiguate noisy duplicate `add` events in consolidation.
// Small files are hashed in full; large files are sampled head + tail with
// the length mixed in. The sampling can miss a mid-file mutation of a
// same-size file, which is acceptable for this use: the fingerprint only
// decides whether two adds of the same path are the same write.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Result, ShoeboxError};

/// Format: "blake3:full:<hash>"
pub fn full_fingerprint(path: &Path, chunk_size: usize) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| ShoeboxError::Other(format!("Failed to open file: {}", e)))?;

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; chunk_size.max(4096)];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| ShoeboxError::Other(format!("Failed to read: {}", e)))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("blake3:full:{}", hasher.finalize().to_hex()))
}

/// Format: "blake3:head_tail_size:<hash>" over the first and last
/// `sample_bytes` plus the file length.
pub fn sampled_fingerprint(path: &Path, sample_bytes: usize) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| ShoeboxError::Other(format!("Failed to open file: {}", e)))?;

    let file_size = file
        .metadata()
        .map_err(|e| ShoeboxError::Other(format!("Failed to get metadata: {}", e)))?
        .len();

    let mut hasher = blake3::Hasher::new();

    let head_len = sample_bytes.min(file_size as usize);
    let mut head = vec![0u8; head_len];
    file.read_exact(&mut head)
        .map_err(|e| ShoeboxError::Other(format!("Failed to read head: {}", e)))?;
    hasher.update(&head);

    if file_size > sample_bytes as u64 {
        let tail_offset = file_size.saturating_sub(sample_bytes as u64);
        file.seek(SeekFrom::Start(tail_offset))
            .map_err(|e| ShoeboxError::Other(format!("Failed to seek: {}", e)))?;

        let mut tail = vec![0u8; sample_bytes];
        file.read_exact(&mut tail)
            .map_err(|e| ShoeboxError::Other(format!("Failed to read tail: {}", e)))?;
        hasher.update(&tail);
    }

    hasher.update(&file_size.to_le_bytes());

    Ok(format!(
        "blake3:head_tail_size:{}",
        hasher.finalize().to_hex()
    ))
}

/// Fingerprint for an `add` event: full stream below the size threshold,
/// head+tail+length sampling above it. None when the file cannot be read
/// (it may already be gone again).
pub fn fingerprint_for_add(
    path: &Path,
    size_threshold: u64,
    sample_bytes: usize,
) -> Option<String> {
    let size = std::fs::metadata(path).ok()?.len();
    let result = if size <= size_threshold {
        full_fingerprint(path, sample_bytes)
    } else {
        sampled_fingerprint(path, sample_bytes)
    };
    result.ok()
}
