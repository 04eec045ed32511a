// Buffer and output directory management

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::recording::SegmentNaming;

/// Timestamp layout used in saved replay names, e.g. 2026-02-21T14-32-45-123Z
const OUTPUT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

const OUTPUT_PREFIX: &str = "recording-";
const OUTPUT_EXTENSION: &str = "mp4";

/// Create the buffer and output directories if they do not exist
pub fn ensure_dirs(buffer_dir: &Path, output_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(buffer_dir)?;
    std::fs::create_dir_all(output_dir)?;
    Ok(())
}

/// Segment files currently in the buffer directory. A missing directory is
/// treated as empty.
pub fn list_segment_files(buffer_dir: &Path, naming: &SegmentNaming) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(buffer_dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Cannot list {}: {}", buffer_dir.display(), e);
            }
            return Vec::new();
        }
    };

    entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| naming.is_segment(name))
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect()
}

/// Delete every segment file in the buffer directory. Files that cannot be
/// removed are logged and skipped. Returns how many were removed.
pub fn remove_segment_files(buffer_dir: &Path, naming: &SegmentNaming) -> usize {
    let mut removed = 0;
    for path in list_segment_files(buffer_dir, naming) {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            // The encoder's wraparound or a concurrent cleanup got there first
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove segment {}: {}", path.display(), e),
        }
    }
    if removed > 0 {
        log::debug!("Removed {} segment files from {}", removed, buffer_dir.display());
    }
    removed
}

/// Output file for an export taken at `timestamp`. Appends `-1`, `-2`, ...
/// when a file of that name already exists.
pub fn output_path_for(output_dir: &Path, timestamp: DateTime<Utc>) -> PathBuf {
    let stem = format!("{}{}", OUTPUT_PREFIX, timestamp.format(OUTPUT_TIMESTAMP_FORMAT));
    let candidate = output_dir.join(format!("{}.{}", stem, OUTPUT_EXTENSION));
    if !candidate.exists() {
        return candidate;
    }

    let mut n = 1u32;
    loop {
        let candidate = output_dir.join(format!("{}-{}.{}", stem, n, OUTPUT_EXTENSION));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
