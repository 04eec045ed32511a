// Export pipeline: turn the current trailing window into one saved replay
//
// The supervisor decides *what* to export (preconditions, reconciliation,
// window selection) and hands over an `ExportPlan`. This module does the
// blocking part: write the concat descriptor, run the remuxer, and clean up.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::storage;
use crate::encoding::{RemuxError, Remuxer};
use crate::recording::{RecordingStatus, Segment};

/// Why an export request was turned away. All of these are worth retrying.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NotReadyReason {
    /// No capture session is running
    NotRecording { status: RecordingStatus },
    /// The session has not been running long enough
    JustStarted { elapsed_ms: u64, required_ms: u64 },
    /// Not enough segments have accumulated in the window yet
    WarmingUp { current: usize, required: usize },
    /// The window came up empty, typically right after a reset
    EmptyWindow,
}

impl std::fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotReadyReason::NotRecording { status } => {
                write!(f, "not recording (status: {})", status)
            }
            NotReadyReason::JustStarted {
                elapsed_ms,
                required_ms,
            } => write!(
                f,
                "recording just started ({} of {} ms)",
                elapsed_ms, required_ms
            ),
            NotReadyReason::WarmingUp { current, required } => write!(
                f,
                "buffer warming up ({} of {} segments)",
                current, required
            ),
            NotReadyReason::EmptyWindow => write!(f, "no segments in the buffer window"),
        }
    }
}

/// Result of an export request that did not fail
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExportOutcome {
    Saved { path: PathBuf, segments: usize },
    NotReady(NotReadyReason),
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Remux failed: {0}")]
    Remux(#[from] RemuxError),

    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Export task failed: {0}")]
    Task(String),

    #[error("Capture supervisor is not running")]
    SupervisorGone,
}

/// Everything needed to produce one replay file
#[derive(Debug, Clone)]
pub struct ExportPlan {
    /// Completed window segments in recording order
    pub segments: Vec<Segment>,
    pub buffer_dir: PathBuf,
    pub output_dir: PathBuf,
    pub requested_at: DateTime<Utc>,
}

/// Concat descriptor that removes itself when dropped
struct DescriptorFile {
    path: PathBuf,
}

impl DescriptorFile {
    fn create(dir: &Path, segments: &[Segment]) -> std::io::Result<Self> {
        let path = dir.join(format!("filelist-{}.txt", uuid::Uuid::new_v4()));
        // Owned before the first write so a partial file is still cleaned up
        let descriptor = Self { path };
        let mut file = std::fs::File::create(&descriptor.path)?;
        file.write_all(descriptor_contents(segments).as_bytes())?;
        file.sync_all()?;
        Ok(descriptor)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DescriptorFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// One `file '<path>'` line per segment, in the given order
pub fn descriptor_contents(segments: &[Segment]) -> String {
    let mut contents = String::new();
    for segment in segments {
        contents.push_str("file '");
        contents.push_str(&escape_single_quotes(&segment.path.to_string_lossy()));
        contents.push_str("'\n");
    }
    contents
}

// The concat demuxer reads ' as '\'' inside a quoted path
fn escape_single_quotes(path: &str) -> String {
    path.replace('\'', r"'\''")
}

/// Write the descriptor, remux, and return the saved file. Blocking.
///
/// The descriptor is gone when this returns, whatever the outcome. A failed
/// remux also removes whatever partial output it left behind.
pub fn run_export(plan: &ExportPlan, remuxer: &dyn Remuxer) -> Result<ExportOutcome, ExportError> {
    if plan.segments.is_empty() {
        return Ok(ExportOutcome::NotReady(NotReadyReason::EmptyWindow));
    }

    std::fs::create_dir_all(&plan.output_dir)?;
    let output = storage::output_path_for(&plan.output_dir, plan.requested_at);

    let descriptor = DescriptorFile::create(&plan.buffer_dir, &plan.segments)?;
    log::info!(
        "[Export] Concatenating {} segments into {}",
        plan.segments.len(),
        output.display()
    );

    if let Err(e) = remuxer.concat(descriptor.path(), &output) {
        if output.exists() {
            if let Err(rm) = std::fs::remove_file(&output) {
                log::warn!("Failed to remove partial output {}: {}", output.display(), rm);
            }
        }
        log::error!("[Export] {}", e);
        return Err(e.into());
    }

    Ok(ExportOutcome::Saved {
        path: output,
        segments: plan.segments.len(),
    })
}
