// Lossless concatenation of buffered segments into one container

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::presets;

/// Number of trailing stderr lines kept in a remux failure
const DIAGNOSTIC_TAIL_LINES: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum RemuxError {
    #[error("Failed to run remuxer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Remuxer exited with {status}: {diagnostic}")]
    Failed { status: String, diagnostic: String },

    #[error("Remuxer produced no output at {}", .0.display())]
    NoOutput(PathBuf),
}

/// Stream-copies the segments listed in a concat descriptor into `output`.
///
/// Blocking; callers run it on the blocking pool.
pub trait Remuxer: Send + Sync + 'static {
    fn concat(&self, list_file: &Path, output: &Path) -> Result<(), RemuxError>;
}

/// ffmpeg concat demuxer with `-c copy`
pub struct FfmpegRemuxer {
    ffmpeg_path: PathBuf,
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg_path: PathBuf) -> Self {
        Self { ffmpeg_path }
    }
}

impl Remuxer for FfmpegRemuxer {
    fn concat(&self, list_file: &Path, output: &Path) -> Result<(), RemuxError> {
        let args = presets::concat_args(list_file, output);
        log::debug!(
            "Remuxing: {} {}",
            self.ffmpeg_path.display(),
            args.join(" ")
        );

        let result = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(RemuxError::Spawn)?;

        if !result.status.success() {
            return Err(RemuxError::Failed {
                status: result.status.to_string(),
                diagnostic: stderr_tail(&result.stderr),
            });
        }

        // ffmpeg can exit 0 without writing anything if every input was skipped
        match std::fs::metadata(output) {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(RemuxError::NoOutput(output.to_path_buf())),
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    lines[start..].join("\n")
}
