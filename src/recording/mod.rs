// Recording modules

pub mod readiness;
pub mod segments;
pub mod supervisor;
pub mod watcher;
pub mod window;

pub use readiness::ReadinessGate;
pub use segments::{ReconcileReport, Segment, SegmentNaming, SegmentRegistry, TimestampSource};
pub use supervisor::{CaptureHandle, CaptureSupervisor, Collaborators};
pub use window::{count_in_window, playback_order, select_window};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current capture state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    /// No session
    Idle,
    /// Encoder spawned, waiting for it to report that it is running
    Starting,
    /// Encoder running and segments accumulating
    Recording,
    /// Device gone; the encoder is down and the buffer was discarded
    Disconnected,
    /// Tearing the session down
    Stopping,
}

impl RecordingStatus {
    /// Whether a session is up or on its way up
    pub fn is_active(&self) -> bool {
        matches!(self, RecordingStatus::Starting | RecordingStatus::Recording)
    }
}

impl std::fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordingStatus::Idle => "idle",
            RecordingStatus::Starting => "starting",
            RecordingStatus::Recording => "recording",
            RecordingStatus::Disconnected => "disconnected",
            RecordingStatus::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Snapshot of the supervisor, republished after every transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingState {
    pub status: RecordingStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// Whether the reconnection poll loop is running
    pub waiting_for_device: bool,
    pub auto_reconnect: bool,
    pub encoder_pid: Option<u32>,
    /// Segments in the trailing window at the last observation
    pub segments_in_window: usize,
    pub segments_required: usize,
    pub buffer_ready: bool,
    /// Incremented for every encoder launch
    pub generation: u64,
    pub last_error: Option<String>,
}

impl RecordingState {
    pub fn new(segments_required: usize, auto_reconnect: bool) -> Self {
        Self {
            status: RecordingStatus::Idle,
            started_at: None,
            waiting_for_device: false,
            auto_reconnect,
            encoder_pid: None,
            segments_in_window: 0,
            segments_required,
            buffer_ready: false,
            generation: 0,
            last_error: None,
        }
    }
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::new(1, true)
    }
}

/// Result of a start request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StartOutcome {
    /// Encoder launched; `Recording` follows once it reports in
    Started,
    /// A session is already up; nothing was spawned
    AlreadyActive { status: RecordingStatus },
    /// The device is absent; capture starts once it returns
    WaitingForDevice,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NothingToStop,
}

/// What `cleanup_and_stop` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub stopped: StopOutcome,
    pub removed_files: usize,
}

/// Failures surfaced to a caller of the capture API
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture supervisor is not running")]
    SupervisorGone,

    #[error("Failed to start encoder: {0}")]
    Spawn(#[from] crate::encoding::EncoderError),

    #[error("Buffer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Notifications broadcast by the supervisor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    StatusChanged { status: RecordingStatus },
    /// The readiness gate opened
    BufferReady { segments: usize },
    /// The encoder failed for a reason other than the device
    EncoderFailed { message: String, will_restart: bool },
    DeviceLost { reconnecting: bool },
    WaitingForDevice,
    DeviceRestored,
    ExportSaved { path: PathBuf, segments: usize },
    ExportFailed { message: String },
}
