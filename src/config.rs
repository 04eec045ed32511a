// Configuration management for Kiosk Replay

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the configured capture device node
pub const VIDEO_DEVICE_ENV: &str = "VIDEO_DEVICE";

/// Application configuration. Any field missing from the file takes its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture device node (e.g. /dev/video0)
    pub device: PathBuf,

    /// Directory holding the rolling segment files.
    /// Defaults to shared memory so the constant churn never touches the disk.
    pub buffer_dir: PathBuf,

    /// Directory where saved replays are written
    pub output_dir: PathBuf,

    /// Length of the rolling window in seconds ("the last minute")
    pub buffer_duration_secs: u32,

    /// Duration of one segment written by the encoder
    pub segment_duration_secs: f64,

    /// Segment file name prefix (files are `<prefix>NNN.<extension>`)
    #[serde(default = "default_segment_prefix")]
    pub segment_prefix: String,

    /// Segment container extension
    #[serde(default = "default_segment_extension")]
    pub segment_extension: String,

    /// Number of segments inside the window before a save is allowed
    #[serde(default = "default_min_segments")]
    pub min_segments_required: usize,

    /// Minimum time a session must have been recording before a save is allowed
    #[serde(default = "default_min_recording_ms")]
    pub min_recording_ms: u64,

    /// Interval between device presence probes (while recording and while waiting)
    #[serde(default = "default_device_poll_interval_ms")]
    pub device_poll_interval_ms: u64,

    /// Consecutive probe results needed before the device is considered lost/returned
    #[serde(default = "default_debounce_polls")]
    pub debounce_polls: u32,

    /// Delay between the device reappearing and capture restarting
    #[serde(default = "default_reconnect_settle_ms")]
    pub reconnect_settle_ms: u64,

    /// Delay before restarting after a non-device encoder failure
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Interval between buffer directory scans
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,

    /// Upper bound on waiting for the encoder to exit after a stop request
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Whether to wait for the device and resume capture after a disconnect
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Whether to restart the encoder after a failure unrelated to the device
    #[serde(default = "default_true")]
    pub restart_on_encoder_error: bool,

    /// Encoder diagnostic fragments (case-insensitive) that mean the device itself failed
    #[serde(default = "default_device_error_patterns")]
    pub device_error_patterns: Vec<String>,

    /// External encoder settings
    #[serde(default)]
    pub encoder: EncoderSettings,
}

/// Settings passed to the external encoder process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Encoder binary (resolved through PATH when not absolute)
    pub ffmpeg_path: PathBuf,
    /// Input demuxer for the capture device
    pub input_format: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub video_codec: String,
    pub bitrate: String,
    /// x264 speed preset
    pub preset: String,
    /// How the encoder is stopped
    #[serde(default)]
    pub stop_policy: StopPolicy,
}

/// How a running encoder is brought down
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum StopPolicy {
    /// Kill immediately; nothing depends on the encoder flushing its last frames
    #[default]
    Kill,
    /// Ask the encoder to quit, then kill it after `grace_ms`
    Graceful { grace_ms: u64 },
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            input_format: "v4l2".to_string(),
            width: 1280,
            height: 720,
            framerate: 30,
            video_codec: "libx264".to_string(),
            bitrate: "2500k".to_string(),
            preset: "ultrafast".to_string(),
            stop_policy: StopPolicy::Kill,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            buffer_dir: PathBuf::from("/dev/shm/buffer"),
            output_dir: get_default_output_dir(),
            buffer_duration_secs: 60,
            segment_duration_secs: 0.5,
            segment_prefix: default_segment_prefix(),
            segment_extension: default_segment_extension(),
            min_segments_required: default_min_segments(),
            min_recording_ms: default_min_recording_ms(),
            device_poll_interval_ms: default_device_poll_interval_ms(),
            debounce_polls: default_debounce_polls(),
            reconnect_settle_ms: default_reconnect_settle_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            watch_interval_ms: default_watch_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            auto_reconnect: true,
            restart_on_encoder_error: true,
            device_error_patterns: default_device_error_patterns(),
            encoder: EncoderSettings::default(),
        }
    }
}

impl Config {
    /// Load config from disk or return default.
    /// `VIDEO_DEVICE` in the environment wins over the file.
    pub fn load_or_default(path: &Path) -> Self {
        let mut config = Self::load_file(path).unwrap_or_default();
        if let Some(device) = std::env::var_os(VIDEO_DEVICE_ENV) {
            if !device.is_empty() {
                config.device = PathBuf::from(device);
            }
        }
        config
    }

    fn load_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => Some(config),
                Err(e) => {
                    log::warn!("Failed to parse config {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read config file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// Reject settings the supervisor cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.segment_duration_secs > 0.0) {
            anyhow::bail!("segment_duration_secs must be positive");
        }
        if (self.buffer_duration_secs as f64) < self.segment_duration_secs {
            anyhow::bail!(
                "buffer_duration_secs ({}) is shorter than one segment ({}s)",
                self.buffer_duration_secs,
                self.segment_duration_secs
            );
        }
        if self.min_segments_required == 0 {
            anyhow::bail!("min_segments_required must be at least 1");
        }
        if self.segment_prefix.is_empty() || self.segment_extension.is_empty() {
            anyhow::bail!("segment_prefix and segment_extension must not be empty");
        }
        Ok(())
    }

    /// Number of segment files before the encoder wraps back to zero
    pub fn segment_wrap(&self) -> u32 {
        (self.buffer_duration_secs as f64 / self.segment_duration_secs).ceil() as u32
    }

    pub fn buffer_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.buffer_duration_secs as i64)
    }

    /// Minimum mtime jump that marks a segment file as rewritten after wraparound
    pub fn rewrite_gap(&self) -> Duration {
        Duration::from_secs_f64((self.segment_duration_secs * 2.0).max(1.0))
    }

    pub fn min_recording(&self) -> Duration {
        Duration::from_millis(self.min_recording_ms)
    }

    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_millis(self.device_poll_interval_ms.max(1))
    }

    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kiosk-replay")
        .join("config.toml")
}

/// Get the default directory for saved replays
fn get_default_output_dir() -> PathBuf {
    dirs::video_dir()
        .map(|d| d.join("KioskReplay"))
        .unwrap_or_else(|| PathBuf::from("recordings"))
}

fn default_segment_prefix() -> String {
    "segment".to_string()
}

fn default_segment_extension() -> String {
    "mp4".to_string()
}

fn default_min_segments() -> usize {
    5
}

fn default_min_recording_ms() -> u64 {
    5000
}

fn default_device_poll_interval_ms() -> u64 {
    1000
}

fn default_debounce_polls() -> u32 {
    1
}

fn default_reconnect_settle_ms() -> u64 {
    1000
}

fn default_restart_delay_ms() -> u64 {
    2000
}

fn default_watch_interval_ms() -> u64 {
    250
}

fn default_stop_timeout_ms() -> u64 {
    2000
}

/// Default true value (for serde)
fn default_true() -> bool {
    true
}

fn default_device_error_patterns() -> Vec<String> {
    [
        "no such file or directory",
        "no such device",
        "device or resource busy",
        "input/output error",
        "cannot open video device",
        "connection refused",
        "permission denied",
        "vidioc_",
        "device disconnected",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
