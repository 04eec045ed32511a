// External encoder collaborators
//
// Capture and export both shell out to ffmpeg:
// - encoder.rs runs the long-lived segmenting capture process
// - remux.rs runs the one-shot lossless concatenation for an export
// - presets.rs builds the command lines for both
//
// Whatever the encoder prints is classified here so the supervisor can tell a
// vanished or wedged capture device apart from an ordinary encoding failure.

pub mod encoder;
pub mod presets;
pub mod remux;

pub use encoder::{
    EncoderError, EncoderEvent, EncoderEventSink, EncoderHandle, EncoderLauncher, FfmpegLauncher,
};
pub use remux::{FfmpegRemuxer, RemuxError, Remuxer};

use serde::Serialize;

/// What an encoder failure says about the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The device is missing, busy, or failing I/O; wait for it to come back
    Device,
    /// Anything else
    Encoder,
}

/// Case-insensitive substring matcher over encoder diagnostics
#[derive(Debug, Clone)]
pub struct DiagnosticClassifier {
    patterns: Vec<String>,
}

impl DiagnosticClassifier {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// True if any line of `diagnostic` matches a device-failure pattern
    pub fn is_device_error(&self, diagnostic: &str) -> bool {
        let text = diagnostic.to_lowercase();
        self.patterns.iter().any(|p| text.contains(p.as_str()))
    }

    pub fn classify(&self, diagnostic: &str) -> FailureClass {
        if self.is_device_error(diagnostic) {
            FailureClass::Device
        } else {
            FailureClass::Encoder
        }
    }

    /// Classify a process exit. An exit we caused by stopping the encoder is
    /// never a device failure, whatever it printed on the way down.
    pub fn classify_exit(&self, killed: bool, diagnostic: &str) -> FailureClass {
        if killed {
            FailureClass::Encoder
        } else {
            self.classify(diagnostic)
        }
    }
}

/// One-off classification against an explicit pattern list
pub fn classify_diagnostic(patterns: &[String], diagnostic: &str) -> FailureClass {
    DiagnosticClassifier::new(patterns).classify(diagnostic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn classifier() -> DiagnosticClassifier {
        DiagnosticClassifier::new(&Config::default().device_error_patterns)
    }

    #[test]
    fn device_failures_are_recognised() {
        let c = classifier();
        for line in [
            "[video4linux2,v4l2 @ 0x55] Cannot open video device /dev/video0: No such file or directory",
            "/dev/video0: Device or resource busy",
            "[video4linux2,v4l2 @ 0x1] ioctl(VIDIOC_DQBUF): No such device",
            "Error reading frame: Input/output error",
            "/dev/video0: Permission denied",
        ] {
            assert_eq!(c.classify(line), FailureClass::Device, "{}", line);
        }
    }

    #[test]
    fn encoding_failures_are_not_device_failures() {
        let c = classifier();
        for line in [
            "Unknown encoder 'libx265'",
            "Error initializing output stream 0:0 -- Error while opening encoder",
            "Conversion failed!",
            "",
        ] {
            assert_eq!(c.classify(line), FailureClass::Encoder, "{}", line);
        }
    }

    #[test]
    fn matching_ignores_case() {
        let c = DiagnosticClassifier::new(["  Device Disconnected "]);
        assert!(c.is_device_error("WARNING: DEVICE DISCONNECTED while reading"));
    }

    #[test]
    fn intentional_kill_is_never_a_device_failure() {
        let c = classifier();
        let diag = "ioctl(VIDIOC_DQBUF): No such device";
        assert_eq!(c.classify_exit(true, diag), FailureClass::Encoder);
        assert_eq!(c.classify_exit(false, diag), FailureClass::Device);
    }

    #[test]
    fn empty_patterns_are_dropped() {
        let c = DiagnosticClassifier::new(["", "   "]);
        assert!(!c.is_device_error("anything at all"));
        assert_eq!(
            classify_diagnostic(&["busy".to_string()], "Device busy"),
            FailureClass::Device
        );
    }
}
