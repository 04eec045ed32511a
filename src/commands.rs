// Operator commands
//
// The console (and any transport layered on top) speaks in `CommandResponse`
// values. "Waiting" and "not ready" are successful responses carrying a status
// text; only real failures come back as errors.

use serde::Serialize;
use std::path::PathBuf;

use crate::recording::{
    CaptureError, CaptureHandle, CleanupReport, RecordingState, StartOutcome, StopOutcome,
};
use crate::session::{ExportError, ExportOutcome, NotReadyReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Waiting,
    Error,
}

/// Response to one operator command
#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<usize>,
}

impl CommandResponse {
    fn new(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            file_path: None,
            current: None,
            required: None,
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::Ok, message)
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::Waiting, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::Error, message)
    }

    /// Whether a caller should treat this as a failure
    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }
}

// ============================================================================
// Outcome mapping
// ============================================================================

pub fn start_response(result: Result<StartOutcome, CaptureError>) -> CommandResponse {
    match result {
        Ok(StartOutcome::Started) => CommandResponse::ok("Recording started"),
        Ok(StartOutcome::AlreadyActive { status }) => {
            CommandResponse::ok(format!("Already {}", status))
        }
        Ok(StartOutcome::WaitingForDevice) => {
            CommandResponse::waiting("Capture device not connected, waiting for it")
        }
        Err(e) => CommandResponse::error(e.to_string()),
    }
}

pub fn stop_response(result: Result<StopOutcome, CaptureError>) -> CommandResponse {
    match result {
        Ok(StopOutcome::Stopped) => CommandResponse::ok("Recording stopped"),
        Ok(StopOutcome::NothingToStop) => CommandResponse::ok("Not recording"),
        Err(e) => CommandResponse::error(e.to_string()),
    }
}

pub fn cleanup_response(result: Result<CleanupReport, CaptureError>) -> CommandResponse {
    match result {
        Ok(report) => CommandResponse::ok(format!(
            "Recording stopped, {} buffered segments removed",
            report.removed_files
        )),
        Err(e) => CommandResponse::error(e.to_string()),
    }
}

pub fn export_response(result: Result<ExportOutcome, ExportError>) -> CommandResponse {
    match result {
        Ok(ExportOutcome::Saved { path, segments }) => {
            let mut response =
                CommandResponse::ok(format!("Saved last {} segments", segments));
            response.file_path = Some(path);
            response
        }
        Ok(ExportOutcome::NotReady(reason)) => {
            let mut response = CommandResponse::waiting(reason.to_string());
            if let NotReadyReason::WarmingUp { current, required } = reason {
                response.current = Some(current);
                response.required = Some(required);
            }
            response
        }
        Err(e) => CommandResponse::error(e.to_string()),
    }
}

pub fn status_response(state: &RecordingState) -> CommandResponse {
    let mut message = format!("Status: {}", state.status);
    if state.waiting_for_device {
        message.push_str(" (waiting for device)");
    }
    if let Some(error) = &state.last_error {
        message.push_str(&format!(", last error: {}", error));
    }
    let mut response = CommandResponse::ok(message);
    response.current = Some(state.segments_in_window);
    response.required = Some(state.segments_required);
    response
}

// ============================================================================
// Console dispatch
// ============================================================================

/// A parsed console line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Save,
    Cleanup,
    Status,
    Device,
    AutoReconnect(bool),
    Quit,
    Help,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = match words.next()?.to_lowercase().as_str() {
            "start" => Command::Start,
            "stop" => Command::Stop,
            "save" | "export" => Command::Save,
            "cleanup" => Command::Cleanup,
            "status" => Command::Status,
            "device" => Command::Device,
            "auto" => match words.next()?.to_lowercase().as_str() {
                "on" | "true" | "1" => Command::AutoReconnect(true),
                "off" | "false" | "0" => Command::AutoReconnect(false),
                _ => return None,
            },
            "quit" | "exit" => Command::Quit,
            "help" | "?" => Command::Help,
            _ => return None,
        };
        Some(command)
    }
}

pub const HELP: &str =
    "commands: start | stop | save | cleanup | status | device | auto on|off | quit";

/// Run one command against the supervisor
pub async fn execute(handle: &CaptureHandle, command: Command) -> CommandResponse {
    match command {
        Command::Start => start_response(handle.start_recording().await),
        Command::Stop => stop_response(handle.stop_recording().await),
        Command::Save => export_response(handle.export_window().await),
        Command::Cleanup => cleanup_response(handle.cleanup_and_stop().await),
        Command::Status => status_response(&handle.state()),
        Command::Device => {
            if handle.is_device_connected().await {
                CommandResponse::ok("Capture device connected")
            } else {
                CommandResponse::waiting("Capture device not connected")
            }
        }
        Command::AutoReconnect(enabled) => match handle.set_auto_reconnect(enabled).await {
            Ok(enabled) => CommandResponse::ok(format!(
                "Auto-reconnect {}",
                if enabled { "enabled" } else { "disabled" }
            )),
            Err(e) => CommandResponse::error(e.to_string()),
        },
        Command::Help => CommandResponse::ok(HELP),
        Command::Quit => stop_response(handle.stop_recording().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingStatus;
    use crate::encoding::RemuxError;

    #[test]
    fn parses_console_lines() {
        assert_eq!(Command::parse("start"), Some(Command::Start));
        assert_eq!(Command::parse("  SAVE  "), Some(Command::Save));
        assert_eq!(Command::parse("auto off"), Some(Command::AutoReconnect(false)));
        assert_eq!(Command::parse("auto on"), Some(Command::AutoReconnect(true)));
        assert_eq!(Command::parse("auto"), None);
        assert_eq!(Command::parse("auto maybe"), None);
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("dance"), None);
    }

    #[test]
    fn waiting_is_not_an_error() {
        let response = start_response(Ok(StartOutcome::WaitingForDevice));
        assert_eq!(response.status, ResponseStatus::Waiting);
        assert!(!response.is_error());

        let response = export_response(Ok(ExportOutcome::NotReady(NotReadyReason::WarmingUp {
            current: 2,
            required: 5,
        })));
        assert_eq!(response.status, ResponseStatus::Waiting);
        assert_eq!(response.current, Some(2));
        assert_eq!(response.required, Some(5));
    }

    #[test]
    fn remux_failure_is_an_error() {
        let response = export_response(Err(ExportError::Remux(RemuxError::Failed {
            status: "exit status: 1".to_string(),
            diagnostic: "Invalid data".to_string(),
        })));
        assert!(response.is_error());
        assert!(response.message.contains("Invalid data"));
    }

    #[test]
    fn saved_export_carries_the_path() {
        let response = export_response(Ok(ExportOutcome::Saved {
            path: PathBuf::from("/out/recording.mp4"),
            segments: 120,
        }));
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.file_path, Some(PathBuf::from("/out/recording.mp4")));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["file_path"], "/out/recording.mp4");
        assert!(json.get("current").is_none());
    }

    #[test]
    fn already_active_is_ok() {
        let response = start_response(Ok(StartOutcome::AlreadyActive {
            status: RecordingStatus::Recording,
        }));
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.message, "Already recording");
    }
}
