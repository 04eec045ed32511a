// Operator notifications

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::recording::{RecordingStatus, SupervisorEvent};

/// Log supervisor events as operator-facing messages until the supervisor goes away
///
/// `segment_duration` converts saved segment counts into footage length.
pub fn spawn_event_logger(
    mut events: broadcast::Receiver<SupervisorEvent>,
    segment_duration: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(message) = describe(&event, segment_duration) {
                        log::info!("[Kiosk] {}", message);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    log::debug!("Event logger fell behind, {} events dropped", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Human-readable text for an event. Transient states are not worth a line.
pub fn describe(event: &SupervisorEvent, segment_duration: Duration) -> Option<String> {
    let message = match event {
        SupervisorEvent::StatusChanged { status } => match status {
            RecordingStatus::Recording => "Recording".to_string(),
            RecordingStatus::Idle => "Recording stopped".to_string(),
            RecordingStatus::Disconnected => "Capture device disconnected".to_string(),
            RecordingStatus::Starting | RecordingStatus::Stopping => return None,
        },
        SupervisorEvent::BufferReady { segments } => {
            format!("Replay buffer ready ({} segments)", segments)
        }
        SupervisorEvent::EncoderFailed {
            message,
            will_restart,
        } => {
            if *will_restart {
                format!("Encoder error, restarting: {}", message)
            } else {
                format!("Encoder error: {}", message)
            }
        }
        SupervisorEvent::DeviceLost { reconnecting } => {
            if *reconnecting {
                "Capture device lost, will reconnect when it returns".to_string()
            } else {
                "Capture device lost".to_string()
            }
        }
        SupervisorEvent::WaitingForDevice => "Waiting for capture device".to_string(),
        SupervisorEvent::DeviceRestored => "Capture device reconnected".to_string(),
        SupervisorEvent::ExportSaved { path, segments } => format!(
            "Replay saved: {} ({} of footage)",
            path.display(),
            format_duration(segment_duration * *segments as u32)
        ),
        SupervisorEvent::ExportFailed { message } => format!("Replay save failed: {}", message),
    };
    Some(message)
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("{}:{:02}", mins, secs)
    }
}
