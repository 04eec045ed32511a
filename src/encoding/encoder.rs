// External encoder process supervision
//
// The capture encoder is a separate process (ffmpeg). This module spawns it,
// forwards every stderr line as a diagnostic, reports when it exits, and
// brings it down on request. Everything the process does is reported through
// an `EncoderEventSink`; the caller never polls.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::{EncoderSettings, StopPolicy};

use super::presets;

/// Number of stderr lines kept for the exit report
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// How long to keep reading stderr after the process is gone
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Error type for encoder process operations
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Failed to spawn encoder: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Encoder {0} pipe was not captured")]
    MissingPipe(&'static str),
}

/// Lifecycle events of one encoder process
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    /// The process is running
    Started { pid: Option<u32> },
    /// One line the process wrote to stderr
    Diagnostic(String),
    /// The process is gone. `killed` is set when we asked it to stop.
    Exited {
        success: bool,
        killed: bool,
        diagnostic: String,
    },
}

/// Callback through which an encoder reports its events
#[derive(Clone)]
pub struct EncoderEventSink {
    emit: Arc<dyn Fn(EncoderEvent) + Send + Sync>,
}

impl EncoderEventSink {
    pub fn new(emit: impl Fn(EncoderEvent) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn emit(&self, event: EncoderEvent) {
        (self.emit)(event)
    }
}

/// Owner's side of a running encoder.
///
/// Dropping the handle without calling `terminate` kills the process.
pub struct EncoderHandle {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<StopPolicy>>,
    exited_rx: Option<oneshot::Receiver<()>>,
}

impl EncoderHandle {
    /// `stop_tx` delivers the stop request to whatever drives the process;
    /// `exited_rx` fires once the process is gone.
    pub fn new(
        pid: Option<u32>,
        stop_tx: oneshot::Sender<StopPolicy>,
        exited_rx: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            pid,
            stop_tx: Some(stop_tx),
            exited_rx: Some(exited_rx),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request a stop without waiting for the process to exit
    pub fn signal(&mut self, policy: StopPolicy) {
        if let Some(tx) = self.stop_tx.take() {
            // The process may already be gone
            let _ = tx.send(policy);
        }
    }

    /// Request a stop and wait up to `timeout` for the process to be gone.
    /// Returns false if the exit was not confirmed in time.
    pub async fn terminate(mut self, policy: StopPolicy, timeout: Duration) -> bool {
        self.signal(policy);
        match self.exited_rx.take() {
            Some(rx) => match tokio::time::timeout(timeout, rx).await {
                Ok(_) => true,
                Err(_) => {
                    log::warn!("Encoder {:?} did not exit within {:?}", self.pid, timeout);
                    false
                }
            },
            None => true,
        }
    }
}

/// Starts encoder processes
pub trait EncoderLauncher: Send + Sync + 'static {
    /// Spawn a new encoder. `Started` must be emitted through `sink` once the
    /// process is running.
    fn launch(&self, sink: EncoderEventSink) -> Result<EncoderHandle, EncoderError>;
}

/// Launches the ffmpeg capture process
pub struct FfmpegLauncher {
    settings: EncoderSettings,
    args: Vec<String>,
}

impl FfmpegLauncher {
    pub fn new(
        settings: EncoderSettings,
        device: PathBuf,
        segment_duration_secs: f64,
        segment_wrap: u32,
        output_pattern: PathBuf,
    ) -> Self {
        let args = presets::capture_args(
            &settings,
            &device,
            segment_duration_secs,
            segment_wrap,
            &output_pattern,
        );
        Self { settings, args }
    }
}

impl EncoderLauncher for FfmpegLauncher {
    fn launch(&self, sink: EncoderEventSink) -> Result<EncoderHandle, EncoderError> {
        let mut command = Command::new(&self.settings.ffmpeg_path);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!(
            "Spawning encoder: {} {}",
            self.settings.ffmpeg_path.display(),
            self.args.join(" ")
        );

        let mut child = command.spawn()?;
        let stderr = child.stderr.take().ok_or(EncoderError::MissingPipe("stderr"))?;
        let stdin = child.stdin.take();
        let pid = child.id();

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();

        log::info!("[Encoder] Started (pid {:?})", pid);
        sink.emit(EncoderEvent::Started { pid });

        tokio::spawn(drive_process(child, stdin, stderr, stop_rx, exited_tx, sink));

        Ok(EncoderHandle::new(pid, stop_tx, exited_rx))
    }
}

/// Own the child until it exits: relay stderr, honour stop requests, report the exit.
async fn drive_process(
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    stderr: ChildStderr,
    mut stop_rx: oneshot::Receiver<StopPolicy>,
    exited_tx: oneshot::Sender<()>,
    sink: EncoderEventSink,
) {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);
    let mut stderr_open = true;
    let mut stop_requested = false;
    let mut kill_deadline: Option<Instant> = None;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,

            line = lines.next_line(), if stderr_open => match line {
                Ok(Some(line)) => relay_line(line, &mut tail, &sink),
                _ => stderr_open = false,
            },

            // A dropped handle counts as a kill request
            policy = &mut stop_rx, if !stop_requested => {
                stop_requested = true;
                match policy.unwrap_or(StopPolicy::Kill) {
                    StopPolicy::Kill => {
                        if let Err(e) = child.start_kill() {
                            log::debug!("Encoder kill failed (already exited?): {}", e);
                        }
                    }
                    StopPolicy::Graceful { grace_ms } => {
                        // ffmpeg quits cleanly on 'q'
                        if let Some(mut pipe) = stdin.take() {
                            let _ = pipe.write_all(b"q\n").await;
                            let _ = pipe.flush().await;
                        }
                        kill_deadline = Some(Instant::now() + Duration::from_millis(grace_ms));
                    }
                }
            },

            _ = tokio::time::sleep_until(kill_deadline.unwrap_or_else(Instant::now)),
                if kill_deadline.is_some() =>
            {
                kill_deadline = None;
                log::warn!("Encoder ignored quit request, killing");
                let _ = child.start_kill();
            }
        }
    };

    // The final error message is usually written right before exit
    while stderr_open {
        match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(line))) => relay_line(line, &mut tail, &sink),
            _ => stderr_open = false,
        }
    }

    let (success, description) = match &status {
        Ok(status) => (status.success(), status.to_string()),
        Err(e) => (false, format!("wait failed: {}", e)),
    };
    log::info!(
        "[Encoder] Exited ({}){}",
        description,
        if stop_requested { " after stop request" } else { "" }
    );

    sink.emit(EncoderEvent::Exited {
        success,
        killed: stop_requested,
        diagnostic: tail.into_iter().collect::<Vec<_>>().join("\n"),
    });
    let _ = exited_tx.send(());
}

fn relay_line(line: String, tail: &mut VecDeque<String>, sink: &EncoderEventSink) {
    let line = line.trim_end().to_string();
    if line.is_empty() {
        return;
    }
    if tail.len() == DIAGNOSTIC_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line.clone());
    sink.emit(EncoderEvent::Diagnostic(line));
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording_sink() -> (EncoderEventSink, Arc<Mutex<Vec<EncoderEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let sink = EncoderEventSink::new(move |e| events_clone.lock().push(e));
        (sink, events)
    }

    /// Launcher that runs `sh -c <script>` through the ffmpeg driver
    fn shell_launcher(script: &str) -> FfmpegLauncher {
        FfmpegLauncher {
            settings: EncoderSettings {
                ffmpeg_path: PathBuf::from("sh"),
                ..EncoderSettings::default()
            },
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[tokio::test]
    async fn reports_stderr_and_failed_exit() {
        let (sink, events) = recording_sink();
        let launcher = shell_launcher("echo '/dev/video0: No such device' >&2; exit 1");
        let _handle = launcher.launch(sink).unwrap();

        // Let it exit on its own
        for _ in 0..500 {
            if matches!(events.lock().last(), Some(EncoderEvent::Exited { .. })) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let events = events.lock();
        assert!(matches!(events[0], EncoderEvent::Started { .. }));
        assert!(events.contains(&EncoderEvent::Diagnostic(
            "/dev/video0: No such device".to_string()
        )));
        match events.last().unwrap() {
            EncoderEvent::Exited {
                success,
                killed,
                diagnostic,
            } => {
                assert!(!success);
                assert!(!killed);
                assert!(diagnostic.contains("No such device"));
            }
            other => panic!("unexpected last event {:?}", other),
        };
    }

    #[tokio::test]
    async fn kill_stops_a_running_process() {
        let (sink, events) = recording_sink();
        let launcher = shell_launcher("sleep 30");
        let handle = launcher.launch(sink).unwrap();
        assert!(handle.pid().is_some());

        assert!(handle.terminate(StopPolicy::Kill, Duration::from_secs(5)).await);
        match events.lock().last().unwrap() {
            EncoderEvent::Exited { success, killed, .. } => {
                assert!(!success);
                assert!(killed);
            }
            other => panic!("unexpected last event {:?}", other),
        };
    }

    #[tokio::test]
    async fn graceful_stop_falls_back_to_kill() {
        let (sink, events) = recording_sink();
        // Ignores stdin entirely
        let launcher = shell_launcher("exec sleep 30");
        let handle = launcher.launch(sink).unwrap();

        let policy = StopPolicy::Graceful { grace_ms: 50 };
        assert!(handle.terminate(policy, Duration::from_secs(5)).await);
        assert!(matches!(
            events.lock().last(),
            Some(EncoderEvent::Exited { killed: true, .. })
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let (sink, events) = recording_sink();
        let launcher = FfmpegLauncher {
            settings: EncoderSettings {
                ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg-binary"),
                ..EncoderSettings::default()
            },
            args: Vec::new(),
        };
        assert!(matches!(launcher.launch(sink), Err(EncoderError::Spawn(_))));
        assert!(events.lock().is_empty());
    }
}
