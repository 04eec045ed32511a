// Capture supervisor: one task owns the whole capture session
//
// Every trigger that can change the session (API calls, encoder events,
// watcher observations, probe results, timers) arrives as a `Message` on one
// channel and is handled to completion before the next one is looked at.
// Background tasks never touch session state; they post messages tagged with
// the generation or token they were started under, and anything that arrives
// for a session or poll loop that no longer exists is dropped.
//
// Callers talk to the task through `CaptureHandle`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::readiness::ReadinessGate;
use super::segments::{SegmentNaming, SegmentRegistry};
use super::watcher::{spawn_segment_watcher, WatchSettings};
use super::window::{count_in_window, playback_order, select_window};
use super::{
    CaptureError, CleanupReport, RecordingState, RecordingStatus, StartOutcome, StopOutcome,
    SupervisorEvent,
};
use crate::config::{Config, StopPolicy};
use crate::devices::health::{spawn_presence_monitor, spawn_reconnect_poll, PollSettings};
use crate::devices::{probe_device, DeviceProbe, V4l2Probe};
use crate::encoding::{
    DiagnosticClassifier, EncoderEvent, EncoderEventSink, EncoderHandle, EncoderLauncher,
    FailureClass, FfmpegLauncher, FfmpegRemuxer, Remuxer,
};
use crate::session::export::{run_export, ExportError, ExportOutcome, ExportPlan, NotReadyReason};
use crate::session::storage;

/// Capacity of the event broadcast; slow subscribers lose the oldest events
const EVENT_CAPACITY: usize = 64;

/// External collaborators, injected so tests can stand in for the device,
/// the encoder, and the remuxer
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn DeviceProbe>,
    pub launcher: Arc<dyn EncoderLauncher>,
    pub remuxer: Arc<dyn Remuxer>,
}

impl Collaborators {
    /// The real thing: V4L2 probe and ffmpeg for capture and remux
    pub fn system(config: &Config) -> Self {
        let naming = SegmentNaming::new(&config.segment_prefix, &config.segment_extension);
        Self {
            probe: Arc::new(V4l2Probe::new(config.device.clone())),
            launcher: Arc::new(FfmpegLauncher::new(
                config.encoder.clone(),
                config.device.clone(),
                config.segment_duration_secs,
                config.segment_wrap(),
                naming.encoder_pattern(&config.buffer_dir),
            )),
            remuxer: Arc::new(FfmpegRemuxer::new(config.encoder.ffmpeg_path.clone())),
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

type Reply<T> = oneshot::Sender<T>;

enum Message {
    Start(Reply<Result<StartOutcome, CaptureError>>),
    Stop(Reply<StopOutcome>),
    Cleanup(Reply<CleanupReport>),
    PrepareExport(Reply<Result<ExportPlan, NotReadyReason>>),
    SetAutoReconnect(bool, Reply<bool>),
    ReportDisconnect,
    Shutdown(Reply<()>),

    Encoder {
        generation: u64,
        event: EncoderEvent,
    },
    SegmentObserved {
        generation: u64,
        name: String,
        observed_at: DateTime<Utc>,
    },
    DeviceLost {
        generation: u64,
    },
    DeviceReturned {
        token: u64,
    },
    TimerFired {
        token: u64,
    },
}

/// Posting side for background tasks. Holds a weak sender so that the
/// supervisor shuts down once every `CaptureHandle` is gone.
#[derive(Clone)]
struct Mailbox(mpsc::WeakUnboundedSender<Message>);

impl Mailbox {
    fn post(&self, message: Message) {
        if let Some(tx) = self.0.upgrade() {
            let _ = tx.send(message);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Device is back; start capture once it has settled
    ReconnectSettle,
    /// Retry after an encoder failure
    Restart,
}

struct PendingTimer {
    token: u64,
    kind: TimerKind,
    task: JoinHandle<()>,
}

/// Who asked for a start; decides what a failure leads to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOrigin {
    Caller,
    Reconnect,
    Restart,
}

// ============================================================================
// Public handle
// ============================================================================

/// Entry point for spawning the supervisor task
pub struct CaptureSupervisor;

impl CaptureSupervisor {
    /// Spawn the supervisor on the current tokio runtime
    pub fn spawn(config: Config, collaborators: Collaborators) -> CaptureHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = Arc::new(RwLock::new(RecordingState::new(
            config.min_segments_required.max(1),
            config.auto_reconnect,
        )));

        let handle = CaptureHandle {
            tx: tx.clone(),
            state: state.clone(),
            events: events.clone(),
            probe: collaborators.probe.clone(),
            remuxer: collaborators.remuxer.clone(),
        };

        let supervisor = Supervisor::new(config, collaborators, Mailbox(tx.downgrade()), state, events);
        drop(tx);
        tokio::spawn(supervisor.run(rx));

        handle
    }
}

/// Cloneable API to a running supervisor
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::UnboundedSender<Message>,
    state: Arc<RwLock<RecordingState>>,
    events: broadcast::Sender<SupervisorEvent>,
    probe: Arc<dyn DeviceProbe>,
    remuxer: Arc<dyn Remuxer>,
}

impl CaptureHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Message) -> Result<T, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| CaptureError::SupervisorGone)?;
        rx.await.map_err(|_| CaptureError::SupervisorGone)
    }

    /// Start capturing. Starting while a session is up is a no-op; starting
    /// with the device absent returns `WaitingForDevice` and capture begins
    /// once the device appears.
    pub async fn start_recording(&self) -> Result<StartOutcome, CaptureError> {
        self.request(Message::Start).await?
    }

    /// Kill the encoder, cancel any reconnection or restart, and drop the buffer index
    pub async fn stop_recording(&self) -> Result<StopOutcome, CaptureError> {
        self.request(Message::Stop).await
    }

    /// Stop, then delete every segment file in the buffer directory
    pub async fn cleanup_and_stop(&self) -> Result<CleanupReport, CaptureError> {
        self.request(Message::Cleanup).await
    }

    /// Save the trailing window to the output directory
    pub async fn export_window(&self) -> Result<ExportOutcome, ExportError> {
        let plan = match self.request(Message::PrepareExport).await {
            Ok(Ok(plan)) => plan,
            Ok(Err(reason)) => {
                log::info!("[Export] Not ready: {}", reason);
                return Ok(ExportOutcome::NotReady(reason));
            }
            Err(_) => return Err(ExportError::SupervisorGone),
        };

        let remuxer = self.remuxer.clone();
        let result = tokio::task::spawn_blocking(move || run_export(&plan, remuxer.as_ref()))
            .await
            .map_err(|e| ExportError::Task(e.to_string()))
            .and_then(|r| r);

        match &result {
            Ok(ExportOutcome::Saved { path, segments }) => {
                log::info!("[Export] Saved {} ({} segments)", path.display(), segments);
                let _ = self.events.send(SupervisorEvent::ExportSaved {
                    path: path.clone(),
                    segments: *segments,
                });
            }
            Ok(ExportOutcome::NotReady(_)) => {}
            Err(e) => {
                let _ = self.events.send(SupervisorEvent::ExportFailed {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    /// Probe the capture device now
    pub async fn is_device_connected(&self) -> bool {
        probe_device(&self.probe).await
    }

    pub async fn set_auto_reconnect(&self, enabled: bool) -> Result<bool, CaptureError> {
        self.request(|reply| Message::SetAutoReconnect(enabled, reply))
            .await
    }

    /// Tell the supervisor the device went away (from an outside detector)
    pub fn report_disconnect(&self) -> Result<(), CaptureError> {
        self.tx
            .send(Message::ReportDisconnect)
            .map_err(|_| CaptureError::SupervisorGone)
    }

    pub fn state(&self) -> RecordingState {
        self.state.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Stop everything and end the supervisor task
    pub async fn shutdown(&self) -> Result<(), CaptureError> {
        self.request(Message::Shutdown).await
    }
}

// ============================================================================
// Supervisor task
// ============================================================================

struct Supervisor {
    config: Config,
    collaborators: Collaborators,
    classifier: DiagnosticClassifier,
    mailbox: Mailbox,
    shared: Arc<RwLock<RecordingState>>,
    events: broadcast::Sender<SupervisorEvent>,

    status: RecordingStatus,
    registry: SegmentRegistry,
    gate: ReadinessGate,
    /// Bumped on every encoder launch and every session teardown
    generation: u64,
    started_at: Option<DateTime<Utc>>,
    started_instant: Option<Instant>,
    auto_reconnect: bool,
    last_error: Option<String>,

    encoder: Option<EncoderHandle>,
    watcher: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    /// Reconnection poll loop; `reconnecting` stays set through the settle delay
    reconnect_poll: Option<JoinHandle<()>>,
    reconnecting: bool,
    reconnect_token: u64,
    timer: Option<PendingTimer>,
    next_token: u64,
}

impl Supervisor {
    fn new(
        config: Config,
        collaborators: Collaborators,
        mailbox: Mailbox,
        shared: Arc<RwLock<RecordingState>>,
        events: broadcast::Sender<SupervisorEvent>,
    ) -> Self {
        let naming = SegmentNaming::new(&config.segment_prefix, &config.segment_extension);
        let registry = SegmentRegistry::new(config.buffer_dir.clone(), naming, config.rewrite_gap());
        Self {
            classifier: DiagnosticClassifier::new(&config.device_error_patterns),
            gate: ReadinessGate::new(config.min_segments_required),
            auto_reconnect: config.auto_reconnect,
            config,
            collaborators,
            mailbox,
            shared,
            events,
            status: RecordingStatus::Idle,
            registry,
            generation: 0,
            started_at: None,
            started_instant: None,
            last_error: None,
            encoder: None,
            watcher: None,
            monitor: None,
            reconnect_poll: None,
            reconnecting: false,
            reconnect_token: 0,
            timer: None,
            next_token: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        log::debug!("[Capture] Supervisor started");
        while let Some(message) = rx.recv().await {
            match message {
                Message::Shutdown(reply) => {
                    self.stop().await;
                    let _ = reply.send(());
                    break;
                }
                other => self.handle(other).await,
            }
        }
        // Every handle dropped without a shutdown
        if self.status != RecordingStatus::Idle || self.reconnecting || self.timer.is_some() {
            self.stop().await;
        }
        log::debug!("[Capture] Supervisor stopped");
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Start(reply) => {
                let result = self.start(StartOrigin::Caller).await;
                let _ = reply.send(result);
            }
            Message::Stop(reply) => {
                let outcome = self.stop().await;
                let _ = reply.send(outcome);
            }
            Message::Cleanup(reply) => {
                let report = self.cleanup_and_stop().await;
                let _ = reply.send(report);
            }
            Message::PrepareExport(reply) => {
                let plan = self.prepare_export().await;
                let _ = reply.send(plan);
            }
            Message::SetAutoReconnect(enabled, reply) => {
                self.set_auto_reconnect(enabled);
                let _ = reply.send(self.auto_reconnect);
            }
            Message::ReportDisconnect => self.on_disconnect_reported(),
            Message::Shutdown(reply) => {
                // Handled in `run`
                let _ = reply.send(());
            }
            Message::Encoder { generation, event } => {
                if generation == self.generation {
                    self.on_encoder_event(event);
                } else if let EncoderEvent::Exited { .. } = event {
                    log::debug!("[Capture] Ignoring exit of encoder generation {}", generation);
                }
            }
            Message::SegmentObserved {
                generation,
                name,
                observed_at,
            } => {
                if generation == self.generation && self.status == RecordingStatus::Recording {
                    self.on_segment_observed(&name, observed_at);
                }
            }
            Message::DeviceLost { generation } => {
                if generation == self.generation {
                    self.on_device_lost("device probe failed");
                }
            }
            Message::DeviceReturned { token } => {
                if self.reconnecting && token == self.reconnect_token {
                    self.on_device_returned().await;
                }
            }
            Message::TimerFired { token } => match self.timer.take() {
                Some(timer) if timer.token == token => self.on_timer(timer.kind).await,
                other => self.timer = other,
            },
        }
    }

    // ------------------------------------------------------------------------
    // Start / stop
    // ------------------------------------------------------------------------

    async fn start(&mut self, origin: StartOrigin) -> Result<StartOutcome, CaptureError> {
        if self.status.is_active() {
            log::info!("[Capture] Start ignored, already {}", self.status);
            return Ok(StartOutcome::AlreadyActive {
                status: self.status,
            });
        }
        if self.reconnecting {
            return Ok(StartOutcome::WaitingForDevice);
        }
        self.cancel_timer();

        if !probe_device(&self.collaborators.probe).await {
            log::warn!(
                "[Capture] Device {} not available, waiting for it",
                self.config.device.display()
            );
            self.set_status(RecordingStatus::Disconnected);
            self.enter_waiting();
            self.publish();
            return Ok(StartOutcome::WaitingForDevice);
        }

        match self.launch_encoder().await {
            Ok(()) => Ok(StartOutcome::Started),
            Err(e) => {
                log::error!("[Capture] {}", e);
                self.last_error = Some(e.to_string());
                self.set_status(RecordingStatus::Idle);
                match origin {
                    StartOrigin::Reconnect => self.enter_waiting(),
                    StartOrigin::Caller | StartOrigin::Restart => {
                        let will_restart = self.schedule_restart();
                        self.emit(SupervisorEvent::EncoderFailed {
                            message: e.to_string(),
                            will_restart,
                        });
                    }
                }
                self.publish();
                Err(e)
            }
        }
    }

    async fn launch_encoder(&mut self) -> Result<(), CaptureError> {
        std::fs::create_dir_all(&self.config.buffer_dir)?;
        self.remove_segment_files().await;
        self.registry.clear();
        self.gate.reset();

        self.generation += 1;
        let generation = self.generation;
        let mailbox = self.mailbox.clone();
        let sink = EncoderEventSink::new(move |event| {
            mailbox.post(Message::Encoder { generation, event })
        });

        self.set_status(RecordingStatus::Starting);
        let handle = self.collaborators.launcher.launch(sink)?;
        log::info!(
            "[Capture] Encoder launched for {} (generation {})",
            self.config.device.display(),
            generation
        );
        self.encoder = Some(handle);
        self.last_error = None;
        self.publish();
        Ok(())
    }

    async fn stop(&mut self) -> StopOutcome {
        let had_work = self.status != RecordingStatus::Idle || self.reconnecting || self.timer.is_some();
        if !had_work {
            return StopOutcome::NothingToStop;
        }

        self.set_status(RecordingStatus::Stopping);
        self.cancel_timer();
        self.cancel_reconnect();

        if let Some(encoder) = self.teardown_session() {
            let policy = self.config.encoder.stop_policy;
            let timeout = self.stop_timeout(policy);
            encoder.terminate(policy, timeout).await;
        }

        self.set_status(RecordingStatus::Idle);
        self.publish();
        log::info!("[Capture] Stopped");
        StopOutcome::Stopped
    }

    async fn cleanup_and_stop(&mut self) -> CleanupReport {
        let auto_reconnect = self.auto_reconnect;
        self.auto_reconnect = false;

        let stopped = self.stop().await;
        let removed_files = self.remove_segment_files().await;

        self.auto_reconnect = auto_reconnect;
        self.publish();
        log::info!("[Capture] Cleanup removed {} segment files", removed_files);
        CleanupReport {
            stopped,
            removed_files,
        }
    }

    /// Wait long enough for a graceful stop to fall back to its kill
    fn stop_timeout(&self, policy: StopPolicy) -> Duration {
        match policy {
            StopPolicy::Kill => self.config.stop_timeout(),
            StopPolicy::Graceful { grace_ms } => {
                self.config.stop_timeout() + Duration::from_millis(grace_ms)
            }
        }
    }

    /// End the current session's background work and forget its segments.
    /// Returns the encoder for the caller to bring down.
    fn teardown_session(&mut self) -> Option<EncoderHandle> {
        if let Some(task) = self.watcher.take() {
            task.abort();
        }
        if let Some(task) = self.monitor.take() {
            task.abort();
        }
        self.registry.clear();
        self.gate.reset();
        self.started_at = None;
        self.started_instant = None;
        self.generation += 1;
        self.encoder.take()
    }

    // ------------------------------------------------------------------------
    // Encoder and watcher events
    // ------------------------------------------------------------------------

    fn on_encoder_event(&mut self, event: EncoderEvent) {
        match event {
            EncoderEvent::Started { pid } => {
                if self.status != RecordingStatus::Starting {
                    return;
                }
                self.on_encoder_started(pid);
            }
            EncoderEvent::Diagnostic(line) => {
                if self.classifier.is_device_error(&line) {
                    log::warn!("[Encoder] {}", line);
                } else {
                    log::debug!("[Encoder] {}", line);
                }
            }
            EncoderEvent::Exited {
                success,
                killed,
                diagnostic,
            } => {
                self.encoder = None;
                if killed || !self.status.is_active() {
                    return;
                }
                match self.classifier.classify_exit(killed, &diagnostic) {
                    FailureClass::Device => {
                        log::warn!("[Capture] Encoder lost the device: {}", diagnostic);
                        self.on_device_lost("encoder reported a device error");
                    }
                    FailureClass::Encoder => {
                        let message = if diagnostic.is_empty() {
                            format!("encoder exited unexpectedly (success: {})", success)
                        } else {
                            diagnostic
                        };
                        self.on_encoder_failed(message);
                    }
                }
            }
        }
    }

    fn on_encoder_started(&mut self, pid: Option<u32>) {
        self.registry.clear();
        self.gate.reset();
        self.started_at = Some(Utc::now());
        self.started_instant = Some(Instant::now());

        let generation = self.generation;
        let mailbox = self.mailbox.clone();
        self.watcher = Some(spawn_segment_watcher(
            WatchSettings {
                dir: self.config.buffer_dir.clone(),
                naming: self.registry.naming().clone(),
                interval: self.config.watch_interval(),
                rewrite_gap: self.config.rewrite_gap(),
            },
            move |name, observed_at| {
                mailbox.post(Message::SegmentObserved {
                    generation,
                    name,
                    observed_at,
                })
            },
        ));

        let mailbox = self.mailbox.clone();
        self.monitor = Some(spawn_presence_monitor(
            self.collaborators.probe.clone(),
            self.poll_settings(),
            move || mailbox.post(Message::DeviceLost { generation }),
        ));

        log::info!("[Capture] Recording (encoder pid {:?})", pid);
        self.set_status(RecordingStatus::Recording);
        self.publish();
    }

    fn on_encoder_failed(&mut self, message: String) {
        log::error!("[Capture] Encoder failed: {}", message);
        drop(self.teardown_session());
        self.last_error = Some(message.clone());
        self.set_status(RecordingStatus::Idle);
        let will_restart = self.schedule_restart();
        self.emit(SupervisorEvent::EncoderFailed {
            message,
            will_restart,
        });
        self.publish();
    }

    fn on_segment_observed(&mut self, name: &str, observed_at: DateTime<Utc>) {
        if !self.registry.record(name, observed_at) {
            return;
        }
        self.observe_window(Utc::now());
        self.publish();
    }

    /// Feed the current window size to the readiness gate
    fn observe_window(&mut self, now: DateTime<Utc>) {
        let count = count_in_window(&self.registry, now, self.config.buffer_duration());
        if self.gate.observe(count) {
            log::info!("[Capture] Buffer ready ({} segments)", count);
            self.emit(SupervisorEvent::BufferReady { segments: count });
        }
    }

    // ------------------------------------------------------------------------
    // Device loss and reconnection
    // ------------------------------------------------------------------------

    fn on_device_lost(&mut self, reason: &str) {
        if !self.status.is_active() {
            return;
        }
        log::warn!("[Capture] Device disconnected: {}", reason);

        // Fire and forget; a dropped handle kills the process too
        if let Some(mut encoder) = self.teardown_session() {
            encoder.signal(StopPolicy::Kill);
        }
        self.last_error = Some(reason.to_string());
        self.set_status(RecordingStatus::Disconnected);
        self.emit(SupervisorEvent::DeviceLost {
            reconnecting: self.auto_reconnect,
        });
        if self.auto_reconnect {
            self.enter_waiting();
        }
        self.publish();
    }

    fn on_disconnect_reported(&mut self) {
        if self.status.is_active() {
            self.on_device_lost("disconnect reported");
        } else if self.status == RecordingStatus::Disconnected && self.auto_reconnect {
            self.enter_waiting();
            self.publish();
        }
    }

    /// Start polling for the device. At most one poll loop runs at a time.
    fn enter_waiting(&mut self) {
        if self.reconnecting {
            log::debug!("[Capture] Already waiting for the device");
            return;
        }
        self.reconnecting = true;
        self.reconnect_token = self.token();
        let token = self.reconnect_token;
        let mailbox = self.mailbox.clone();
        self.reconnect_poll = Some(spawn_reconnect_poll(
            self.collaborators.probe.clone(),
            self.poll_settings(),
            move || mailbox.post(Message::DeviceReturned { token }),
        ));
        self.emit(SupervisorEvent::WaitingForDevice);
    }

    async fn on_device_returned(&mut self) {
        self.reconnect_poll = None;

        // Nothing from before the disconnect may leak into the new session
        self.registry.clear();
        self.gate.reset();
        self.remove_segment_files().await;

        log::info!(
            "[Capture] Device is back, restarting in {:?}",
            self.config.reconnect_settle()
        );
        self.schedule(TimerKind::ReconnectSettle, self.config.reconnect_settle());
        self.publish();
    }

    fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect_poll.take() {
            task.abort();
        }
        self.reconnecting = false;
    }

    fn set_auto_reconnect(&mut self, enabled: bool) {
        self.auto_reconnect = enabled;
        log::info!("[Capture] Auto-reconnect {}", if enabled { "enabled" } else { "disabled" });
        if !enabled && matches!(self.timer.as_ref(), Some(t) if t.kind == TimerKind::Restart) {
            self.cancel_timer();
        }
        self.publish();
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel_timer();
        let token = self.token();
        let mailbox = self.mailbox.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            mailbox.post(Message::TimerFired { token });
        });
        self.timer = Some(PendingTimer { token, kind, task });
    }

    /// Arrange an automatic restart if configured. Returns whether one was scheduled.
    fn schedule_restart(&mut self) -> bool {
        if !(self.config.restart_on_encoder_error && self.auto_reconnect) {
            return false;
        }
        log::info!(
            "[Capture] Restarting encoder in {:?}",
            self.config.restart_delay()
        );
        self.schedule(TimerKind::Restart, self.config.restart_delay());
        true
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.task.abort();
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ReconnectSettle => {
                self.reconnecting = false;
                match self.start(StartOrigin::Reconnect).await {
                    Ok(StartOutcome::Started) => self.emit(SupervisorEvent::DeviceRestored),
                    Ok(_) => {}
                    Err(e) => log::warn!("[Capture] Restart after reconnect failed: {}", e),
                }
            }
            TimerKind::Restart => {
                if let Err(e) = self.start(StartOrigin::Restart).await {
                    log::warn!("[Capture] Automatic restart failed: {}", e);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------------

    async fn prepare_export(&mut self) -> Result<ExportPlan, NotReadyReason> {
        if self.status != RecordingStatus::Recording {
            return Err(NotReadyReason::NotRecording {
                status: self.status,
            });
        }

        let elapsed = self.started_instant.map(|i| i.elapsed()).unwrap_or_default();
        let required = self.config.min_recording();
        if elapsed < required {
            return Err(NotReadyReason::JustStarted {
                elapsed_ms: elapsed.as_millis() as u64,
                required_ms: required.as_millis() as u64,
            });
        }

        let now = Utc::now();
        self.registry.reconcile_with_filesystem(now).await;
        self.observe_window(now);
        self.publish();

        if !self.gate.is_ready() {
            return Err(NotReadyReason::WarmingUp {
                current: self.gate.current(),
                required: self.gate.required(),
            });
        }

        let mut segments = playback_order(
            select_window(&self.registry, now, self.config.buffer_duration()),
            self.config.rewrite_gap(),
        );
        // The newest segment is still open in the encoder and not yet playable
        if let Some(open) = segments.pop() {
            log::debug!("[Export] Leaving out {} (still being written)", open.name);
        }
        if segments.is_empty() {
            return Err(NotReadyReason::EmptyWindow);
        }

        Ok(ExportPlan {
            segments,
            buffer_dir: self.config.buffer_dir.clone(),
            output_dir: self.config.output_dir.clone(),
            requested_at: now,
        })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn remove_segment_files(&self) -> usize {
        let dir: PathBuf = self.config.buffer_dir.clone();
        let naming = self.registry.naming().clone();
        match tokio::task::spawn_blocking(move || storage::remove_segment_files(&dir, &naming)).await {
            Ok(removed) => removed,
            Err(e) => {
                log::warn!("Segment cleanup task failed: {}", e);
                0
            }
        }
    }

    fn poll_settings(&self) -> PollSettings {
        PollSettings::new(self.config.device_poll_interval(), self.config.debounce_polls)
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn set_status(&mut self, status: RecordingStatus) {
        if self.status == status {
            return;
        }
        log::info!("[Capture] {} -> {}", self.status, status);
        self.status = status;
        self.emit(SupervisorEvent::StatusChanged { status });
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let mut state = self.shared.write();
        state.status = self.status;
        state.started_at = self.started_at;
        state.waiting_for_device = self.reconnecting;
        state.auto_reconnect = self.auto_reconnect;
        state.encoder_pid = self.encoder.as_ref().and_then(|e| e.pid());
        state.segments_in_window = self.gate.current();
        state.segments_required = self.gate.required();
        state.buffer_ready = self.gate.is_ready();
        state.generation = self.generation;
        state.last_error = self.last_error.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{EncoderError, RemuxError};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Present(AtomicBool);

    impl DeviceProbe for Present {
        fn is_available(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Reports Started and then does nothing until stopped
    struct IdleLauncher {
        launches: AtomicUsize,
    }

    impl EncoderLauncher for IdleLauncher {
        fn launch(&self, sink: EncoderEventSink) -> Result<EncoderHandle, EncoderError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let (stop_tx, stop_rx) = oneshot::channel::<StopPolicy>();
            let (exited_tx, exited_rx) = oneshot::channel();
            sink.emit(EncoderEvent::Started { pid: Some(42) });
            tokio::spawn(async move {
                let _ = stop_rx.await;
                sink.emit(EncoderEvent::Exited {
                    success: false,
                    killed: true,
                    diagnostic: String::new(),
                });
                let _ = exited_tx.send(());
            });
            Ok(EncoderHandle::new(Some(42), stop_tx, exited_rx))
        }
    }

    struct NoRemux;

    impl Remuxer for NoRemux {
        fn concat(&self, _: &Path, _: &Path) -> Result<(), RemuxError> {
            Ok(())
        }
    }

    fn spawn(present: bool, dir: &Path) -> (CaptureHandle, Arc<IdleLauncher>) {
        let launcher = Arc::new(IdleLauncher {
            launches: AtomicUsize::new(0),
        });
        let config = Config {
            buffer_dir: dir.join("buffer"),
            output_dir: dir.join("out"),
            device_poll_interval_ms: 20,
            ..Config::default()
        };
        let handle = CaptureSupervisor::spawn(
            config,
            Collaborators {
                probe: Arc::new(Present(AtomicBool::new(present))),
                launcher: launcher.clone(),
                remuxer: Arc::new(NoRemux),
            },
        );
        (handle, launcher)
    }

    async fn wait_for(handle: &CaptureHandle, status: RecordingStatus) {
        for _ in 0..200 {
            if handle.state().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never reached {:?}, state {:?}", status, handle.state());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, launcher) = spawn(true, dir.path());

        assert_eq!(handle.start_recording().await.unwrap(), StartOutcome::Started);
        wait_for(&handle, RecordingStatus::Recording).await;
        let started_at = handle.state().started_at;

        let again = handle.start_recording().await.unwrap();
        assert_eq!(
            again,
            StartOutcome::AlreadyActive {
                status: RecordingStatus::Recording
            }
        );
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state().started_at, started_at);

        assert_eq!(handle.stop_recording().await.unwrap(), StopOutcome::Stopped);
        assert_eq!(handle.stop_recording().await.unwrap(), StopOutcome::NothingToStop);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn absent_device_waits_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, launcher) = spawn(false, dir.path());

        assert_eq!(
            handle.start_recording().await.unwrap(),
            StartOutcome::WaitingForDevice
        );
        let state = handle.state();
        assert_eq!(state.status, RecordingStatus::Disconnected);
        assert!(state.waiting_for_device);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);

        // A second start while waiting does not add a second poll loop
        assert_eq!(
            handle.start_recording().await.unwrap(),
            StartOutcome::WaitingForDevice
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn export_before_recording_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _) = spawn(true, dir.path());

        let outcome = handle.export_window().await.unwrap();
        assert_eq!(
            outcome,
            ExportOutcome::NotReady(NotReadyReason::NotRecording {
                status: RecordingStatus::Idle
            })
        );

        handle.start_recording().await.unwrap();
        wait_for(&handle, RecordingStatus::Recording).await;
        assert!(matches!(
            handle.export_window().await.unwrap(),
            ExportOutcome::NotReady(NotReadyReason::JustStarted { .. })
        ));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_ends_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _) = spawn(true, dir.path());
        handle.shutdown().await.unwrap();
        assert!(matches!(
            handle.start_recording().await,
            Err(CaptureError::SupervisorGone)
        ));
    }
}
