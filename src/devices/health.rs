// Device health loops: presence monitoring while recording and reconnection
// polling while waiting for the device to come back.
//
// Both loops probe on a fixed interval, report exactly once when the device
// changes to the state they are waiting for, and then exit. The supervisor owns
// the JoinHandle and aborts the loop when it is no longer wanted.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{probe_device, DeviceProbe};

/// Polling parameters shared by both loops
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    /// Consecutive matching probes required before reporting
    pub debounce: u32,
}

impl PollSettings {
    pub fn new(interval: Duration, debounce: u32) -> Self {
        Self {
            interval,
            debounce: debounce.max(1),
        }
    }
}

/// Watch a recording device and call `on_lost` once it has been absent for
/// `debounce` consecutive probes.
pub fn spawn_presence_monitor<F>(
    probe: Arc<dyn DeviceProbe>,
    settings: PollSettings,
    on_lost: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        log::debug!("[Health] Presence monitor started");
        wait_for_presence(&probe, false, settings).await;
        log::info!("[Health] Capture device lost");
        on_lost();
    })
}

/// Poll a missing device and call `on_returned` once it has been present for
/// `debounce` consecutive probes.
pub fn spawn_reconnect_poll<F>(
    probe: Arc<dyn DeviceProbe>,
    settings: PollSettings,
    on_returned: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        log::info!(
            "[Health] Waiting for capture device (polling every {:?})",
            settings.interval
        );
        wait_for_presence(&probe, true, settings).await;
        log::info!("[Health] Capture device is back");
        on_returned();
    })
}

async fn wait_for_presence(probe: &Arc<dyn DeviceProbe>, wanted: bool, settings: PollSettings) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the caller just checked
    ticker.tick().await;

    let mut streak = 0u32;
    loop {
        ticker.tick().await;
        if probe_device(probe).await == wanted {
            streak += 1;
            if streak >= settings.debounce {
                return;
            }
        } else {
            streak = 0;
        }
    }
}
