// Kiosk Replay - instant-replay capture for a single camera
// Main library entry point

pub mod commands;
pub mod config;
pub mod devices;
pub mod encoding;
pub mod notifications;
pub mod recording;
pub mod session;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::commands::{Command, CommandResponse};
use crate::recording::{CaptureHandle, CaptureSupervisor, Collaborators};

/// Parse `--config <path>` from the command line
fn config_path_from_args(args: &[String]) -> PathBuf {
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path)
}

/// Load config, start capturing, and serve the operator console until told to quit
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = config_path_from_args(&args);
    let config = config::Config::load_or_default(&config_path);
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;

    session::ensure_dirs(&config.buffer_dir, &config.output_dir).with_context(|| {
        format!(
            "Failed to create {} or {}",
            config.buffer_dir.display(),
            config.output_dir.display()
        )
    })?;

    log::info!(
        "Kiosk Replay starting: device {}, buffer {}, output {}",
        config.device.display(),
        config.buffer_dir.display(),
        config.output_dir.display()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    runtime.block_on(async move {
        let segment_duration = Duration::from_secs_f64(config.segment_duration_secs);
        let collaborators = Collaborators::system(&config);
        let handle = CaptureSupervisor::spawn(config, collaborators);
        notifications::spawn_event_logger(handle.subscribe(), segment_duration);

        report(&commands::start_response(handle.start_recording().await));

        // A kiosk usually runs with stdin on /dev/null; losing the console
        // must not stop the capture
        tokio::select! {
            exit = serve_console(&handle, BufReader::new(tokio::io::stdin())) => {
                if exit == ConsoleExit::Closed {
                    log::info!("Console input closed, recording until signalled");
                    shutdown_signal().await;
                }
            }
            _ = shutdown_signal() => {}
        }

        handle.shutdown().await.context("Supervisor did not shut down cleanly")?;
        log::info!("Kiosk Replay stopped");
        Ok::<(), anyhow::Error>(())
    })
}

/// How the console loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleExit {
    /// The operator asked to quit
    Quit,
    /// Input ended or could not be read
    Closed,
}

/// Read commands until `quit` or end of input
async fn serve_console<R>(handle: &CaptureHandle, input: R) -> ConsoleExit
where
    R: AsyncBufRead + Unpin,
{
    println!("{}", commands::HELP);
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return ConsoleExit::Closed,
            Err(e) => {
                log::warn!("Console read failed: {}", e);
                return ConsoleExit::Closed;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let Some(command) = Command::parse(&line) else {
            println!("unknown command: {} ({})", line.trim(), commands::HELP);
            continue;
        };

        let response = commands::execute(handle, command).await;
        report(&response);
        if command == Command::Quit {
            return ConsoleExit::Quit;
        }
    }
}

/// Wait for Ctrl-C, SIGTERM or SIGQUIT
async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT, shutting down"),
        _ = unix_signal(UnixSignal::Terminate) => log::info!("Received SIGTERM, shutting down"),
        _ = unix_signal(UnixSignal::Quit) => log::info!("Received SIGQUIT, shutting down"),
    }
}

#[derive(Clone, Copy)]
enum UnixSignal {
    Terminate,
    Quit,
}

async fn unix_signal(which: UnixSignal) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let kind = match which {
            UnixSignal::Terminate => SignalKind::terminate(),
            UnixSignal::Quit => SignalKind::quit(),
        };
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::warn!("Cannot listen for {:?}: {}", kind, e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = which;
        std::future::pending::<()>().await;
    }
}

fn report(response: &CommandResponse) {
    match serde_json::to_string(response) {
        Ok(json) => println!("{}", json),
        Err(_) => println!("{}", response.message),
    }
    if response.is_error() {
        log::error!("{}", response.message);
    }
}
