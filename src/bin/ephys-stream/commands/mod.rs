pub mod analyze;
pub mod demo;
pub mod record;
pub mod replay;
pub mod sessions;

use crate::cli::StreamArgs;
use crate::exit_codes;
use ephys_stream::persistence::default_data_dir;
use ephys_stream::streaming::{NdjsonSink, RecordingState, SampleSource, SessionInfo};
use ephys_stream::{AcquisitionConfig, AcquisitionRuntime, Settings, StreamError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;

const STATUS_POLL: Duration = Duration::from_millis(100);

/// Settings from the optional file and the environment, with stream flags
/// applied on top.
pub fn resolve_settings(args: &StreamArgs) -> Result<Settings, StreamError> {
    let mut settings = Settings::load(args.settings.as_deref())?;

    settings.recorder.data_dir = if args.no_save {
        None
    } else {
        args.data_dir
            .clone()
            .or(settings.recorder.data_dir.take())
            .or_else(default_data_dir)
    };
    if let Some(interval_ms) = args.interval_ms {
        settings.broadcast.interval_ms = interval_ms;
    }

    settings.validate()?;
    Ok(settings)
}

/// Data directory for commands that read sessions
pub fn resolve_data_dir(flag: Option<&Path>) -> Option<PathBuf> {
    flag.map(Path::to_path_buf).or_else(default_data_dir)
}

/// Run one recording session through the live pipeline and report it.
pub async fn run_session(
    source: Box<dyn SampleSource>,
    config: AcquisitionConfig,
    args: &StreamArgs,
) -> i32 {
    let settings = match resolve_settings(args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    let runtime = match AcquisitionRuntime::init(source, settings) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    let mut live = None;
    if !args.no_live {
        let writer: Box<dyn AsyncWrite + Unpin + Send> = match &args.output {
            Some(path) => match tokio::fs::File::create(path).await {
                Ok(file) => Box::new(file),
                Err(e) => {
                    eprintln!("Error: Failed to create output file '{}': {}", path, e);
                    return exit_codes::EXECUTION_ERROR;
                }
            },
            None => Box::new(tokio::io::stdout()),
        };
        let capacity = runtime.settings().broadcast.channel_capacity;
        let (sink, writer_task) = NdjsonSink::spawn("live", writer, capacity);
        let id = runtime.sinks().register(Arc::new(sink));
        live = Some((id, writer_task));
    }

    let code = record_until_done(&runtime, config, args).await;

    if let Err(e) = runtime.shutdown().await {
        eprintln!("Error during shutdown: {}", e);
        return exit_codes::EXECUTION_ERROR;
    }

    // Dropping the sink lets its writer drain the queue and exit
    if let Some((id, writer_task)) = live {
        runtime.sinks().unregister(id);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Live output ended early: {}", e),
            Err(e) => log::error!("Live output task failed: {}", e),
        }
    }
    code
}

async fn record_until_done(
    runtime: &AcquisitionRuntime,
    config: AcquisitionConfig,
    args: &StreamArgs,
) -> i32 {
    let recorder = runtime.recorder();

    let started = match recorder.start(config).await {
        Ok(info) => info,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };
    if !args.quiet {
        eprintln!("Recording session {}...", started.id);
        if let Some(path) = &started.csv_path {
            eprintln!("  Writing {}", path.display());
        }
    }

    let deadline = args
        .duration
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(|d| tokio::time::Instant::now() + Duration::from_secs_f64(d));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if !args.quiet {
                    eprintln!("Interrupted, stopping...");
                }
                break;
            }
            _ = sleep_until(deadline) => break,
            _ = tokio::time::sleep(STATUS_POLL) => {
                if recorder.state() == RecordingState::Idle {
                    break;
                }
            }
        }
    }

    let info = if recorder.is_recording() {
        match runtime.stop().await {
            Ok(info) => info,
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::for_error(&e);
            }
        }
    } else {
        match runtime.finished_session().await {
            Some(info) => info,
            None => return exit_codes::EXECUTION_ERROR,
        }
    };

    report_session(&info, args);
    if info.interrupted {
        exit_codes::EXECUTION_ERROR
    } else {
        exit_codes::SUCCESS
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn report_session(info: &SessionInfo, args: &StreamArgs) {
    if args.json {
        match serde_json::to_string_pretty(info) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => eprintln!("Error: {}", e),
        }
        return;
    }
    if args.quiet {
        if let Some(error) = &info.error {
            eprintln!("Error: {}", error);
        }
        return;
    }

    eprintln!(
        "Session {}: {} samples, {} peaks in {:.1} s",
        info.id, info.sample_count, info.peak_count, info.duration_s
    );
    if let Some(path) = &info.csv_path {
        eprintln!("  Saved to {}", path.display());
    }
    if let Some(error) = &info.error {
        eprintln!("  Interrupted: {}", error);
    }
}
