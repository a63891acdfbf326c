use crate::cli::AnalyzeArgs;
use crate::exit_codes;
use crate::output;
use ephys_stream::analysis::{analyze_file, SessionSummary};
use ephys_stream::persistence::{find_session, list_sessions};
use ephys_stream::{Settings, SignalProcessor};
use std::path::PathBuf;

fn resolve_path(args: &AnalyzeArgs) -> Result<PathBuf, String> {
    if let Some(file) = &args.file {
        return if file.is_file() {
            Ok(file.clone())
        } else {
            Err(format!("File not found: {}", file.display()))
        };
    }

    let data_dir = super::resolve_data_dir(args.data_dir.as_deref())
        .ok_or_else(|| "No data directory; pass --data-dir or --file".to_string())?;

    match &args.session {
        Some(id) => find_session(&data_dir, id).map_err(|e| e.to_string()),
        None => list_sessions(&data_dir)
            .map_err(|e| e.to_string())?
            .into_iter()
            .next()
            .map(|s| s.path)
            .ok_or_else(|| format!("No sessions found in {}", data_dir.display())),
    }
}

pub fn execute(args: AnalyzeArgs) -> i32 {
    let path = match resolve_path(&args) {
        Ok(path) => path,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    let processor = match Settings::load(args.settings.as_deref())
        .and_then(|settings| SignalProcessor::new(settings.processing))
    {
        Ok(processor) => processor,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let mut summary = match analyze_file(&path, &processor, args.bin_s) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    if args.json {
        if !args.peaks {
            for channel in &mut summary.channels {
                channel.peaks.clear();
            }
        }
        return match output::emit_json(&summary, args.compact, args.output.as_deref()) {
            Ok(()) => {
                if let Some(path) = &args.output {
                    eprintln!("Results written to {}", path.display());
                }
                exit_codes::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                exit_codes::EXECUTION_ERROR
            }
        };
    }

    let text = render_text(&summary, &path);
    match output::emit_text(&text, args.output.as_deref()) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_codes::EXECUTION_ERROR
        }
    }
}

fn render_text(summary: &SessionSummary, path: &std::path::Path) -> String {
    let mut lines = vec![
        format!("Session: {}", path.display()),
        format!("Samples: {}", summary.total_samples),
    ];

    for ch in &summary.channels {
        lines.push(String::new());
        lines.push(format!("Channel {}", ch.channel));
        lines.push(format!(
            "  Duration: {:.1} min  |  Rate: {:.1} S/s",
            ch.duration_s / 60.0,
            ch.sample_rate_hz
        ));
        lines.push(format!(
            "  Mean: {:.1} µV  |  SD: {:.1} µV  |  Range: [{:.1}, {:.1}] µV",
            ch.mean_uv, ch.std_uv, ch.min_uv, ch.max_uv
        ));
        lines.push(format!(
            "  Noise RMS: {:.2} µV  |  Mean amplitude: {:.1} µV",
            ch.rms_noise_uv, ch.mean_amplitude_uv
        ));
        lines.push(format!(
            "  Peaks: {} ({} positive, {} negative)  |  {:.4} Hz",
            ch.peak_count(),
            ch.positive_peaks,
            ch.negative_peaks,
            ch.spike_frequency_hz
        ));
        for bin in &ch.bins {
            lines.push(format!(
                "    {:>8.1}-{:<8.1} s  {:>4} peaks  {:.4} Hz",
                bin.start_s, bin.end_s, bin.peaks, bin.rate_hz
            ));
        }
    }
    lines.join("\n")
}
