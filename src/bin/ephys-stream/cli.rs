use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ephys-stream",
    version,
    about = "Real-time electrophysiology acquisition, live spike detection and session recording",
    long_about = "Stream voltage samples from an ADC bridge, a simulator or a recorded session,\n\
                  detect spikes live and record every sample to a per-session CSV file.\n\
                  Settings come from --settings, then EPHYS_* environment variables, then flags."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Record a simulated spiking signal
    Demo(DemoArgs),
    /// Record from the hardware bridge
    Record(RecordArgs),
    /// Play a recorded session back through the live pipeline
    Replay(ReplayArgs),
    /// List recorded sessions
    Sessions(SessionsArgs),
    /// Summarize a recorded session
    Analyze(AnalyzeArgs),
}

/// Options shared by every command that runs the live pipeline
#[derive(Args, Clone)]
pub struct StreamArgs {
    /// Stop after this many seconds (default: until the source ends or Ctrl-C)
    #[arg(long)]
    pub duration: Option<f64>,

    /// Directory for session CSV files
    #[arg(long, env = "EPHYS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Do not write a session CSV
    #[arg(long, default_value_t = false)]
    pub no_save: bool,

    /// JSON settings file
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Live payload interval in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Write live payloads as JSON lines to this file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Do not emit live payloads
    #[arg(long, default_value_t = false)]
    pub no_live: bool,

    /// Print the final session summary as JSON on stderr
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Suppress progress messages on stderr
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct DemoArgs {
    #[command(flatten)]
    pub stream: StreamArgs,

    /// Random seed for a reproducible signal
    #[arg(long)]
    pub seed: Option<u64>,

    /// Generate samples as fast as they are consumed instead of at 10 S/s
    #[arg(long, default_value_t = false)]
    pub fast: bool,
}

#[derive(Args)]
pub struct RecordArgs {
    #[command(flatten)]
    pub stream: StreamArgs,

    /// Bridge executable
    #[arg(long, env = "EPHYS_BRIDGE_PROGRAM", default_value = "python3")]
    pub program: String,

    /// Arguments passed to the bridge executable
    #[arg(long = "bridge-arg", num_args = 1.., allow_hyphen_values = true)]
    pub bridge_args: Vec<String>,

    /// Input channels (1-16)
    #[arg(long, num_args = 1.., default_values_t = vec![1u8])]
    pub channels: Vec<u8>,

    /// Voltage range in mV (39, 78, 156, 312, 625, 1250, 2500)
    #[arg(long, default_value = "39")]
    pub range: String,

    /// Single-ended inputs instead of differential
    #[arg(long, default_value_t = false)]
    pub single_ended: bool,

    /// Conversion time in ms (60, 100, 180, 340, 660)
    #[arg(long, default_value_t = 100)]
    pub conversion_ms: u64,

    /// Mains frequency to reject (50 or 60)
    #[arg(long, default_value_t = 50)]
    pub mains: u32,

    /// Bridge readiness poll interval in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Args)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub stream: StreamArgs,

    /// Session CSV file
    #[arg(long)]
    pub file: PathBuf,

    /// Playback speed relative to recorded time (default: as fast as possible)
    #[arg(long)]
    pub speed: Option<f64>,

    /// Start over at the end of the file
    #[arg(long = "loop", default_value_t = false)]
    pub loop_playback: bool,
}

#[derive(Args)]
pub struct SessionsArgs {
    /// Directory holding session CSV files
    #[arg(long, env = "EPHYS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Session CSV file (default: latest session in the data directory)
    #[arg(long, conflicts_with = "session")]
    pub file: Option<PathBuf>,

    /// Session id, resolved in the data directory
    #[arg(long)]
    pub session: Option<String>,

    /// Directory holding session CSV files
    #[arg(long, env = "EPHYS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// JSON settings file (processing section)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Width of spike-rate bins in seconds
    #[arg(long, default_value_t = 60.0)]
    pub bin_s: f64,

    /// Include every detected peak in JSON output
    #[arg(long, default_value_t = false)]
    pub peaks: bool,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}
