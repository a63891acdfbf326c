use clap::Parser;

mod cli;
mod commands;
mod exit_codes;
mod output;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let exit_code = match cli.command {
        cli::Command::Demo(args) => commands::demo::execute(args).await,
        cli::Command::Record(args) => commands::record::execute(args).await,
        cli::Command::Replay(args) => commands::replay::execute(args).await,
        cli::Command::Sessions(args) => commands::sessions::execute(args),
        cli::Command::Analyze(args) => commands::analyze::execute(args),
    };

    std::process::exit(exit_code);
}
