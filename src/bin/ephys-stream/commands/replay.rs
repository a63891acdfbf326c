use crate::cli::ReplayArgs;
use crate::exit_codes;
use ephys_stream::streaming::source::ReplaySource;
use ephys_stream::streaming::SampleSource;
use ephys_stream::{AcquisitionConfig, ChannelConfig};

pub async fn execute(args: ReplayArgs) -> i32 {
    if !args.file.is_file() {
        eprintln!("Error: File not found: {}", args.file.display());
        return exit_codes::INPUT_ERROR;
    }

    let mut source = match ReplaySource::new(args.file.clone(), args.speed, args.loop_playback) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    // Loading up front tells us which channels the recording holds
    if let Err(e) = source.connect().await {
        eprintln!("Error: {}", e);
        return exit_codes::INPUT_ERROR;
    }
    let config = AcquisitionConfig {
        channels: source
            .metadata()
            .channels
            .into_iter()
            .map(|channel| ChannelConfig {
                channel,
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    if !args.stream.quiet {
        eprintln!("Replaying {}...", args.file.display());
    }
    super::run_session(Box::new(source), config, &args.stream).await
}
