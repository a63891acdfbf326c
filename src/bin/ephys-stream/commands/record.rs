use crate::cli::RecordArgs;
use crate::exit_codes;
use ephys_stream::streaming::source::{create_source, SampleSourceConfig};
use ephys_stream::{AcquisitionConfig, ChannelConfig, ConversionTime, StreamError, VoltageRange};

fn build_config(args: &RecordArgs) -> Result<AcquisitionConfig, StreamError> {
    let voltage_range: VoltageRange = args.range.parse()?;
    let conversion_time = ConversionTime::from_millis(args.conversion_ms)?;
    let mains_rejection_50hz = match args.mains {
        50 => true,
        60 => false,
        other => {
            return Err(StreamError::InvalidConfig(format!(
                "Mains frequency must be 50 or 60, got {}",
                other
            )))
        }
    };

    let config = AcquisitionConfig {
        channels: args
            .channels
            .iter()
            .map(|&channel| ChannelConfig {
                channel,
                enabled: true,
                single_ended: args.single_ended,
                voltage_range,
            })
            .collect(),
        conversion_time,
        mains_rejection_50hz,
    };
    config.validate()?;
    Ok(config)
}

pub async fn execute(args: RecordArgs) -> i32 {
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let source = match create_source(SampleSourceConfig::Bridge {
        program: args.program.clone(),
        args: args.bridge_args.clone(),
        poll_interval_ms: args.poll_interval_ms,
    }) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    if !args.stream.quiet {
        let channels: Vec<String> = config
            .enabled_channels()
            .map(|c| c.channel.to_string())
            .collect();
        eprintln!("Recording from bridge '{}'...", args.program);
        eprintln!(
            "  Channels: {} ({}, {})",
            channels.join(", "),
            voltage_label(&config),
            if args.single_ended { "single-ended" } else { "differential" }
        );
        eprintln!(
            "  Conversion: {} ms, sample interval {} ms",
            config.conversion_time.millis(),
            config.sample_interval_ms()
        );
    }

    super::run_session(source, config, &args.stream).await
}

fn voltage_label(config: &AcquisitionConfig) -> String {
    config
        .channels
        .first()
        .map(|c| c.voltage_range.to_string())
        .unwrap_or_default()
}
