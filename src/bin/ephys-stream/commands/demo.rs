use crate::cli::DemoArgs;
use ephys_stream::streaming::source::SimulatedSource;
use ephys_stream::AcquisitionConfig;

pub async fn execute(args: DemoArgs) -> i32 {
    if !args.stream.quiet {
        eprintln!("Starting demo with a simulated spiking signal (no hardware needed)");
    }
    let source = SimulatedSource::new(args.seed, !args.fast);
    super::run_session(Box::new(source), AcquisitionConfig::default(), &args.stream).await
}
