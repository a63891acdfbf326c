// Real-time acquisition and live streaming module
//
// This module connects to a sample source, records every sample into a
// lock-free ring buffer and a per-session CSV file, and periodically
// publishes processed windows to registered sinks.
//
// Architecture:
// - `source`: Trait-based system for pluggable sample sources (bridge, simulated, replay, scripted)
// - `ring_buffer`: Lock-free single-writer ring for the live sample history
// - `session`: Live handle and running totals of one recording session
// - `recorder`: Source lifecycle and the recording state machine
// - `broadcaster`: Fixed-cadence processing and payload fan-out
// - `sink`: Payload destinations and their registry

pub mod broadcaster;
pub mod recorder;
pub mod ring_buffer;
pub mod session;
pub mod sink;
pub mod source;
pub mod types;

pub use broadcaster::{LiveBroadcaster, LivePayload, LiveStats, PeakReport, TickOutcome};
pub use recorder::SessionRecorder;
pub use ring_buffer::{BufferedSample, RingBuffer, RingMetrics, RingWriter};
pub use session::ActiveSession;
pub use sink::{ChannelSink, NdjsonSink, PayloadSink, PublishReport, SinkId, SinkRegistry};
pub use source::{create_source, SampleSource, SampleSourceConfig, SampleStream, SourceMetadata};
pub use types::{RecorderStatus, RecordingState, Sample, SessionInfo};
