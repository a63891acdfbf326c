// Library exports

pub mod acquisition;
pub mod analysis;
pub mod config;
pub mod error;
pub mod persistence;
pub mod runtime;
pub mod signal;
pub mod streaming;

pub use acquisition::{AcquisitionConfig, ChannelConfig, ConversionTime, VoltageRange};
pub use config::Settings;
pub use error::{ErrorKind, StreamError, StreamResult};
pub use runtime::AcquisitionRuntime;
pub use signal::{Peak, Polarity, ProcessingParams, SignalProcessor, WindowResult};
