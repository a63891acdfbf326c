// In-memory source that plays a fixed script of batches and errors

use super::{SampleSource, SampleStream, SourceMetadata};
use crate::acquisition::AcquisitionConfig;
use crate::error::{StreamError, StreamResult};
use crate::streaming::types::Sample;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// One step of a script
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Batch(Vec<Sample>),
    /// Recoverable read error; the script continues
    Transient(String),
    /// Unrecoverable failure; the stream ends here
    Fatal(String),
    Pause(Duration),
}

/// Counters a test can keep after handing the source to a recorder
#[derive(Debug, Default)]
pub struct ScriptCalls {
    pub connects: AtomicUsize,
    pub streams: AtomicUsize,
    pub stops: AtomicUsize,
    pub disconnects: AtomicUsize,
}

pub struct ScriptedSource {
    steps: Vec<ScriptStep>,
    /// Keep the stream pending after the last step instead of ending it
    hold_open: bool,
    batch_delay: Option<Duration>,
    connect_error: Option<String>,
    connected: bool,
    config: AcquisitionConfig,
    calls: Arc<ScriptCalls>,
}

impl ScriptedSource {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            hold_open: false,
            batch_delay: None,
            connect_error: None,
            connected: false,
            config: AcquisitionConfig::default(),
            calls: Arc::new(ScriptCalls::default()),
        }
    }

    /// Split samples into batches of `batch_size`.
    pub fn from_samples(samples: Vec<Sample>, batch_size: usize) -> Self {
        let steps = samples
            .chunks(batch_size.max(1))
            .map(|chunk| ScriptStep::Batch(chunk.to_vec()))
            .collect();
        Self::new(steps)
    }

    pub fn hold_open(mut self, hold_open: bool) -> Self {
        self.hold_open = hold_open;
        self
    }

    pub fn batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = Some(delay);
        self
    }

    /// Make every `connect` fail with the given message.
    pub fn failing_connect(mut self, message: impl Into<String>) -> Self {
        self.connect_error = Some(message.into());
        self
    }

    pub fn calls(&self) -> Arc<ScriptCalls> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl SampleSource for ScriptedSource {
    async fn connect(&mut self) -> StreamResult<()> {
        self.calls.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.connect_error {
            return Err(StreamError::Connection(message.clone()));
        }
        self.connected = true;
        Ok(())
    }

    async fn configure(&mut self, config: &AcquisitionConfig) -> StreamResult<()> {
        config.validate()?;
        if !self.connected {
            return Err(StreamError::InvalidConfig(
                "Scripted source is not connected".to_string(),
            ));
        }
        self.config = config.clone();
        Ok(())
    }

    fn stream(&mut self) -> SampleStream<'_> {
        self.calls.streams.fetch_add(1, Ordering::SeqCst);
        let steps = self.steps.clone();
        let hold_open = self.hold_open;
        let batch_delay = self.batch_delay;

        Box::pin(async_stream::stream! {
            for step in steps {
                match step {
                    ScriptStep::Batch(batch) => {
                        if let Some(delay) = batch_delay {
                            sleep(delay).await;
                        }
                        yield Ok(batch);
                    }
                    ScriptStep::Transient(message) => {
                        yield Err(StreamError::TransientSource(message));
                    }
                    ScriptStep::Fatal(message) => {
                        yield Err(StreamError::FatalSource(message));
                        return;
                    }
                    ScriptStep::Pause(duration) => sleep(duration).await,
                }
            }

            if hold_open {
                futures::future::pending::<()>().await;
            }
        })
    }

    async fn stop(&mut self) -> StreamResult<()> {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> StreamResult<()> {
        self.calls.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            kind: "scripted".to_string(),
            channels: self.config.enabled_channels().map(|c| c.channel).collect(),
            sample_interval_ms: self.config.sample_interval_ms(),
            simulated: true,
            properties: [("steps".to_string(), self.steps.len().to_string())]
                .into_iter()
                .collect(),
        }
    }
}
