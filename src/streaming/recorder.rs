// Session recorder - drives a sample source into the ring buffer and CSV
//
// The recorder manages:
// - Source lifecycle (connect, configure, stop, disconnect)
// - The Idle → Configuring → Recording → Idle state machine
// - A producer task per session that owns the ring writer and CSV writer
// - Finalization on stop, on end of stream, and on fatal source failure
//
// Start and stop are serialized by an async lifecycle lock. The source sits
// behind a tokio mutex because the producer holds it across awaits for the
// whole session.

use crate::acquisition::AcquisitionConfig;
use crate::config::RecorderSettings;
use crate::error::{StreamError, StreamResult};
use crate::persistence::{session_filename, SessionCsvWriter};
use crate::streaming::ring_buffer::{RingBuffer, RingWriter};
use crate::streaming::session::ActiveSession;
use crate::streaming::source::{SampleSource, SourceMetadata};
use crate::streaming::types::{RecorderStatus, RecordingState, SessionInfo};
use chrono::Local;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type SharedSource = Arc<TokioMutex<Box<dyn SampleSource>>>;

struct ProducerHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

/// State shared with producer tasks so they can finalize on their own
#[derive(Clone)]
struct Shared {
    state: Arc<RwLock<RecordingState>>,
    active: Arc<RwLock<Option<Arc<ActiveSession>>>>,
    last: Arc<RwLock<Option<Arc<ActiveSession>>>>,
}

impl Shared {
    fn finalize(&self, session: &Arc<ActiveSession>, interrupted: bool, error: Option<String>) {
        if session.finish(interrupted, error) {
            log::info!(
                "Session {} finalized: {} samples, {} peaks, {:.1} s",
                session.id(),
                session.sample_count(),
                session.peak_count(),
                session.elapsed_s()
            );
        }

        let mut active = self.active.write();
        if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, session)) {
            *active = None;
            *self.last.write() = Some(Arc::clone(session));
            *self.state.write() = RecordingState::Idle;
        }
    }
}

/// Owns the sample source and the current recording session
pub struct SessionRecorder {
    source: SharedSource,
    settings: RecorderSettings,
    shared: Shared,
    connected: AtomicBool,
    metadata: RwLock<Option<SourceMetadata>>,
    producer: Mutex<Option<ProducerHandle>>,
    lifecycle: TokioMutex<()>,
    next_serial: AtomicU64,
}

impl SessionRecorder {
    pub fn new(source: Box<dyn SampleSource>, settings: RecorderSettings) -> Self {
        let connected = source.is_connected();
        Self {
            source: Arc::new(TokioMutex::new(source)),
            settings,
            shared: Shared {
                state: Arc::new(RwLock::new(RecordingState::Idle)),
                active: Arc::new(RwLock::new(None)),
                last: Arc::new(RwLock::new(None)),
            },
            connected: AtomicBool::new(connected),
            metadata: RwLock::new(None),
            producer: Mutex::new(None),
            lifecycle: TokioMutex::new(()),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    pub fn state(&self) -> RecordingState {
        *self.shared.state.read()
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecordingState::Recording
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Metadata reported by the source at the last connect or start
    pub fn source_metadata(&self) -> Option<SourceMetadata> {
        self.metadata.read().clone()
    }

    /// Session currently being recorded
    pub fn active_session(&self) -> Option<Arc<ActiveSession>> {
        self.shared.active.read().clone()
    }

    /// Most recently finalized session, kept until the next one ends
    pub fn last_session(&self) -> Option<Arc<ActiveSession>> {
        self.shared.last.read().clone()
    }

    pub fn status(&self) -> RecorderStatus {
        let state = self.state();
        let session = self.active_session();
        let last = self.last_session();

        RecorderStatus {
            connected: self.is_connected(),
            state,
            elapsed_s: session.as_ref().map(|s| s.elapsed_s()).unwrap_or(0.0),
            session: session.map(|s| s.info()),
            last_session: last.map(|s| s.info()),
        }
    }

    /// Connect the source without starting a session.
    pub async fn connect(&self) -> StreamResult<SourceMetadata> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != RecordingState::Idle {
            return self
                .source_metadata()
                .ok_or_else(|| StreamError::Connection("Source metadata unavailable".to_string()));
        }

        let mut source = self.source.lock().await;
        source.connect().await?;
        let metadata = source.metadata();
        self.connected.store(true, Ordering::Release);
        *self.metadata.write() = Some(metadata.clone());

        log::info!("Source connected: {}", metadata.kind);
        Ok(metadata)
    }

    /// Release the source. Rejected while a session is active.
    pub async fn disconnect(&self) -> StreamResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != RecordingState::Idle {
            return Err(StreamError::StillRecording);
        }

        let mut source = self.source.lock().await;
        source.disconnect().await?;
        self.connected.store(false, Ordering::Release);

        log::info!("Source disconnected");
        Ok(())
    }

    /// Validate the configuration, prepare the source and begin recording.
    pub async fn start(&self, config: AcquisitionConfig) -> StreamResult<SessionInfo> {
        config.validate()?;

        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut state = self.shared.state.write();
            if *state != RecordingState::Idle {
                return Err(StreamError::AlreadyRecording);
            }
            *state = RecordingState::Configuring;
        }

        match self.open_session(config).await {
            Ok(info) => Ok(info),
            Err(e) => {
                log::warn!("Failed to start recording: {}", e);
                *self.shared.state.write() = RecordingState::Idle;
                Err(e)
            }
        }
    }

    async fn open_session(&self, config: AcquisitionConfig) -> StreamResult<SessionInfo> {
        let metadata = {
            let mut source = self.source.lock().await;
            if !source.is_connected() {
                source.connect().await?;
                log::info!("Source connected: {}", source.metadata().kind);
            }
            self.connected.store(true, Ordering::Release);

            source.configure(&config).await?;
            source.metadata()
        };
        *self.metadata.write() = Some(metadata.clone());

        let id = self.next_session_id(&metadata);
        let (writer, ring) = RingBuffer::with_capacity(self.settings.ring_capacity);

        let csv = match &self.settings.data_dir {
            Some(dir) => Some(SessionCsvWriter::create(dir.join(session_filename(&id)))?),
            None => None,
        };

        let session = Arc::new(ActiveSession::new(
            id,
            self.next_serial.fetch_add(1, Ordering::Relaxed),
            config,
            ring,
            csv.as_ref().map(|w| w.path().to_path_buf()),
        ));

        *self.shared.active.write() = Some(Arc::clone(&session));
        *self.shared.state.write() = RecordingState::Recording;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_producer(
            Arc::clone(&self.source),
            Arc::clone(&session),
            writer,
            csv,
            cancel.clone(),
            self.shared.clone(),
        ));
        *self.producer.lock() = Some(ProducerHandle { task, cancel });

        log::info!(
            "Recording started: session {} ({} channel(s), {} ms interval)",
            session.id(),
            metadata.channels.len(),
            metadata.sample_interval_ms
        );
        Ok(session.info())
    }

    /// Session ids are local timestamps, suffixed by source kind and made
    /// unique against the previous session and existing files.
    fn next_session_id(&self, metadata: &SourceMetadata) -> String {
        let suffix = match metadata.kind.as_str() {
            "simulated" => "_demo",
            "replay" => "_replay",
            _ => "",
        };
        let base = format!("{}{}", Local::now().format("%Y%m%d_%H%M%S"), suffix);

        let previous = self.last_session().map(|s| s.id().to_string());
        let taken = |candidate: &str| {
            previous.as_deref() == Some(candidate)
                || self
                    .settings
                    .data_dir
                    .as_ref()
                    .is_some_and(|dir| dir.join(session_filename(candidate)).exists())
        };

        let mut id = base.clone();
        let mut n = 2;
        while taken(&id) {
            id = format!("{}_{}", base, n);
            n += 1;
        }
        id
    }

    /// Stop the current session and return its summary.
    ///
    /// Waits up to the configured stop timeout for the producer. If it does
    /// not finish in time it is aborted, the session is still finalized, and
    /// `Timeout` is returned.
    pub async fn stop(&self) -> StreamResult<SessionInfo> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != RecordingState::Recording {
            return Err(StreamError::NotRecording);
        }
        let session = self.active_session().ok_or(StreamError::NotRecording)?;

        let handle = self.producer.lock().take();
        if let Some(ProducerHandle { mut task, cancel }) = handle {
            cancel.cancel();
            match tokio::time::timeout(self.settings.stop_timeout(), &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Producer task failed: {}", e),
                Err(_) => {
                    task.abort();
                    let message = format!(
                        "producer did not stop within {} ms",
                        self.settings.stop_timeout_ms
                    );
                    log::error!("Session {}: {}", session.id(), message);

                    // The aborted producer releases the source once dropped
                    let _ = tokio::time::timeout(self.settings.stop_timeout(), &mut task).await;
                    self.stop_source().await;

                    self.shared.finalize(&session, false, Some(message.clone()));
                    return Err(StreamError::Timeout(message));
                }
            }
        }

        self.stop_source().await;
        self.shared.finalize(&session, false, None);
        log::info!("Recording stopped: session {}", session.id());
        Ok(session.info())
    }

    /// Tell the source to stop streaming. Failures are logged, never returned.
    async fn stop_source(&self) {
        match tokio::time::timeout(self.settings.stop_timeout(), self.source.lock()).await {
            Ok(mut source) => {
                if let Err(e) = source.stop().await {
                    log::warn!("Source stop failed: {}", e);
                }
            }
            Err(_) => log::warn!("Source still busy, stop not sent"),
        }
    }

    /// Stop any recording and release the source.
    pub async fn shutdown(&self) -> StreamResult<()> {
        match self.stop().await {
            Ok(_) | Err(StreamError::NotRecording) => {}
            Err(e) => log::warn!("Error stopping recording during shutdown: {}", e),
        }
        if self.is_connected() {
            self.disconnect().await?;
        }
        Ok(())
    }
}

enum ProducerExit {
    Cancelled,
    EndOfStream,
    Failed(String),
}

async fn run_producer(
    source: SharedSource,
    session: Arc<ActiveSession>,
    mut writer: RingWriter,
    mut csv: Option<SessionCsvWriter>,
    cancel: CancellationToken,
    shared: Shared,
) {
    let mut source = source.lock().await;

    let exit = {
        let mut stream = source.stream();
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break ProducerExit::Cancelled,

                item = stream.next() => match item {
                    Some(Ok(batch)) => {
                        for sample in &batch {
                            writer.push_sample(sample);
                            session.record_sample();

                            if let Some(w) = csv.as_mut() {
                                if let Err(e) = w.append(sample) {
                                    log::warn!(
                                        "CSV write failed for session {}, persistence disabled: {}",
                                        session.id(),
                                        e
                                    );
                                    csv = None;
                                }
                            }
                        }
                    }
                    Some(Err(e)) if e.is_transient() => {
                        log::warn!("Transient source error (continuing): {}", e);
                    }
                    Some(Err(e)) => break ProducerExit::Failed(e.to_string()),
                    None => break ProducerExit::EndOfStream,
                }
            }
        }
    };

    if let Some(w) = csv.take() {
        if let Err(e) = w.finish() {
            log::warn!("Failed to flush CSV for session {}: {}", session.id(), e);
        }
    }

    match exit {
        ProducerExit::Cancelled => log::debug!("Producer for session {} cancelled", session.id()),
        ProducerExit::EndOfStream => {
            log::info!("Source stream ended for session {}", session.id());
            if let Err(e) = source.stop().await {
                log::warn!("Source stop failed: {}", e);
            }
            shared.finalize(&session, false, None);
        }
        ProducerExit::Failed(message) => {
            log::error!("Source failed during session {}: {}", session.id(), message);
            if let Err(e) = source.stop().await {
                log::warn!("Source stop failed: {}", e);
            }
            shared.finalize(&session, true, Some(message));
        }
    }
}
