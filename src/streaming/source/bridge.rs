// Hardware bridge source
//
// The logger's vendor library is loaded by a separate bridge process. We
// talk to it over stdin/stdout, one JSON object per line:
//   → {"cmd": "open"}                      ← {"ok": true, "handle": 1}
//   → {"cmd": "set_channel", ...}          ← {"ok": true}
//   → {"cmd": "ready"}                     ← {"ok": true, "ready": true}
//   → {"cmd": "get_values", "n_values": 20}
//   ← {"ok": true, "n_returned": 2, "samples": [123, 456]}
// On start the bridge prints a single ready line before accepting commands.

use super::{SampleSource, SampleStream, SourceMetadata};
use crate::acquisition::{AcquisitionConfig, ChannelConfig};
use crate::error::{StreamError, StreamResult};
use crate::streaming::types::Sample;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::{sleep, timeout, Duration};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 20;

/// Values requested per `run`/`get_values` round trip
const VALUES_PER_READ: u32 = 20;
/// Streaming mode understood by the driver
const METHOD_STREAM: u16 = 2;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum BridgeCommand {
    Open,
    SetMains {
        reject_50hz: bool,
    },
    SetChannel {
        channel: u8,
        enabled: bool,
        range: i16,
        single_ended: bool,
    },
    SetInterval {
        interval_ms: u64,
        conv_time: i16,
    },
    Run {
        n_values: u32,
        method: u16,
    },
    Ready,
    GetValues {
        n_values: u32,
    },
    Stop,
    Close,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BridgeReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ready: Option<bool>,
    #[serde(default)]
    handle: Option<i64>,
    #[serde(default)]
    n_returned: i64,
    #[serde(default)]
    samples: Vec<i32>,
}

impl BridgeReply {
    fn error_message(&self) -> String {
        self.error.clone().unwrap_or_else(|| "unknown".to_string())
    }
}

struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    /// Commands written whose reply has not been read yet. A stream dropped
    /// mid-request leaves one behind.
    pending: usize,
}

impl BridgeProcess {
    async fn spawn(program: &str, args: &[String]) -> StreamResult<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::Connection(format!("Failed to start bridge {}: {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StreamError::Connection("Bridge stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::Connection("Bridge stdout not captured".to_string()))?;

        let mut process = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            pending: 0,
        };

        let ready = process.read_reply().await?;
        if !ready.ok {
            return Err(StreamError::Connection(format!(
                "Bridge error: {}",
                ready.error_message()
            )));
        }

        Ok(process)
    }

    async fn read_reply(&mut self) -> StreamResult<BridgeReply> {
        let line = timeout(REPLY_TIMEOUT, self.stdout.next_line())
            .await
            .map_err(|_| StreamError::Timeout("No reply from bridge".to_string()))??
            .ok_or_else(|| {
                StreamError::Connection("Bridge process closed unexpectedly".to_string())
            })?;

        serde_json::from_str(line.trim())
            .map_err(|e| StreamError::Parse(format!("Invalid bridge reply {:?}: {}", line, e)))
    }

    async fn send(&mut self, command: &BridgeCommand) -> StreamResult<BridgeReply> {
        while self.pending > 0 {
            log::debug!("Discarding stale bridge reply");
            self.pending -= 1;
            self.read_reply().await?;
        }

        let mut line = serde_json::to_string(command)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        self.pending += 1;
        let reply = self.read_reply().await;
        self.pending -= 1;
        reply
    }

    /// Send a command that must succeed during setup.
    async fn expect_ok(&mut self, command: &BridgeCommand, what: &str) -> StreamResult<BridgeReply> {
        let reply = self.send(command).await?;
        if reply.ok {
            Ok(reply)
        } else {
            Err(StreamError::InvalidConfig(format!(
                "Failed to {}: {}",
                what,
                reply.error_message()
            )))
        }
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.send(&BridgeCommand::Close).await {
            log::warn!("Error closing bridge: {}", e);
        }

        match timeout(EXIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => log::debug!("Bridge exited with {}", status),
            Ok(Err(e)) => log::warn!("Failed to wait for bridge: {}", e),
            Err(_) => {
                log::warn!("Bridge did not exit, killing it");
                if let Err(e) = self.child.kill().await {
                    log::warn!("Failed to kill bridge: {}", e);
                }
            }
        }
    }
}

/// Sample source backed by the hardware bridge subprocess
pub struct BridgeSource {
    program: String,
    args: Vec<String>,
    poll_interval: Duration,
    process: Option<BridgeProcess>,
    config: Option<AcquisitionConfig>,
    streaming: bool,
}

impl BridgeSource {
    pub fn new(program: String, args: Vec<String>, poll_interval_ms: u64) -> Self {
        Self {
            program,
            args,
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
            process: None,
            config: None,
            streaming: false,
        }
    }
}

/// Split an interleaved driver buffer into samples, one round per enabled
/// channel. Rounds are spaced `interval_s` apart, ending at `now`, and never
/// go back before `last`.
fn decode_values(
    raw: &[i32],
    n_returned: usize,
    channels: &[ChannelConfig],
    now: f64,
    interval_s: f64,
    last: f64,
) -> Vec<Sample> {
    if channels.is_empty() {
        return Vec::new();
    }

    let rounds = n_returned.min(raw.len() / channels.len());
    let mut samples = Vec::with_capacity(rounds * channels.len());

    for round in 0..rounds {
        let behind = (rounds - 1 - round) as f64 * interval_s;
        let timestamp = (now - behind).max(last);
        for (offset, ch) in channels.iter().enumerate() {
            let count = raw[round * channels.len() + offset];
            samples.push(Sample::new(
                timestamp,
                ch.channel,
                count,
                ch.voltage_range.counts_to_microvolts(count),
            ));
        }
    }

    samples
}

/// Connection-level failures end the stream; malformed replies do not.
fn classify(error: StreamError) -> StreamError {
    if error.is_transient() {
        error
    } else {
        StreamError::FatalSource(error.to_string())
    }
}

#[async_trait]
impl SampleSource for BridgeSource {
    async fn connect(&mut self) -> StreamResult<()> {
        if self.process.is_some() {
            log::warn!("Bridge already connected");
            return Ok(());
        }

        let mut process = BridgeProcess::spawn(&self.program, &self.args).await?;
        log::info!("Bridge subprocess started: {}", self.program);

        let reply = process.send(&BridgeCommand::Open).await?;
        if !reply.ok {
            process.shutdown().await;
            return Err(StreamError::Connection(format!(
                "Failed to open ADC-24: {}. Check USB connection.",
                reply.error_message()
            )));
        }

        log::info!(
            "ADC-24 connected via bridge (handle={})",
            reply.handle.unwrap_or_default()
        );
        self.process = Some(process);
        Ok(())
    }

    async fn configure(&mut self, config: &AcquisitionConfig) -> StreamResult<()> {
        config.validate()?;
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| StreamError::InvalidConfig("Bridge is not connected".to_string()))?;

        process
            .expect_ok(
                &BridgeCommand::SetMains {
                    reject_50hz: config.mains_rejection_50hz,
                },
                "set mains rejection",
            )
            .await?;
        log::info!(
            "Mains rejection: {} Hz",
            if config.mains_rejection_50hz { 50 } else { 60 }
        );

        for ch in config.enabled_channels() {
            process
                .expect_ok(
                    &BridgeCommand::SetChannel {
                        channel: ch.channel,
                        enabled: true,
                        range: ch.voltage_range.code(),
                        single_ended: ch.single_ended,
                    },
                    &format!("set channel {}", ch.channel),
                )
                .await?;
            log::info!(
                "Channel {}: {}, {}",
                ch.channel,
                if ch.single_ended { "single-ended" } else { "differential" },
                ch.voltage_range
            );
        }

        self.config = Some(config.clone());
        Ok(())
    }

    fn stream(&mut self) -> SampleStream<'_> {
        let process = self.process.as_mut();
        let config = self.config.clone();
        let poll_interval = self.poll_interval;
        let streaming = &mut self.streaming;

        Box::pin(async_stream::stream! {
            let (Some(process), Some(config)) = (process, config) else {
                yield Err(StreamError::FatalSource("Bridge not connected or not configured".to_string()));
                return;
            };

            let channels: Vec<ChannelConfig> = config.enabled_channels().cloned().collect();
            let interval_ms = config.sample_interval_ms();
            let interval_s = interval_ms as f64 / 1000.0;

            let setup = [
                (
                    BridgeCommand::SetInterval {
                        interval_ms,
                        conv_time: config.conversion_time.code(),
                    },
                    "set interval",
                ),
                (
                    BridgeCommand::Run {
                        n_values: VALUES_PER_READ,
                        method: METHOD_STREAM,
                    },
                    "start stream",
                ),
            ];
            for (command, what) in &setup {
                if let Err(e) = process.expect_ok(command, what).await {
                    yield Err(StreamError::FatalSource(e.to_string()));
                    return;
                }
            }

            *streaming = true;
            let start = Instant::now();
            let mut last = 0.0;
            log::info!(
                "Streaming started: {} ch, {} ms interval",
                channels.len(),
                interval_ms
            );

            loop {
                let ready = match process.send(&BridgeCommand::Ready).await {
                    Ok(reply) => reply.ready.unwrap_or(false),
                    Err(e) => {
                        let e = classify(e);
                        let fatal = !e.is_transient();
                        yield Err(e);
                        if fatal {
                            return;
                        }
                        continue;
                    }
                };
                if !ready {
                    sleep(poll_interval).await;
                    continue;
                }

                let reply = match process
                    .send(&BridgeCommand::GetValues {
                        n_values: VALUES_PER_READ,
                    })
                    .await
                {
                    Ok(reply) => reply,
                    Err(e) => {
                        let e = classify(e);
                        let fatal = !e.is_transient();
                        yield Err(e);
                        if fatal {
                            return;
                        }
                        continue;
                    }
                };

                if !reply.ok {
                    yield Err(StreamError::TransientSource(format!(
                        "get_values failed: {}",
                        reply.error_message()
                    )));
                    sleep(poll_interval).await;
                    continue;
                }

                if reply.n_returned > 0 {
                    let batch = decode_values(
                        &reply.samples,
                        reply.n_returned as usize,
                        &channels,
                        start.elapsed().as_secs_f64(),
                        interval_s,
                        last,
                    );
                    if let Some(newest) = batch.last() {
                        last = newest.timestamp;
                        yield Ok(batch);
                    }
                }

                sleep(poll_interval).await;
            }
        })
    }

    async fn stop(&mut self) -> StreamResult<()> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;

        if let Some(process) = self.process.as_mut() {
            let reply = process.send(&BridgeCommand::Stop).await?;
            if !reply.ok {
                log::warn!("Bridge refused stop: {}", reply.error_message());
            }
        }
        log::info!("Streaming stopped");
        Ok(())
    }

    async fn disconnect(&mut self) -> StreamResult<()> {
        if self.streaming {
            if let Err(e) = self.stop().await {
                log::warn!("Error stopping bridge stream: {}", e);
            }
        }

        if let Some(process) = self.process.take() {
            process.shutdown().await;
            log::info!("ADC-24 disconnected");
        }
        self.config = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.process.is_some()
    }

    fn metadata(&self) -> SourceMetadata {
        let config = self.config.clone().unwrap_or_default();
        SourceMetadata {
            kind: "bridge".to_string(),
            channels: config.enabled_channels().map(|c| c.channel).collect(),
            sample_interval_ms: config.sample_interval_ms(),
            simulated: false,
            properties: [
                ("program".to_string(), self.program.clone()),
                ("args".to_string(), self.args.join(" ")),
            ]
            .into_iter()
            .collect(),
        }
    }
}
