// src/telemetry/influx.rs
//
// InfluxDB v2 telemetry sink.
//
// Readings are formatted as line protocol and queued on a bounded channel.
// A background task drains the queue, batching whatever is already waiting,
// and POSTs to /api/v2/write. Write failures are logged and the batch dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{TelemetryError, TelemetrySink};
use crate::io::serial::Reading;

// ============================================================================
// Configuration
// ============================================================================

/// Capacity of the pending-line queue between the relay and the writer.
const QUEUE_CAPACITY: usize = 1024;

/// Upper bound on lines sent in a single write request.
const MAX_BATCH_LINES: usize = 500;

/// How long shutdown waits for pending writes to drain.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection details for an InfluxDB v2 bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    pub measurement: String,
}

// ============================================================================
// Line Protocol
// ============================================================================

/// Escape a measurement name for line protocol (commas and spaces).
fn escape_measurement(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, ',' | ' ' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Format a reading as one line-protocol point with nanosecond timestamp.
///
/// Fields are `t1`..`t4`; open channels are omitted rather than written as
/// null or zero. Returns `None` when no channel is connected since a point
/// needs at least one field.
pub fn to_line_protocol(measurement: &str, reading: &Reading) -> Option<String> {
    if reading.is_empty() {
        return None;
    }

    let fields: Vec<String> = reading
        .present_channels()
        .map(|(channel, temp)| format!("t{}={}", channel, temp))
        .collect();

    let mut line = format!("{} {}", escape_measurement(measurement), fields.join(","));
    if let Some(ns) = reading.captured_at.timestamp_nanos_opt() {
        line.push_str(&format!(" {}", ns));
    }
    Some(line)
}

// ============================================================================
// Writer Backend
// ============================================================================

/// Destination for batches of line-protocol text.
#[async_trait]
pub trait LineWriter: Send + Sync {
    async fn write_lines(&self, body: String) -> Result<(), TelemetryError>;
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for the InfluxDB v2 API.
pub struct InfluxHttpWriter {
    client: reqwest::Client,
    config: InfluxConfig,
}

impl InfluxHttpWriter {
    pub fn new(config: InfluxConfig) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ta612c-bridge/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| TelemetryError::Http(format!("Failed to create HTTP client: {}", e)))?;
        Ok(InfluxHttpWriter { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Check that the server reports itself healthy.
    pub async fn check_health(&self) -> Result<(), TelemetryError> {
        let response = self
            .client
            .get(self.endpoint("health"))
            .send()
            .await
            .map_err(|e| TelemetryError::Unhealthy(e.to_string()))?;

        let health: HealthResponse = response
            .json()
            .await
            .map_err(|e| TelemetryError::Unhealthy(format!("unreadable response: {}", e)))?;

        if health.status == "pass" {
            Ok(())
        } else {
            Err(TelemetryError::Unhealthy(
                health.message.unwrap_or(health.status),
            ))
        }
    }
}

#[async_trait]
impl LineWriter for InfluxHttpWriter {
    async fn write_lines(&self, body: String) -> Result<(), TelemetryError> {
        let response = self
            .client
            .post(self.endpoint("api/v2/write"))
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.config.token))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| TelemetryError::Http(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TelemetryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

// ============================================================================
// Sink
// ============================================================================

enum WriterCommand {
    Line(String),
    Flush,
}

/// Telemetry sink that queues readings for the background writer.
pub struct InfluxSink {
    measurement: String,
    tx: mpsc::Sender<WriterCommand>,
}

impl TelemetrySink for InfluxSink {
    fn record(&self, reading: &Reading) -> Result<(), TelemetryError> {
        let Some(line) = to_line_protocol(&self.measurement, reading) else {
            return Ok(());
        };
        self.tx.try_send(WriterCommand::Line(line)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TelemetryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TelemetryError::Closed,
        })
    }
}

/// Owner-side handle used to flush and stop the background writer.
pub struct InfluxWriterHandle {
    tx: mpsc::Sender<WriterCommand>,
    task: JoinHandle<()>,
}

impl InfluxWriterHandle {
    /// Write everything still queued, then stop the writer.
    pub async fn shutdown(self) {
        if self.tx.send(WriterCommand::Flush).await.is_err() {
            return;
        }
        if tokio::time::timeout(FLUSH_TIMEOUT, self.task).await.is_err() {
            tlog!("[influx] Timed out flushing pending writes");
        }
    }
}

impl InfluxSink {
    /// Connect to InfluxDB: check server health, then start the writer task.
    pub async fn connect(config: InfluxConfig) -> Result<(Arc<Self>, InfluxWriterHandle), TelemetryError> {
        let measurement = config.measurement.clone();
        let writer = InfluxHttpWriter::new(config)?;
        writer.check_health().await?;
        Ok(Self::with_writer(measurement, Arc::new(writer)))
    }

    /// Start a sink over any line writer.
    pub fn with_writer(
        measurement: String,
        writer: Arc<dyn LineWriter>,
    ) -> (Arc<Self>, InfluxWriterHandle) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let task = tokio::spawn(run_writer(rx, writer));
        let sink = Arc::new(InfluxSink {
            measurement,
            tx: tx.clone(),
        });
        (sink, InfluxWriterHandle { tx, task })
    }
}

/// Background writer loop. Collects every line already queued into one
/// request so bursts cost a single round trip.
async fn run_writer(mut rx: mpsc::Receiver<WriterCommand>, writer: Arc<dyn LineWriter>) {
    let mut batch: Vec<String> = Vec::new();

    while let Some(command) = rx.recv().await {
        let mut stop = matches!(command, WriterCommand::Flush);
        if let WriterCommand::Line(line) = command {
            batch.push(line);
        }

        while batch.len() < MAX_BATCH_LINES {
            match rx.try_recv() {
                Ok(WriterCommand::Line(line)) => batch.push(line),
                Ok(WriterCommand::Flush) => stop = true,
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let count = batch.len();
            let body = batch.join("\n");
            batch.clear();
            if let Err(e) = writer.write_lines(body).await {
                tlog!("[influx] Write error ({} points dropped): {}", count, e);
            }
        }

        if stop {
            rx.close();
            // Lines accepted before close still deserve a write
            let rest: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
                .filter_map(|c| match c {
                    WriterCommand::Line(line) => Some(line),
                    WriterCommand::Flush => None,
                })
                .collect();
            if !rest.is_empty() {
                if let Err(e) = writer.write_lines(rest.join("\n")).await {
                    tlog!("[influx] Write error during flush: {}", e);
                }
            }
            break;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
