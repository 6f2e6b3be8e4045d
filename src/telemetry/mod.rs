// src/telemetry/mod.rs
//
// Forwarding of decoded temperature readings to a time-series store.
//
// The relay holds an optional sink handle. Sinks must never block the relay:
// `record` queues the reading and returns immediately, and any failure is
// logged by the caller and otherwise ignored.

pub mod influx;

use std::sync::Arc;

use thiserror::Error;

use crate::io::serial::{readings_from_frames, Reading, Ta612cFramer};

pub use influx::{InfluxConfig, InfluxSink, InfluxWriterHandle};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry queue is full, reading dropped")]
    QueueFull,

    #[error("telemetry writer has stopped")]
    Closed,

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("server rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("health check failed: {0}")]
    Unhealthy(String),
}

/// Receiver for decoded readings.
pub trait TelemetrySink: Send + Sync {
    /// Queue one reading for storage. Must not block.
    fn record(&self, reading: &Reading) -> Result<(), TelemetryError>;
}

// ============================================================================
// Relay Tap
// ============================================================================

/// Per-connection decoder feeding a telemetry sink.
///
/// Owns the connection's accumulation buffer; nothing here is shared with
/// other connections.
pub struct TelemetryTap {
    framer: Ta612cFramer,
    sink: Arc<dyn TelemetrySink>,
}

impl TelemetryTap {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        TelemetryTap {
            framer: Ta612cFramer::new(),
            sink,
        }
    }

    /// Decode `data` and forward every completed reading to the sink.
    /// Returns the number of readings decoded. Sink errors are logged only.
    pub fn ingest(&mut self, data: &[u8]) -> usize {
        let frames = self.framer.feed(data);
        let readings = readings_from_frames(&frames);
        for reading in &readings {
            if let Err(e) = self.sink.record(reading) {
                tlog!("[telemetry] Failed to record reading: {}", e);
            }
        }
        readings.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
