// src/io/serial/reading.rs
//
// Interprets a TA612C real-time frame payload as a 4-channel temperature sample.
//
// Payload layout (command 0x01):
//   [t1 lo][t1 hi][t2 lo][t2 hi][t3 lo][t3 hi][t4 lo][t4 hi]
// Each value is a signed 16-bit little-endian integer holding degrees C x 10.
// Readings outside the thermocouple range are the device's open-channel code.

use chrono::{DateTime, Utc};

// ============================================================================
// Constants
// ============================================================================

/// Number of thermocouple inputs on the TA612C.
pub const CHANNEL_COUNT: usize = 4;

/// Minimum payload length that carries all four channels.
pub const REALTIME_PAYLOAD_LEN: usize = CHANNEL_COUNT * 2;

/// Lowest temperature the device reports for a connected probe.
pub const MIN_TEMPERATURE_C: f64 = -300.0;

/// Highest temperature the device reports for a connected probe.
pub const MAX_TEMPERATURE_C: f64 = 2000.0;

// ============================================================================
// Types
// ============================================================================

/// One decoded 4-channel sample. `None` marks an open or disconnected probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub channels: [Option<f64>; CHANNEL_COUNT],
    /// Wall-clock time the sample was decoded
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    /// Iterate over connected channels as (1-based channel number, temperature).
    pub fn present_channels(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.channels
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.map(|t| (i + 1, t)))
    }

    /// True when every channel reports an open probe.
    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(Option::is_none)
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Convert a raw channel code into degrees C, or `None` for an open channel.
pub fn decode_temperature(raw: i16) -> Option<f64> {
    let temp = f64::from(raw) / 10.0;
    (MIN_TEMPERATURE_C..=MAX_TEMPERATURE_C)
        .contains(&temp)
        .then_some(temp)
}

/// Extract a reading from a real-time payload.
/// Returns `None` if the payload is too short to hold all four channels.
pub fn extract_reading(payload: &[u8]) -> Option<Reading> {
    if payload.len() < REALTIME_PAYLOAD_LEN {
        return None;
    }

    let mut channels = [None; CHANNEL_COUNT];
    for (index, channel) in channels.iter_mut().enumerate() {
        let offset = index * 2;
        let raw = i16::from_le_bytes([payload[offset], payload[offset + 1]]);
        *channel = decode_temperature(raw);
    }

    Some(Reading {
        channels,
        captured_at: Utc::now(),
    })
}

// ============================================================================
// Tests
// ============================================================================
