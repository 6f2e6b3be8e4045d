// src/io/serial/framer.rs
//
// TA612C binary frame synchronisation, validation and decoding.
//
// Device -> host frame layout:
//   [0x55][0xAA][cmd][len][payload: len - 2 bytes][checksum]
// `len` counts itself, the payload and the checksum, so a frame occupies
// 3 + len bytes. The checksum is the low byte of the sum of every byte before it.

use crate::checksums::validate_sum8_trailer;

use super::reading::{extract_reading, Reading, REALTIME_PAYLOAD_LEN};

// =============================================================================
// Protocol Constants
// =============================================================================

/// Device -> host sync marker.
pub const SYNC: [u8; 2] = [0x55, 0xAA];

/// Sync + command + length.
pub const HEADER_LEN: usize = 4;

/// Real-time 4-channel temperature sample.
pub const CMD_REALTIME: u8 = 0x01;

/// The length byte must at least count itself and the checksum.
const MIN_LENGTH_FIELD: u8 = 2;

// =============================================================================
// Types
// =============================================================================

/// A complete, checksum-validated device frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFrame {
    bytes: Vec<u8>,
}

impl DeviceFrame {
    /// Validate a candidate slice. Returns `None` if the declared length
    /// is impossible or the checksum does not match.
    fn validate(candidate: &[u8]) -> Option<Self> {
        if candidate.len() < HEADER_LEN + 1 || candidate[3] < MIN_LENGTH_FIELD {
            return None;
        }
        if !validate_sum8_trailer(candidate) {
            return None;
        }
        Some(DeviceFrame {
            bytes: candidate.to_vec(),
        })
    }

    pub fn command(&self) -> u8 {
        self.bytes[2]
    }

    /// Payload bytes between the length byte and the checksum.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..self.bytes.len() - 1]
    }

    /// The frame exactly as it appeared on the wire.
    #[cfg(test)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

// =============================================================================
// Decoding
// =============================================================================

fn find_sync(buf: &[u8]) -> Option<usize> {
    buf.windows(SYNC.len()).position(|w| w == SYNC)
}

/// Decode every complete frame in `buf`.
///
/// Returns the validated frames in arrival order and the unconsumed tail that
/// must be kept for the next call. When no sync marker is present only the
/// final byte is kept, since it may be the first half of a marker split
/// across reads. A candidate with a bad checksum is dropped as a whole and
/// scanning resumes after it.
pub fn decode_frames(buf: &[u8]) -> (Vec<DeviceFrame>, Vec<u8>) {
    let mut frames = Vec::new();
    let mut rest = buf;

    loop {
        let Some(start) = find_sync(rest) else {
            let keep = rest.len().min(1);
            rest = &rest[rest.len() - keep..];
            break;
        };
        rest = &rest[start..];

        if rest.len() < HEADER_LEN {
            break;
        }

        let frame_size = SYNC.len() + 1 + rest[3] as usize;
        if rest.len() < frame_size {
            break;
        }

        let (candidate, tail) = rest.split_at(frame_size);
        rest = tail;

        if let Some(frame) = DeviceFrame::validate(candidate) {
            frames.push(frame);
        }
    }

    (frames, rest.to_vec())
}

/// Extract temperature readings from decoded frames.
/// Frames with other commands or short payloads are skipped.
pub fn readings_from_frames(frames: &[DeviceFrame]) -> Vec<Reading> {
    frames
        .iter()
        .filter(|f| f.command() == CMD_REALTIME && f.payload().len() >= REALTIME_PAYLOAD_LEN)
        .filter_map(|f| extract_reading(f.payload()))
        .collect()
}

// =============================================================================
// Streaming Framer
// =============================================================================

/// Per-connection accumulation buffer around [`decode_frames`].
#[derive(Debug, Default)]
pub struct Ta612cFramer {
    buffer: Vec<u8>,
}

impl Ta612cFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes and return any frames they complete.
    pub fn feed(&mut self, data: &[u8]) -> Vec<DeviceFrame> {
        self.buffer.extend_from_slice(data);
        let (frames, remainder) = decode_frames(&self.buffer);
        self.buffer = remainder;
        frames
    }

    /// Bytes held back waiting for the rest of a frame.
    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

// =============================================================================
// Test Helpers
// =============================================================================

/// Build a well-formed device frame (test use only).
#[cfg(test)]
pub(crate) fn encode_test_frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.extend_from_slice(&SYNC);
    frame.push(cmd);
    frame.push((payload.len() + 2) as u8);
    frame.extend_from_slice(payload);
    crate::checksums::append_sum8(&frame)
}

/// Build a real-time frame from four raw channel codes (test use only).
#[cfg(test)]
pub(crate) fn encode_realtime_frame(values: [i16; 4]) -> Vec<u8> {
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    encode_test_frame(CMD_REALTIME, &payload)
}
