// src/checksums.rs
//
// Checksum calculation for TA612C frame validation.
// The device protects each frame with a truncated 8-bit sum.

// ============================================================================
// Named Checksum Functions
// ============================================================================

/// Simple modulo-256 sum of bytes (8-bit sum).
pub fn sum8_checksum(data: &[u8]) -> u8 {
    let mut sum: u8 = 0;
    for &byte in data {
        sum = sum.wrapping_add(byte);
    }
    sum
}

/// Validate a frame whose final byte is the sum8 of everything before it.
///
/// Frames shorter than two bytes cannot carry both data and a checksum and
/// are never valid.
pub fn validate_sum8_trailer(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((&checksum, data)) if !data.is_empty() => sum8_checksum(data) == checksum,
        _ => false,
    }
}

/// Append the sum8 checksum to data.
#[cfg(test)]
pub fn append_sum8(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len() + 1);
    result.extend_from_slice(data);
    result.push(sum8_checksum(data));
    result
}

// ============================================================================
// Tests
// ============================================================================
