//! State compression: byte-wise delta encoding layered over run-length encoding.
//!
//! Delta encoding XORs a state against a base snapshot; consecutive frames usually
//! differ in a handful of bytes, so the XOR stream is almost all zeros and run-length
//! encodes well. The same RLE layer doubles as the generic compressor for full
//! states above the size threshold.
//!
//! Both directions are fully deterministic: identical inputs produce identical
//! compressed bytes on every platform, which matters because compressed snapshots
//! travel between peers during resync.

use std::fmt;

/// Longest encodable repeat run (control byte range 0x80..=0xFF maps to 3..=130).
const MAX_REPEAT_RUN: usize = 130;
/// Shortest run worth encoding as a repeat instead of a literal.
const MIN_REPEAT_RUN: usize = 3;
/// Longest encodable literal run (control byte range 0x00..=0x7F maps to 1..=128).
const MAX_LITERAL_RUN: usize = 128;

/// Errors produced while undoing compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CompressionError {
    /// The compressed stream ended mid-token.
    Truncated {
        /// Offset at which the stream ended unexpectedly.
        offset: usize,
    },
    /// A delta stream is missing its length header.
    MissingHeader,
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset } => {
                write!(f, "compressed stream truncated at offset {offset}")
            },
            Self::MissingHeader => write!(f, "delta stream is missing its length header"),
        }
    }
}

impl std::error::Error for CompressionError {}

/// Run-length encodes `bytes`.
///
/// Token format: a control byte `c` followed by data. `c < 0x80` introduces a
/// literal run of `c + 1` bytes; `c >= 0x80` introduces a repeat of the next byte,
/// `c - 0x80 + 3` times. Greedy and deterministic.
#[must_use]
pub fn rle_compress(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() / 4 + 8);
    let mut i = 0;
    let mut literal_start = 0;

    let flush_literals = |out: &mut Vec<u8>, start: usize, end: usize, bytes: &[u8]| {
        let mut from = start;
        while from < end {
            let take = (end - from).min(MAX_LITERAL_RUN);
            out.push((take - 1) as u8);
            out.extend_from_slice(&bytes[from..from + take]);
            from += take;
        }
    };

    while i < bytes.len() {
        let byte = bytes[i];
        let mut run = 1;
        while i + run < bytes.len() && bytes[i + run] == byte && run < MAX_REPEAT_RUN {
            run += 1;
        }
        if run >= MIN_REPEAT_RUN {
            flush_literals(&mut out, literal_start, i, bytes);
            out.push(0x80 + (run - MIN_REPEAT_RUN) as u8);
            out.push(byte);
            i += run;
            literal_start = i;
        } else {
            i += run;
        }
    }
    flush_literals(&mut out, literal_start, bytes.len(), bytes);
    out
}

/// Undoes [`rle_compress`].
pub fn rle_decompress(bytes: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    let mut i = 0;
    while i < bytes.len() {
        let control = bytes[i];
        i += 1;
        if control < 0x80 {
            let len = control as usize + 1;
            let end = i + len;
            if end > bytes.len() {
                return Err(CompressionError::Truncated { offset: i });
            }
            out.extend_from_slice(&bytes[i..end]);
            i = end;
        } else {
            let len = (control - 0x80) as usize + MIN_REPEAT_RUN;
            let byte = *bytes.get(i).ok_or(CompressionError::Truncated { offset: i })?;
            i += 1;
            out.resize(out.len() + len, byte);
        }
    }
    Ok(out)
}

/// Encodes `target` as a delta against `base`.
///
/// The delta is a 4-byte little-endian target length followed by the run-length
/// encoded XOR stream of `target` against the zero-padded `base`. States of
/// different lengths are handled by the padding and the explicit length.
#[must_use]
pub fn delta_encode(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut xored = Vec::with_capacity(target.len());
    for (index, &byte) in target.iter().enumerate() {
        xored.push(byte ^ base.get(index).copied().unwrap_or(0));
    }
    let mut out = Vec::with_capacity(xored.len() / 4 + 8);
    out.extend_from_slice(&(target.len() as u32).to_le_bytes());
    out.extend_from_slice(&rle_compress(&xored));
    out
}

/// Reconstructs the target state from `base` and a delta produced by
/// [`delta_encode`]. The exact inverse: `delta_apply(base, delta_encode(base, t)) == t`.
pub fn delta_apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if delta.len() < 4 {
        return Err(CompressionError::MissingHeader);
    }
    let (header, body) = delta.split_at(4);
    let target_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let xored = rle_decompress(body)?;
    if xored.len() != target_len {
        return Err(CompressionError::Truncated { offset: delta.len() });
    }
    let mut out = Vec::with_capacity(target_len);
    for (index, &byte) in xored.iter().enumerate() {
        out.push(byte ^ base.get(index).copied().unwrap_or(0));
    }
    Ok(out)
}

/// The selected generic compression algorithm.
///
/// A small capability set rather than a trait object: the algorithm travels with
/// the session configuration and all peers of a session must agree on it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum GenericCompressor {
    /// Deterministic run-length encoding (the reference algorithm).
    #[default]
    RunLength,
}

impl GenericCompressor {
    /// Compresses a full state.
    #[must_use]
    pub fn compress(self, state: &[u8]) -> Vec<u8> {
        match self {
            GenericCompressor::RunLength => rle_compress(state),
        }
    }

    /// Undoes [`compress`](Self::compress).
    pub fn decompress(self, bytes: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            GenericCompressor::RunLength => rle_decompress(bytes),
        }
    }
}

// #########
// # TESTS #
// #########


#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod delta_tests {
    use super::*;

    #[test]
    fn single_byte_change_is_tiny() {
        let base = vec![0xAAu8; 2048];
        let mut target = base.clone();
        target[777] = 0xAB;

        let delta = delta_encode(&base, &target);
        assert!(delta.len() < target.len() / 4);
        assert_eq!(delta_apply(&base, &delta).unwrap(), target);
    }

    #[test]
    fn identical_states_produce_minimal_delta() {
        let base = vec![5u8; 512];
        let delta = delta_encode(&base, &base);
        assert!(delta.len() < 16);
        assert_eq!(delta_apply(&base, &delta).unwrap(), base);
    }

    #[test]
    fn growing_state_roundtrips() {
        let base = vec![1u8, 2, 3];
        let target = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let delta = delta_encode(&base, &target);
        assert_eq!(delta_apply(&base, &delta).unwrap(), target);
    }

    #[test]
    fn shrinking_state_roundtrips() {
        let base = vec![1u8, 2, 3, 4, 5, 6];
        let target = vec![1u8, 9];
        let delta = delta_encode(&base, &target);
        assert_eq!(delta_apply(&base, &delta).unwrap(), target);
    }

    #[test]
    fn missing_header_errors() {
        assert_eq!(
            delta_apply(&[1, 2], &[0, 0]).unwrap_err(),
            CompressionError::MissingHeader
        );
    }

    #[test]
    fn generic_compressor_roundtrips() {
        let compressor = GenericCompressor::RunLength;
        let state = vec![3u8; 4096];
        let compressed = compressor.compress(&state);
        assert!(compressed.len() < state.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), state);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// rle_decompress ∘ rle_compress is identity.
        #[test]
        fn prop_rle_roundtrip(state in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let compressed = rle_compress(&state);
            prop_assert_eq!(rle_decompress(&compressed).unwrap(), state);
        }

        /// delta_apply ∘ delta_encode is identity for any base/target pair.
        #[test]
        fn prop_delta_roundtrip(
            base in proptest::collection::vec(any::<u8>(), 0..1024),
            target in proptest::collection::vec(any::<u8>(), 0..1024),
        ) {
            let delta = delta_encode(&base, &target);
            prop_assert_eq!(delta_apply(&base, &delta).unwrap(), target);
        }

        /// Compression output is deterministic.
        #[test]
        fn prop_compression_deterministic(state in proptest::collection::vec(any::<u8>(), 0..1024)) {
            prop_assert_eq!(rle_compress(&state), rle_compress(&state));
        }
    }
}
