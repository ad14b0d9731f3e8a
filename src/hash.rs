//! Deterministic hashing for state checksums.
//!
//! `DefaultHasher` is randomly seeded per process, which would make every peer
//! compute different checksums for identical states. The runtime's own checksum
//! levels therefore use FNV-1a with fixed constants: fast, deterministic across
//! platforms, and good enough distribution for divergence detection. Not
//! cryptographic, and not meant to be.

/// FNV-1a 64-bit offset basis constant.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime constant.
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Computes the FNV-1a hash of `bytes`.
#[inline]
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    fnv1a_seeded(bytes, FNV_OFFSET_BASIS)
}

/// FNV-1a with a caller-chosen basis, so distinct checksum levels hashing the
/// same bytes do not collide by construction.
#[inline]
#[must_use]
pub fn fnv1a_seeded(bytes: &[u8], basis: u64) -> u64 {
    let mut state = basis;
    for &byte in bytes {
        state ^= u64::from(byte);
        state = state.wrapping_mul(FNV_PRIME);
    }
    state
}

/// Basis for the enhanced checksum level: the standard basis perturbed so the
/// two levels disagree independently under corruption.
pub const ENHANCED_BASIS: u64 = FNV_OFFSET_BASIS ^ 0x9e37_79b9_7f4a_7c15;

/// Basis for the deep checksum level.
pub const DEEP_BASIS: u64 = FNV_OFFSET_BASIS ^ 0x6a09_e667_f3bc_c909;

// #########
// # TESTS #
// #########
