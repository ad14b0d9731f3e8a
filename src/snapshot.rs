//! Bounded history of simulation state snapshots, indexed by frame.
//!
//! Each saved frame holds the serialized simulation state (possibly compressed), the
//! checksum ladder computed at save time, and a compression tag describing how to get
//! the raw bytes back. Checksums are stored alongside the state so replay never has
//! to recompute them for frames that were not re-simulated.
//!
//! Storage is a fixed ring of [`StateCell`]s indexed by `frame % capacity`; ring
//! pressure evicts oldest-first by construction.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{BulwarkError, InternalErrorKind, InvalidFrameReason};
use crate::optimizer::compression;
use crate::telemetry::{InvariantChecker, InvariantViolation};
use crate::{ChecksumLevel, Frame};

use serde::{Deserialize, Serialize};

/// The layered checksums for one saved frame.
///
/// `basic` and `enhanced` are present for every save; `deep` only on its sparse
/// schedule and `native` only when the simulation core provides one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChecksumTuple {
    /// Cheap hash, computed every frame.
    pub basic: u64,
    /// Medium-cost hash, computed every frame.
    pub enhanced: u64,
    /// Expensive hash, computed on a sparse schedule.
    pub deep: Option<u64>,
    /// Simulation-native checksum, if the simulation provides one.
    pub native: Option<u64>,
}

impl ChecksumTuple {
    /// Returns the checksum at `level`, if that level was computed.
    #[must_use]
    pub fn level(&self, level: ChecksumLevel) -> Option<u64> {
        match level {
            ChecksumLevel::Basic => Some(self.basic),
            ChecksumLevel::Enhanced => Some(self.enhanced),
            ChecksumLevel::Deep => self.deep,
            ChecksumLevel::Native => self.native,
        }
    }

    /// Compares two ladders level by level, cheapest first, and returns the first
    /// level at which both sides are present but disagree.
    ///
    /// Levels missing on either side are skipped; two ladders that only overlap on
    /// matching levels compare equal.
    #[must_use]
    pub fn first_mismatch(&self, other: &ChecksumTuple) -> Option<ChecksumLevel> {
        const LEVELS: [ChecksumLevel; 4] = [
            ChecksumLevel::Basic,
            ChecksumLevel::Enhanced,
            ChecksumLevel::Deep,
            ChecksumLevel::Native,
        ];
        for level in LEVELS {
            if let (Some(ours), Some(theirs)) = (self.level(level), other.level(level)) {
                if ours != theirs {
                    return Some(level);
                }
            }
        }
        None
    }

    /// Whether the two ladders agree on every level both sides computed.
    #[must_use]
    pub fn matches(&self, other: &ChecksumTuple) -> bool {
        self.first_mismatch(other).is_none()
    }
}

/// How the bytes inside a snapshot are encoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionTag {
    /// Raw serialized state.
    #[default]
    None,
    /// Byte-wise delta against the snapshot at `base_frame`.
    Delta {
        /// The frame whose snapshot the delta was computed against.
        base_frame: Frame,
    },
    /// Run-length compressed full state.
    Generic,
}

/// The contents of one snapshot slot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotData {
    /// The frame this snapshot belongs to; [`Frame::NULL`] for an empty slot.
    pub frame: Frame,
    /// The stored (possibly compressed) state bytes.
    pub bytes: Option<Vec<u8>>,
    /// The checksum ladder computed at save time.
    pub checksums: Option<ChecksumTuple>,
    /// How `bytes` is encoded.
    pub compression: CompressionTag,
}

/// A shared, lock-guarded snapshot slot.
///
/// Cells are cheap to clone and hand out; the ring and any state-transfer code
/// observe the same underlying slot.
#[derive(Clone, Default)]
pub struct StateCell(Arc<Mutex<SnapshotData>>);

impl StateCell {
    /// Overwrites the slot with a new snapshot.
    pub fn save(
        &self,
        frame: Frame,
        bytes: Vec<u8>,
        checksums: ChecksumTuple,
        compression: CompressionTag,
    ) {
        let mut data = self.0.lock();
        data.frame = frame;
        data.bytes = Some(bytes);
        data.checksums = Some(checksums);
        data.compression = compression;
    }

    /// Clears the slot back to empty.
    pub fn reset(&self) {
        *self.0.lock() = SnapshotData::default();
    }

    /// The frame currently stored in this slot.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.0.lock().frame
    }

    /// The checksum ladder stored in this slot, if any.
    #[must_use]
    pub fn checksums(&self) -> Option<ChecksumTuple> {
        self.0.lock().checksums
    }

    /// Replaces the stored checksum ladder (used when replay recomputes a sparse
    /// level that rollback invalidated).
    pub fn set_checksums(&self, checksums: ChecksumTuple) {
        self.0.lock().checksums = Some(checksums);
    }

    /// Returns a copy of the stored bytes and their compression tag.
    #[must_use]
    pub fn raw(&self) -> Option<(Vec<u8>, CompressionTag)> {
        let data = self.0.lock();
        data.bytes.as_ref().map(|b| (b.clone(), data.compression))
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.0.lock();
        f.debug_struct("StateCell")
            .field("frame", &data.frame)
            .field("bytes_len", &data.bytes.as_ref().map(Vec::len))
            .field("compression", &data.compression)
            .finish()
    }
}

/// Bounded ring of snapshots indexed by frame.
pub struct SnapshotRing {
    cells: Vec<StateCell>,
    capacity: usize,
}

impl SnapshotRing {
    /// Creates a ring holding up to `capacity` snapshots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            cells: (0..capacity).map(|_| StateCell::default()).collect(),
            capacity,
        }
    }

    /// The fixed number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.iter().filter(|c| c.frame().is_valid()).count()
    }

    /// Whether no snapshot is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, frame: Frame) -> &StateCell {
        // capacity >= 1 and frame is validated non-negative by callers
        let index = (frame.as_i32().unsigned_abs() as usize) % self.capacity;
        &self.cells[index]
    }

    /// Stores a snapshot for `frame`, evicting whatever occupied its slot.
    pub fn save(
        &mut self,
        frame: Frame,
        bytes: Vec<u8>,
        checksums: ChecksumTuple,
        compression: CompressionTag,
    ) -> Result<(), BulwarkError> {
        if !frame.is_valid() {
            return Err(BulwarkError::InvalidFrame {
                frame,
                reason: InvalidFrameReason::NullFrame,
            });
        }
        self.slot(frame).save(frame, bytes, checksums, compression);
        Ok(())
    }

    /// Returns the cell holding exactly `frame`, if it has not been evicted.
    #[must_use]
    pub fn cell(&self, frame: Frame) -> Option<&StateCell> {
        let cell = self.slot(frame);
        (cell.frame() == frame).then_some(cell)
    }

    /// Whether a snapshot for exactly `frame` is held.
    #[must_use]
    pub fn contains(&self, frame: Frame) -> bool {
        self.cell(frame).is_some()
    }

    /// The newest stored frame, or [`Frame::NULL`] if empty.
    #[must_use]
    pub fn latest_frame(&self) -> Frame {
        self.cells
            .iter()
            .map(StateCell::frame)
            .max()
            .unwrap_or(Frame::NULL)
    }

    /// The oldest stored frame, or [`Frame::NULL`] if empty.
    #[must_use]
    pub fn oldest_frame(&self) -> Frame {
        self.cells
            .iter()
            .map(StateCell::frame)
            .filter(|f| f.is_valid())
            .min()
            .unwrap_or(Frame::NULL)
    }

    /// Returns the latest stored cell with frame <= `frame`, if any.
    #[must_use]
    pub fn find_nearest(&self, frame: Frame) -> Option<&StateCell> {
        self.cells
            .iter()
            .filter(|c| c.frame().is_valid() && c.frame() <= frame)
            .max_by_key(|c| c.frame())
    }

    /// Reconstructs the raw state bytes for `frame`, resolving delta chains against
    /// their base snapshots and undoing generic compression.
    pub fn load_state(&self, frame: Frame) -> Result<Vec<u8>, BulwarkError> {
        let cell = self.cell(frame).ok_or({
            let nearest = self.oldest_frame();
            BulwarkError::InvalidFrame {
                frame,
                reason: InvalidFrameReason::Evicted {
                    oldest_kept: nearest,
                },
            }
        })?;
        self.resolve(cell, 0)
    }

    fn resolve(&self, cell: &StateCell, depth: usize) -> Result<Vec<u8>, BulwarkError> {
        // A delta chain can never be longer than the ring itself; anything deeper
        // means a base frame loop and a bug.
        if depth > self.capacity {
            return Err(BulwarkError::Internal {
                kind: InternalErrorKind::DecompressionFailed,
            });
        }
        let (bytes, tag) = cell.raw().ok_or(BulwarkError::Internal {
            kind: InternalErrorKind::DecompressionFailed,
        })?;
        match tag {
            CompressionTag::None => Ok(bytes),
            CompressionTag::Generic => compression::rle_decompress(&bytes)
                .map_err(|_| BulwarkError::Internal {
                    kind: InternalErrorKind::DecompressionFailed,
                }),
            CompressionTag::Delta { base_frame } => {
                let base_cell = self.cell(base_frame).ok_or(BulwarkError::Internal {
                    kind: InternalErrorKind::DeltaBaseMissing { base_frame },
                })?;
                let base = self.resolve(base_cell, depth + 1)?;
                compression::delta_apply(&base, &bytes).map_err(|_| BulwarkError::Internal {
                    kind: InternalErrorKind::DecompressionFailed,
                })
            },
        }
    }

    /// Drops every snapshot with frame >= `frame` (after a rollback the dropped
    /// frames will be re-saved during replay).
    pub fn invalidate_from(&mut self, frame: Frame) {
        for cell in &self.cells {
            if cell.frame().is_valid() && cell.frame() >= frame {
                cell.reset();
            }
        }
    }

    /// Clears the entire ring (full resync).
    pub fn clear(&mut self) {
        for cell in &self.cells {
            cell.reset();
        }
    }
}

impl std::fmt::Debug for SnapshotRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotRing")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("oldest", &self.oldest_frame())
            .field("latest", &self.latest_frame())
            .finish()
    }
}

impl InvariantChecker for SnapshotRing {
    /// # Invariants
    ///
    /// 1. The slot vector length equals the fixed capacity.
    /// 2. Occupied slots never exceed capacity.
    /// 3. Every occupied slot holds the frame that hashes to it.
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.cells.len() != self.capacity {
            return Err(InvariantViolation::new(
                "SnapshotRing",
                "slot count does not match capacity",
            )
            .with_details(format!(
                "cells.len()={}, capacity={}",
                self.cells.len(),
                self.capacity
            )));
        }
        if self.len() > self.capacity {
            return Err(InvariantViolation::new(
                "SnapshotRing",
                "occupied slots exceed capacity",
            ));
        }
        for (index, cell) in self.cells.iter().enumerate() {
            let frame = cell.frame();
            if frame.is_valid() && (frame.as_i32() as usize) % self.capacity != index {
                return Err(InvariantViolation::new(
                    "SnapshotRing",
                    "slot holds a frame that does not hash to it",
                )
                .with_details(format!("index={index}, frame={frame}")));
            }
        }
        Ok(())
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod checksum_tests {
    use super::*;

    fn tuple(basic: u64, enhanced: u64) -> ChecksumTuple {
        ChecksumTuple {
            basic,
            enhanced,
            deep: None,
            native: None,
        }
    }

    #[test]
    fn identical_ladders_match() {
        assert!(tuple(1, 2).matches(&tuple(1, 2)));
        assert_eq!(tuple(1, 2).first_mismatch(&tuple(1, 2)), None);
    }

    #[test]
    fn first_mismatch_is_cheapest_level() {
        let ours = ChecksumTuple {
            basic: 1,
            enhanced: 9,
            deep: Some(9),
            native: None,
        };
        let theirs = ChecksumTuple {
            basic: 1,
            enhanced: 8,
            deep: Some(8),
            native: None,
        };
        assert_eq!(ours.first_mismatch(&theirs), Some(ChecksumLevel::Enhanced));
    }

    #[test]
    fn missing_levels_are_skipped() {
        let ours = ChecksumTuple {
            basic: 1,
            enhanced: 2,
            deep: Some(3),
            native: None,
        };
        let theirs = tuple(1, 2);
        assert!(ours.matches(&theirs));
    }

    #[test]
    fn deep_mismatch_detected_when_both_present() {
        let ours = ChecksumTuple {
            basic: 1,
            enhanced: 2,
            deep: Some(3),
            native: None,
        };
        let theirs = ChecksumTuple {
            basic: 1,
            enhanced: 2,
            deep: Some(4),
            native: None,
        };
        assert_eq!(ours.first_mismatch(&theirs), Some(ChecksumLevel::Deep));
    }
}
