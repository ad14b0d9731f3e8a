//! Per-player sparse input rings with prediction and correction tracking.
//!
//! Every player owns a circular buffer of inputs keyed by frame. Missing remote
//! inputs are predicted by repeating the last observed authoritative input (the
//! standard rollback heuristic); when the real input later arrives and differs from
//! the prediction, a correction event is produced and the engine schedules a
//! rollback to the corrected frame.
//!
//! Inputs are opaque byte bundles. The empty bundle doubles as the blank input used
//! before any input from a player has been observed.

use std::collections::BTreeMap;

use web_time::Instant;

use crate::error::{BulwarkError, InvalidFrameReason};
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{report_violation, Frame, InputStatus, PlayerId};

/// A stored input for one player and frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEntry {
    /// The frame this input belongs to.
    pub frame: Frame,
    /// The opaque input payload.
    pub bytes: Vec<u8>,
    /// Local wall time at which the input was received, `None` for predictions.
    pub received_at: Option<Instant>,
    /// Whether this entry is a prediction rather than a received input.
    pub predicted: bool,
}

/// Produced when an authoritative input contradicts a stored prediction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionEvent {
    /// The player whose input was mispredicted.
    pub player: PlayerId,
    /// The mispredicted frame.
    pub frame: Frame,
    /// What the ring had predicted.
    pub predicted: Vec<u8>,
    /// What actually arrived.
    pub authoritative: Vec<u8>,
}

/// Outcome of inserting an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The input was stored (or confirmed an equal prediction).
    Stored,
    /// An equal input was already present; nothing changed.
    Duplicate,
    /// The input contradicted a stored prediction.
    Corrected(CorrectionEvent),
}

#[derive(Debug)]
struct PlayerRing {
    player: PlayerId,
    slots: Vec<Option<InputEntry>>,
    /// Greatest frame f such that authoritative inputs exist for all frames <= f.
    last_confirmed: Frame,
    /// The most recent authoritative input, used as the prediction source.
    last_observed: Option<Vec<u8>>,
    predictions_made: u64,
}

impl PlayerRing {
    fn new(player: PlayerId, capacity: usize) -> Self {
        Self {
            player,
            slots: (0..capacity).map(|_| None).collect(),
            last_confirmed: Frame::NULL,
            last_observed: None,
            predictions_made: 0,
        }
    }

    fn slot_index(&self, frame: Frame) -> usize {
        (frame.as_i32().unsigned_abs() as usize) % self.slots.len()
    }

    fn entry(&self, frame: Frame) -> Option<&InputEntry> {
        let entry = self.slots[self.slot_index(frame)].as_ref()?;
        (entry.frame == frame).then_some(entry)
    }

    /// Advances the confirmation horizon while consecutive authoritative inputs
    /// are present. Starting from the NULL horizon, `next()` is frame 0.
    fn advance_confirmed(&mut self) {
        loop {
            let next = self.last_confirmed.next();
            match self.entry(next) {
                Some(entry) if !entry.predicted => self.last_confirmed = next,
                _ => break,
            }
        }
    }

    fn put(
        &mut self,
        frame: Frame,
        bytes: Vec<u8>,
        received_at: Option<Instant>,
    ) -> PutOutcome {
        let index = self.slot_index(frame);
        if let Some(existing) = &self.slots[index] {
            if existing.frame == frame {
                if existing.bytes == bytes {
                    if existing.predicted {
                        // Prediction was correct: promote in place, no rollback.
                        if let Some(entry) = self.slots[index].as_mut() {
                            entry.predicted = false;
                            entry.received_at = received_at;
                        }
                        self.last_observed = Some(bytes);
                        self.advance_confirmed();
                        return PutOutcome::Stored;
                    }
                    return PutOutcome::Duplicate;
                }
                if existing.predicted {
                    let correction = CorrectionEvent {
                        player: self.player,
                        frame,
                        predicted: existing.bytes.clone(),
                        authoritative: bytes.clone(),
                    };
                    self.slots[index] = Some(InputEntry {
                        frame,
                        bytes: bytes.clone(),
                        received_at,
                        predicted: false,
                    });
                    self.last_observed = Some(bytes);
                    self.advance_confirmed();
                    return PutOutcome::Corrected(correction);
                }
                // Conflicting authoritative inputs violate the single-writer rule;
                // the first write wins.
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::FrameSync,
                    "conflicting authoritative input for player {} frame {}",
                    self.player,
                    frame
                );
                return PutOutcome::Duplicate;
            }
        }
        self.slots[index] = Some(InputEntry {
            frame,
            bytes: bytes.clone(),
            received_at,
            predicted: false,
        });
        self.last_observed = Some(bytes);
        self.advance_confirmed();
        PutOutcome::Stored
    }

    fn get_or_predict(&mut self, frame: Frame) -> (Vec<u8>, InputStatus) {
        if let Some(entry) = self.entry(frame) {
            let status = if entry.predicted {
                InputStatus::Predicted
            } else {
                InputStatus::Confirmed
            };
            return (entry.bytes.clone(), status);
        }
        // Predict by repeating the last observed input and remember the prediction
        // so a later authoritative arrival can be compared against it.
        let prediction = self.last_observed.clone().unwrap_or_default();
        let index = self.slot_index(frame);
        self.slots[index] = Some(InputEntry {
            frame,
            bytes: prediction.clone(),
            received_at: None,
            predicted: true,
        });
        self.predictions_made += 1;
        (prediction, InputStatus::Predicted)
    }

    fn discard_before(&mut self, frame: Frame) {
        for slot in &mut self.slots {
            if let Some(entry) = slot {
                if entry.frame < frame {
                    *slot = None;
                }
            }
        }
    }

    fn reset_predictions(&mut self) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|e| e.predicted) {
                *slot = None;
            }
        }
    }
}

/// All players' input rings plus session-wide confirmation tracking.
#[derive(Debug)]
pub struct InputRing {
    rings: BTreeMap<PlayerId, PlayerRing>,
    capacity: usize,
}

impl InputRing {
    /// Creates an input ring where each player's buffer holds `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: BTreeMap::new(),
            capacity: capacity.max(2),
        }
    }

    /// Registers a player. Returns `false` if already present.
    pub fn add_player(&mut self, player: PlayerId) -> bool {
        if self.rings.contains_key(&player) {
            return false;
        }
        self.rings
            .insert(player, PlayerRing::new(player, self.capacity));
        true
    }

    /// Removes a player and their inputs.
    pub fn remove_player(&mut self, player: PlayerId) -> bool {
        self.rings.remove(&player).is_some()
    }

    /// The registered players, in id order.
    pub fn players(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.rings.keys().copied()
    }

    /// Number of registered players.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.rings.len()
    }

    /// Inserts an authoritative input.
    ///
    /// Idempotent for equal `(player, frame)` payloads. A payload contradicting a
    /// stored prediction yields [`PutOutcome::Corrected`]. Inputs at or before the
    /// session-wide confirmed frame are rejected as too old (a transient condition
    /// under network reordering, not a failure).
    pub fn put(
        &mut self,
        player: PlayerId,
        frame: Frame,
        bytes: Vec<u8>,
        received_at: Option<Instant>,
    ) -> Result<PutOutcome, BulwarkError> {
        let confirmed = self.confirmed_frame();
        if !frame.is_valid() {
            return Err(BulwarkError::InvalidFrame {
                frame,
                reason: InvalidFrameReason::NullFrame,
            });
        }
        if confirmed.is_valid() && frame < confirmed {
            return Err(BulwarkError::InvalidFrame {
                frame,
                reason: InvalidFrameReason::FrameTooOld {
                    confirmed_frame: confirmed,
                },
            });
        }
        let ring = self
            .rings
            .get_mut(&player)
            .ok_or(BulwarkError::InvalidRequest {
                kind: crate::error::InvalidRequestKind::UnknownPlayer { id: player },
            })?;
        Ok(ring.put(frame, bytes, received_at))
    }

    /// Returns the input for `(player, frame)`, predicting (and remembering the
    /// prediction) when no authoritative input is present. Never returns "nothing".
    pub fn get(&mut self, player: PlayerId, frame: Frame) -> Option<(Vec<u8>, InputStatus)> {
        self.rings
            .get_mut(&player)
            .map(|ring| ring.get_or_predict(frame))
    }

    /// The greatest frame for which `player`'s inputs are confirmed.
    #[must_use]
    pub fn last_confirmed(&self, player: PlayerId) -> Frame {
        self.rings
            .get(&player)
            .map_or(Frame::NULL, |r| r.last_confirmed)
    }

    /// The session-wide confirmed frame: the minimum over all players.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.rings
            .values()
            .map(|r| r.last_confirmed)
            .min()
            .unwrap_or(Frame::NULL)
    }

    /// Total predictions handed out across all players.
    #[must_use]
    pub fn prediction_count(&self) -> u64 {
        self.rings.values().map(|r| r.predictions_made).sum()
    }

    /// Frees entries older than `frame` across all players (retention eviction).
    pub fn discard_before(&mut self, frame: Frame) {
        for ring in self.rings.values_mut() {
            ring.discard_before(frame);
        }
    }

    /// Drops all stored predictions (full resync).
    pub fn reset_predictions(&mut self) {
        for ring in self.rings.values_mut() {
            ring.reset_predictions();
        }
    }
}

impl InvariantChecker for InputRing {
    /// # Invariants
    ///
    /// 1. Every occupied slot holds the frame that hashes to it.
    /// 2. Per-player confirmation horizons never exceed the newest stored frame.
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for (player, ring) in &self.rings {
            let len = ring.slots.len();
            for (index, slot) in ring.slots.iter().enumerate() {
                if let Some(entry) = slot {
                    if entry.frame.is_valid()
                        && (entry.frame.as_i32() as usize) % len != index
                    {
                        return Err(InvariantViolation::new(
                            "InputRing",
                            "slot holds a frame that does not hash to it",
                        )
                        .with_details(format!(
                            "player={player}, index={index}, frame={}",
                            entry.frame
                        )));
                    }
                }
            }
            let newest = ring
                .slots
                .iter()
                .flatten()
                .map(|e| e.frame)
                .max()
                .unwrap_or(Frame::NULL);
            if ring.last_confirmed.is_valid() && newest.is_valid() && ring.last_confirmed > newest
            {
                return Err(InvariantViolation::new(
                    "InputRing",
                    "confirmation horizon exceeds newest stored frame",
                )
                .with_details(format!(
                    "player={player}, last_confirmed={}, newest={newest}",
                    ring.last_confirmed
                )));
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
mod tests {
    use super::*;

    const P0: PlayerId = PlayerId::new(0);
    const P1: PlayerId = PlayerId::new(1);

    fn two_player_ring() -> InputRing {
        let mut ring = InputRing::new(64);
        ring.add_player(P0);
        ring.add_player(P1);
        ring
    }

    fn put(ring: &mut InputRing, player: PlayerId, frame: i32, byte: u8) -> PutOutcome {
        ring.put(player, Frame::new(frame), vec![byte], None).unwrap()
    }

    #[test]
    fn stored_input_reads_back_confirmed() {
        let mut ring = two_player_ring();
        assert_eq!(put(&mut ring, P0, 0, 7), PutOutcome::Stored);
        assert_eq!(
            ring.get(P0, Frame::new(0)).unwrap(),
            (vec![7], InputStatus::Confirmed)
        );
    }

    #[test]
    fn equal_reinsert_is_duplicate() {
        let mut ring = two_player_ring();
        put(&mut ring, P0, 0, 7);
        assert_eq!(put(&mut ring, P0, 0, 7), PutOutcome::Duplicate);
    }

    #[test]
    fn missing_input_predicts_last_observed() {
        let mut ring = two_player_ring();
        put(&mut ring, P1, 0, 9);
        let (bytes, status) = ring.get(P1, Frame::new(3)).unwrap();
        assert_eq!(bytes, vec![9]);
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(ring.prediction_count(), 1);
    }

    #[test]
    fn prediction_before_any_input_is_blank() {
        let mut ring = two_player_ring();
        let (bytes, status) = ring.get(P1, Frame::new(0)).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(status, InputStatus::Predicted);
    }

    #[test]
    fn correct_prediction_confirms_without_correction() {
        let mut ring = two_player_ring();
        put(&mut ring, P1, 0, 4);
        // Predict frame 1 (repeats 4), then the real equal input arrives.
        ring.get(P1, Frame::new(1)).unwrap();
        assert_eq!(put(&mut ring, P1, 1, 4), PutOutcome::Stored);
        assert_eq!(
            ring.get(P1, Frame::new(1)).unwrap(),
            (vec![4], InputStatus::Confirmed)
        );
    }

    #[test]
    fn wrong_prediction_yields_correction() {
        let mut ring = two_player_ring();
        put(&mut ring, P1, 0, 4);
        ring.get(P1, Frame::new(1)).unwrap();

        let outcome = put(&mut ring, P1, 1, 5);
        match outcome {
            PutOutcome::Corrected(correction) => {
                assert_eq!(correction.player, P1);
                assert_eq!(correction.frame, Frame::new(1));
                assert_eq!(correction.predicted, vec![4]);
                assert_eq!(correction.authoritative, vec![5]);
            },
            other => panic!("expected correction, got {other:?}"),
        }
        // The authoritative value replaced the prediction.
        assert_eq!(
            ring.get(P1, Frame::new(1)).unwrap(),
            (vec![5], InputStatus::Confirmed)
        );
    }

    #[test]
    fn confirmation_requires_contiguity() {
        let mut ring = two_player_ring();
        put(&mut ring, P0, 0, 1);
        put(&mut ring, P0, 2, 3);
        // Frame 1 is missing, so confirmation stops at 0.
        assert_eq!(ring.last_confirmed(P0), Frame::new(0));
        put(&mut ring, P0, 1, 2);
        assert_eq!(ring.last_confirmed(P0), Frame::new(2));
    }

    #[test]
    fn session_confirmed_is_minimum_over_players() {
        let mut ring = two_player_ring();
        put(&mut ring, P0, 0, 1);
        put(&mut ring, P0, 1, 1);
        put(&mut ring, P1, 0, 2);
        assert_eq!(ring.confirmed_frame(), Frame::new(0));
        put(&mut ring, P1, 1, 2);
        assert_eq!(ring.confirmed_frame(), Frame::new(1));
    }

    #[test]
    fn input_before_confirmed_is_too_old() {
        let mut ring = two_player_ring();
        for frame in 0..3 {
            put(&mut ring, P0, frame, 1);
            put(&mut ring, P1, frame, 1);
        }
        let err = ring
            .put(P0, Frame::new(1), vec![9], None)
            .unwrap_err();
        assert!(matches!(
            err,
            BulwarkError::InvalidFrame {
                reason: InvalidFrameReason::FrameTooOld { confirmed_frame },
                ..
            } if confirmed_frame == Frame::new(2)
        ));
        assert_eq!(err.severity(), crate::error::Severity::Transient);
    }

    #[test]
    fn unknown_player_is_rejected() {
        let mut ring = two_player_ring();
        let err = ring
            .put(PlayerId::new(9), Frame::new(0), vec![1], None)
            .unwrap_err();
        assert!(matches!(err, BulwarkError::InvalidRequest { .. }));
    }

    #[test]
    fn discard_before_frees_old_entries() {
        let mut ring = two_player_ring();
        for frame in 0..10 {
            put(&mut ring, P0, frame, frame as u8);
            put(&mut ring, P1, frame, frame as u8);
        }
        ring.discard_before(Frame::new(5));
        ring.check_invariants().unwrap();
        // Confirmation horizon is untouched by retention eviction.
        assert_eq!(ring.confirmed_frame(), Frame::new(9));
    }

    #[test]
    fn reset_predictions_drops_only_predictions() {
        let mut ring = two_player_ring();
        put(&mut ring, P1, 0, 4);
        ring.get(P1, Frame::new(2)).unwrap();
        ring.reset_predictions();
        // The confirmed input survives.
        assert_eq!(
            ring.get(P1, Frame::new(0)).unwrap(),
            (vec![4], InputStatus::Confirmed)
        );
        // Frame 2 re-predicts (counts again).
        assert_eq!(ring.prediction_count(), 2);
    }

    #[test]
    fn ring_wraparound_keeps_frames_straight() {
        let mut ring = InputRing::new(8);
        ring.add_player(P0);
        for frame in 0..20 {
            ring.put(P0, Frame::new(frame), vec![frame as u8], None)
                .unwrap();
        }
        ring.check_invariants().unwrap();
        assert_eq!(
            ring.get(P0, Frame::new(19)).unwrap(),
            (vec![19], InputStatus::Confirmed)
        );
    }

    #[test]
    fn remove_player_unblocks_confirmation() {
        let mut ring = two_player_ring();
        put(&mut ring, P0, 0, 1);
        // P1 never sends anything; the session horizon is stuck at NULL.
        assert_eq!(ring.confirmed_frame(), Frame::NULL);
        ring.remove_player(P1);
        assert_eq!(ring.confirmed_frame(), Frame::new(0));
    }
}
