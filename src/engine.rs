//! The rollback engine: frame pipeline, prediction, rollback and re-simulation.
//!
//! The engine owns the simulation core, the input rings and the snapshot ring. One
//! `tick()` call runs the frame pipeline:
//!
//! 1. Apply the earliest pending input correction by restoring the snapshot at the
//!    corrected frame and re-simulating forward with authoritative inputs.
//! 2. Advance one frame speculatively, predicting missing remote inputs, as long as
//!    the prediction window allows; otherwise stall and wait for remote input.
//! 3. Save the new state and its checksum ladder so the desync detector and sync
//!    tests can run against it.
//!
//! Rollback is a substep, not a state: observers only ever see the engine between
//! ticks, never a partially rolled back simulation.

use std::collections::BTreeSet;

use web_time::Instant;

use crate::error::{BulwarkError, InvalidFrameReason, InvalidRequestKind};
use crate::hash;
use crate::input_ring::{InputRing, PutOutcome};
use crate::optimizer::PerformanceOptimizer;
use crate::snapshot::{ChecksumTuple, CompressionTag, SnapshotRing, StateCell};
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{
    report_violation, ChecksumLevel, Frame, FrameInputs, PlayerFrameInput, PlayerId,
    SimulationCore,
};

/// Engine lifecycle. Rollback never appears here; it happens inside a tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// Not started, or terminally stopped.
    Stopped,
    /// Advancing frames.
    Running,
    /// At the prediction bound, waiting for remote input.
    Stalled,
}

/// Static tuning the engine is constructed with.
#[derive(Debug, Clone, Copy)]
pub struct EngineTuning {
    /// Frames of delay applied to local input to reduce prediction volume.
    pub input_delay: usize,
    /// Maximum frames of speculation past the confirmed frame.
    pub max_prediction: usize,
    /// Maximum rollback depth.
    pub max_rollback: usize,
    /// Snapshot ring capacity.
    pub snapshot_ring_size: usize,
    /// Deep checksums are computed every this many frames.
    pub deep_checksum_interval: u32,
}

/// One completed rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackSummary {
    /// The frame restored and replayed from.
    pub from: Frame,
    /// Number of frames re-simulated.
    pub depth: u32,
}

/// What one tick did, for the session to route onwards.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Frames newly simulated forward this tick.
    pub advanced: Vec<Frame>,
    /// Snapshots saved this tick (forward and replay), with their ladders.
    pub saved: Vec<(Frame, ChecksumTuple)>,
    /// The rollback performed this tick, if any.
    pub rollback: Option<RollbackSummary>,
    /// Whether the engine refused to advance at the prediction bound.
    pub stalled: bool,
}

/// Counters exposed for observability and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetrics {
    /// The current simulation frame.
    pub current_frame: Frame,
    /// The session-wide confirmed frame.
    pub confirmed_frame: Frame,
    /// Rollbacks performed.
    pub rollback_count: u64,
    /// Mean rollback depth in frames.
    pub avg_rollback_depth: f64,
    /// Predictions handed to the simulation.
    pub prediction_count: u64,
    /// Ticks refused at the prediction bound.
    pub stall_count: u64,
}

/// Drives the simulation core forward, backward and forward again.
pub struct RollbackEngine {
    sim: Box<dyn SimulationCore>,
    inputs: InputRing,
    snapshots: SnapshotRing,
    tuning: EngineTuning,
    state: EngineState,
    current_frame: Frame,
    local_players: BTreeSet<PlayerId>,

    /// Earliest frame with a pending input correction, applied next tick.
    earliest_correction: Frame,
    /// Raw bytes of the most recently saved frame, the delta base for the next
    /// save (avoids re-resolving delta chains out of the ring every frame).
    last_raw_state: Option<(Frame, Vec<u8>)>,

    rollback_count: u64,
    total_rollback_depth: u64,
    stall_count: u64,
}

impl RollbackEngine {
    /// Creates an engine around a simulation core. Call [`start`](Self::start)
    /// after registering players.
    #[must_use]
    pub fn new(sim: Box<dyn SimulationCore>, tuning: EngineTuning) -> Self {
        Self {
            inputs: InputRing::new(tuning.snapshot_ring_size),
            snapshots: SnapshotRing::new(tuning.snapshot_ring_size),
            sim,
            tuning,
            state: EngineState::Stopped,
            current_frame: Frame::new(0),
            local_players: BTreeSet::new(),
            earliest_correction: Frame::NULL,
            last_raw_state: None,
            rollback_count: 0,
            total_rollback_depth: 0,
            stall_count: 0,
        }
    }

    /// The engine's lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The current simulation frame.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The session-wide confirmed frame.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.inputs.confirmed_frame()
    }

    /// The greatest confirmed frame for one player.
    #[must_use]
    pub fn last_confirmed(&self, player: PlayerId) -> Frame {
        self.inputs.last_confirmed(player)
    }

    /// Registers a player before or during a session.
    pub fn add_player(&mut self, player: PlayerId, local: bool) -> Result<(), BulwarkError> {
        if !self.inputs.add_player(player) {
            return Err(BulwarkError::InvalidRequest {
                kind: InvalidRequestKind::DuplicatePlayer { id: player },
            });
        }
        if local {
            self.local_players.insert(player);
        }
        // A mid-session joiner contributes no inputs for frames that are already
        // in flight; seed those as blank so confirmation can pass them.
        if self.state != EngineState::Stopped {
            self.seed_blank_inputs(player, self.current_frame + self.tuning.input_delay as i32);
        }
        Ok(())
    }

    /// Removes a player; their confirmation horizon no longer gates the session.
    pub fn remove_player(&mut self, player: PlayerId) -> Result<(), BulwarkError> {
        if !self.inputs.remove_player(player) {
            return Err(BulwarkError::InvalidRequest {
                kind: InvalidRequestKind::UnknownPlayer { id: player },
            });
        }
        self.local_players.remove(&player);
        Ok(())
    }

    /// Starts the engine: seeds the input-delay window with blank inputs, saves
    /// the initial snapshot and returns its checksum ladder for frame 0.
    pub fn start(&mut self) -> Result<ChecksumTuple, BulwarkError> {
        if self.state != EngineState::Stopped {
            return Err(BulwarkError::InvalidRequest {
                kind: InvalidRequestKind::AlreadyStarted,
            });
        }
        let players: Vec<PlayerId> = self.inputs.players().collect();
        for player in players {
            self.seed_blank_inputs(player, Frame::new(self.tuning.input_delay as i32));
        }
        let state = self.sim.save_state();
        let checksums = self.compute_checksums(Frame::new(0), &state);
        self.snapshots
            .save(Frame::new(0), state.clone(), checksums, CompressionTag::None)?;
        self.last_raw_state = Some((Frame::new(0), state));
        self.current_frame = Frame::new(0);
        self.state = EngineState::Running;
        Ok(checksums)
    }

    /// Stops the engine permanently.
    pub fn stop(&mut self) {
        self.state = EngineState::Stopped;
    }

    /// Forwards pause to the simulation (host migration).
    pub fn pause(&mut self) {
        self.sim.pause();
    }

    /// Forwards resume to the simulation.
    pub fn resume(&mut self) {
        self.sim.resume();
    }

    /// Blank inputs for every frame up to (excluding) `until`, so frames inside
    /// the input-delay window never block confirmation.
    fn seed_blank_inputs(&mut self, player: PlayerId, until: Frame) {
        let mut frame = Frame::new(0);
        let confirmed = self.inputs.confirmed_frame();
        if confirmed.is_valid() {
            frame = confirmed;
        }
        while frame < until {
            // Duplicate seeds are harmless; FrameTooOld cannot fire because we
            // start at the confirmed horizon.
            let _ = self.inputs.put(player, frame, Vec::new(), None);
            frame += 1;
        }
    }

    /// Enqueues local input for `current_frame + input_delay` and returns the
    /// frame it landed on.
    pub fn add_local_input(
        &mut self,
        player: PlayerId,
        bytes: Vec<u8>,
        now: Instant,
    ) -> Result<Frame, BulwarkError> {
        if !self.local_players.contains(&player) {
            return Err(BulwarkError::InvalidRequest {
                kind: InvalidRequestKind::NotLocalPlayer { id: player },
            });
        }
        let target = self.current_frame + self.tuning.input_delay as i32;
        self.inputs.put(player, target, bytes, Some(now))?;
        Ok(target)
    }

    /// Feeds a remote input into the ring. A correction for an already-simulated
    /// frame schedules a rollback on the next tick. Late inputs are transparently
    /// dropped (transient under reordering), and the prediction-equal case
    /// confirms without any rollback.
    pub fn receive_remote_input(
        &mut self,
        player: PlayerId,
        frame: Frame,
        bytes: Vec<u8>,
        now: Instant,
    ) -> Result<(), BulwarkError> {
        match self.inputs.put(player, frame, bytes, Some(now)) {
            Ok(PutOutcome::Corrected(correction)) => {
                if correction.frame < self.current_frame {
                    self.earliest_correction = if self.earliest_correction.is_null() {
                        correction.frame
                    } else {
                        self.earliest_correction.min(correction.frame)
                    };
                    tracing::trace!(
                        player = %correction.player,
                        frame = %correction.frame,
                        "misprediction, rollback scheduled"
                    );
                }
                Ok(())
            },
            Ok(_) => Ok(()),
            Err(err) if err.severity() == crate::error::Severity::Transient => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Runs the frame pipeline for one clock tick.
    pub fn tick(
        &mut self,
        optimizer: &mut PerformanceOptimizer,
    ) -> Result<TickReport, BulwarkError> {
        let mut report = TickReport::default();
        if self.state == EngineState::Stopped {
            return Ok(report);
        }

        // 1. Apply the earliest pending correction.
        if self.earliest_correction.is_valid() {
            let target = self.earliest_correction;
            self.earliest_correction = Frame::NULL;
            report.rollback = self.restore_and_replay(target, optimizer, &mut report, false)?;
        }

        // 2. Forward advance, bounded by the prediction window.
        let confirmed = self.inputs.confirmed_frame();
        let speculation = self.current_frame - confirmed; // NULL confirmed reads as -1
        if speculation >= self.tuning.max_prediction as i32 + i32::from(confirmed.is_null()) {
            if self.state != EngineState::Stalled {
                tracing::debug!(
                    current = %self.current_frame,
                    %confirmed,
                    "prediction window exhausted, stalling"
                );
            }
            self.state = EngineState::Stalled;
            self.stall_count += 1;
            report.stalled = true;
            return Ok(report);
        }
        self.state = EngineState::Running;

        self.step(optimizer, true, &mut report)?;
        report.advanced.push(self.current_frame);

        // 3. Retention: inputs behind the replay window can never be needed again.
        let horizon = self.inputs.confirmed_frame() - self.tuning.max_rollback as i32;
        if horizon.is_valid() {
            self.inputs.discard_before(horizon);
        }
        Ok(report)
    }

    /// Rolls back to `target` and replays forward at full fidelity (every replayed
    /// frame is saved with fresh checksums). Used for desync rollback-to-agreement,
    /// where the recomputed ladders are the evidence of repair.
    pub fn rollback_to(
        &mut self,
        target: Frame,
        optimizer: &mut PerformanceOptimizer,
    ) -> Result<TickReport, BulwarkError> {
        let mut report = TickReport::default();
        report.rollback = self.restore_and_replay(target, optimizer, &mut report, true)?;
        Ok(report)
    }

    fn restore_and_replay(
        &mut self,
        target: Frame,
        optimizer: &mut PerformanceOptimizer,
        report: &mut TickReport,
        full_fidelity: bool,
    ) -> Result<Option<RollbackSummary>, BulwarkError> {
        let resume_at = self.current_frame;
        let depth = resume_at - target;
        if depth <= 0 {
            return Ok(None);
        }
        if depth as usize > self.tuning.max_rollback {
            return Err(BulwarkError::InvalidFrame {
                frame: target,
                reason: InvalidFrameReason::OutsideRollbackWindow {
                    current_frame: resume_at,
                    max_rollback: self.tuning.max_rollback,
                },
            });
        }

        let bytes = self.snapshots.load_state(target)?;
        let stored = self.snapshots.cell(target).and_then(StateCell::checksums);
        self.sim.load_state(&bytes);

        // Save/load must be exact inverses: a diverging checksum after restore
        // means the simulation is not deterministic and nothing downstream can be
        // trusted.
        if let Some(stored) = stored {
            let recomputed = self
                .sim
                .checksum(ChecksumLevel::Basic)
                .unwrap_or_else(|| hash::fnv1a(&bytes));
            if recomputed != stored.basic {
                self.state = EngineState::Stopped;
                return Err(BulwarkError::NonDeterministic { frame: target });
            }
        }

        self.current_frame = target;
        self.last_raw_state = Some((target, bytes));
        self.snapshots.invalidate_from(target.next());

        // Replay with authoritative inputs. Degraded links may skip intermediate
        // snapshot/checksum work, but every frame is still simulated and the
        // resume frame (plus any deep-schedule frame) is always saved in full.
        let stride = if full_fidelity {
            1
        } else {
            optimizer.replay_stride().max(1) as i32
        };
        while self.current_frame < resume_at {
            let next = self.current_frame.next();
            let save = next == resume_at
                || next % stride == 0
                || next % self.tuning.deep_checksum_interval as i32 == 0;
            self.step(optimizer, save, report)?;
        }

        self.rollback_count += 1;
        self.total_rollback_depth += depth as u64;
        tracing::debug!(from = %target, depth, "rollback complete");
        Ok(Some(RollbackSummary {
            from: target,
            depth: depth as u32,
        }))
    }

    /// Simulates exactly one frame and optionally saves the result.
    fn step(
        &mut self,
        optimizer: &mut PerformanceOptimizer,
        save: bool,
        report: &mut TickReport,
    ) -> Result<(), BulwarkError> {
        let inputs = self.gather_inputs(self.current_frame);
        if let Err(fault) = self.sim.advance(&inputs) {
            self.state = EngineState::Stopped;
            return Err(BulwarkError::Simulation { fault });
        }
        self.current_frame += 1;
        if save {
            self.save_current(optimizer, report)?;
        }
        Ok(())
    }

    /// Reads the input tuple for `frame`, predicted where missing, sorted by
    /// player id so every peer presents the same ordering to the simulation.
    fn gather_inputs(&mut self, frame: Frame) -> FrameInputs {
        let players: Vec<PlayerId> = self.inputs.players().collect();
        let mut tuple = FrameInputs::new();
        for player in players {
            if let Some((bytes, status)) = self.inputs.get(player, frame) {
                tuple.push(PlayerFrameInput {
                    player,
                    bytes,
                    status,
                });
            }
        }
        tuple
    }

    fn save_current(
        &mut self,
        optimizer: &mut PerformanceOptimizer,
        report: &mut TickReport,
    ) -> Result<(), BulwarkError> {
        let mut state = optimizer.pool().acquire(0);
        state.extend_from_slice(&self.sim.save_state());
        let checksums = self.compute_checksums(self.current_frame, &state);

        let prev = self
            .last_raw_state
            .as_ref()
            .filter(|(frame, _)| self.snapshots.contains(*frame))
            .map(|(frame, bytes)| (*frame, bytes.as_slice()));
        let (encoded, tag) = optimizer.encode_snapshot(&state, prev);
        self.snapshots.save(self.current_frame, encoded, checksums, tag)?;

        if let Some((_, old)) = self.last_raw_state.replace((self.current_frame, state)) {
            optimizer.pool().release(old);
        }
        report.saved.push((self.current_frame, checksums));
        Ok(())
    }

    fn compute_checksums(&mut self, frame: Frame, state: &[u8]) -> ChecksumTuple {
        let basic = self
            .sim
            .checksum(ChecksumLevel::Basic)
            .unwrap_or_else(|| hash::fnv1a(state));
        let enhanced = self
            .sim
            .checksum(ChecksumLevel::Enhanced)
            .unwrap_or_else(|| hash::fnv1a_seeded(state, hash::ENHANCED_BASIS));
        let deep = if frame % self.tuning.deep_checksum_interval as i32 == 0 {
            Some(
                self.sim
                    .checksum(ChecksumLevel::Deep)
                    .unwrap_or_else(|| hash::fnv1a_seeded(state, hash::DEEP_BASIS)),
            )
        } else {
            None
        };
        let native = self.sim.checksum(ChecksumLevel::Native);
        ChecksumTuple {
            basic,
            enhanced,
            deep,
            native,
        }
    }

    /// The freshest state for transfer to another peer (migration, resync),
    /// with a full ladder for validation on the receiving side.
    pub fn state_for_transfer(&mut self) -> (Frame, Vec<u8>, ChecksumTuple) {
        let state = self.sim.save_state();
        let mut checksums = self.compute_checksums(self.current_frame, &state);
        if checksums.deep.is_none() {
            checksums.deep = Some(
                self.sim
                    .checksum(ChecksumLevel::Deep)
                    .unwrap_or_else(|| hash::fnv1a_seeded(&state, hash::DEEP_BASIS)),
            );
        }
        (self.current_frame, state, checksums)
    }

    /// Loads a state received from another peer.
    ///
    /// When `expected` checksums are present, validation is mandatory: the state is
    /// loaded, its ladder recomputed and compared; on mismatch the previous state
    /// is restored and `Ok(false)` is returned. Without checksums the state is
    /// adopted as-is. Adoption resets the snapshot ring, drops predictions and
    /// re-bases the engine at `frame`.
    pub fn load_foreign_state(
        &mut self,
        frame: Frame,
        bytes: &[u8],
        expected: Option<&ChecksumTuple>,
    ) -> Result<bool, BulwarkError> {
        if !frame.is_valid() {
            return Err(BulwarkError::InvalidFrame {
                frame,
                reason: InvalidFrameReason::NullFrame,
            });
        }
        let backup = self.sim.save_state();
        self.sim.load_state(bytes);

        if let Some(expected) = expected {
            let mut recomputed = self.compute_checksums(frame, bytes);
            if expected.deep.is_some() && recomputed.deep.is_none() {
                recomputed.deep = Some(
                    self.sim
                        .checksum(ChecksumLevel::Deep)
                        .unwrap_or_else(|| hash::fnv1a_seeded(bytes, hash::DEEP_BASIS)),
                );
            }
            if !expected.matches(&recomputed) {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Desync,
                    "received state for frame {} failed checksum validation",
                    frame
                );
                self.sim.load_state(&backup);
                return Ok(false);
            }
        }

        let checksums = self.compute_checksums(frame, bytes);
        self.snapshots.clear();
        self.snapshots
            .save(frame, bytes.to_vec(), checksums, CompressionTag::None)?;
        self.inputs.reset_predictions();
        self.inputs.discard_before(frame);
        self.current_frame = frame;
        self.last_raw_state = Some((frame, bytes.to_vec()));
        self.earliest_correction = Frame::NULL;
        self.state = EngineState::Running;
        tracing::info!(%frame, "adopted foreign state");
        Ok(true)
    }

    /// The stored checksum ladder for a frame, if its snapshot is still held.
    #[must_use]
    pub fn stored_checksums(&self, frame: Frame) -> Option<ChecksumTuple> {
        self.snapshots.cell(frame).and_then(StateCell::checksums)
    }

    /// The raw snapshot bytes and ladder for a frame, if still held; used to
    /// answer state requests for a specific frame.
    #[must_use]
    pub fn snapshot_for(&self, frame: Frame) -> Option<(Vec<u8>, ChecksumTuple)> {
        let bytes = self.snapshots.load_state(frame).ok()?;
        let checksums = self.stored_checksums(frame)?;
        Some((bytes, checksums))
    }

    /// Counters for observability.
    #[must_use]
    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            current_frame: self.current_frame,
            confirmed_frame: self.inputs.confirmed_frame(),
            rollback_count: self.rollback_count,
            avg_rollback_depth: if self.rollback_count == 0 {
                0.0
            } else {
                self.total_rollback_depth as f64 / self.rollback_count as f64
            },
            prediction_count: self.inputs.prediction_count(),
            stall_count: self.stall_count,
        }
    }
}

// #########
// # TESTS #
// #########
