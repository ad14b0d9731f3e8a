//! Host liveness monitoring and session authority transfer.
//!
//! The host emits periodic heartbeats; peers that stop hearing them score every
//! remaining player and the best candidate elects itself proposer. The proposer
//! announces the migration, everyone pauses, the proposer pulls (and validates) the
//! freshest state it can get, then broadcasts readiness and the session resumes
//! under the new authority.
//!
//! The manager is a poll-driven state machine in the style of the per-peer network
//! protocol: the session feeds it wall time and incoming protocol messages, and it
//! returns the actions to perform. It never touches the transport itself.

use web_time::Instant;

use crate::network::messages::{
    HostHeartbeat, HostReady, MigrationAnnounce, MigrationReason, StateRequest,
};
use crate::sessions::builder::MigrationConfig;
use crate::snapshot::ChecksumTuple;
use crate::{ConnectionQuality, Frame, PlayerId};

/// Everything the scorer needs to know about one candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateInfo {
    /// The candidate's id.
    pub id: PlayerId,
    /// Link quality grade towards the candidate (local grades itself Excellent).
    pub quality: ConnectionQuality,
    /// Round-trip latency in milliseconds (0 for the local player).
    pub latency_ms: f64,
    /// Simulation performance in `[0, 1]` (observed fps over target fps).
    pub performance: f64,
    /// Connection stability in `[0, 1]`.
    pub stability: f64,
}

/// Weighted candidate score; higher is better. Ties are broken by smallest id.
#[must_use]
pub fn candidate_score(info: &CandidateInfo, config: &MigrationConfig) -> f64 {
    let latency_norm = (1.0 - info.latency_ms / 500.0).max(0.0);
    config.quality_weight * info.quality.score_weight()
        + config.latency_weight * latency_norm
        + config.performance_weight * info.performance.clamp(0.0, 1.0)
        + config.stability_weight * info.stability.clamp(0.0, 1.0)
}

/// Picks the best candidate: highest score, smallest id on equal scores.
#[must_use]
pub fn best_candidate(
    candidates: &[CandidateInfo],
    config: &MigrationConfig,
) -> Option<PlayerId> {
    candidates
        .iter()
        .map(|info| (candidate_score(info, config), info.id))
        .max_by(|(score_a, id_a), (score_b, id_b)| {
            score_a
                .total_cmp(score_b)
                // On equal scores the *smaller* id must win, so reverse the
                // id ordering inside this max comparison.
                .then_with(|| id_b.cmp(id_a))
        })
        .map(|(_, id)| id)
}

/// Work the session must perform on behalf of the migration manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationAction {
    /// Broadcast a host heartbeat (local player is the host).
    SendHeartbeat(HostHeartbeat),
    /// Pause the simulation and start queueing remote inputs.
    PauseSimulation,
    /// Broadcast the migration announcement.
    BroadcastAnnounce(MigrationAnnounce),
    /// Ask `peer` for its current state.
    RequestState {
        /// The peer to pull state from.
        peer: PlayerId,
        /// The request to send.
        request: StateRequest,
    },
    /// Every candidate failed; the new host proceeds with its own last state.
    UseOwnState,
    /// Broadcast that the new host is ready.
    BroadcastReady(HostReady),
    /// Migration finished; adopt the new host and resume from `frame`.
    Completed {
        /// The new authority.
        new_host: PlayerId,
        /// The frame the session resumes from.
        frame: Frame,
    },
    /// All attempts exhausted; the session is disconnected.
    Failed {
        /// How many attempts were made.
        attempts: u32,
    },
}

/// A state response awaiting checksum validation by the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStateValidation {
    /// Who supplied the state.
    pub peer: PlayerId,
    /// The frame the state belongs to.
    pub frame: Frame,
    /// The serialized state.
    pub state: Vec<u8>,
    /// The supplier's checksums; validation is mandatory when present and skipped
    /// when the supplier had none.
    pub checksums: Option<ChecksumTuple>,
}

#[derive(Debug)]
enum Phase {
    /// Normal operation; watching heartbeats.
    Idle,
    /// Proposer: pulling state from the best remaining peers.
    AwaitingState {
        candidates: Vec<PlayerId>,
        next_candidate: usize,
        request_id: u32,
        requested_at: Instant,
        frame: Frame,
        reason: MigrationReason,
    },
    /// Non-proposer: paused, waiting for the new host to signal readiness.
    AwaitingReady {
        new_host: PlayerId,
        since: Instant,
    },
    /// Terminal failure; the session is disconnected.
    Failed,
}

/// Monitors host liveness and orchestrates authority transfer.
pub struct MigrationManager {
    config: MigrationConfig,
    local_id: PlayerId,
    local_is_host: bool,
    phase: Phase,

    last_heartbeat_seen: Option<Instant>,
    last_heartbeat_sent: Option<Instant>,

    /// `host_ready` observed before its announcement; applied once the announce
    /// arrives (ordering enforcement for the out-of-order case).
    buffered_ready: Option<HostReady>,

    attempts: u32,
    attempt_started_at: Option<Instant>,
    backoff_until: Option<Instant>,
    next_request_id: u32,

    migrations_completed: u64,
    migrations_failed: u64,
}

impl MigrationManager {
    /// Creates a manager for `local_id`.
    #[must_use]
    pub fn new(local_id: PlayerId, config: MigrationConfig) -> Self {
        Self {
            config,
            local_id,
            local_is_host: false,
            phase: Phase::Idle,
            last_heartbeat_seen: None,
            last_heartbeat_sent: None,
            buffered_ready: None,
            attempts: 0,
            attempt_started_at: None,
            backoff_until: None,
            next_request_id: 0,
            migrations_completed: 0,
            migrations_failed: 0,
        }
    }

    /// Tells the manager whether the local player currently holds authority.
    pub fn set_local_host(&mut self, is_host: bool, now: Instant) {
        self.local_is_host = is_host;
        if !is_host {
            // Restart the liveness window so a fresh host gets its full timeout.
            self.last_heartbeat_seen = Some(now);
        }
    }

    /// Whether a migration is currently in flight.
    #[must_use]
    pub fn is_migrating(&self) -> bool {
        matches!(
            self.phase,
            Phase::AwaitingState { .. } | Phase::AwaitingReady { .. }
        )
    }

    /// Whether the manager has declared the session disconnected.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        matches!(self.phase, Phase::Failed)
    }

    /// Completed migrations so far.
    #[must_use]
    pub fn migrations_completed(&self) -> u64 {
        self.migrations_completed
    }

    /// Fraction of attempted migrations that completed.
    #[must_use]
    pub fn migration_success_rate(&self) -> f64 {
        let total = self.migrations_completed + self.migrations_failed;
        if total == 0 {
            1.0
        } else {
            self.migrations_completed as f64 / total as f64
        }
    }

    /// Records a heartbeat from the current host.
    pub fn record_heartbeat(&mut self, heartbeat: &HostHeartbeat, now: Instant) {
        let _ = heartbeat;
        self.last_heartbeat_seen = Some(now);
    }

    /// Drives timers: heartbeat emission (as host), host death detection, state
    /// request timeouts and attempt retry/backoff.
    ///
    /// `current_frame` is the engine's frame, `candidates` every *live* player
    /// including the local one (the departed host must already be excluded).
    pub fn poll(
        &mut self,
        now: Instant,
        current_frame: Frame,
        candidates: &[CandidateInfo],
    ) -> Vec<MigrationAction> {
        let mut actions = Vec::new();

        // Host side: keep the beacon going.
        if self.local_is_host && !self.is_migrating() {
            let due = match self.last_heartbeat_sent {
                None => true,
                Some(last) => {
                    now.saturating_duration_since(last).as_millis()
                        >= u128::from(self.config.heartbeat_interval_ms)
                },
            };
            if due {
                self.last_heartbeat_sent = Some(now);
                actions.push(MigrationAction::SendHeartbeat(HostHeartbeat {
                    host: self.local_id,
                    frame: current_frame,
                    t: 0,
                }));
            }
            return actions;
        }

        match &self.phase {
            Phase::Idle => {
                if !self.local_is_host && self.host_timed_out(now) {
                    actions.extend(self.consider_proposing(
                        now,
                        current_frame,
                        candidates,
                        MigrationReason::HostTimeout,
                    ));
                }
            },
            Phase::AwaitingState {
                requested_at,
                next_candidate,
                candidates: pull_order,
                frame,
                reason,
                ..
            } => {
                let frame = *frame;
                let reason = *reason;
                let attempt_deadline = self
                    .attempt_started_at
                    .map(|started| {
                        now.saturating_duration_since(started).as_millis()
                            >= u128::from(self.config.migration_timeout_ms)
                    })
                    .unwrap_or(false);
                if attempt_deadline {
                    actions.extend(self.attempt_failed(now, frame, reason, candidates));
                } else if now.saturating_duration_since(*requested_at).as_millis()
                    >= u128::from(self.config.state_request_timeout_ms)
                {
                    // Current supplier is unresponsive; fall through to the next.
                    let next = *next_candidate;
                    let order = pull_order.clone();
                    actions.extend(self.request_from(next, order, frame, reason, now));
                }
            },
            Phase::AwaitingReady { since, .. } => {
                let give_up = now.saturating_duration_since(*since).as_millis()
                    >= u128::from(self.config.migration_timeout_ms)
                        * u128::from(self.config.retry_attempts.max(1));
                if give_up {
                    self.phase = Phase::Failed;
                    self.migrations_failed += 1;
                    actions.push(MigrationAction::Failed {
                        attempts: self.config.retry_attempts,
                    });
                }
            },
            Phase::Failed => {},
        }
        actions
    }

    /// Reacts to the transport reporting the host's connection as gone; faster
    /// than waiting out the heartbeat timeout.
    pub fn host_disconnected(
        &mut self,
        now: Instant,
        current_frame: Frame,
        candidates: &[CandidateInfo],
    ) -> Vec<MigrationAction> {
        if self.is_migrating() || self.has_failed() || self.local_is_host {
            return Vec::new();
        }
        self.consider_proposing(
            now,
            current_frame,
            candidates,
            MigrationReason::HostDisconnected,
        )
    }

    fn host_timed_out(&self, now: Instant) -> bool {
        match self.last_heartbeat_seen {
            None => false, // never had a host yet
            Some(last) => {
                now.saturating_duration_since(last).as_millis()
                    >= u128::from(self.config.host_timeout_ms)
            },
        }
    }

    fn consider_proposing(
        &mut self,
        now: Instant,
        current_frame: Frame,
        candidates: &[CandidateInfo],
        reason: MigrationReason,
    ) -> Vec<MigrationAction> {
        if let Some(until) = self.backoff_until {
            if now < until {
                return Vec::new();
            }
        }
        let Some(best) = best_candidate(candidates, &self.config) else {
            return Vec::new();
        };
        if best != self.local_id {
            // Someone better will propose; we will hear their announcement. Until
            // then keep waiting (and keep the liveness clock from re-firing).
            return Vec::new();
        }

        tracing::info!(
            new_host = %self.local_id,
            ?reason,
            frame = %current_frame,
            attempt = self.attempts + 1,
            "electing self as migration proposer"
        );

        let mut actions = vec![
            MigrationAction::PauseSimulation,
            MigrationAction::BroadcastAnnounce(MigrationAnnounce {
                new_host: self.local_id,
                reason,
                frame: current_frame,
            }),
        ];
        self.attempt_started_at = Some(now);
        self.backoff_until = None;

        // Pull order: every other live candidate, best first.
        let mut others: Vec<(f64, PlayerId)> = candidates
            .iter()
            .filter(|info| info.id != self.local_id)
            .map(|info| (candidate_score(info, &self.config), info.id))
            .collect();
        others.sort_by(|(score_a, id_a), (score_b, id_b)| {
            score_b.total_cmp(score_a).then_with(|| id_a.cmp(id_b))
        });
        let order: Vec<PlayerId> = others.into_iter().map(|(_, id)| id).collect();

        actions.extend(self.request_from(0, order, current_frame, reason, now));
        actions
    }

    /// Issues the state request for `order[index]`, or falls back to the local
    /// state when every candidate is exhausted.
    fn request_from(
        &mut self,
        index: usize,
        order: Vec<PlayerId>,
        frame: Frame,
        reason: MigrationReason,
        now: Instant,
    ) -> Vec<MigrationAction> {
        match order.get(index) {
            Some(peer) => {
                let request_id = self.next_request_id;
                self.next_request_id = self.next_request_id.wrapping_add(1);
                let peer = *peer;
                self.phase = Phase::AwaitingState {
                    candidates: order,
                    next_candidate: index + 1,
                    request_id,
                    requested_at: now,
                    frame,
                    reason,
                };
                vec![MigrationAction::RequestState {
                    peer,
                    request: StateRequest {
                        request_id,
                        frame: Frame::NULL,
                    },
                }]
            },
            None => {
                // No peer could supply a state; our own last state is the session's
                // best remaining truth.
                self.phase = Phase::AwaitingState {
                    candidates: order,
                    next_candidate: index + 1,
                    request_id: u32::MAX,
                    requested_at: now,
                    frame,
                    reason,
                };
                vec![MigrationAction::UseOwnState]
            },
        }
    }

    fn attempt_failed(
        &mut self,
        now: Instant,
        frame: Frame,
        _reason: MigrationReason,
        _candidates: &[CandidateInfo],
    ) -> Vec<MigrationAction> {
        self.attempts += 1;
        if self.attempts >= self.config.retry_attempts {
            tracing::error!(attempts = self.attempts, "host migration failed");
            self.phase = Phase::Failed;
            self.migrations_failed += 1;
            return vec![MigrationAction::Failed {
                attempts: self.attempts,
            }];
        }
        // Linear backoff: 1s, 2s, 3s between attempts.
        let backoff_ms = u64::from(self.attempts) * 1000;
        self.backoff_until = Some(now + web_time::Duration::from_millis(backoff_ms));
        self.phase = Phase::Idle;
        tracing::warn!(
            attempt = self.attempts,
            backoff_ms,
            frame = %frame,
            "migration attempt timed out, backing off"
        );
        Vec::new()
    }

    /// Handles an incoming migration announcement.
    pub fn handle_announce(
        &mut self,
        announce: &MigrationAnnounce,
        now: Instant,
    ) -> Vec<MigrationAction> {
        if self.has_failed() {
            return Vec::new();
        }
        if announce.new_host == self.local_id {
            // Our own broadcast echoed back; already handled locally.
            return Vec::new();
        }
        let mut actions = vec![MigrationAction::PauseSimulation];
        self.phase = Phase::AwaitingReady {
            new_host: announce.new_host,
            since: now,
        };
        // An out-of-order host_ready may already be waiting for this announce.
        if let Some(ready) = self.buffered_ready.take() {
            if ready.host == announce.new_host {
                actions.extend(self.complete(ready.host, ready.frame, now));
            }
        }
        actions
    }

    /// Handles a state response addressed to our in-flight pull. Returns the
    /// payload for the session to validate, or `None` if it is stale.
    pub fn handle_state_response(
        &mut self,
        peer: PlayerId,
        request_id: u32,
        frame: Frame,
        state: Option<Vec<u8>>,
        checksums: Option<ChecksumTuple>,
        now: Instant,
    ) -> Option<PendingStateValidation> {
        let Phase::AwaitingState {
            request_id: expected,
            next_candidate,
            candidates,
            frame: announce_frame,
            reason,
            ..
        } = &self.phase
        else {
            return None;
        };
        if request_id != *expected {
            return None;
        }
        match state {
            Some(state) => Some(PendingStateValidation {
                peer,
                frame,
                state,
                checksums,
            }),
            None => {
                // The peer had nothing for us; move on immediately.
                let next = *next_candidate;
                let order = candidates.clone();
                let announce_frame = *announce_frame;
                let reason = *reason;
                let _ = self.request_from(next, order, announce_frame, reason, now);
                None
            },
        }
    }

    /// Called by the session once a pulled state passed validation (or the local
    /// fallback state was adopted). Completes the migration on the proposer side.
    pub fn state_validated(&mut self, resume_frame: Frame, now: Instant) -> Vec<MigrationAction> {
        if !matches!(self.phase, Phase::AwaitingState { .. }) {
            return Vec::new();
        }
        let mut actions = vec![MigrationAction::BroadcastReady(HostReady {
            host: self.local_id,
            frame: resume_frame,
        })];
        actions.extend(self.complete(self.local_id, resume_frame, now));
        actions
    }

    /// Called by the session when a pulled state failed checksum validation; falls
    /// through to the next candidate (or the local state).
    pub fn state_validation_failed(&mut self, now: Instant) -> Vec<MigrationAction> {
        let Phase::AwaitingState {
            next_candidate,
            candidates,
            frame,
            reason,
            ..
        } = &self.phase
        else {
            return Vec::new();
        };
        let next = *next_candidate;
        let order = candidates.clone();
        let frame = *frame;
        let reason = *reason;
        self.request_from(next, order, frame, reason, now)
    }

    /// Handles the new host's readiness signal. Out-of-order arrivals (before the
    /// announcement) are buffered until the announce shows up.
    pub fn handle_host_ready(&mut self, ready: &HostReady, now: Instant) -> Vec<MigrationAction> {
        match &self.phase {
            Phase::AwaitingReady { new_host, .. } if *new_host == ready.host => {
                self.complete(ready.host, ready.frame, now)
            },
            Phase::Idle => {
                self.buffered_ready = Some(*ready);
                Vec::new()
            },
            _ => Vec::new(),
        }
    }

    fn complete(&mut self, new_host: PlayerId, frame: Frame, now: Instant) -> Vec<MigrationAction> {
        self.phase = Phase::Idle;
        self.attempts = 0;
        self.attempt_started_at = None;
        self.backoff_until = None;
        self.migrations_completed += 1;
        self.local_is_host = new_host == self.local_id;
        self.last_heartbeat_seen = Some(now);
        tracing::info!(%new_host, %frame, "host migration completed");
        vec![MigrationAction::Completed { new_host, frame }]
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use web_time::Duration;

    const LOCAL: PlayerId = PlayerId::new(0);
    const PEER_A: PlayerId = PlayerId::new(1);
    const PEER_B: PlayerId = PlayerId::new(2);

    fn config() -> MigrationConfig {
        MigrationConfig::default()
    }

    fn candidate(id: PlayerId, quality: ConnectionQuality, latency: f64) -> CandidateInfo {
        CandidateInfo {
            id,
            quality,
            latency_ms: latency,
            performance: 1.0,
            stability: 1.0,
        }
    }

    fn strong_local_field() -> Vec<CandidateInfo> {
        vec![
            candidate(LOCAL, ConnectionQuality::Excellent, 0.0),
            candidate(PEER_A, ConnectionQuality::Good, 80.0),
            candidate(PEER_B, ConnectionQuality::Fair, 200.0),
        ]
    }

    #[test]
    fn scoring_matches_weighted_formula() {
        let info = candidate(PEER_A, ConnectionQuality::Good, 250.0);
        let score = candidate_score(&info, &config());
        // 0.4 * 0.8 + 0.3 * 0.5 + 0.2 * 1.0 + 0.1 * 1.0 = 0.77
        assert!((score - 0.77).abs() < 1e-9);
    }

    #[test]
    fn latency_norm_clamps_at_zero() {
        let info = candidate(PEER_A, ConnectionQuality::Poor, 900.0);
        let score = candidate_score(&info, &config());
        // 0.4 * 0.3 + 0.3 * 0.0 + 0.2 + 0.1 = 0.42
        assert!((score - 0.42).abs() < 1e-9);
    }

    #[test]
    fn ties_break_towards_smallest_id() {
        let twins = vec![
            candidate(PEER_B, ConnectionQuality::Good, 50.0),
            candidate(PEER_A, ConnectionQuality::Good, 50.0),
        ];
        assert_eq!(best_candidate(&twins, &config()), Some(PEER_A));
    }

    #[test]
    fn host_emits_heartbeats_on_schedule() {
        let mut mgr = MigrationManager::new(LOCAL, config());
        let now = Instant::now();
        mgr.set_local_host(true, now);

        let actions = mgr.poll(now, Frame::new(10), &strong_local_field());
        assert!(matches!(
            actions.first(),
            Some(MigrationAction::SendHeartbeat(hb)) if hb.host == LOCAL && hb.frame == Frame::new(10)
        ));

        // Within the interval: quiet.
        assert!(mgr.poll(now + Duration::from_millis(500), Frame::new(11), &[]).is_empty());
        // After the interval: another beacon.
        let actions = mgr.poll(now + Duration::from_millis(2001), Frame::new(12), &[]);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn best_survivor_elects_itself_after_timeout() {
        let mut mgr = MigrationManager::new(LOCAL, config());
        let now = Instant::now();
        mgr.set_local_host(false, now);
        mgr.record_heartbeat(
            &HostHeartbeat {
                host: PlayerId::new(9),
                frame: Frame::new(0),
                t: 0,
            },
            now,
        );

        // Before the timeout: nothing.
        assert!(mgr
            .poll(now + Duration::from_millis(5999), Frame::new(100), &strong_local_field())
            .is_empty());

        let actions = mgr.poll(
            now + Duration::from_millis(6001),
            Frame::new(1000),
            &strong_local_field(),
        );
        assert_eq!(actions[0], MigrationAction::PauseSimulation);
        assert!(matches!(
            &actions[1],
            MigrationAction::BroadcastAnnounce(a)
                if a.new_host == LOCAL && a.reason == MigrationReason::HostTimeout && a.frame == Frame::new(1000)
        ));
        // Pulls from the best remaining peer first.
        assert!(matches!(
            &actions[2],
            MigrationAction::RequestState { peer, .. } if *peer == PEER_A
        ));
        assert!(mgr.is_migrating());
    }

    #[test]
    fn weaker_survivor_waits_for_announce() {
        let mut mgr = MigrationManager::new(PEER_B, config());
        let now = Instant::now();
        mgr.set_local_host(false, now);
        mgr.record_heartbeat(
            &HostHeartbeat {
                host: PlayerId::new(9),
                frame: Frame::new(0),
                t: 0,
            },
            now,
        );
        let actions = mgr.poll(
            now + Duration::from_millis(7000),
            Frame::new(1000),
            &strong_local_field(),
        );
        assert!(actions.is_empty());
        assert!(!mgr.is_migrating());
    }

    #[test]
    fn sole_survivor_uses_own_state() {
        let mut mgr = MigrationManager::new(LOCAL, config());
        let now = Instant::now();
        mgr.set_local_host(false, now);
        mgr.record_heartbeat(
            &HostHeartbeat {
                host: PlayerId::new(9),
                frame: Frame::new(0),
                t: 0,
            },
            now,
        );
        let only_me = vec![candidate(LOCAL, ConnectionQuality::Excellent, 0.0)];
        let actions = mgr.poll(now + Duration::from_millis(6001), Frame::new(1000), &only_me);
        assert!(actions.contains(&MigrationAction::UseOwnState));

        // Session adopts its own state and completes.
        let actions = mgr.state_validated(Frame::new(1000), now + Duration::from_millis(6002));
        assert!(matches!(
            actions[0],
            MigrationAction::BroadcastReady(ready) if ready.host == LOCAL
        ));
        assert!(matches!(
            actions[1],
            MigrationAction::Completed { new_host, frame }
                if new_host == LOCAL && frame == Frame::new(1000)
        ));
        assert!(!mgr.is_migrating());
        assert_eq!(mgr.migrations_completed(), 1);
    }

    #[test]
    fn state_request_times_out_to_next_candidate() {
        let mut mgr = MigrationManager::new(LOCAL, config());
        let now = Instant::now();
        mgr.set_local_host(false, now);
        mgr.record_heartbeat(
            &HostHeartbeat {
                host: PlayerId::new(9),
                frame: Frame::new(0),
                t: 0,
            },
            now,
        );
        let field = strong_local_field();
        let start = now + Duration::from_millis(6001);
        mgr.poll(start, Frame::new(1000), &field);

        // First supplier (PEER_A) never answers; after 5s the pull moves to PEER_B.
        let actions = mgr.poll(start + Duration::from_millis(5001), Frame::new(1000), &field);
        assert!(matches!(
            actions.first(),
            Some(MigrationAction::RequestState { peer, .. }) if *peer == PEER_B
        ));
    }

    #[test]
    fn invalid_state_falls_through_then_uses_own() {
        let mut mgr = MigrationManager::new(LOCAL, config());
        let now = Instant::now();
        mgr.set_local_host(false, now);
        mgr.record_heartbeat(
            &HostHeartbeat {
                host: PlayerId::new(9),
                frame: Frame::new(0),
                t: 0,
            },
            now,
        );
        let field = strong_local_field();
        let start = now + Duration::from_millis(6001);
        mgr.poll(start, Frame::new(1000), &field);

        // PEER_A's state fails validation; the pull moves to PEER_B.
        let actions = mgr.state_validation_failed(start);
        assert!(matches!(
            actions.first(),
            Some(MigrationAction::RequestState { peer, .. }) if *peer == PEER_B
        ));
        // PEER_B's state fails too; only our own state remains.
        let actions = mgr.state_validation_failed(start);
        assert_eq!(actions, vec![MigrationAction::UseOwnState]);
    }

    #[test]
    fn non_proposer_completes_on_ready_after_announce() {
        let mut mgr = MigrationManager::new(PEER_B, config());
        let now = Instant::now();
        mgr.set_local_host(false, now);

        let announce = MigrationAnnounce {
            new_host: LOCAL,
            reason: MigrationReason::HostTimeout,
            frame: Frame::new(1000),
        };
        let actions = mgr.handle_announce(&announce, now);
        assert_eq!(actions, vec![MigrationAction::PauseSimulation]);
        assert!(mgr.is_migrating());

        let ready = HostReady {
            host: LOCAL,
            frame: Frame::new(1000),
        };
        let actions = mgr.handle_host_ready(&ready, now);
        assert!(matches!(
            actions.first(),
            Some(MigrationAction::Completed { new_host, frame })
                if *new_host == LOCAL && *frame == Frame::new(1000)
        ));
    }

    #[test]
    fn early_ready_is_buffered_until_announce() {
        let mut mgr = MigrationManager::new(PEER_B, config());
        let now = Instant::now();
        mgr.set_local_host(false, now);

        let ready = HostReady {
            host: LOCAL,
            frame: Frame::new(1000),
        };
        // Ready arrives first: buffered, no visible effect.
        assert!(mgr.handle_host_ready(&ready, now).is_empty());
        assert!(!mgr.is_migrating());

        // The announce arrives: pause and complete in one go.
        let announce = MigrationAnnounce {
            new_host: LOCAL,
            reason: MigrationReason::HostTimeout,
            frame: Frame::new(1000),
        };
        let actions = mgr.handle_announce(&announce, now);
        assert_eq!(actions[0], MigrationAction::PauseSimulation);
        assert!(matches!(
            actions[1],
            MigrationAction::Completed { new_host, .. } if new_host == LOCAL
        ));
    }

    #[test]
    fn attempts_exhaust_into_failure() {
        let mut mgr = MigrationManager::new(LOCAL, config());
        let now = Instant::now();
        mgr.set_local_host(false, now);
        mgr.record_heartbeat(
            &HostHeartbeat {
                host: PlayerId::new(9),
                frame: Frame::new(0),
                t: 0,
            },
            now,
        );
        let only_peer = vec![
            candidate(LOCAL, ConnectionQuality::Excellent, 0.0),
            candidate(PEER_A, ConnectionQuality::Good, 50.0),
        ];

        let mut at = now + Duration::from_millis(6001);
        mgr.poll(at, Frame::new(100), &only_peer); // attempt 1 starts

        for attempt in 1..=3u64 {
            // Let the whole attempt time out (10s), then wait out the backoff.
            at += Duration::from_millis(10_001);
            let actions = mgr.poll(at, Frame::new(100), &only_peer);
            if attempt == 3 {
                assert!(matches!(
                    actions.first(),
                    Some(MigrationAction::Failed { attempts: 3 })
                ));
                assert!(mgr.has_failed());
                assert!(mgr.migration_success_rate() < 1.0);
                return;
            }
            assert!(actions.is_empty(), "attempt {attempt} should back off");
            // Wait out the backoff and let the next attempt start.
            at += Duration::from_millis(attempt * 1000 + 1);
            let actions = mgr.poll(at, Frame::new(100), &only_peer);
            assert!(
                actions.contains(&MigrationAction::PauseSimulation),
                "attempt {} should restart, got {actions:?}",
                attempt + 1
            );
        }
    }

    #[test]
    fn completed_migration_resets_for_next_time() {
        let mut mgr = MigrationManager::new(LOCAL, config());
        let now = Instant::now();
        mgr.set_local_host(false, now);
        mgr.record_heartbeat(
            &HostHeartbeat {
                host: PlayerId::new(9),
                frame: Frame::new(0),
                t: 0,
            },
            now,
        );
        let only_me = vec![candidate(LOCAL, ConnectionQuality::Excellent, 0.0)];
        mgr.poll(now + Duration::from_millis(6001), Frame::new(50), &only_me);
        mgr.state_validated(Frame::new(50), now + Duration::from_millis(6002));

        assert!(!mgr.is_migrating());
        // The new host now heartbeats.
        let actions = mgr.poll(now + Duration::from_millis(9000), Frame::new(51), &only_me);
        assert!(matches!(
            actions.first(),
            Some(MigrationAction::SendHeartbeat(hb)) if hb.host == LOCAL
        ));
    }
}
