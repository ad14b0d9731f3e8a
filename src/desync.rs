//! Desync detection and recovery selection.
//!
//! Peers exchange layered checksums per frame. Once a local and at least one remote
//! ladder are present for a frame, they are compared cheapest level first. A lone
//! cheap-level blip with enough corroborating peers is classified transient and only
//! counted; anything else is a confirmed desync, resolved by majority consensus
//! (host breaks ties) and a three-step recovery ladder:
//!
//! 1. **Rollback-to-agreement**: roll back to the newest frame where the local state
//!    still matched the majority and replay.
//! 2. **Targeted resync**: fetch the majority's state for the frame, validate it
//!    against their checksums, and load it.
//! 3. **Full resync**: broadcast a state request and take the first valid response.
//!
//! The detector only *chooses* actions; the session executes them and reports
//! outcomes back, which drives the ladder escalation and the per-method success
//! statistics. A method whose success rate collapses is skipped in later incidents.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::snapshot::ChecksumTuple;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{report_violation, ChecksumLevel, Frame, PlayerId};

/// How many frames of checksum history are retained for agreement searches.
const HISTORY_WINDOW: i32 = 256;

/// How many closed desync records are archived.
const ARCHIVE_LIMIT: usize = 64;

/// Minimum recorded attempts before a method's success rate can disqualify it.
const MIN_ATTEMPTS_FOR_GATING: u64 = 4;

/// What the session should do about a confirmed desync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Roll back to `frame` and replay with the inputs already in the ring.
    RollbackTo {
        /// The newest frame at which the majority still agreed with us.
        frame: Frame,
    },
    /// Ask `peer` for its state at `frame`, validate, and load it.
    RequestStateResync {
        /// The majority peer to fetch state from.
        peer: PlayerId,
        /// The diverged frame.
        frame: Frame,
    },
    /// Broadcast a state request and load the first checksum-valid response.
    RequestFullResync {
        /// The diverged frame.
        frame: Frame,
    },
    /// Every method failed; the session cannot be repaired.
    Unresolvable {
        /// The diverged frame.
        frame: Frame,
    },
}

/// Lifecycle of one desync incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Waiting for a host to break a consensus tie.
    PendingQuorum,
    /// Being repaired by rollback to the given frame.
    RollbackTo(Frame),
    /// Being repaired by targeted state transfer from the given peer.
    TargetedResync(PlayerId),
    /// Being repaired by full resync.
    FullResync,
    /// Could not be repaired.
    Unresolvable,
    /// Repaired.
    Resolved,
}

/// A recorded desync incident.
#[derive(Debug, Clone)]
pub struct DesyncRecord {
    /// The frame at which checksums disagreed.
    pub frame: Frame,
    /// The local ladder at that frame.
    pub local: ChecksumTuple,
    /// Every remote ladder recorded for that frame.
    pub remote: BTreeMap<PlayerId, ChecksumTuple>,
    /// The cheapest level that disagreed.
    pub first_mismatch_level: ChecksumLevel,
    /// Where the incident currently stands.
    pub resolution: Resolution,
}

/// Which recovery rung an incident is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Rollback,
    Targeted,
    Full,
}

#[derive(Debug, Default, Clone, Copy)]
struct MethodStats {
    successes: u64,
    failures: u64,
}

impl MethodStats {
    fn attempts(&self) -> u64 {
        self.successes + self.failures
    }

    fn success_rate(&self) -> f64 {
        if self.attempts() == 0 {
            1.0
        } else {
            self.successes as f64 / self.attempts() as f64
        }
    }
}

#[derive(Debug)]
struct ActiveRecovery {
    frame: Frame,
    method: Method,
    majority_peers: Vec<PlayerId>,
    record: DesyncRecord,
}

/// Detects divergence from checksum exchanges and selects recovery actions.
pub struct DesyncDetector {
    /// Local ladders by frame.
    local: BTreeMap<Frame, ChecksumTuple>,
    /// Remote ladders by frame and peer, with the sender timestamp that won.
    remote: BTreeMap<Frame, BTreeMap<PlayerId, (ChecksumTuple, u128)>>,
    /// Frames that gained new data since their last evaluation.
    pending: BTreeSet<Frame>,
    /// The incident currently being repaired, if any.
    active: Option<ActiveRecovery>,
    /// Closed incidents, newest last.
    history: VecDeque<DesyncRecord>,

    rollback_stats: MethodStats,
    targeted_stats: MethodStats,
    full_stats: MethodStats,

    /// Success-rate floor below which rollback-to-agreement is skipped.
    rollback_gate: f64,
    transient_count: u64,
    desync_count: u64,
}

impl DesyncDetector {
    /// Creates a detector with the given rollback-method success-rate floor.
    #[must_use]
    pub fn new(rollback_success_floor: f64) -> Self {
        Self {
            local: BTreeMap::new(),
            remote: BTreeMap::new(),
            pending: BTreeSet::new(),
            active: None,
            history: VecDeque::new(),
            rollback_stats: MethodStats::default(),
            targeted_stats: MethodStats::default(),
            full_stats: MethodStats::default(),
            rollback_gate: rollback_success_floor,
            transient_count: 0,
            desync_count: 0,
        }
    }

    /// Records the local ladder for a frame (called after every save).
    pub fn record_local(&mut self, frame: Frame, checksums: ChecksumTuple) {
        self.local.insert(frame, checksums);
        if self.remote.contains_key(&frame) {
            self.pending.insert(frame);
        }
        self.prune(frame);
    }

    /// Replaces the local ladder after a replay recomputed it (a rollback across a
    /// sparse-level boundary invalidates that frame's expensive checksum).
    pub fn replace_local(&mut self, frame: Frame, checksums: ChecksumTuple) {
        self.local.insert(frame, checksums);
    }

    /// Records a remote ladder. Re-delivery with the same payload leaves the record
    /// unchanged; only a strictly newer sender timestamp replaces the stored value.
    pub fn record_remote(
        &mut self,
        peer: PlayerId,
        frame: Frame,
        checksums: ChecksumTuple,
        send_time: u128,
    ) {
        let entry = self.remote.entry(frame).or_default();
        match entry.get(&peer) {
            Some((_, existing_time)) if *existing_time >= send_time => return,
            _ => {},
        }
        entry.insert(peer, (checksums, send_time));
        if self.local.contains_key(&frame) {
            self.pending.insert(frame);
        }
    }

    /// Total confirmed desyncs observed.
    #[must_use]
    pub fn desync_count(&self) -> u64 {
        self.desync_count
    }

    /// Transient cheap-level blips that were recorded but not acted on.
    #[must_use]
    pub fn transient_count(&self) -> u64 {
        self.transient_count
    }

    /// Fraction of completed recovery attempts that succeeded, over all methods.
    #[must_use]
    pub fn recovery_success_rate(&self) -> f64 {
        let successes = self.rollback_stats.successes
            + self.targeted_stats.successes
            + self.full_stats.successes;
        let attempts = self.rollback_stats.attempts()
            + self.targeted_stats.attempts()
            + self.full_stats.attempts();
        if attempts == 0 {
            1.0
        } else {
            successes as f64 / attempts as f64
        }
    }

    /// Closed incident records, oldest first.
    #[must_use]
    pub fn history(&self) -> &VecDeque<DesyncRecord> {
        &self.history
    }

    /// Whether an incident is currently being repaired.
    #[must_use]
    pub fn recovery_in_flight(&self) -> bool {
        self.active.is_some()
    }

    /// Evaluates every frame with fresh data and returns the action to take, if
    /// any. At most one incident is in flight at a time; further mismatches are
    /// left pending until the current one closes.
    ///
    /// `local_id` is this peer, `host` the current authority (if known), and
    /// `player_count` the number of players in the session.
    pub fn evaluate(
        &mut self,
        local_id: PlayerId,
        host: Option<PlayerId>,
        player_count: usize,
    ) -> Option<RecoveryAction> {
        if self.active.is_some() {
            return None;
        }
        let frames: Vec<Frame> = self.pending.iter().copied().collect();
        for frame in frames {
            let Some(local) = self.local.get(&frame).copied() else {
                continue;
            };
            let Some(remotes) = self.remote.get(&frame) else {
                continue;
            };

            let mismatched: Vec<(PlayerId, ChecksumLevel)> = remotes
                .iter()
                .filter_map(|(peer, (tuple, _))| {
                    local.first_mismatch(tuple).map(|level| (*peer, level))
                })
                .collect();

            if mismatched.is_empty() {
                self.pending.remove(&frame);
                continue;
            }

            let first_level = mismatched
                .iter()
                .map(|(_, level)| *level)
                .min()
                .unwrap_or(ChecksumLevel::Basic);

            let agreeing_peers = remotes
                .iter()
                .filter(|(_, (tuple, _))| local.matches(tuple))
                .count();

            // A lone cheap-level disagreement with enough peers corroborating our
            // state is compression/ordering noise, not divergence.
            let deeper_levels_agree = mismatched.iter().all(|(_, level)| {
                *level == ChecksumLevel::Basic
            }) && remotes.iter().all(|(_, (tuple, _))| {
                tuple.level(ChecksumLevel::Enhanced) == Some(local.enhanced)
            });
            if first_level == ChecksumLevel::Basic && deeper_levels_agree && agreeing_peers >= 2 {
                self.transient_count += 1;
                self.pending.remove(&frame);
                tracing::debug!(%frame, "transient cheap-checksum blip ignored");
                continue;
            }

            // Confirmed desync: find the majority version at the mismatch level.
            let record = DesyncRecord {
                frame,
                local,
                remote: remotes
                    .iter()
                    .map(|(peer, (tuple, _))| (*peer, *tuple))
                    .collect(),
                first_mismatch_level: first_level,
                resolution: Resolution::PendingQuorum,
            };

            match self.consensus(frame, local_id, host, player_count, first_level) {
                // Not enough information yet; the frame stays pending and is
                // re-evaluated next tick.
                ConsensusOutcome::Deferred => continue,
                ConsensusOutcome::LocalCorrect => {
                    // The divergent peers repair themselves; we just archive.
                    self.pending.remove(&frame);
                    self.desync_count += 1;
                    tracing::debug!(%frame, "desync confirmed, local state is majority");
                    self.archive(DesyncRecord {
                        resolution: Resolution::Resolved,
                        ..record
                    });
                },
                ConsensusOutcome::LocalDiverged { majority_peers } => {
                    self.pending.remove(&frame);
                    self.desync_count += 1;
                    tracing::warn!(%frame, ?majority_peers, "local state diverged from majority");
                    return Some(self.begin_recovery(frame, majority_peers, record));
                },
            }
        }
        None
    }

    /// After a rollback-to-agreement replay, compares the recomputed local ladder
    /// at the incident frame against the majority's recorded ladders. Returns the
    /// next action if the replay reproduced the mismatch, `None` if repaired (or
    /// if no rollback incident is in flight).
    pub fn conclude_rollback(&mut self) -> Option<RecoveryAction> {
        let active = self.active.as_ref()?;
        if active.method != Method::Rollback {
            return None;
        }
        let frame = active.frame;
        let local = self.local.get(&frame).copied()?;
        let remotes = self.remote.get(&frame)?;
        let repaired = active
            .majority_peers
            .iter()
            .filter_map(|peer| remotes.get(peer).map(|(tuple, _)| tuple))
            .all(|tuple| local.matches(tuple));
        if repaired {
            self.recovery_succeeded(frame);
            None
        } else {
            Some(self.recovery_failed(frame))
        }
    }

    /// Reports that the action issued for `frame` repaired the divergence.
    pub fn recovery_succeeded(&mut self, frame: Frame) {
        let Some(active) = self.active.take() else {
            return;
        };
        if active.frame != frame {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Desync,
                "recovery outcome for frame {} but incident is at frame {}",
                frame,
                active.frame
            );
        }
        self.stats_mut(active.method).successes += 1;
        let resolution = match active.method {
            Method::Rollback => Resolution::RollbackTo(active.frame),
            Method::Targeted => Resolution::TargetedResync(
                active.majority_peers.first().copied().unwrap_or_default(),
            ),
            Method::Full => Resolution::FullResync,
        };
        let mut record = active.record;
        record.resolution = resolution;
        self.archive(record);
    }

    /// Reports that the action issued for `frame` did not repair the divergence
    /// and returns the next rung of the ladder.
    pub fn recovery_failed(&mut self, frame: Frame) -> RecoveryAction {
        let Some(mut active) = self.active.take() else {
            return RecoveryAction::Unresolvable { frame };
        };
        self.stats_mut(active.method).failures += 1;

        let next = match active.method {
            Method::Rollback => Some(Method::Targeted),
            Method::Targeted => Some(Method::Full),
            Method::Full => None,
        };
        match next {
            Some(method) => {
                active.method = method;
                let action = self.action_for(method, active.frame, &active.majority_peers);
                active.record.resolution = match method {
                    Method::Targeted => Resolution::TargetedResync(
                        active.majority_peers.first().copied().unwrap_or_default(),
                    ),
                    Method::Full => Resolution::FullResync,
                    Method::Rollback => Resolution::RollbackTo(active.frame),
                };
                self.active = Some(active);
                action
            },
            None => {
                let mut record = active.record;
                record.resolution = Resolution::Unresolvable;
                self.archive(record);
                RecoveryAction::Unresolvable { frame }
            },
        }
    }

    fn begin_recovery(
        &mut self,
        frame: Frame,
        majority_peers: Vec<PlayerId>,
        mut record: DesyncRecord,
    ) -> RecoveryAction {
        let rollback_gated = self.rollback_stats.attempts() >= MIN_ATTEMPTS_FOR_GATING
            && self.rollback_stats.success_rate() < self.rollback_gate;

        let agreement_frame = if rollback_gated {
            None
        } else {
            self.find_agreement_frame(frame, &majority_peers)
        };

        let (method, action) = match agreement_frame {
            Some(agreement) => (
                Method::Rollback,
                RecoveryAction::RollbackTo { frame: agreement },
            ),
            None => (
                Method::Targeted,
                self.action_for(Method::Targeted, frame, &majority_peers),
            ),
        };
        record.resolution = match &action {
            RecoveryAction::RollbackTo { frame } => Resolution::RollbackTo(*frame),
            RecoveryAction::RequestStateResync { peer, .. } => Resolution::TargetedResync(*peer),
            _ => Resolution::FullResync,
        };
        self.active = Some(ActiveRecovery {
            frame,
            method,
            majority_peers,
            record,
        });
        action
    }

    fn action_for(
        &self,
        method: Method,
        frame: Frame,
        majority_peers: &[PlayerId],
    ) -> RecoveryAction {
        match method {
            Method::Rollback => RecoveryAction::RollbackTo { frame },
            Method::Targeted => match majority_peers.first() {
                Some(peer) => RecoveryAction::RequestStateResync { peer: *peer, frame },
                None => RecoveryAction::RequestFullResync { frame },
            },
            Method::Full => RecoveryAction::RequestFullResync { frame },
        }
    }

    /// The greatest frame at or below `frame` where the local ladder still matches
    /// every majority peer that reported one.
    fn find_agreement_frame(&self, frame: Frame, majority_peers: &[PlayerId]) -> Option<Frame> {
        self.local
            .range(..=frame)
            .rev()
            .skip(1) // the diverged frame itself cannot be the agreement point
            .find_map(|(candidate, local)| {
                let remotes = self.remote.get(candidate)?;
                let reported: Vec<&ChecksumTuple> = majority_peers
                    .iter()
                    .filter_map(|peer| remotes.get(peer).map(|(tuple, _)| tuple))
                    .collect();
                (!reported.is_empty() && reported.iter().all(|tuple| local.matches(tuple)))
                    .then_some(*candidate)
            })
    }

    fn consensus(
        &self,
        frame: Frame,
        local_id: PlayerId,
        host: Option<PlayerId>,
        player_count: usize,
        level: ChecksumLevel,
    ) -> ConsensusOutcome {
        let Some(local) = self.local.get(&frame) else {
            return ConsensusOutcome::Deferred;
        };
        let Some(remotes) = self.remote.get(&frame) else {
            return ConsensusOutcome::Deferred;
        };

        // Group voters by their checksum value at the mismatch level, falling back
        // to the always-present cheap level.
        let value_of = |tuple: &ChecksumTuple| tuple.level(level).unwrap_or(tuple.basic);

        let mut groups: BTreeMap<u64, Vec<PlayerId>> = BTreeMap::new();
        groups.entry(value_of(local)).or_default().push(local_id);
        for (peer, (tuple, _)) in remotes {
            groups.entry(value_of(tuple)).or_default().push(*peer);
        }

        let voters: usize = groups.values().map(Vec::len).sum();
        let max_votes = groups.values().map(Vec::len).max().unwrap_or(0);
        let leaders: Vec<(&u64, &Vec<PlayerId>)> = groups
            .iter()
            .filter(|(_, members)| members.len() == max_votes)
            .collect();

        let winner_members: Vec<PlayerId> = if leaders.len() == 1 {
            leaders[0].1.clone()
        } else {
            // Tie: the host's version wins; without a known host, defer and
            // re-evaluate next frame with hopefully more reports.
            match host {
                Some(host_id) => {
                    match leaders
                        .iter()
                        .find(|(_, members)| members.contains(&host_id))
                    {
                        Some((_, members)) => (*members).clone(),
                        None => return ConsensusOutcome::Deferred,
                    }
                },
                None => return ConsensusOutcome::Deferred,
            }
        };

        // With very few voters relative to the session, wait for more reports
        // unless the winning side already spans a strict majority of players.
        if voters < player_count && winner_members.len() * 2 <= player_count {
            return ConsensusOutcome::Deferred;
        }

        if winner_members.contains(&local_id) {
            ConsensusOutcome::LocalCorrect
        } else {
            let majority_peers = winner_members
                .into_iter()
                .filter(|peer| *peer != local_id)
                .collect();
            ConsensusOutcome::LocalDiverged { majority_peers }
        }
    }

    fn stats_mut(&mut self, method: Method) -> &mut MethodStats {
        match method {
            Method::Rollback => &mut self.rollback_stats,
            Method::Targeted => &mut self.targeted_stats,
            Method::Full => &mut self.full_stats,
        }
    }

    fn archive(&mut self, record: DesyncRecord) {
        self.history.push_back(record);
        while self.history.len() > ARCHIVE_LIMIT {
            self.history.pop_front();
        }
    }

    fn prune(&mut self, newest: Frame) {
        let horizon = newest - HISTORY_WINDOW;
        if !horizon.is_valid() {
            return;
        }
        self.local.retain(|frame, _| *frame >= horizon);
        self.remote.retain(|frame, _| *frame >= horizon);
        self.pending.retain(|frame| *frame >= horizon);
    }

    /// Drops all checksum state (full resync resets the world).
    pub fn reset(&mut self) {
        self.local.clear();
        self.remote.clear();
        self.pending.clear();
        self.active = None;
    }
}

enum ConsensusOutcome {
    /// Local state matches the winning version; nothing to repair here.
    LocalCorrect,
    /// Local state lost the vote; repair against these peers.
    LocalDiverged { majority_peers: Vec<PlayerId> },
    /// Not enough information; try again next frame.
    Deferred,
}

// #########
// # TESTS #
// #########
