//! The session façade: composition, event routing and lifecycle.
//!
//! A [`Session`] owns every per-session singleton: the rollback engine (which owns
//! the simulation core), the desync detector, the migration manager, diagnostics,
//! the optimizer, the fixed-step clock and the transport. Multiple sessions can
//! coexist in one process.
//!
//! Everything runs on the caller's thread. `tick()` drains the transport, runs due
//! clock ticks through the engine's frame pipeline, routes subsystem actions onto
//! the wire and queues notifications which the game drains with
//! [`drain_events`](Session::drain_events). During host migration the simulation is
//! paused and remote inputs queue; they are re-applied on resume, minus anything
//! older than the resume frame.

use std::collections::{BTreeMap, VecDeque};

use web_time::Instant;

use crate::clock::FixedStepClock;
use crate::desync::{DesyncDetector, RecoveryAction};
use crate::diagnostics::{DiagnosticsAction, NetworkDiagnostics};
use crate::engine::{EngineTuning, RollbackEngine, TickReport};
use crate::error::{BulwarkError, InvalidRequestKind};
use crate::migration::{CandidateInfo, MigrationAction, MigrationManager};
use crate::network::messages::{
    InputMessage, Message, MessageBody, StateRequest, StateResponse,
};
use crate::optimizer::PerformanceOptimizer;
use crate::sessions::builder::SessionConfig;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{
    report_violation, ConnectionQuality, Frame, PeerEvent, PlayerId, PlayerInfo, SessionEvent,
    SessionState, SimulationCore, Transport,
};

/// Events kept before the oldest are dropped.
const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// Cumulative counters for the lifetime of the session object.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// Sessions booted through this object (1 after construction).
    pub sessions_started: u64,
    /// Confirmed desyncs observed.
    pub desyncs_detected: u64,
    /// Desyncs successfully repaired.
    pub recoveries: u64,
    /// Completed host migrations.
    pub host_migrations: u64,
}

/// All metric probes in one place.
#[derive(Debug, Clone, Copy)]
pub struct SessionMetrics {
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
    /// Mean one-way input latency estimate in milliseconds.
    pub avg_input_latency_ms: f64,
    /// Confirmed desyncs.
    pub desync_count: u64,
    /// Fraction of recovery attempts that succeeded.
    pub recovery_success_rate: f64,
    /// Completed host migrations.
    pub host_migrations: u64,
    /// Fraction of migrations that completed.
    pub migration_success_rate: f64,
    /// Mean input entries per flushed batch.
    pub avg_batch_size: f64,
    /// Stored snapshot bytes over raw snapshot bytes.
    pub compression_ratio: f64,
    /// Fraction of state buffer acquisitions served from the pool.
    pub state_pool_hit_rate: f64,
}

/// Snapshot of the session for observability.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Lifecycle state.
    pub state: SessionState,
    /// The current host, if any.
    pub host: Option<PlayerId>,
    /// Per-player metadata.
    pub players: Vec<PlayerInfo>,
    /// Metric probes.
    pub metrics: SessionMetrics,
    /// Cumulative counters.
    pub stats: SessionStats,
}

/// Per-peer link measurements for observability.
#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    /// One entry per remote peer.
    pub peers: Vec<PeerLinkReport>,
}

/// Link measurements towards one peer.
#[derive(Debug, Clone)]
pub struct PeerLinkReport {
    /// The peer.
    pub peer: PlayerId,
    /// Current quality grade.
    pub grade: ConnectionQuality,
    /// 0-100 quality score.
    pub score: f64,
    /// Mean RTT in milliseconds.
    pub latency_ms: f64,
    /// RTT standard deviation in milliseconds.
    pub jitter_ms: f64,
    /// Probe loss rate.
    pub loss_rate: f64,
    /// Upload estimate in bits per second.
    pub upload_bps: f64,
    /// Download estimate in bits per second.
    pub download_bps: f64,
    /// Stability in `[0, 1]`.
    pub stability: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResyncKind {
    Targeted,
    Full,
}

#[derive(Debug)]
struct PendingResync {
    kind: ResyncKind,
    request_id: u32,
    incident_frame: Frame,
    issued_at: Instant,
}

/// The deterministic P2P rollback runtime, composed and ready to tick.
pub struct Session {
    config: SessionConfig,
    local_id: PlayerId,
    state: SessionState,

    engine: RollbackEngine,
    desync: DesyncDetector,
    migration: MigrationManager,
    diagnostics: NetworkDiagnostics,
    optimizer: PerformanceOptimizer,
    clock: FixedStepClock,
    transport: Box<dyn Transport>,

    players: BTreeMap<PlayerId, PlayerInfo>,
    host_id: Option<PlayerId>,
    events: VecDeque<SessionEvent>,
    epoch: Instant,

    /// Remote inputs received while the simulation is paused for migration.
    queued_inputs: Vec<InputMessage>,
    pending_resync: Option<PendingResync>,
    next_request_id: u32,
    /// High-water mark of the instants fed into `tick_at`; millisecond timestamps
    /// are derived from it so synthetic clocks drive them too.
    now_cursor: Instant,

    stats: SessionStats,
    input_latency_sum_ms: u128,
    input_latency_samples: u64,
    was_stalled: bool,

    // Observed frame rate over a rolling window, for the optimizer's adapt loop.
    fps_window_start: Option<Instant>,
    fps_window_frames: u32,
    observed_fps: f64,
}

impl Session {
    pub(crate) fn start_as_host(
        local_id: PlayerId,
        config: SessionConfig,
        sim: Box<dyn SimulationCore>,
        transport: Box<dyn Transport>,
    ) -> Result<Self, BulwarkError> {
        let now = Instant::now();
        let mut session = Self::build(local_id, config, sim, transport, now)?;
        session.host_id = Some(local_id);
        if let Some(info) = session.players.get_mut(&local_id) {
            info.is_host = true;
        }
        session.migration.set_local_host(true, now);
        tracing::info!(%local_id, "session started as host");
        Ok(session)
    }

    pub(crate) fn join_as_client(
        local_id: PlayerId,
        host_id: PlayerId,
        config: SessionConfig,
        sim: Box<dyn SimulationCore>,
        transport: Box<dyn Transport>,
    ) -> Result<Self, BulwarkError> {
        if local_id == host_id {
            return Err(BulwarkError::InvalidRequest {
                kind: InvalidRequestKind::DuplicatePlayer { id: host_id },
            });
        }
        let now = Instant::now();
        let mut session = Self::build(local_id, config, sim, transport, now)?;
        session.add_player(host_id, false)?;
        session.host_id = Some(host_id);
        if let Some(info) = session.players.get_mut(&host_id) {
            info.is_host = true;
        }
        session.migration.set_local_host(false, now);
        tracing::info!(%local_id, %host_id, "session joined as client");
        Ok(session)
    }

    fn build(
        local_id: PlayerId,
        config: SessionConfig,
        sim: Box<dyn SimulationCore>,
        transport: Box<dyn Transport>,
        now: Instant,
    ) -> Result<Self, BulwarkError> {
        let tuning = EngineTuning {
            input_delay: config.input_delay_frames,
            max_prediction: config.max_prediction_frames,
            max_rollback: config.max_rollback_frames,
            snapshot_ring_size: config.snapshot_ring_size,
            deep_checksum_interval: config.deep_checksum_interval,
        };
        let mut engine = RollbackEngine::new(sim, tuning);
        engine.add_player(local_id, true)?;
        let initial_checksums = engine.start()?;

        let mut desync = DesyncDetector::new(config.desync_rollback_success_floor);
        desync.record_local(Frame::new(0), initial_checksums);

        let mut players = BTreeMap::new();
        let mut local_info = PlayerInfo::new(local_id, true);
        local_info.input_delay = config.input_delay_frames;
        players.insert(local_id, local_info);

        Ok(Self {
            engine,
            desync,
            migration: MigrationManager::new(local_id, config.migration),
            diagnostics: NetworkDiagnostics::new(config.diagnostics),
            optimizer: PerformanceOptimizer::new(config.optimizer),
            clock: FixedStepClock::with_cap(config.frame_rate_hz, config.max_pending_ticks),
            transport,
            players,
            host_id: None,
            events: VecDeque::new(),
            epoch: now,
            queued_inputs: Vec::new(),
            pending_resync: None,
            next_request_id: 0,
            now_cursor: now,
            stats: SessionStats {
                sessions_started: 1,
                ..SessionStats::default()
            },
            input_latency_sum_ms: 0,
            input_latency_samples: 0,
            was_stalled: false,
            fps_window_start: None,
            fps_window_frames: 0,
            observed_fps: f64::from(config.frame_rate_hz),
            local_id,
            config,
            state: SessionState::Running,
        })
    }

    /// The session's lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The local player id.
    #[must_use]
    pub fn local_id(&self) -> PlayerId {
        self.local_id
    }

    /// The current host, if any.
    #[must_use]
    pub fn host(&self) -> Option<PlayerId> {
        self.host_id
    }

    /// Adds a player to the session.
    pub fn add_player(&mut self, id: PlayerId, local: bool) -> Result<(), BulwarkError> {
        self.ensure_not_stopped()?;
        if self.players.contains_key(&id) {
            return Err(BulwarkError::InvalidRequest {
                kind: InvalidRequestKind::DuplicatePlayer { id },
            });
        }
        self.engine.add_player(id, local)?;
        let mut info = PlayerInfo::new(id, local);
        info.input_delay = self.config.input_delay_frames;
        self.players.insert(id, info);
        if !local {
            self.diagnostics.add_peer(id, Instant::now());
        }
        self.push_event(SessionEvent::PeerJoined { peer: id });
        Ok(())
    }

    /// Removes a player from the session.
    pub fn remove_player(&mut self, id: PlayerId) -> Result<(), BulwarkError> {
        self.ensure_not_stopped()?;
        if !self.players.contains_key(&id) {
            return Err(BulwarkError::InvalidRequest {
                kind: InvalidRequestKind::UnknownPlayer { id },
            });
        }
        self.remove_player_internal(id);
        Ok(())
    }

    fn remove_player_internal(&mut self, id: PlayerId) {
        self.players.remove(&id);
        let _ = self.engine.remove_player(id);
        self.diagnostics.remove_peer(id);
        if self.host_id == Some(id) {
            self.host_id = None;
        }
        self.push_event(SessionEvent::PeerLeft { peer: id });
    }

    /// Submits local input for the current frame (applied `input_delay` frames
    /// later) and hands it to the outgoing batcher.
    pub fn send_local_input(&mut self, bytes: Vec<u8>) -> Result<Frame, BulwarkError> {
        self.ensure_not_stopped()?;
        let now = Instant::now();
        let frame = self.engine.add_local_input(self.local_id, bytes.clone(), now)?;
        let entry = InputMessage {
            frame,
            player: self.local_id,
            bytes,
            send_time: self.now_ms(),
        };
        if let Some(batch) = self.optimizer.enqueue_input(entry, now) {
            self.send_input_batch(batch);
        }
        Ok(frame)
    }

    /// Runs one pump iteration using the real clock.
    pub fn tick(&mut self) -> Result<(), BulwarkError> {
        self.tick_at(Instant::now())
    }

    /// Runs one pump iteration at an explicit instant (deterministic testing).
    pub fn tick_at(&mut self, now: Instant) -> Result<(), BulwarkError> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }
        self.now_cursor = self.now_cursor.max(now);

        self.drain_peer_events(now)?;
        self.drain_messages(now)?;

        if self.state == SessionState::Stopped {
            return Ok(());
        }

        if self.state == SessionState::Migrating {
            // Rollback activity is frozen; only the migration timers run.
            let actions = self.poll_migration(now);
            self.execute_migration_actions(actions, now)?;
            return Ok(());
        }

        // Clock-driven frame pipeline.
        let due = self.clock.try_advance(now);
        for _ in 0..due {
            let report = match self.engine.tick(&mut self.optimizer) {
                Ok(report) => report,
                Err(error) => return self.fatal(error),
            };
            self.route_tick_report(&report);
        }

        // Desync evaluation and recovery.
        if self.pending_resync.is_none() && !self.migration.is_migrating() {
            if let Some(action) =
                self.desync
                    .evaluate(self.local_id, self.host_id, self.players.len())
            {
                self.stats.desyncs_detected += 1;
                self.execute_recovery_action(action, now)?;
            }
        }
        self.check_resync_timeout(now)?;

        // Link measurement.
        let actions = self.diagnostics.poll(now);
        self.execute_diagnostics_actions(actions);

        // Host liveness / migration timers.
        let actions = self.poll_migration(now);
        self.execute_migration_actions(actions, now)?;

        // Outgoing batch deadline and adaptive tuning.
        if let Some(batch) = self.optimizer.flush_due(now) {
            self.send_input_batch(batch);
        }
        self.update_fps(now, due);
        self.optimizer
            .adapt(now, self.observed_fps, f64::from(self.config.frame_rate_hz));

        self.refresh_player_infos();
        Ok(())
    }

    /// Drains queued notifications, oldest first.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    /// Builds a status snapshot.
    #[must_use]
    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.state,
            host: self.host_id,
            players: self.players.values().cloned().collect(),
            metrics: self.metrics(),
            stats: self.stats,
        }
    }

    /// Assembles every metric probe.
    #[must_use]
    pub fn metrics(&self) -> SessionMetrics {
        let engine = self.engine.metrics();
        SessionMetrics {
            current_frame: engine.current_frame,
            confirmed_frame: engine.confirmed_frame,
            rollback_count: engine.rollback_count,
            avg_rollback_depth: engine.avg_rollback_depth,
            prediction_count: engine.prediction_count,
            avg_input_latency_ms: if self.input_latency_samples == 0 {
                0.0
            } else {
                self.input_latency_sum_ms as f64 / self.input_latency_samples as f64
            },
            desync_count: self.desync.desync_count(),
            recovery_success_rate: self.desync.recovery_success_rate(),
            host_migrations: self.migration.migrations_completed(),
            migration_success_rate: self.migration.migration_success_rate(),
            avg_batch_size: self.optimizer.avg_batch_size(),
            compression_ratio: self.optimizer.compression_ratio(),
            state_pool_hit_rate: self.optimizer.pool_hit_rate(),
        }
    }

    /// Builds a per-peer link report.
    #[must_use]
    pub fn diagnostics_report(&self) -> DiagnosticsReport {
        let peers = self
            .players
            .values()
            .filter(|info| !info.local)
            .map(|info| {
                let peer = info.id;
                let latency = self.diagnostics.latency_stats(peer);
                let loss = self.diagnostics.loss_stats(peer);
                let bandwidth = self.diagnostics.bandwidth_stats(peer);
                PeerLinkReport {
                    peer,
                    grade: self.diagnostics.grade(peer),
                    score: self.diagnostics.score(peer),
                    latency_ms: latency.map_or(0.0, |l| l.avg_ms),
                    jitter_ms: latency.map_or(0.0, |l| l.jitter_ms),
                    loss_rate: loss.map_or(0.0, |l| l.loss_rate),
                    upload_bps: bandwidth.map_or(0.0, |b| b.upload_bps),
                    download_bps: bandwidth.map_or(0.0, |b| b.download_bps),
                    stability: self.diagnostics.stability(peer),
                }
            })
            .collect();
        DiagnosticsReport { peers }
    }

    /// Stops the session and releases its resources. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        if let Some(batch) = self.optimizer.flush() {
            self.send_input_batch(batch);
        }
        self.engine.stop();
        self.pending_resync = None;
        self.queued_inputs.clear();
        self.state = SessionState::Stopped;
        tracing::info!(local = %self.local_id, "session shut down");
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn ensure_not_stopped(&self) -> Result<(), BulwarkError> {
        if self.state == SessionState::Stopped {
            return Err(BulwarkError::InvalidRequest {
                kind: InvalidRequestKind::SessionStopped,
            });
        }
        Ok(())
    }

    fn now_ms(&self) -> u128 {
        self.now_cursor.saturating_duration_since(self.epoch).as_millis()
    }

    fn push_event(&mut self, event: SessionEvent) {
        if self.events.len() >= MAX_EVENT_QUEUE_SIZE {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn fatal(&mut self, error: BulwarkError) -> Result<(), BulwarkError> {
        tracing::error!(%error, "session fatal");
        self.engine.stop();
        self.state = SessionState::Stopped;
        self.push_event(SessionEvent::Fatal {
            error: error.clone(),
        });
        Err(error)
    }

    fn message(&self, body: MessageBody) -> Message {
        Message::new(self.config.session_magic, body)
    }

    fn send_to(&mut self, peer: PlayerId, body: MessageBody) {
        let msg = self.message(body);
        self.transport.send_to(peer, &msg);
    }

    fn broadcast(&mut self, body: MessageBody) {
        let msg = self.message(body);
        self.transport.broadcast(&msg);
    }

    fn send_input_batch(&mut self, batch: crate::network::messages::InputBatch) {
        let body = match <[InputMessage; 1]>::try_from(batch.entries.clone()) {
            Ok([single]) => MessageBody::Input(single),
            Err(_) => MessageBody::InputBatch(batch),
        };
        self.broadcast(body);
    }

    fn drain_peer_events(&mut self, now: Instant) -> Result<(), BulwarkError> {
        for event in self.transport.poll_peer_events() {
            match event {
                PeerEvent::Connected(peer) => {
                    self.diagnostics.record_reconnect(peer, now);
                },
                PeerEvent::Disconnected(peer) => {
                    self.diagnostics.record_disconnect(peer);
                    if self.host_id == Some(peer) {
                        let candidates = self.candidates();
                        let actions = self.migration.host_disconnected(
                            now,
                            self.engine.current_frame(),
                            &candidates,
                        );
                        self.execute_migration_actions(actions, now)?;
                    }
                },
            }
        }
        Ok(())
    }

    fn drain_messages(&mut self, now: Instant) -> Result<(), BulwarkError> {
        let now_ms = self.now_ms();
        for (peer, msg) in self.transport.receive_all_messages() {
            if msg.header.magic != self.config.session_magic {
                report_violation!(
                    ViolationSeverity::Info,
                    ViolationKind::InternalError,
                    "dropping message with foreign magic {:#x} from {}",
                    msg.header.magic,
                    peer
                );
                continue;
            }
            self.handle_message(peer, msg.body, now, now_ms)?;
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        peer: PlayerId,
        body: MessageBody,
        now: Instant,
        now_ms: u128,
    ) -> Result<(), BulwarkError> {
        match body {
            MessageBody::Input(entry) => self.handle_input(entry, now, now_ms)?,
            MessageBody::InputBatch(batch) => {
                for entry in batch.entries {
                    self.handle_input(entry, now, now_ms)?;
                }
            },
            MessageBody::SyncTest(sync) => {
                self.desync
                    .record_remote(peer, sync.frame, sync.checksums, sync.send_time);
            },
            MessageBody::Ping(ping) => {
                let pong = NetworkDiagnostics::answer_ping(&ping, now_ms);
                self.send_to(peer, MessageBody::Pong(pong));
            },
            MessageBody::Pong(pong) => {
                self.diagnostics.handle_pong(peer, &pong, now_ms);
            },
            MessageBody::BandwidthTest(packet) => {
                let ack = self.diagnostics.handle_bandwidth_packet(peer, &packet, now);
                self.send_to(peer, MessageBody::BandwidthAck(ack));
            },
            MessageBody::BandwidthAck(ack) => {
                self.diagnostics.handle_bandwidth_ack(peer, &ack);
            },
            MessageBody::HostHeartbeat(heartbeat) => {
                if self.host_id == Some(heartbeat.host) {
                    self.migration.record_heartbeat(&heartbeat, now);
                }
            },
            MessageBody::MigrationAnnounce(announce) => {
                let actions = self.migration.handle_announce(&announce, now);
                if !actions.is_empty() {
                    self.push_event(SessionEvent::MigrationStarted {
                        new_host: announce.new_host,
                    });
                }
                self.execute_migration_actions(actions, now)?;
            },
            MessageBody::StateRequest(request) => {
                let response = self.answer_state_request(&request);
                self.send_to(peer, MessageBody::StateResponse(response));
            },
            MessageBody::StateResponse(response) => {
                self.handle_state_response(peer, response, now)?;
            },
            MessageBody::HostReady(ready) => {
                let actions = self.migration.handle_host_ready(&ready, now);
                self.execute_migration_actions(actions, now)?;
            },
            MessageBody::KeepAlive => {},
        }
        Ok(())
    }

    fn handle_input(
        &mut self,
        entry: InputMessage,
        now: Instant,
        now_ms: u128,
    ) -> Result<(), BulwarkError> {
        if !self.players.contains_key(&entry.player) || !entry.frame.is_valid() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "dropping input for player {} at frame {}",
                entry.player,
                entry.frame
            );
            return Ok(());
        }
        self.input_latency_sum_ms += now_ms.saturating_sub(entry.send_time);
        self.input_latency_samples += 1;

        if self.state == SessionState::Migrating {
            // Applied on resume; anything older than the resume frame is dropped
            // there.
            self.queued_inputs.push(entry);
            return Ok(());
        }
        self.engine
            .receive_remote_input(entry.player, entry.frame, entry.bytes, now)
    }

    fn answer_state_request(&mut self, request: &StateRequest) -> StateResponse {
        if request.frame.is_valid() {
            if let Some((state, checksums)) = self.engine.snapshot_for(request.frame) {
                return StateResponse {
                    request_id: request.request_id,
                    frame: request.frame,
                    state: Some(state),
                    checksums: Some(checksums),
                };
            }
        }
        let (frame, state, checksums) = self.engine.state_for_transfer();
        StateResponse {
            request_id: request.request_id,
            frame,
            state: Some(state),
            checksums: Some(checksums),
        }
    }

    fn handle_state_response(
        &mut self,
        peer: PlayerId,
        response: StateResponse,
        now: Instant,
    ) -> Result<(), BulwarkError> {
        if !response.frame.is_valid() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Desync,
                "state response from {} carries no valid frame",
                peer
            );
            return Ok(());
        }
        // Migration state pull takes precedence; desync resync is frozen anyway
        // while a migration is in flight.
        if self.migration.is_migrating() {
            if let Some(validation) = self.migration.handle_state_response(
                peer,
                response.request_id,
                response.frame,
                response.state,
                response.checksums,
                now,
            ) {
                let adopted = self.engine.load_foreign_state(
                    validation.frame,
                    &validation.state,
                    validation.checksums.as_ref(),
                )?;
                let actions = if adopted {
                    self.migration.state_validated(validation.frame, now)
                } else {
                    self.migration.state_validation_failed(now)
                };
                self.execute_migration_actions(actions, now)?;
            }
            return Ok(());
        }

        let Some(pending) = &self.pending_resync else {
            return Ok(());
        };
        if response.request_id != pending.request_id {
            return Ok(());
        }
        let incident = pending.incident_frame;
        let kind = pending.kind;
        let Some(state) = response.state else {
            return self.resync_response_invalid(kind, incident, now);
        };
        let adopted =
            self.engine
                .load_foreign_state(response.frame, &state, response.checksums.as_ref())?;
        if adopted {
            self.pending_resync = None;
            self.desync.recovery_succeeded(incident);
            self.desync.reset();
            self.stats.recoveries += 1;
            self.push_event(SessionEvent::DesyncRecovered {
                frame: response.frame,
            });
            tracing::info!(frame = %response.frame, "state resync complete");
            Ok(())
        } else {
            self.resync_response_invalid(kind, incident, now)
        }
    }

    fn resync_response_invalid(
        &mut self,
        kind: ResyncKind,
        incident: Frame,
        now: Instant,
    ) -> Result<(), BulwarkError> {
        match kind {
            ResyncKind::Targeted => {
                // The chosen peer could not help; climb to the next rung.
                self.pending_resync = None;
                let action = self.desync.recovery_failed(incident);
                self.execute_recovery_action(action, now)
            },
            ResyncKind::Full => {
                // First valid response wins; an invalid one just doesn't win.
                Ok(())
            },
        }
    }

    fn check_resync_timeout(&mut self, now: Instant) -> Result<(), BulwarkError> {
        let Some(pending) = &self.pending_resync else {
            return Ok(());
        };
        if now.saturating_duration_since(pending.issued_at).as_millis()
            < u128::from(self.config.resync_timeout_ms)
        {
            return Ok(());
        }
        let incident = pending.incident_frame;
        self.pending_resync = None;
        let action = self.desync.recovery_failed(incident);
        self.execute_recovery_action(action, now)
    }

    fn execute_recovery_action(
        &mut self,
        action: RecoveryAction,
        now: Instant,
    ) -> Result<(), BulwarkError> {
        match action {
            RecoveryAction::RollbackTo { frame } => {
                match self.engine.rollback_to(frame, &mut self.optimizer) {
                    Ok(report) => {
                        self.route_tick_report(&report);
                        match self.desync.conclude_rollback() {
                            None => {
                                self.stats.recoveries += 1;
                                self.push_event(SessionEvent::DesyncRecovered {
                                    frame: self.engine.current_frame(),
                                });
                                Ok(())
                            },
                            Some(next) => self.execute_recovery_action(next, now),
                        }
                    },
                    Err(error) if error.severity() == crate::error::Severity::Fatal => {
                        self.fatal(error)
                    },
                    Err(_) => {
                        // The agreement frame fell outside the replayable window;
                        // climb the ladder instead.
                        let next = self.desync.recovery_failed(frame);
                        self.execute_recovery_action(next, now)
                    },
                }
            },
            RecoveryAction::RequestStateResync { peer, frame } => {
                let request_id = self.take_request_id();
                self.pending_resync = Some(PendingResync {
                    kind: ResyncKind::Targeted,
                    request_id,
                    incident_frame: frame,
                    issued_at: now,
                });
                self.send_to(peer, MessageBody::StateRequest(StateRequest { request_id, frame }));
                Ok(())
            },
            RecoveryAction::RequestFullResync { frame } => {
                let request_id = self.take_request_id();
                self.pending_resync = Some(PendingResync {
                    kind: ResyncKind::Full,
                    request_id,
                    incident_frame: frame,
                    issued_at: now,
                });
                self.broadcast(MessageBody::StateRequest(StateRequest {
                    request_id,
                    frame: Frame::NULL,
                }));
                Ok(())
            },
            RecoveryAction::Unresolvable { frame } => {
                self.fatal(BulwarkError::DesyncUnresolvable { frame })
            },
        }
    }

    fn take_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    fn route_tick_report(&mut self, report: &TickReport) {
        let now_ms = self.now_ms();
        for frame in &report.advanced {
            self.push_event(SessionEvent::FrameAdvanced { frame: *frame });
        }
        for (frame, checksums) in &report.saved {
            if report.advanced.contains(frame) {
                self.desync.record_local(*frame, *checksums);
            } else {
                self.desync.replace_local(*frame, *checksums);
            }
            // Broadcast after the save, never before.
            self.broadcast(MessageBody::SyncTest(crate::network::messages::SyncTest {
                frame: *frame,
                checksums: *checksums,
                send_time: now_ms,
            }));
        }
        if let Some(rollback) = report.rollback {
            self.push_event(SessionEvent::RollbackCompleted {
                from: rollback.from,
                depth: rollback.depth,
            });
        }
        if report.stalled && !self.was_stalled {
            self.push_event(SessionEvent::Stalled {
                frame: self.engine.current_frame(),
            });
        }
        self.was_stalled = report.stalled;
    }

    fn candidates(&self) -> Vec<CandidateInfo> {
        let performance =
            (self.observed_fps / f64::from(self.config.frame_rate_hz)).clamp(0.0, 1.0);
        self.players
            .values()
            .filter(|info| Some(info.id) != self.host_id)
            .map(|info| {
                if info.local {
                    CandidateInfo {
                        id: info.id,
                        quality: ConnectionQuality::Excellent,
                        latency_ms: 0.0,
                        performance,
                        stability: 1.0,
                    }
                } else {
                    CandidateInfo {
                        id: info.id,
                        quality: self.diagnostics.grade(info.id),
                        latency_ms: self.diagnostics.latency_ms(info.id),
                        performance: 1.0,
                        stability: self.diagnostics.stability(info.id),
                    }
                }
            })
            .collect()
    }

    fn poll_migration(&mut self, now: Instant) -> Vec<MigrationAction> {
        let candidates = self.candidates();
        self.migration
            .poll(now, self.engine.current_frame(), &candidates)
    }

    fn execute_migration_actions(
        &mut self,
        actions: Vec<MigrationAction>,
        now: Instant,
    ) -> Result<(), BulwarkError> {
        let mut queue: VecDeque<MigrationAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                MigrationAction::SendHeartbeat(mut heartbeat) => {
                    heartbeat.t = self.now_ms();
                    self.broadcast(MessageBody::HostHeartbeat(heartbeat));
                },
                MigrationAction::PauseSimulation => {
                    if self.state != SessionState::Migrating {
                        self.engine.pause();
                        if let Some(batch) = self.optimizer.flush() {
                            self.send_input_batch(batch);
                        }
                        self.state = SessionState::Migrating;
                    }
                },
                MigrationAction::BroadcastAnnounce(announce) => {
                    self.push_event(SessionEvent::MigrationStarted {
                        new_host: announce.new_host,
                    });
                    self.broadcast(MessageBody::MigrationAnnounce(announce));
                },
                MigrationAction::RequestState { peer, request } => {
                    self.send_to(peer, MessageBody::StateRequest(request));
                },
                MigrationAction::UseOwnState => {
                    let frame = self.engine.current_frame();
                    let more = self.migration.state_validated(frame, now);
                    queue.extend(more);
                },
                MigrationAction::BroadcastReady(ready) => {
                    self.broadcast(MessageBody::HostReady(ready));
                },
                MigrationAction::Completed { new_host, frame } => {
                    self.finish_migration(new_host, frame, now);
                },
                MigrationAction::Failed { attempts } => {
                    return self.fatal(BulwarkError::MigrationFailed { attempts });
                },
            }
        }
        Ok(())
    }

    fn finish_migration(&mut self, new_host: PlayerId, frame: Frame, now: Instant) {
        // The departed host leaves the membership; exactly one player ends up
        // with authority.
        if let Some(old_host) = self.host_id {
            if old_host != new_host && self.players.contains_key(&old_host) {
                self.remove_player_internal(old_host);
            }
        }
        self.host_id = Some(new_host);
        for info in self.players.values_mut() {
            info.is_host = info.id == new_host;
        }

        self.engine.resume();
        self.state = SessionState::Running;
        self.clock.reset_accumulator(now);

        // Re-apply inputs that queued during the freeze; anything at or before the
        // resume horizon is stale by definition.
        let queued = std::mem::take(&mut self.queued_inputs);
        for entry in queued {
            if entry.frame < frame {
                continue;
            }
            if self.players.contains_key(&entry.player) {
                let _ = self
                    .engine
                    .receive_remote_input(entry.player, entry.frame, entry.bytes, now);
            }
        }

        self.stats.host_migrations += 1;
        self.push_event(SessionEvent::MigrationCompleted { new_host, frame });
    }

    fn execute_diagnostics_actions(&mut self, actions: Vec<DiagnosticsAction>) {
        let now_ms = self.now_ms();
        for action in actions {
            match action {
                DiagnosticsAction::SendPing { peer, ping } => {
                    let stamped = NetworkDiagnostics::stamp_ping(ping, now_ms);
                    self.send_to(peer, MessageBody::Ping(stamped));
                },
                DiagnosticsAction::SendBandwidthBurst { peer, packets } => {
                    for packet in packets {
                        self.send_to(peer, MessageBody::BandwidthTest(packet));
                    }
                },
                DiagnosticsAction::GradeChanged { peer, old, new } => {
                    if let Some(info) = self.players.get_mut(&peer) {
                        info.quality = new;
                    }
                    let (worst_grade, worst_score) = self.diagnostics.worst_link();
                    self.optimizer.set_quality(worst_grade, worst_score);
                    self.push_event(SessionEvent::QualityChanged { peer, old, new });
                },
            }
        }
    }

    fn update_fps(&mut self, now: Instant, frames: u32) {
        self.fps_window_frames += frames;
        match self.fps_window_start {
            None => self.fps_window_start = Some(now),
            Some(start) => {
                let elapsed = now.saturating_duration_since(start);
                if elapsed.as_millis() >= 1000 {
                    self.observed_fps =
                        f64::from(self.fps_window_frames) / elapsed.as_secs_f64();
                    self.fps_window_start = Some(now);
                    self.fps_window_frames = 0;
                }
            },
        }
    }

    fn refresh_player_infos(&mut self) {
        let confirmed: Vec<(PlayerId, Frame)> = self
            .players
            .keys()
            .map(|id| (*id, self.engine.last_confirmed(*id)))
            .collect();
        for (id, frame) in confirmed {
            let latency = self.diagnostics.latency_ms(id);
            let stability = self.diagnostics.stability(id);
            let grade = self.diagnostics.grade(id);
            if let Some(info) = self.players.get_mut(&id) {
                info.last_confirmed_frame = frame;
                if !info.local {
                    info.latency_ms = latency;
                    info.stability = stability;
                    info.quality = grade;
                }
            }
        }
    }

}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sessions::builder::SessionBuilder;
    use crate::{ChecksumLevel, PlayerFrameInput, SimulationFault};
    use std::cell::RefCell;
    use std::rc::Rc;

    const HOST: PlayerId = PlayerId::new(0);
    const CLIENT: PlayerId = PlayerId::new(1);

    /// Counter simulation: identical to the one the engine tests use, so session
    /// level behavior stays comparable.
    struct CounterSim {
        frame: u32,
        acc: u32,
    }

    impl CounterSim {
        fn new() -> Self {
            Self { frame: 0, acc: 0 }
        }
    }

    impl SimulationCore for CounterSim {
        fn save_state(&mut self) -> Vec<u8> {
            let mut bytes = self.frame.to_le_bytes().to_vec();
            bytes.extend_from_slice(&self.acc.to_le_bytes());
            bytes
        }

        fn load_state(&mut self, state: &[u8]) {
            self.frame = u32::from_le_bytes([state[0], state[1], state[2], state[3]]);
            self.acc = u32::from_le_bytes([state[4], state[5], state[6], state[7]]);
        }

        fn advance(&mut self, inputs: &[PlayerFrameInput]) -> Result<(), SimulationFault> {
            self.frame += 1;
            for (index, input) in inputs.iter().enumerate() {
                for &byte in &input.bytes {
                    self.acc = self.acc.wrapping_add(u32::from(byte) * (index as u32 + 1));
                }
            }
            Ok(())
        }

        fn checksum(&mut self, _level: ChecksumLevel) -> Option<u64> {
            None
        }
    }

    /// Transport that records everything sent, for assertions.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Rc<RefCell<Vec<(Option<PlayerId>, Message)>>>,
        inbox: Rc<RefCell<Vec<(PlayerId, Message)>>>,
    }

    impl Transport for RecordingTransport {
        fn send_to(&mut self, peer: PlayerId, msg: &Message) {
            self.sent.borrow_mut().push((Some(peer), msg.clone()));
        }

        fn broadcast(&mut self, msg: &Message) {
            self.sent.borrow_mut().push((None, msg.clone()));
        }

        fn receive_all_messages(&mut self) -> Vec<(PlayerId, Message)> {
            self.inbox.borrow_mut().drain(..).collect()
        }
    }

    fn host_session() -> (
        Session,
        Rc<RefCell<Vec<(Option<PlayerId>, Message)>>>,
        Rc<RefCell<Vec<(PlayerId, Message)>>>,
    ) {
        let transport = RecordingTransport::default();
        let sent = transport.sent.clone();
        let inbox = transport.inbox.clone();
        let session = SessionBuilder::new()
            .start_as_host(HOST, Box::new(CounterSim::new()), Box::new(transport))
            .unwrap();
        (session, sent, inbox)
    }

    #[test]
    fn host_boot_marks_exactly_one_host() {
        let (session, _, _) = host_session();
        let status = session.status();
        assert_eq!(status.host, Some(HOST));
        assert_eq!(
            status.players.iter().filter(|p| p.is_host).count(),
            1
        );
        assert_eq!(status.stats.sessions_started, 1);
    }

    #[test]
    fn join_as_self_is_rejected() {
        let transport = RecordingTransport::default();
        let result = SessionBuilder::new().join_as_client(
            HOST,
            HOST,
            Box::new(CounterSim::new()),
            Box::new(transport),
        );
        assert!(result.is_err());
    }

    #[test]
    fn add_then_remove_restores_membership() {
        let (mut session, _, _) = host_session();
        let before: Vec<PlayerId> = session.status().players.iter().map(|p| p.id).collect();

        session.add_player(CLIENT, false).unwrap();
        assert!(session
            .status()
            .players
            .iter()
            .any(|p| p.id == CLIENT));

        session.remove_player(CLIENT).unwrap();
        let after: Vec<PlayerId> = session.status().players.iter().map(|p| p.id).collect();
        assert_eq!(before, after);

        let events = session.drain_events();
        assert!(events.contains(&SessionEvent::PeerJoined { peer: CLIENT }));
        assert!(events.contains(&SessionEvent::PeerLeft { peer: CLIENT }));
    }

    #[test]
    fn duplicate_player_is_rejected() {
        let (mut session, _, _) = host_session();
        session.add_player(CLIENT, false).unwrap();
        let err = session.add_player(CLIENT, false).unwrap_err();
        assert!(matches!(
            err,
            BulwarkError::InvalidRequest {
                kind: InvalidRequestKind::DuplicatePlayer { .. }
            }
        ));
    }

    #[test]
    fn ticks_advance_frames_and_emit_sync_tests() {
        let (mut session, sent, _) = host_session();
        let start = Instant::now();
        session.tick_at(start).unwrap();

        let interval = session.clock.tick_interval();
        for step in 1..=5u32 {
            session.send_local_input(vec![1]).unwrap();
            session.tick_at(start + interval * step).unwrap();
        }

        let events = session.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::FrameAdvanced { .. })));

        let sent = sent.borrow();
        assert!(sent
            .iter()
            .any(|(_, msg)| matches!(msg.body, MessageBody::SyncTest(_))));
        // Sync tests follow the save they belong to.
        assert!(session.metrics().current_frame >= Frame::new(5));
    }

    #[test]
    fn shutdown_is_idempotent_and_blocks_further_calls() {
        let (mut session, _, _) = host_session();
        session.shutdown();
        session.shutdown();
        assert_eq!(session.state(), SessionState::Stopped);

        let err = session.send_local_input(vec![1]).unwrap_err();
        assert!(matches!(
            err,
            BulwarkError::InvalidRequest {
                kind: InvalidRequestKind::SessionStopped
            }
        ));
        // tick after shutdown is an inert Ok.
        session.tick().unwrap();
    }

    #[test]
    fn foreign_magic_is_dropped() {
        let (mut session, _, inbox) = host_session();
        session.add_player(CLIENT, false).unwrap();
        inbox.borrow_mut().push((
            CLIENT,
            Message::new(
                0xDEAD,
                MessageBody::SyncTest(crate::network::messages::SyncTest {
                    frame: Frame::new(1),
                    checksums: crate::snapshot::ChecksumTuple::default(),
                    send_time: 1,
                }),
            ),
        ));
        session.tick_at(Instant::now()).unwrap();
        assert_eq!(session.metrics().desync_count, 0);
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let (mut session, sent, inbox) = host_session();
        session.add_player(CLIENT, false).unwrap();
        inbox.borrow_mut().push((
            CLIENT,
            Message::new(
                session.config.session_magic,
                MessageBody::Ping(crate::network::messages::Ping { ping_id: 7, t0: 123 }),
            ),
        ));
        session.tick_at(Instant::now()).unwrap();

        let sent = sent.borrow();
        let pong = sent.iter().find_map(|(to, msg)| match &msg.body {
            MessageBody::Pong(pong) => Some((*to, *pong)),
            _ => None,
        });
        let (to, pong) = pong.expect("pong sent");
        assert_eq!(to, Some(CLIENT));
        assert_eq!(pong.ping_id, 7);
        assert_eq!(pong.t0, 123);
    }

    #[test]
    fn state_request_is_answered_with_state() {
        let (mut session, sent, inbox) = host_session();
        session.add_player(CLIENT, false).unwrap();
        inbox.borrow_mut().push((
            CLIENT,
            Message::new(
                session.config.session_magic,
                MessageBody::StateRequest(StateRequest {
                    request_id: 42,
                    frame: Frame::NULL,
                }),
            ),
        ));
        session.tick_at(Instant::now()).unwrap();

        let sent = sent.borrow();
        let response = sent
            .iter()
            .find_map(|(_, msg)| match &msg.body {
                MessageBody::StateResponse(response) => Some(response.clone()),
                _ => None,
            })
            .expect("state response sent");
        assert_eq!(response.request_id, 42);
        assert!(response.state.is_some());
        assert!(response.checksums.is_some());
    }

    #[test]
    fn matching_remote_checksums_cause_no_desync() {
        let (mut session, sent, inbox) = host_session();
        session.add_player(CLIENT, false).unwrap();
        let start = Instant::now();
        let interval = session.clock.tick_interval();
        session.tick_at(start).unwrap();
        session.send_local_input(vec![0]).unwrap();
        session.tick_at(start + interval).unwrap();

        // Echo back our own broadcast checksums as the client's.
        let ours: Vec<_> = sent
            .borrow()
            .iter()
            .filter_map(|(_, msg)| match &msg.body {
                MessageBody::SyncTest(sync) => Some(*sync),
                _ => None,
            })
            .collect();
        assert!(!ours.is_empty());
        for sync in ours {
            inbox.borrow_mut().push((
                CLIENT,
                Message::new(session.config.session_magic, MessageBody::SyncTest(sync)),
            ));
        }
        session.tick_at(start + interval * 2).unwrap();
        assert_eq!(session.metrics().desync_count, 0);
    }

    #[test]
    fn migration_failure_is_fatal() {
        let (mut session, _, _) = host_session();
        let actions = vec![MigrationAction::Failed { attempts: 3 }];
        let err = session
            .execute_migration_actions(actions, Instant::now())
            .unwrap_err();
        assert!(matches!(err, BulwarkError::MigrationFailed { attempts: 3 }));
        assert_eq!(session.state(), SessionState::Stopped);
        let events = session.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Fatal { .. })));
    }

    #[test]
    fn event_queue_is_bounded() {
        let (mut session, _, _) = host_session();
        for _ in 0..300 {
            session.push_event(SessionEvent::FrameAdvanced {
                frame: Frame::new(1),
            });
        }
        assert_eq!(session.drain_events().len(), MAX_EVENT_QUEUE_SIZE);
    }
}
