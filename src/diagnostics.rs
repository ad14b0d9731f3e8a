//! Per-peer network diagnostics: latency, jitter, loss, bandwidth and stability,
//! folded into a 0-100 quality score and an ordinal grade.
//!
//! The session drives this module with wall time each tick; the module never reads
//! clocks itself. Outgoing probes are returned as actions for the session to send,
//! which keeps all transport traffic on the one send path.
//!
//! Grades feed back into the rest of the runtime: the optimizer switches batching
//! strategies on grade changes and host migration scores candidates with them.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use web_time::Instant;

use crate::network::messages::{BandwidthAck, BandwidthTest, Ping, Pong};
use crate::sessions::builder::DiagnosticsConfig;
use crate::{ConnectionQuality, PlayerId};

/// Outgoing work produced by [`NetworkDiagnostics::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticsAction {
    /// Send a latency probe to a peer.
    SendPing {
        /// The probe target.
        peer: PlayerId,
        /// The probe to send.
        ping: Ping,
    },
    /// Send a bandwidth measurement burst to a peer.
    SendBandwidthBurst {
        /// The burst target.
        peer: PlayerId,
        /// The packets of the burst, in order.
        packets: Vec<BandwidthTest>,
    },
    /// A peer's quality grade changed.
    GradeChanged {
        /// The peer whose grade changed.
        peer: PlayerId,
        /// The previous grade.
        old: ConnectionQuality,
        /// The new grade.
        new: ConnectionQuality,
    },
}

/// Round-trip latency statistics for one peer.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    /// Most recent RTT in milliseconds.
    pub current_ms: f64,
    /// Smallest RTT seen.
    pub min_ms: f64,
    /// Largest RTT seen.
    pub max_ms: f64,
    /// Mean over the sample window.
    pub avg_ms: f64,
    /// Standard deviation over the sample window.
    pub jitter_ms: f64,
    samples: VecDeque<f64>,
}

impl LatencyStats {
    fn record(&mut self, rtt_ms: f64, window: usize) {
        self.current_ms = rtt_ms;
        if self.samples.is_empty() {
            self.min_ms = rtt_ms;
            self.max_ms = rtt_ms;
        } else {
            self.min_ms = self.min_ms.min(rtt_ms);
            self.max_ms = self.max_ms.max(rtt_ms);
        }
        self.samples.push_back(rtt_ms);
        while self.samples.len() > window {
            self.samples.pop_front();
        }
        let n = self.samples.len() as f64;
        self.avg_ms = self.samples.iter().sum::<f64>() / n;
        let variance = self
            .samples
            .iter()
            .map(|s| (s - self.avg_ms).powi(2))
            .sum::<f64>()
            / n;
        self.jitter_ms = variance.sqrt();
    }

    /// Number of RTT samples currently held.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Packet loss statistics for one peer, derived from the ping stream.
#[derive(Debug, Clone, Default)]
pub struct LossStats {
    /// Probes sent.
    pub sent: u64,
    /// Probe echoes received.
    pub received: u64,
    /// Probes counted lost after the timeout.
    pub lost: u64,
    /// `lost / sent`.
    pub loss_rate: f64,
    /// Probes lost in a row without an intervening echo.
    pub consecutive_lost: u32,
}

impl LossStats {
    fn on_sent(&mut self) {
        self.sent += 1;
        self.update_rate();
    }

    fn on_received(&mut self) {
        self.received += 1;
        self.consecutive_lost = 0;
        self.update_rate();
    }

    fn on_lost(&mut self) {
        self.lost += 1;
        self.consecutive_lost += 1;
        self.update_rate();
    }

    fn update_rate(&mut self) {
        self.loss_rate = if self.sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.sent as f64
        };
    }
}

/// Bandwidth estimates for one peer in bits per second.
#[derive(Debug, Clone, Default)]
pub struct BandwidthStats {
    /// Latest upload estimate (local to peer).
    pub upload_bps: f64,
    /// Latest download estimate (peer to local).
    pub download_bps: f64,
    upload_samples: VecDeque<f64>,
    download_samples: VecDeque<f64>,
}

impl BandwidthStats {
    fn record_upload(&mut self, bps: f64, window: usize) {
        self.upload_samples.push_back(bps);
        while self.upload_samples.len() > window {
            self.upload_samples.pop_front();
        }
        self.upload_bps =
            self.upload_samples.iter().sum::<f64>() / self.upload_samples.len() as f64;
    }

    fn record_download(&mut self, bps: f64, window: usize) {
        self.download_samples.push_back(bps);
        while self.download_samples.len() > window {
            self.download_samples.pop_front();
        }
        self.download_bps =
            self.download_samples.iter().sum::<f64>() / self.download_samples.len() as f64;
    }
}

/// Connection stability accounting for one peer.
#[derive(Debug, Clone)]
pub struct StabilityStats {
    /// Times the transport reported the peer gone.
    pub disconnections: u32,
    /// Times the peer came back.
    pub reconnections: u32,
    /// When the current connection was established.
    pub connected_since: Option<Instant>,
}

impl StabilityStats {
    /// Stability in `[0, 1]`; starts at 1 and drops with each disconnection.
    #[must_use]
    pub fn score(&self) -> f64 {
        1.0 / (1.0 + 0.5 * f64::from(self.disconnections))
    }
}

impl Default for StabilityStats {
    fn default() -> Self {
        Self {
            disconnections: 0,
            reconnections: 0,
            connected_since: None,
        }
    }
}

/// An in-flight bandwidth burst we initiated.
#[derive(Debug)]
struct OutgoingBandwidthTest {
    test_id: u32,
    started_at: Instant,
    bytes_acked: u64,
}

/// A bandwidth burst a peer is sending us.
#[derive(Debug)]
struct IncomingBandwidthTest {
    test_id: u32,
    first_packet_at: Instant,
    bytes_received: u64,
}

#[derive(Debug, Default)]
struct PeerState {
    latency: LatencyStats,
    loss: LossStats,
    bandwidth: BandwidthStats,
    stability: StabilityStats,
    grade: ConnectionQuality,
    score: f64,
    outstanding_pings: BTreeMap<u32, Instant>,
    last_ping_at: Option<Instant>,
    last_bandwidth_test_at: Option<Instant>,
    outgoing_test: Option<OutgoingBandwidthTest>,
    incoming_test: Option<IncomingBandwidthTest>,
}

/// Measures link quality towards every peer.
pub struct NetworkDiagnostics {
    config: DiagnosticsConfig,
    peers: BTreeMap<PlayerId, PeerState>,
    next_ping_id: u32,
    next_test_id: u32,
}

impl NetworkDiagnostics {
    /// Creates diagnostics with the given configuration.
    #[must_use]
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self {
            config,
            peers: BTreeMap::new(),
            next_ping_id: 0,
            next_test_id: 0,
        }
    }

    /// Starts tracking a peer. The first bandwidth burst is scheduled one full
    /// interval after the join so session start is not spent measuring.
    pub fn add_peer(&mut self, peer: PlayerId, now: Instant) {
        let state = self.peers.entry(peer).or_default();
        state.stability.connected_since = Some(now);
        state.last_bandwidth_test_at = Some(now);
    }

    /// Stops tracking a peer entirely (departure, not a connection blip).
    pub fn remove_peer(&mut self, peer: PlayerId) {
        self.peers.remove(&peer);
    }

    /// Records a transport-level disconnection of a peer that stays in the session.
    pub fn record_disconnect(&mut self, peer: PlayerId) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.stability.disconnections += 1;
            state.stability.connected_since = None;
        }
    }

    /// Records a peer's connection coming back.
    pub fn record_reconnect(&mut self, peer: PlayerId, now: Instant) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.stability.reconnections += 1;
            state.stability.connected_since = Some(now);
        }
    }

    /// Drives schedules: due pings, ping timeouts, due bandwidth bursts, burst
    /// completion, and grade recomputation. Returns the work for the session.
    pub fn poll(&mut self, now: Instant) -> Vec<DiagnosticsAction> {
        let mut actions = Vec::new();
        let config = self.config;

        let peer_ids: Vec<PlayerId> = self.peers.keys().copied().collect();
        for peer in peer_ids {
            // Expire outstanding pings into losses.
            {
                let state = match self.peers.get_mut(&peer) {
                    Some(state) => state,
                    None => continue,
                };
                let timeout = u128::from(config.ping_timeout_ms);
                let expired: Vec<u32> = state
                    .outstanding_pings
                    .iter()
                    .filter(|(_, sent)| now.saturating_duration_since(**sent).as_millis() >= timeout)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    state.outstanding_pings.remove(&id);
                    state.loss.on_lost();
                }
            }

            // Ping on schedule.
            if self.ping_due(peer, now) {
                let ping_id = self.next_ping_id;
                self.next_ping_id = self.next_ping_id.wrapping_add(1);
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.last_ping_at = Some(now);
                    state.outstanding_pings.insert(ping_id, now);
                    state.loss.on_sent();
                }
                actions.push(DiagnosticsAction::SendPing {
                    peer,
                    ping: Ping { ping_id, t0: 0 },
                });
            }

            // Bandwidth burst on schedule.
            if self.bandwidth_test_due(peer, now) {
                let test_id = self.next_test_id;
                self.next_test_id = self.next_test_id.wrapping_add(1);
                let packets: Vec<BandwidthTest> = (0..config.bandwidth_max_packets)
                    .map(|packet_id| BandwidthTest {
                        test_id,
                        packet_id,
                        payload: vec![0u8; config.bandwidth_packet_bytes],
                    })
                    .collect();
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.last_bandwidth_test_at = Some(now);
                    state.outgoing_test = Some(OutgoingBandwidthTest {
                        test_id,
                        started_at: now,
                        bytes_acked: 0,
                    });
                }
                actions.push(DiagnosticsAction::SendBandwidthBurst { peer, packets });
            }

            // Close out bandwidth tests that hit their hard cap.
            self.finalize_expired_tests(peer, now);

            // Recompute the score and surface grade transitions.
            if let Some(action) = self.update_grade(peer) {
                actions.push(action);
            }
        }
        actions
    }

    fn ping_due(&self, peer: PlayerId, now: Instant) -> bool {
        let Some(state) = self.peers.get(&peer) else {
            return false;
        };
        match state.last_ping_at {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last).as_millis()
                    >= u128::from(self.config.ping_interval_ms)
            },
        }
    }

    fn bandwidth_test_due(&self, peer: PlayerId, now: Instant) -> bool {
        let Some(state) = self.peers.get(&peer) else {
            return false;
        };
        if state.outgoing_test.is_some() {
            return false;
        }
        match state.last_bandwidth_test_at {
            None => false,
            Some(last) => {
                now.saturating_duration_since(last).as_millis()
                    >= u128::from(self.config.bandwidth_test_interval_ms)
            },
        }
    }

    fn finalize_expired_tests(&mut self, peer: PlayerId, now: Instant) {
        let config = self.config;
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        if let Some(test) = &state.outgoing_test {
            let elapsed = now.saturating_duration_since(test.started_at);
            if elapsed.as_millis() >= u128::from(config.bandwidth_test_duration_ms) {
                let secs = elapsed.as_secs_f64().max(0.001);
                let bps = test.bytes_acked as f64 * 8.0 / secs;
                state
                    .bandwidth
                    .record_upload(bps, config.bandwidth_sample_window);
                state.outgoing_test = None;
            }
        }
        if let Some(test) = &state.incoming_test {
            let elapsed = now.saturating_duration_since(test.first_packet_at);
            if elapsed.as_millis() >= u128::from(config.bandwidth_test_duration_ms) {
                let secs = elapsed.as_secs_f64().max(0.001);
                let bps = test.bytes_received as f64 * 8.0 / secs;
                state
                    .bandwidth
                    .record_download(bps, config.bandwidth_sample_window);
                state.incoming_test = None;
            }
        }
    }

    /// Fills in the send timestamp for a ping produced by [`poll`](Self::poll).
    /// The caller owns the millisecond epoch; diagnostics only compares values.
    pub fn stamp_ping(ping: Ping, now_ms: u128) -> Ping {
        Ping {
            ping_id: ping.ping_id,
            t0: now_ms,
        }
    }

    /// Builds the echo for a received ping.
    #[must_use]
    pub fn answer_ping(ping: &Ping, now_ms: u128) -> Pong {
        Pong {
            ping_id: ping.ping_id,
            t0: ping.t0,
            t1: now_ms,
        }
    }

    /// Records an echoed probe. `now_ms` must come from the same epoch that
    /// stamped the outgoing probe; the peer id comes from the message envelope.
    pub fn handle_pong(&mut self, peer: PlayerId, pong: &Pong, now_ms: u128) {
        let config = self.config;
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        if state.outstanding_pings.remove(&pong.ping_id).is_none() {
            // Echo after the loss timeout (or duplicate); counted already.
            return;
        }
        let rtt_ms = now_ms.saturating_sub(pong.t0) as f64;
        state.loss.on_received();
        state.latency.record(rtt_ms, config.latency_sample_window);
    }

    /// Accepts one packet of a peer's bandwidth burst and produces its ack.
    pub fn handle_bandwidth_packet(
        &mut self,
        peer: PlayerId,
        packet: &BandwidthTest,
        now: Instant,
    ) -> BandwidthAck {
        if let Some(state) = self.peers.get_mut(&peer) {
            let restart = state
                .incoming_test
                .as_ref()
                .map_or(true, |t| t.test_id != packet.test_id);
            if restart {
                state.incoming_test = Some(IncomingBandwidthTest {
                    test_id: packet.test_id,
                    first_packet_at: now,
                    bytes_received: 0,
                });
            }
            if let Some(test) = state.incoming_test.as_mut() {
                test.bytes_received += packet.payload.len() as u64;
            }
        }
        BandwidthAck {
            test_id: packet.test_id,
            packet_id: packet.packet_id,
        }
    }

    /// Credits an acked burst packet towards the upload estimate.
    pub fn handle_bandwidth_ack(&mut self, peer: PlayerId, ack: &BandwidthAck) {
        let packet_bytes = self.config.bandwidth_packet_bytes as u64;
        if let Some(state) = self.peers.get_mut(&peer) {
            if let Some(test) = state.outgoing_test.as_mut() {
                if test.test_id == ack.test_id {
                    test.bytes_acked += packet_bytes;
                }
            }
        }
    }

    fn update_grade(&mut self, peer: PlayerId) -> Option<DiagnosticsAction> {
        let config = self.config;
        let state = self.peers.get_mut(&peer)?;
        if state.latency.sample_count() == 0 {
            return None; // stays Unknown until the first echo
        }

        let mut score = 100.0;

        let latency_threshold = f64::from(config.latency_threshold_ms);
        if state.latency.avg_ms > latency_threshold {
            let excess = ((state.latency.avg_ms - latency_threshold) / latency_threshold)
                .clamp(0.0, 1.0);
            score -= excess * 40.0;
        }

        let jitter_threshold = f64::from(config.jitter_threshold_ms);
        if state.latency.jitter_ms > jitter_threshold {
            let excess =
                ((state.latency.jitter_ms - jitter_threshold) / jitter_threshold).clamp(0.0, 1.0);
            score -= excess * 20.0;
        }

        if state.loss.loss_rate > config.loss_threshold {
            let excess = ((state.loss.loss_rate - config.loss_threshold) / config.loss_threshold)
                .clamp(0.0, 1.0);
            score -= excess * 30.0;
        }

        score -= (1.0 - state.stability.score()) * 20.0;

        state.score = score.clamp(0.0, 100.0);
        let new_grade = if state.score >= 90.0 {
            ConnectionQuality::Excellent
        } else if state.score >= 75.0 {
            ConnectionQuality::Good
        } else if state.score >= 50.0 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        };

        if new_grade != state.grade {
            let old = state.grade;
            state.grade = new_grade;
            tracing::debug!(%peer, ?old, ?new_grade, score = state.score, "link grade changed");
            return Some(DiagnosticsAction::GradeChanged {
                peer,
                old,
                new: new_grade,
            });
        }
        None
    }

    /// The current grade for a peer.
    #[must_use]
    pub fn grade(&self, peer: PlayerId) -> ConnectionQuality {
        self.peers.get(&peer).map_or_else(Default::default, |s| s.grade)
    }

    /// The current 0-100 score for a peer (50 before any measurement).
    #[must_use]
    pub fn score(&self, peer: PlayerId) -> f64 {
        self.peers
            .get(&peer)
            .map_or(50.0, |s| if s.latency.sample_count() == 0 { 50.0 } else { s.score })
    }

    /// Average RTT for a peer in milliseconds.
    #[must_use]
    pub fn latency_ms(&self, peer: PlayerId) -> f64 {
        self.peers.get(&peer).map_or(0.0, |s| s.latency.avg_ms)
    }

    /// Stability score in `[0, 1]` for a peer.
    #[must_use]
    pub fn stability(&self, peer: PlayerId) -> f64 {
        self.peers.get(&peer).map_or(1.0, |s| s.stability.score())
    }

    /// The worst grade and score across all peers, for the optimizer.
    #[must_use]
    pub fn worst_link(&self) -> (ConnectionQuality, f64) {
        self.peers
            .values()
            .filter(|s| s.latency.sample_count() > 0)
            .map(|s| (s.grade, s.score))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((ConnectionQuality::Unknown, 100.0))
    }

    /// Latency stats for a peer, if tracked.
    #[must_use]
    pub fn latency_stats(&self, peer: PlayerId) -> Option<&LatencyStats> {
        self.peers.get(&peer).map(|s| &s.latency)
    }

    /// Loss stats for a peer, if tracked.
    #[must_use]
    pub fn loss_stats(&self, peer: PlayerId) -> Option<&LossStats> {
        self.peers.get(&peer).map(|s| &s.loss)
    }

    /// Bandwidth stats for a peer, if tracked.
    #[must_use]
    pub fn bandwidth_stats(&self, peer: PlayerId) -> Option<&BandwidthStats> {
        self.peers.get(&peer).map(|s| &s.bandwidth)
    }
}

// #########
// # TESTS #
// #########
