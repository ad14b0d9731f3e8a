//! Session configuration and the builder that validates it.
//!
//! Configuration is grouped per subsystem. Every group has defaults that work for
//! a 60 Hz game on a reasonable connection, a `validate()` that rejects
//! combinations the runtime cannot honor, and a few named presets for common
//! situations. Validation happens once at session construction; the subsystems
//! trust their config afterwards.

use crate::error::{BulwarkError, InvalidRequestKind};
use crate::sessions::session::Session;
use crate::{PlayerId, SimulationCore, Transport};

fn config_error(field: &'static str, constraint: &'static str) -> BulwarkError {
    BulwarkError::InvalidRequest {
        kind: InvalidRequestKind::InvalidConfig { field, constraint },
    }
}

/// Network measurement configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiagnosticsConfig {
    /// Interval between latency probes per peer.
    pub ping_interval_ms: u32,
    /// A probe unanswered for this long counts as lost.
    pub ping_timeout_ms: u32,
    /// Interval between bandwidth measurement bursts per peer.
    pub bandwidth_test_interval_ms: u32,
    /// Hard cap on one bandwidth measurement.
    pub bandwidth_test_duration_ms: u32,
    /// Payload size of one burst packet.
    pub bandwidth_packet_bytes: usize,
    /// Packets per burst.
    pub bandwidth_max_packets: u32,
    /// Average latency above this starts penalizing the quality score.
    pub latency_threshold_ms: u32,
    /// Jitter above this starts penalizing the quality score.
    pub jitter_threshold_ms: u32,
    /// Loss rate above this starts penalizing the quality score.
    pub loss_threshold: f64,
    /// RTT samples kept per peer.
    pub latency_sample_window: usize,
    /// Bandwidth samples kept per peer and direction.
    pub bandwidth_sample_window: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1000,
            ping_timeout_ms: 5000,
            bandwidth_test_interval_ms: 30_000,
            bandwidth_test_duration_ms: 10_000,
            bandwidth_packet_bytes: 1024,
            bandwidth_max_packets: 50,
            latency_threshold_ms: 150,
            jitter_threshold_ms: 50,
            loss_threshold: 0.05,
            latency_sample_window: 100,
            bandwidth_sample_window: 10,
        }
    }
}

impl DiagnosticsConfig {
    /// Validates threshold sanity.
    pub fn validate(&self) -> Result<(), BulwarkError> {
        if self.ping_interval_ms == 0 {
            return Err(config_error("ping_interval_ms", "must be greater than 0"));
        }
        if self.ping_timeout_ms <= self.ping_interval_ms {
            return Err(config_error(
                "ping_timeout_ms",
                "must exceed ping_interval_ms",
            ));
        }
        if !(0.0..1.0).contains(&self.loss_threshold) {
            return Err(config_error("loss_threshold", "must be within [0, 1)"));
        }
        if self.latency_sample_window == 0 || self.bandwidth_sample_window == 0 {
            return Err(config_error(
                "latency_sample_window",
                "sample windows must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Host migration configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MigrationConfig {
    /// Interval between host heartbeats.
    pub heartbeat_interval_ms: u32,
    /// Silence after which the host is considered dead.
    pub host_timeout_ms: u32,
    /// End-to-end budget for one migration attempt.
    pub migration_timeout_ms: u32,
    /// Attempts before the session is declared disconnected.
    pub retry_attempts: u32,
    /// Per-peer budget for a state pull during migration.
    pub state_request_timeout_ms: u32,
    /// Candidate score weight of the connection quality grade.
    pub quality_weight: f64,
    /// Candidate score weight of normalized latency.
    pub latency_weight: f64,
    /// Candidate score weight of simulation performance.
    pub performance_weight: f64,
    /// Candidate score weight of connection stability.
    pub stability_weight: f64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2000,
            host_timeout_ms: 6000,
            migration_timeout_ms: 10_000,
            retry_attempts: 3,
            state_request_timeout_ms: 5000,
            quality_weight: 0.4,
            latency_weight: 0.3,
            performance_weight: 0.2,
            stability_weight: 0.1,
        }
    }
}

impl MigrationConfig {
    /// Validates timer ordering and that the score weights form a unit sum.
    pub fn validate(&self) -> Result<(), BulwarkError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(config_error(
                "heartbeat_interval_ms",
                "must be greater than 0",
            ));
        }
        if self.host_timeout_ms <= self.heartbeat_interval_ms {
            return Err(config_error(
                "host_timeout_ms",
                "must exceed heartbeat_interval_ms",
            ));
        }
        if self.retry_attempts == 0 {
            return Err(config_error("retry_attempts", "must be greater than 0"));
        }
        let weight_sum = self.quality_weight
            + self.latency_weight
            + self.performance_weight
            + self.stability_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(config_error("migration weights", "must sum to 1.0"));
        }
        Ok(())
    }
}

/// Performance optimizer configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    /// Whether snapshots may be stored as deltas against the previous frame.
    pub delta_compression_enabled: bool,
    /// Full states above this size get generic compression.
    pub compression_threshold_bytes: usize,
    /// Outgoing input batches flush at this size.
    pub max_batch_bytes: usize,
    /// Outgoing input batches flush after this long.
    pub max_batch_ms: u32,
    /// Upper bound on frames skipped during rollback replay.
    pub frame_skip_cap: u32,
    /// Buffers held by the state pool.
    pub state_pool_capacity: usize,
    /// Interval of the adaptive tuning loop.
    pub adapt_interval_ms: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            delta_compression_enabled: true,
            compression_threshold_bytes: 1024,
            max_batch_bytes: 8192,
            max_batch_ms: 16,
            frame_skip_cap: 3,
            state_pool_capacity: 1000,
            adapt_interval_ms: 5000,
        }
    }
}

impl OptimizerConfig {
    /// Validates byte and timer bounds.
    pub fn validate(&self) -> Result<(), BulwarkError> {
        if self.max_batch_bytes == 0 {
            return Err(config_error("max_batch_bytes", "must be greater than 0"));
        }
        if self.max_batch_ms == 0 {
            return Err(config_error("max_batch_ms", "must be greater than 0"));
        }
        if self.frame_skip_cap > 3 {
            return Err(config_error("frame_skip_cap", "must be at most 3"));
        }
        Ok(())
    }
}

/// Top-level session configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Simulation cadence.
    pub frame_rate_hz: u32,
    /// Clock ticks that may pile up before wall time is discarded.
    pub max_pending_ticks: u32,
    /// Frames of local input delay.
    pub input_delay_frames: usize,
    /// Maximum rollback depth.
    pub max_rollback_frames: usize,
    /// Maximum speculation past the confirmed frame.
    pub max_prediction_frames: usize,
    /// Snapshot (and input) ring capacity.
    pub snapshot_ring_size: usize,
    /// Deep checksums are computed every this many frames.
    pub deep_checksum_interval: u32,
    /// Rollback-to-agreement is skipped once its success rate drops below this.
    pub desync_rollback_success_floor: f64,
    /// Budget for desync state-resync requests.
    pub resync_timeout_ms: u32,
    /// Magic stamped into every message; peers of one session must agree on it.
    pub session_magic: u16,
    /// Network measurement settings.
    pub diagnostics: DiagnosticsConfig,
    /// Host migration settings.
    pub migration: MigrationConfig,
    /// Optimizer settings.
    pub optimizer: OptimizerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let max_rollback_frames = 8;
        Self {
            frame_rate_hz: 60,
            max_pending_ticks: 5,
            input_delay_frames: 2,
            max_rollback_frames,
            max_prediction_frames: 8,
            snapshot_ring_size: 60.max(max_rollback_frames + 8),
            deep_checksum_interval: 30,
            desync_rollback_success_floor: 0.5,
            resync_timeout_ms: 5000,
            session_magic: 0xB1DA,
            diagnostics: DiagnosticsConfig::default(),
            migration: MigrationConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Preset for LAN play: tighter timers, no input delay.
    #[must_use]
    pub fn lan() -> Self {
        Self {
            input_delay_frames: 1,
            diagnostics: DiagnosticsConfig {
                latency_threshold_ms: 30,
                jitter_threshold_ms: 10,
                ..DiagnosticsConfig::default()
            },
            ..Self::default()
        }
    }

    /// Preset for high-latency connections: more delay and speculation headroom.
    #[must_use]
    pub fn high_latency() -> Self {
        Self {
            input_delay_frames: 4,
            max_prediction_frames: 12,
            max_rollback_frames: 12,
            snapshot_ring_size: 60.max(12 + 8),
            diagnostics: DiagnosticsConfig {
                latency_threshold_ms: 250,
                jitter_threshold_ms: 80,
                ..DiagnosticsConfig::default()
            },
            ..Self::default()
        }
    }

    /// Preset for competitive play: minimal delay, aggressive desync detection.
    #[must_use]
    pub fn competitive() -> Self {
        Self {
            input_delay_frames: 1,
            deep_checksum_interval: 10,
            ..Self::default()
        }
    }

    /// Validates the whole configuration tree.
    pub fn validate(&self) -> Result<(), BulwarkError> {
        if self.frame_rate_hz == 0 {
            return Err(config_error("frame_rate_hz", "must be greater than 0"));
        }
        if self.max_pending_ticks == 0 {
            return Err(config_error("max_pending_ticks", "must be greater than 0"));
        }
        if self.max_prediction_frames == 0 {
            return Err(config_error(
                "max_prediction_frames",
                "must be greater than 0",
            ));
        }
        if self.max_rollback_frames == 0 {
            return Err(config_error(
                "max_rollback_frames",
                "must be greater than 0",
            ));
        }
        // The ring must cover the whole window a rollback can reach back into.
        let required =
            self.max_rollback_frames + self.input_delay_frames + self.max_pending_ticks as usize;
        if self.snapshot_ring_size < required {
            return Err(config_error(
                "snapshot_ring_size",
                "must cover max_rollback_frames + input_delay_frames + a safety margin",
            ));
        }
        if self.deep_checksum_interval == 0 {
            return Err(config_error(
                "deep_checksum_interval",
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.desync_rollback_success_floor) {
            return Err(config_error(
                "desync_rollback_success_floor",
                "must be within [0, 1]",
            ));
        }
        self.diagnostics.validate()?;
        self.migration.validate()?;
        self.optimizer.validate()?;
        Ok(())
    }
}

/// Builds a [`Session`] from validated configuration.
///
/// # Example
///
/// ```no_run
/// use bulwark_rollback::{SessionBuilder, SessionConfig, PlayerId};
/// # fn sim() -> Box<dyn bulwark_rollback::SimulationCore> { unreachable!() }
/// # fn transport() -> Box<dyn bulwark_rollback::Transport> { unreachable!() }
///
/// let session = SessionBuilder::new()
///     .with_config(SessionConfig::high_latency())
///     .start_as_host(PlayerId::new(0), sim(), transport())
///     .expect("valid configuration");
/// ```
#[derive(Debug, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    /// Starts from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the simulation cadence.
    #[must_use]
    pub fn with_frame_rate(mut self, hz: u32) -> Self {
        self.config.frame_rate_hz = hz;
        self
    }

    /// Sets the local input delay.
    #[must_use]
    pub fn with_input_delay(mut self, frames: usize) -> Self {
        self.config.input_delay_frames = frames;
        self
    }

    /// Sets the speculation and rollback window.
    #[must_use]
    pub fn with_prediction_window(mut self, frames: usize) -> Self {
        self.config.max_prediction_frames = frames;
        self.config.max_rollback_frames = frames;
        self.config.snapshot_ring_size = 60.max(frames + 8);
        self
    }

    /// Boots a session with the local player as host.
    pub fn start_as_host(
        self,
        local_id: PlayerId,
        sim: Box<dyn SimulationCore>,
        transport: Box<dyn Transport>,
    ) -> Result<Session, BulwarkError> {
        self.config.validate()?;
        Session::start_as_host(local_id, self.config, sim, transport)
    }

    /// Boots a session joining an existing host.
    pub fn join_as_client(
        self,
        local_id: PlayerId,
        host_id: PlayerId,
        sim: Box<dyn SimulationCore>,
        transport: Box<dyn Transport>,
    ) -> Result<Session, BulwarkError> {
        self.config.validate()?;
        Session::join_as_client(local_id, host_id, self.config, sim, transport)
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SessionConfig::default().validate().unwrap();
        SessionConfig::lan().validate().unwrap();
        SessionConfig::high_latency().validate().unwrap();
        SessionConfig::competitive().validate().unwrap();
    }

    #[test]
    fn zero_frame_rate_is_rejected() {
        let config = SessionConfig {
            frame_rate_hz: 0,
            ..SessionConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("frame_rate_hz"));
    }

    #[test]
    fn undersized_ring_is_rejected() {
        let config = SessionConfig {
            snapshot_ring_size: 4,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn skewed_migration_weights_are_rejected() {
        let config = SessionConfig {
            migration: MigrationConfig {
                quality_weight: 0.9,
                ..MigrationConfig::default()
            },
            ..SessionConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn ping_timeout_must_exceed_interval() {
        let config = DiagnosticsConfig {
            ping_timeout_ms: 500,
            ..DiagnosticsConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn frame_skip_cap_is_bounded() {
        let config = OptimizerConfig {
            frame_skip_cap: 9,
            ..OptimizerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_ring_covers_the_window() {
        let config = SessionConfig::default();
        assert!(config.snapshot_ring_size >= 60);
        assert_eq!(config.migration.retry_attempts, 3);
        assert_eq!(config.optimizer.max_batch_bytes, 8192);
    }
}
