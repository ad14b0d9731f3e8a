//! # Bulwark Rollback
//!
//! Bulwark Rollback is a deterministic peer-to-peer rollback netcode runtime written in
//! 100% safe Rust. It drives an externally-provided simulation core frame by frame and
//! decides *which* frames to simulate, *with what inputs*, *when* to roll back, *when*
//! to resynchronize, and *who* is host.
//!
//! The runtime is composed of five cooperating subsystems behind one [`Session`] facade:
//!
//! - the **rollback engine** predicts missing remote inputs, detects mispredictions and
//!   re-simulates from the last known-good snapshot,
//! - the **desync detector** exchanges layered state checksums and walks a recovery
//!   ladder (rollback-to-agreement, targeted resync, full resync) when peers diverge,
//! - **host migration** monitors host liveness, scores candidates and transfers session
//!   authority when the host departs,
//! - **network diagnostics** measure RTT, jitter, loss and bandwidth per peer and derive
//!   a quality grade that feeds back into the other subsystems,
//! - the **performance optimizer** delta-compresses snapshots, batches outgoing inputs
//!   and advises replay frame-skipping under degraded network conditions.
//!
//! The transport (sockets, WebRTC, whatever moves bytes) and the simulation itself are
//! external collaborators, plugged in through the [`Transport`] and [`SimulationCore`]
//! traits.
//!
//! [`Session`]: sessions::session::Session

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use error::BulwarkError;
pub use network::messages::Message;
pub use sessions::builder::{
    DiagnosticsConfig, MigrationConfig, OptimizerConfig, SessionBuilder, SessionConfig,
};
pub use sessions::session::{DiagnosticsReport, Session, SessionStats, StatusReport};
pub use snapshot::{ChecksumTuple, StateCell};

#[doc(hidden)]
pub mod clock;
#[doc(hidden)]
pub mod desync;
#[doc(hidden)]
pub mod diagnostics;
#[doc(hidden)]
pub mod engine;
pub mod error;
pub mod hash;
#[doc(hidden)]
pub mod input_ring;
#[doc(hidden)]
pub mod migration;
#[doc(hidden)]
pub mod optimizer;
#[doc(hidden)]
pub mod snapshot;
pub mod telemetry;
#[doc(hidden)]
pub mod network {
    /// Binary codec for network message serialization.
    pub mod codec;
    #[doc(hidden)]
    pub mod messages;
}
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod session;
}

use serde::{Deserialize, Serialize};

// #############
// # CONSTANTS #
// #############

/// Raw value of [`Frame::NULL`]. Keeping the sentinel inside the frame type
/// (instead of wrapping every horizon in `Option<Frame>`) lets confirmation
/// horizons, heartbeat bookkeeping and ring slots share one "nothing yet" state
/// that still orders below every real frame.
pub const NULL_FRAME: i32 = -1;

/// One step of the simulation timeline, counted from 0 at session start.
///
/// Frame numbers are local to each peer; peers align on them through the frames
/// attached to exchanged inputs, never through wall clock. The backing integer is
/// signed purely to make room for [`Frame::NULL`] below frame 0; a healthy session
/// never produces any other negative value (and at 60 Hz the positive range lasts
/// over a year).
///
/// The surface is deliberately small: the engine only ever steps forward one
/// frame at a time ([`next`](Frame::next)), offsets by a window constant, measures
/// distances (rollback depth, speculation), and buckets into rings and sparse
/// schedules via `%`.
///
/// # Examples
///
/// ```
/// use bulwark_rollback::Frame;
///
/// let start = Frame::new(0);
/// assert!(start.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!(Frame::NULL.next(), start);
///
/// // Distances between frames are plain integers.
/// let later = start + 8;
/// assert_eq!(later - start, 8);
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// "Nothing yet": the state of every horizon before the first input or
    /// snapshot exists. Orders strictly below all real frames.
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Wraps a raw frame number without validating it; [`is_valid`](Frame::is_valid)
    /// is the check for whether it names a real frame.
    #[inline]
    #[must_use]
    pub const fn new(index: i32) -> Self {
        Frame(index)
    }

    /// The raw frame number, for indexing and wire encoding.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Whether this is the [`Frame::NULL`] sentinel.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Whether this names a real frame (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The frame after this one. On [`Frame::NULL`] this is frame 0, which is
    /// exactly what horizon-advancing loops want: the first frame to look at
    /// when nothing is confirmed yet is the first frame of the session.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Frame {
        Frame(self.0 + 1)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            f.write_str("NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// The arithmetic below is the complete set the runtime needs: offsetting by a
// window constant (`+`/`-` with an i32), in-place stepping in seed loops, frame
// distances (rollback depth, speculation) and ring/schedule bucketing.

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, offset: i32) -> Frame {
        Frame(self.0 + offset)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, offset: i32) {
        self.0 += offset;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, offset: i32) -> Frame {
        Frame(self.0 - offset)
    }
}

/// Frame minus frame is a distance, not a frame.
impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, earlier: Frame) -> i32 {
        self.0 - earlier.0
    }
}

/// Bucketing for ring slots and sparse schedules.
impl std::ops::Rem<i32> for Frame {
    type Output = i32;

    #[inline]
    fn rem(self, modulus: i32) -> i32 {
        self.0 % modulus
    }
}

/// A unique identifier for a player within a session.
///
/// The runtime addresses peers by `PlayerId` everywhere: input rings, diagnostics,
/// migration scoring and the transport all key on it. The total order on ids is used
/// wherever a deterministic tie-break is needed (input ordering for the simulation,
/// migration candidate ties), so all peers agree on it by construction.
///
/// # Examples
///
/// ```
/// use bulwark_rollback::PlayerId;
///
/// let a = PlayerId::new(0);
/// let b = PlayerId::new(1);
/// assert!(a < b);
/// assert_eq!(a.as_u16(), 0);
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PlayerId(u16);

impl PlayerId {
    /// Creates a new `PlayerId` from a `u16` value.
    #[inline]
    #[must_use]
    pub const fn new(id: u16) -> Self {
        PlayerId(id)
    }

    /// Returns the underlying `u16` value.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PlayerId {
    #[inline]
    fn from(value: u16) -> Self {
        PlayerId(value)
    }
}

impl From<PlayerId> for u16 {
    #[inline]
    fn from(id: PlayerId) -> Self {
        id.0
    }
}

// #############
// #   ENUMS   #
// #############

/// The layered checksum ladder used for desync detection, ordered by cost.
///
/// Cheap levels run every frame, expensive ones on a sparse schedule. A mismatch at
/// any level marks a candidate desync; the first mismatching level is recorded to
/// help classify transient noise versus genuine divergence.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChecksumLevel {
    /// Cheap hash over the serialized state, computed every frame.
    Basic,
    /// Medium-cost hash with better collision resistance, computed every frame.
    Enhanced,
    /// Expensive full-coverage hash, computed on a sparse schedule.
    Deep,
    /// A checksum computed by the simulation core itself, if it provides one.
    Native,
}

/// Whether an input handed to the simulation was actually received or predicted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The input for this player and frame is an actual received input.
    Confirmed,
    /// The input for this player and frame is predicted from earlier inputs.
    Predicted,
}

/// Ordinal link quality grade derived from latency, jitter, loss and stability.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionQuality {
    /// Score >= 90: negligible latency, jitter and loss.
    Excellent,
    /// Score >= 75.
    Good,
    /// Score >= 50.
    Fair,
    /// Score < 50.
    Poor,
    /// No measurements yet.
    #[default]
    Unknown,
}

impl ConnectionQuality {
    /// The normalized weight of this grade used in host candidate scoring.
    #[must_use]
    pub const fn score_weight(self) -> f64 {
        match self {
            ConnectionQuality::Excellent => 1.0,
            ConnectionQuality::Good => 0.8,
            ConnectionQuality::Fair => 0.6,
            ConnectionQuality::Poor => 0.3,
            ConnectionQuality::Unknown => 0.5,
        }
    }
}

/// A session is always in one of these states. Query via [`Session::state`].
///
/// [`Session::state`]: sessions::session::Session::state
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The session is ticking the simulation forward.
    Running,
    /// A host migration is in flight; the simulation is paused and remote inputs queue.
    Migrating,
    /// The session has stopped, either via shutdown or a fatal error.
    Stopped,
}

/// Per-player metadata tracked by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInfo {
    /// The player's id, unique within the session.
    pub id: PlayerId,
    /// Whether this player runs on the local device.
    pub local: bool,
    /// Whether this player currently holds session authority.
    pub is_host: bool,
    /// Frames of local input delay applied to this player's inputs.
    pub input_delay: usize,
    /// The last frame for which this player's input is confirmed.
    pub last_confirmed_frame: Frame,
    /// Current link quality grade towards this player.
    pub quality: ConnectionQuality,
    /// Current round-trip latency towards this player, in milliseconds.
    pub latency_ms: f64,
    /// Connection stability in `[0, 1]`, derived from disconnect history and uptime.
    pub stability: f64,
}

impl PlayerInfo {
    /// Creates metadata for a freshly joined player with no measurements yet.
    #[must_use]
    pub fn new(id: PlayerId, local: bool) -> Self {
        Self {
            id,
            local,
            is_host: false,
            input_delay: 0,
            last_confirmed_frame: Frame::NULL,
            quality: ConnectionQuality::Unknown,
            latency_ms: 0.0,
            stability: 1.0,
        }
    }
}

/// One player's input for one frame as handed to [`SimulationCore::advance`].
///
/// The slice passed to `advance` is always sorted by [`PlayerId`], so every peer
/// presents inputs to the simulation in the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerFrameInput {
    /// The player this input belongs to.
    pub player: PlayerId,
    /// The opaque input payload produced by the game's input schema.
    pub bytes: Vec<u8>,
    /// Whether the payload was received or predicted.
    pub status: InputStatus,
}

/// The per-frame input tuple type; stack-allocated for sessions of up to 4 players.
pub type FrameInputs = smallvec::SmallVec<[PlayerFrameInput; 4]>;

/// Notifications drained from the session via [`Session::drain_events`]. Handling
/// them is up to the game; dropping them is safe.
///
/// [`Session::drain_events`]: sessions::session::Session::drain_events
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum SessionEvent {
    /// The simulation advanced to `frame`; render state may be sampled now.
    FrameAdvanced {
        /// The frame the simulation has just reached.
        frame: Frame,
    },
    /// The engine refused to advance because the prediction window is exhausted.
    Stalled {
        /// The frame the engine is stuck at.
        frame: Frame,
    },
    /// A misprediction was corrected by rolling back and re-simulating.
    RollbackCompleted {
        /// The first frame that was re-simulated.
        from: Frame,
        /// Number of frames re-simulated.
        depth: u32,
    },
    /// A confirmed state divergence against at least one peer.
    DesyncDetected {
        /// The frame at which checksums disagree.
        frame: Frame,
        /// The first checksum level that disagreed.
        level: ChecksumLevel,
    },
    /// A previously detected desync was repaired.
    DesyncRecovered {
        /// The frame the session resumed from.
        frame: Frame,
    },
    /// A peer's link quality grade changed.
    QualityChanged {
        /// The peer whose grade changed.
        peer: PlayerId,
        /// The previous grade.
        old: ConnectionQuality,
        /// The new grade.
        new: ConnectionQuality,
    },
    /// Host migration started; the simulation is paused until it completes.
    MigrationStarted {
        /// The proposed new host.
        new_host: PlayerId,
    },
    /// Host migration completed and the simulation resumed.
    MigrationCompleted {
        /// The new host.
        new_host: PlayerId,
        /// The frame the session resumed from.
        frame: Frame,
    },
    /// A peer joined the session.
    PeerJoined {
        /// The new peer.
        peer: PlayerId,
    },
    /// A peer left the session or was removed after migration.
    PeerLeft {
        /// The departed peer.
        peer: PlayerId,
    },
    /// A fatal condition; no further frames will be delivered.
    Fatal {
        /// The terminal error.
        error: BulwarkError,
    },
}

// #############
// #  TRAITS   #
// #############

/// A non-recoverable failure raised by the simulation core.
///
/// `advance` is expected to be total; if it does fail, the engine transitions to
/// stopped and the session surfaces a fatal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationFault {
    /// Human-readable description of what went wrong inside the simulation.
    pub detail: String,
}

impl std::fmt::Display for SimulationFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "simulation fault: {}", self.detail)
    }
}

impl std::error::Error for SimulationFault {}

/// The deterministic simulation the runtime drives.
///
/// # Determinism requirement
///
/// Given identical start state and identical ordered input tuples, [`advance`] must
/// produce byte-identical state and identical checksums on every platform the session
/// spans. Common sources of non-determinism to avoid: floating point differences,
/// `HashMap` iteration, wall-clock reads, unseeded randomness.
///
/// [`advance`]: SimulationCore::advance
pub trait SimulationCore {
    /// Produces a deterministic snapshot of the full simulation state.
    fn save_state(&mut self) -> Vec<u8>;

    /// Restores a snapshot previously produced by [`save_state`]; the exact inverse
    /// of saving. Foreign state bytes are checksum-validated by the runtime before
    /// this is called.
    ///
    /// [`save_state`]: SimulationCore::save_state
    fn load_state(&mut self, state: &[u8]);

    /// Advances the simulation by exactly one deterministic frame step.
    ///
    /// Missing remote inputs never reach this method; the runtime substitutes
    /// predictions. An `Err` is treated as session-fatal.
    fn advance(&mut self, inputs: &[PlayerFrameInput]) -> Result<(), SimulationFault>;

    /// Computes a layered checksum of the current state. Returns `None` for levels
    /// the simulation does not implement (typically [`ChecksumLevel::Native`]).
    fn checksum(&mut self, level: ChecksumLevel) -> Option<u64>;

    /// Called when the runtime pauses the simulation (host migration). Idempotent.
    fn pause(&mut self) {}

    /// Called when the runtime resumes the simulation. Idempotent.
    fn resume(&mut self) {}
}

/// Lifecycle notifications drained from the transport each tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer connection was established.
    Connected(PlayerId),
    /// A peer connection was lost.
    Disconnected(PlayerId),
}

/// The byte-moving collaborator the runtime sends and receives [`Message`]s through.
///
/// Delivery is best-effort and may drop messages, but order must be preserved per
/// peer. The runtime layers its own acknowledgement and retry logic on top where it
/// matters (state transfer, migration).
///
/// Implementations must not block: `receive_all_messages` drains whatever arrived
/// since the last call and returns immediately. Transport I/O may happen on other
/// threads, but messages must only be handed over through this drain.
pub trait Transport {
    /// Sends a message to a single peer.
    fn send_to(&mut self, peer: PlayerId, msg: &Message);

    /// Sends a message to all currently-known peers.
    fn broadcast(&mut self, msg: &Message);

    /// Returns all messages received since the last call, tagged with their sender.
    fn receive_all_messages(&mut self) -> Vec<(PlayerId, Message)>;

    /// Returns peer connect/disconnect notifications since the last call.
    fn poll_peer_events(&mut self) -> Vec<PeerEvent> {
        Vec::new()
    }
}

// #########
// # TESTS #
// #########
