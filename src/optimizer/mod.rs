//! Performance optimizer: state compression policy, input batching, replay
//! frame-skipping and buffer pooling.
//!
//! The optimizer never changes simulation semantics. It decides how snapshots are
//! encoded, when outgoing inputs are coalesced into batches, and how aggressively
//! replay may skip re-simulation, all driven by the diagnostics quality grade. An
//! adaptive loop nudges its thresholds every few seconds based on observed frame
//! rate and network grade.

pub mod compression;
pub mod state_pool;

use web_time::Instant;

use crate::network::messages::{InputBatch, InputMessage};
use crate::sessions::builder::OptimizerConfig;
use crate::snapshot::CompressionTag;
use crate::{ConnectionQuality, Frame};

use std::collections::{BTreeMap, VecDeque};

use compression::GenericCompressor;
use state_pool::StatePool;

/// Emit a delta only when it is smaller than this fraction of the full state.
const DELTA_WORTHWHILE_RATIO: f64 = 0.7;

/// Per-adaptation step applied to byte thresholds.
const ADAPT_STEP: f64 = 0.2;

/// Memoized generic-compression results kept before the oldest are dropped.
const COMPRESSION_CACHE_CAPACITY: usize = 500;

/// Decides snapshot encoding, batches outgoing inputs and advises replay skipping.
pub struct PerformanceOptimizer {
    config: OptimizerConfig,
    compressor: GenericCompressor,
    pool: StatePool,
    /// Memoizes generic compression keyed by state hash; static states (title
    /// screens, pauses) recur frame after frame.
    compression_cache: BTreeMap<u64, Vec<u8>>,
    compression_cache_order: VecDeque<u64>,

    /// Latest quality score in `[0, 1]` from diagnostics (worst across peers).
    quality_score: f64,
    grade: ConnectionQuality,

    // Adaptive knobs, seeded from config and nudged by `adapt`.
    batch_limit_bytes: usize,
    compression_threshold: usize,
    stride_cap: u32,

    // Outgoing input batch under construction.
    pending: Vec<InputMessage>,
    pending_bytes: usize,
    batch_opened_at: Option<Instant>,

    // Metrics.
    batches_flushed: u64,
    entries_flushed: u64,
    raw_state_bytes: u64,
    stored_state_bytes: u64,
    last_adapt: Option<Instant>,
}

impl PerformanceOptimizer {
    /// Creates an optimizer seeded from configuration.
    #[must_use]
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            batch_limit_bytes: config.max_batch_bytes,
            compression_threshold: config.compression_threshold_bytes,
            stride_cap: config.frame_skip_cap,
            compressor: GenericCompressor::default(),
            pool: StatePool::new(config.state_pool_capacity),
            compression_cache: BTreeMap::new(),
            compression_cache_order: VecDeque::new(),
            quality_score: 1.0,
            grade: ConnectionQuality::Unknown,
            pending: Vec::new(),
            pending_bytes: 0,
            batch_opened_at: None,
            batches_flushed: 0,
            entries_flushed: 0,
            raw_state_bytes: 0,
            stored_state_bytes: 0,
            last_adapt: None,
            config,
        }
    }

    /// The buffer pool shared with the save/replay path.
    pub fn pool(&mut self) -> &mut StatePool {
        &mut self.pool
    }

    /// Fraction of state buffer acquisitions served from the pool.
    #[must_use]
    pub fn pool_hit_rate(&self) -> f64 {
        self.pool.hit_rate()
    }

    /// Records the latest quality grade and 0-100 score from diagnostics.
    pub fn set_quality(&mut self, grade: ConnectionQuality, score: f64) {
        self.grade = grade;
        self.quality_score = (score / 100.0).clamp(0.0, 1.0);
    }

    // ---------------------------------------------------------------------
    // State compression
    // ---------------------------------------------------------------------

    /// Chooses the encoding for a snapshot of `state`, given the previous frame's
    /// raw state when it is available in the ring.
    ///
    /// Preference order: delta against the previous frame when enabled, the base is
    /// present and the delta is small enough; otherwise generic compression when
    /// the state exceeds the size threshold; otherwise raw bytes.
    pub fn encode_snapshot(
        &mut self,
        state: &[u8],
        prev: Option<(Frame, &[u8])>,
    ) -> (Vec<u8>, CompressionTag) {
        self.raw_state_bytes += state.len() as u64;

        if self.config.delta_compression_enabled {
            if let Some((base_frame, base)) = prev {
                let delta = compression::delta_encode(base, state);
                if (delta.len() as f64) < state.len() as f64 * DELTA_WORTHWHILE_RATIO {
                    self.stored_state_bytes += delta.len() as u64;
                    return (delta, CompressionTag::Delta { base_frame });
                }
            }
        }

        if state.len() > self.compression_threshold {
            let compressed = self.compress_cached(state);
            if compressed.len() < state.len() {
                self.stored_state_bytes += compressed.len() as u64;
                return (compressed, CompressionTag::Generic);
            }
        }

        self.stored_state_bytes += state.len() as u64;
        (state.to_vec(), CompressionTag::None)
    }

    fn compress_cached(&mut self, state: &[u8]) -> Vec<u8> {
        let key = crate::hash::fnv1a(state);
        if let Some(hit) = self.compression_cache.get(&key) {
            return hit.clone();
        }
        let compressed = self.compressor.compress(state);
        self.compression_cache.insert(key, compressed.clone());
        self.compression_cache_order.push_back(key);
        while self.compression_cache.len() > COMPRESSION_CACHE_CAPACITY {
            if let Some(oldest) = self.compression_cache_order.pop_front() {
                self.compression_cache.remove(&oldest);
            }
        }
        compressed
    }

    /// Ratio of stored snapshot bytes to raw snapshot bytes (1.0 = no savings).
    #[must_use]
    pub fn compression_ratio(&self) -> f64 {
        if self.raw_state_bytes == 0 {
            1.0
        } else {
            self.stored_state_bytes as f64 / self.raw_state_bytes as f64
        }
    }

    // ---------------------------------------------------------------------
    // Input batching
    // ---------------------------------------------------------------------

    /// Queues an outgoing input. Returns a batch to send immediately when the
    /// network grade calls for unbatched sends or the size limit was reached.
    pub fn enqueue_input(&mut self, entry: InputMessage, now: Instant) -> Option<InputBatch> {
        if self.grade == ConnectionQuality::Excellent {
            // No coalescing on excellent links: latency wins over packet count.
            self.record_flush(1);
            return Some(InputBatch {
                entries: vec![entry],
            });
        }

        let entry_bytes = entry.bytes.len() + std::mem::size_of::<InputMessage>();
        if self.pending.is_empty() {
            self.batch_opened_at = Some(now);
        }
        self.pending.push(entry);
        self.pending_bytes += entry_bytes;

        if self.pending_bytes >= self.batch_limit_bytes {
            return self.flush();
        }
        None
    }

    /// Flushes the pending batch if it has exceeded the time limit.
    pub fn flush_due(&mut self, now: Instant) -> Option<InputBatch> {
        let opened = self.batch_opened_at?;
        if now.saturating_duration_since(opened).as_millis() >= u128::from(self.config.max_batch_ms)
        {
            self.flush()
        } else {
            None
        }
    }

    /// Unconditionally flushes whatever is pending (shutdown, migration pause).
    pub fn flush(&mut self) -> Option<InputBatch> {
        if self.pending.is_empty() {
            return None;
        }
        let entries = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        self.batch_opened_at = None;
        self.record_flush(entries.len() as u64);
        Some(InputBatch { entries })
    }

    fn record_flush(&mut self, entries: u64) {
        self.batches_flushed += 1;
        self.entries_flushed += entries;
    }

    /// Mean number of input entries per flushed batch.
    #[must_use]
    pub fn avg_batch_size(&self) -> f64 {
        if self.batches_flushed == 0 {
            0.0
        } else {
            self.entries_flushed as f64 / self.batches_flushed as f64
        }
    }

    // ---------------------------------------------------------------------
    // Frame skipping
    // ---------------------------------------------------------------------

    /// Replay stride for rollback re-simulation: 1 means re-simulate every frame,
    /// k means only every k-th frame is re-simulated in full fidelity.
    ///
    /// Forward simulation is never skipped; this only applies during replay.
    #[must_use]
    pub fn replay_stride(&self) -> u32 {
        if self.quality_score >= 0.7 {
            return 1;
        }
        // One extra skipped frame per 0.15 of score below the threshold.
        let deficit = 0.7 - self.quality_score;
        let stride = 2 + (deficit / 0.15) as u32;
        stride.min(self.stride_cap + 1).max(1)
    }

    // ---------------------------------------------------------------------
    // Adaptive loop
    // ---------------------------------------------------------------------

    /// Re-tunes thresholds from observed frame rate and the current grade. Runs at
    /// most once per configured interval; extra calls are free no-ops.
    pub fn adapt(&mut self, now: Instant, observed_fps: f64, target_fps: f64) {
        if let Some(last) = self.last_adapt {
            if now.saturating_duration_since(last).as_millis()
                < u128::from(self.config.adapt_interval_ms)
            {
                return;
            }
        }
        self.last_adapt = Some(now);

        let struggling = observed_fps < target_fps * 0.9
            || matches!(self.grade, ConnectionQuality::Fair | ConnectionQuality::Poor);

        if struggling {
            // Bigger batches, compress smaller states, allow more replay skipping.
            self.batch_limit_bytes = grow(self.batch_limit_bytes, ADAPT_STEP, 1024, 65_536);
            self.compression_threshold =
                shrink(self.compression_threshold, ADAPT_STEP, 256, 16_384);
            self.stride_cap = (self.stride_cap + 1).min(self.config.frame_skip_cap);
        } else {
            // Relax back towards the configured baseline.
            self.batch_limit_bytes = shrink(
                self.batch_limit_bytes,
                ADAPT_STEP,
                self.config.max_batch_bytes.min(1024),
                self.config.max_batch_bytes,
            );
            self.compression_threshold = grow(
                self.compression_threshold,
                ADAPT_STEP,
                256,
                self.config.compression_threshold_bytes,
            );
            self.stride_cap = self.stride_cap.saturating_sub(1);
        }
        tracing::debug!(
            batch_limit = self.batch_limit_bytes,
            compression_threshold = self.compression_threshold,
            stride_cap = self.stride_cap,
            struggling,
            "optimizer adapted"
        );
    }

    /// The current (possibly adapted) batch size limit in bytes.
    #[must_use]
    pub fn batch_limit_bytes(&self) -> usize {
        self.batch_limit_bytes
    }

    /// The current (possibly adapted) generic compression threshold in bytes.
    #[must_use]
    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }
}

fn grow(value: usize, step: f64, min: usize, max: usize) -> usize {
    (((value as f64) * (1.0 + step)) as usize).max(min).min(max.max(min))
}

fn shrink(value: usize, step: f64, min: usize, max: usize) -> usize {
    (((value as f64) * (1.0 - step)) as usize).max(min).min(max.max(min))
}

// #########
// # TESTS #
// #########
