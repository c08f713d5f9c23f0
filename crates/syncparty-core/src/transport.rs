//! Transport state, start scheduling, sequencing and latency estimation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// Default slack added on top of the slowest receiver's latency.
pub const DEFAULT_SAFETY_MARGIN_MS: u64 = 40;

/// Default one-way latency assumed before any round trip is measured.
pub const DEFAULT_LATENCY_MS: u64 = 50;

/// Upper bound on the latency term used for scheduling.
pub const DEFAULT_MAX_LATENCY_MS: u64 = 1_000;

/// Largest sequence number a device may send. Also the largest integer a
/// JavaScript client can represent exactly.
pub const MAX_SEQ: u64 = (1 << 53) - 1;

/// The authoritative playback anchor for a party.
///
/// Every device computes its local position from this triple with
/// [`TransportState::position_at`] and its own clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportState {
    pub position_ms: u64,
    pub reference_epoch_ms: u64,
    pub playing: bool,
}

impl TransportState {
    pub fn paused_at(position_ms: u64, reference_epoch_ms: u64) -> Self {
        Self {
            position_ms,
            reference_epoch_ms,
            playing: false,
        }
    }

    /// Extrapolated track position at `epoch_ms`. Before a scheduled start
    /// the position stays at the anchor.
    pub fn position_at(&self, epoch_ms: u64) -> u64 {
        if self.playing && epoch_ms > self.reference_epoch_ms {
            self.position_ms
                .saturating_add(epoch_ms - self.reference_epoch_ms)
        } else {
            self.position_ms
        }
    }
}

/// Computes when time-sensitive commands take effect on receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportScheduler {
    pub safety_margin_ms: u64,
    pub max_latency_ms: u64,
}

impl Default for TransportScheduler {
    fn default() -> Self {
        Self {
            safety_margin_ms: DEFAULT_SAFETY_MARGIN_MS,
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
        }
    }
}

impl TransportScheduler {
    pub fn new(safety_margin_ms: u64, max_latency_ms: u64) -> Self {
        Self {
            safety_margin_ms,
            max_latency_ms,
        }
    }

    /// Epoch instant at which a play requested at `requested_at` should
    /// start so that a receiver `estimated_latency_ms` away still has
    /// `safety_margin_ms` to spare.
    pub fn schedule_start(&self, requested_at: u64, estimated_latency_ms: u64) -> u64 {
        requested_at
            .saturating_add(estimated_latency_ms.min(self.max_latency_ms))
            .saturating_add(self.safety_margin_ms)
    }

    /// Seeks apply on receipt; the instant is only used for ordering.
    pub fn schedule_seek(&self, requested_at: u64, last_reference: u64) -> u64 {
        requested_at.max(last_reference)
    }

    /// Pauses apply on receipt; the instant is only used for ordering.
    pub fn schedule_pause(&self, requested_at: u64, last_reference: u64) -> u64 {
        requested_at.max(last_reference)
    }
}

/// A command whose sequence number does not advance the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleSequence {
    pub seq: u64,
    pub last_applied: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceError {
    /// At or below the last applied number; dropped silently.
    Stale(StaleSequence),
    /// Above [`MAX_SEQ`].
    OutOfRange(u64),
    /// No number is left above the last applied one.
    Exhausted,
}

/// Per-room ordering gate. Sequence numbers of applied commands strictly
/// increase; anything at or below the last applied one is stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceGate {
    last_applied: u64,
}

impl SequenceGate {
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// The number a command would be applied under, without consuming it.
    pub fn admit(&self, requested: Option<u64>) -> Result<u64, SequenceError> {
        match requested {
            None => self
                .last_applied
                .checked_add(1)
                .ok_or(SequenceError::Exhausted),
            Some(seq) if seq > MAX_SEQ => Err(SequenceError::OutOfRange(seq)),
            Some(seq) if seq > self.last_applied => Ok(seq),
            Some(seq) => Err(SequenceError::Stale(StaleSequence {
                seq,
                last_applied: self.last_applied,
            })),
        }
    }

    pub fn commit(&mut self, seq: u64) {
        debug_assert!(seq > self.last_applied);
        self.last_applied = self.last_applied.max(seq);
    }

    /// Consume the next implicit number, if any is left.
    pub fn bump(&mut self) -> Option<u64> {
        self.last_applied = self.last_applied.checked_add(1)?;
        Some(self.last_applied)
    }
}

/// Smoothed round-trip estimates for the devices of one room.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    rtt_ms: HashMap<DeviceId, f64>,
    smoothing: f64,
    default_latency_ms: u64,
}

impl LatencyTracker {
    /// `smoothing` is the weight of a new sample, in `(0, 1]`.
    pub fn new(smoothing: f64, default_latency_ms: u64) -> Self {
        let smoothing = if smoothing.is_finite() && smoothing > 0.0 {
            smoothing.min(1.0)
        } else {
            1.0
        };
        Self {
            rtt_ms: HashMap::new(),
            smoothing,
            default_latency_ms,
        }
    }

    pub fn record(&mut self, device: &str, rtt_ms: u64) {
        let sample = rtt_ms as f64;
        let smoothing = self.smoothing;
        self.rtt_ms
            .entry(device.to_string())
            .and_modify(|avg| *avg += smoothing * (sample - *avg))
            .or_insert(sample);
    }

    pub fn forget(&mut self, device: &str) {
        self.rtt_ms.remove(device);
    }

    /// One-way latency of `device`, if it has been measured.
    pub fn device_latency_ms(&self, device: &str) -> Option<u64> {
        self.rtt_ms.get(device).map(|rtt| (rtt / 2.0).round() as u64)
    }

    /// One-way latency of the slowest measured device, or the default.
    pub fn room_latency_ms(&self) -> u64 {
        self.rtt_ms
            .values()
            .map(|rtt| (rtt / 2.0).round() as u64)
            .max()
            .unwrap_or(self.default_latency_ms)
    }
}
