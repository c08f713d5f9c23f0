//! The party room state machine.
//!
//! A [`PartyRoom`] is owned by exactly one task. Every mutation goes through
//! [`PartyRoom::apply_intent`] or one of the connection-level hooks, each of
//! which returns the events to fan out together with the sequence number
//! they were applied under.

use rand::Rng;

use crate::device::{DeviceId, GridPos, sanitize_label};
use crate::error::HubError;
use crate::net::messages::{
    DeviceUpdateMsg, GridUpdateMsg, Intent, PauseMsg, PlayMsg, RingMsg, RoomSnapshot, SeekMsg,
    ServerEvent, TrackMsg,
};
use crate::net::protocol::{MAX_SEEK_MS, MAX_TRACK_URL_LEN};
use crate::registry::{ChangeKind, DEFAULT_GRID_SIZE, DeviceChange, DeviceRegistry};
use crate::transport::{
    DEFAULT_LATENCY_MS, DEFAULT_MAX_LATENCY_MS, DEFAULT_SAFETY_MARGIN_MS, LatencyTracker, MAX_SEQ,
    SequenceError, SequenceGate, StaleSequence, TransportScheduler, TransportState,
};

/// Length of generated party codes.
pub const PARTY_CODE_LEN: usize = 8;
const PARTY_CODE_MIN_LEN: usize = 4;
const PARTY_CODE_MAX_LEN: usize = 16;
const PARTY_CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a random party code (uppercase, no ambiguous characters).
pub fn generate_party_code() -> String {
    let mut rng = rand::rng();
    (0..PARTY_CODE_LEN)
        .map(|_| PARTY_CODE_CHARSET[rng.random_range(0..PARTY_CODE_CHARSET.len())] as char)
        .collect()
}

pub fn is_valid_party_code(code: &str) -> bool {
    (PARTY_CODE_MIN_LEN..=PARTY_CODE_MAX_LEN).contains(&code.len())
        && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Trim and upper-case a code, returning `None` if it is not a valid code.
pub fn normalize_party_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    is_valid_party_code(&code).then_some(code)
}

/// Per-room tunables, filled in from server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSettings {
    pub grid_size: u32,
    pub max_grid_size: u32,
    pub max_devices: usize,
    pub safety_margin_ms: u64,
    pub max_latency_ms: u64,
    pub default_latency_ms: u64,
    pub latency_smoothing: f64,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE,
            max_grid_size: 16,
            max_devices: 32,
            safety_margin_ms: DEFAULT_SAFETY_MARGIN_MS,
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
            default_latency_ms: DEFAULT_LATENCY_MS,
            latency_smoothing: 0.25,
        }
    }
}

/// Result of a mutation that went through.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub seq: u64,
    pub events: Vec<ServerEvent>,
    /// Set when a device claimed a cell, so the placement can be recorded.
    pub placed: Option<(DeviceId, GridPos)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied(Applied),
    /// The intent carried a sequence number at or below the last applied
    /// one and was dropped without touching state.
    Stale(StaleSequence),
}

pub struct PartyRoom {
    code: String,
    party_id: String,
    name: String,
    registry: DeviceRegistry,
    track: Option<String>,
    transport: TransportState,
    gate: SequenceGate,
    last_reference_ms: u64,
    scheduler: TransportScheduler,
    latency: LatencyTracker,
}

impl PartyRoom {
    pub fn new(
        code: impl Into<String>,
        party_id: impl Into<String>,
        name: impl Into<String>,
        settings: &RoomSettings,
    ) -> Self {
        Self {
            code: code.into(),
            party_id: party_id.into(),
            name: name.into(),
            registry: DeviceRegistry::new(
                settings.grid_size,
                settings.max_grid_size,
                settings.max_devices,
            ),
            track: None,
            transport: TransportState::paused_at(0, 0),
            gate: SequenceGate::default(),
            last_reference_ms: 0,
            scheduler: TransportScheduler::new(settings.safety_margin_ms, settings.max_latency_ms),
            latency: LatencyTracker::new(settings.latency_smoothing, settings.default_latency_ms),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn party_id(&self) -> &str {
        &self.party_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn transport(&self) -> TransportState {
        self.transport
    }

    pub fn track(&self) -> Option<&str> {
        self.track.as_deref()
    }

    pub fn last_seq(&self) -> u64 {
        self.gate.last_applied()
    }

    pub fn is_member(&self, device_id: &str) -> bool {
        self.registry.contains(device_id)
    }

    /// Apply one device intent.
    ///
    /// Rejected intents leave the room untouched and consume no sequence
    /// number.
    pub fn apply_intent(
        &mut self,
        device_id: &str,
        seq: Option<u64>,
        intent: Intent,
        now_ms: u64,
    ) -> Result<Outcome, HubError> {
        let seq = match self.gate.admit(seq) {
            Ok(seq) => seq,
            Err(SequenceError::Stale(stale)) => return Ok(Outcome::Stale(stale)),
            Err(SequenceError::OutOfRange(seq)) => {
                return Err(HubError::invalid(format!("seq {seq} is above {MAX_SEQ}")));
            },
            Err(SequenceError::Exhausted) => {
                return Err(HubError::invalid("room has run out of sequence numbers"));
            },
        };
        if !matches!(intent, Intent::Join { .. }) && !self.registry.contains(device_id) {
            return Err(HubError::NotAMember(device_id.to_string()));
        }

        let mut placed = None;
        let events = match intent {
            Intent::Join { label } => {
                let label = sanitize_label(&label)
                    .ok_or_else(|| HubError::invalid("label must be 1-100 printable characters"))?;
                self.registry.join(device_id, &label)?;
                self.drain_device_events()
            },
            Intent::Leave => {
                self.registry.remove(device_id);
                self.latency.forget(device_id);
                self.drain_device_events()
            },
            Intent::SetTrack { url } => vec![self.set_track(url, now_ms)?],
            Intent::Play { seek_ms } => {
                if let Some(ms) = seek_ms {
                    check_seek(ms)?;
                }
                vec![self.play(seek_ms, now_ms)]
            },
            Intent::Pause => vec![self.pause(now_ms)],
            Intent::Seek { seek_ms } => {
                check_seek(seek_ms)?;
                vec![self.seek(seek_ms, now_ms)]
            },
            Intent::PlaceDevice {
                device_id: target,
                pos,
            } => {
                let target = target.unwrap_or_else(|| device_id.to_string());
                self.registry.place(&target, pos)?;
                placed = Some((target, pos));
                self.drain_device_events()
            },
            Intent::ResizeGrid { size } => {
                self.registry.resize(size)?;
                vec![ServerEvent::GridUpdate(GridUpdateMsg { size })]
            },
            Intent::Rotate { angle_deg } => {
                self.registry.set_angle(device_id, angle_deg)?;
                self.drain_device_events()
            },
            Intent::Ring { target } => {
                if let Some(target) = &target
                    && !self.registry.contains(target)
                {
                    return Err(HubError::NotAMember(target.clone()));
                }
                vec![ServerEvent::Ring(RingMsg {
                    from: device_id.to_string(),
                    target,
                })]
            },
        };

        self.gate.commit(seq);
        Ok(Outcome::Applied(Applied {
            seq,
            events,
            placed,
        }))
    }

    /// Flag a device whose channel went away. Returns `None` if nothing
    /// changed (unknown device, or already disconnected).
    pub fn mark_disconnected(&mut self, device_id: &str, now_ms: u64) -> Option<Applied> {
        self.registry.set_connected(device_id, false, now_ms).ok()?;
        self.latency.forget(device_id);
        self.applied_from_changes()
    }

    /// Drop devices that stayed disconnected for `ttl_ms`.
    pub fn reap_disconnected(&mut self, now_ms: u64, ttl_ms: u64) -> Option<Applied> {
        let reaped = self.registry.reap_disconnected(now_ms, ttl_ms);
        for id in &reaped {
            self.latency.forget(id);
        }
        self.applied_from_changes()
    }

    pub fn record_latency(&mut self, device_id: &str, rtt_ms: u64) {
        if self.registry.contains(device_id) {
            self.latency.record(device_id, rtt_ms);
        }
    }

    pub fn room_latency_ms(&self) -> u64 {
        self.latency.room_latency_ms()
    }

    pub fn snapshot(&self, now_ms: u64) -> RoomSnapshot {
        RoomSnapshot {
            code: self.code.clone(),
            name: self.name.clone(),
            grid_size: self.registry.grid_size(),
            devices: self.registry.list(),
            track: self.track.clone(),
            transport: self.transport,
            position_ms: self.transport.position_at(now_ms),
            seq: self.gate.last_applied(),
            server_time_ms: now_ms,
        }
    }

    fn set_track(&mut self, url: String, now_ms: u64) -> Result<ServerEvent, HubError> {
        let url = url.trim().to_string();
        if url.len() > MAX_TRACK_URL_LEN {
            return Err(HubError::invalid("track url is too long"));
        }
        if url.chars().any(char::is_control) {
            return Err(HubError::invalid("track url contains control characters"));
        }
        let at = self.issue_reference(self.scheduler.schedule_pause(now_ms, self.last_reference_ms));
        self.transport = TransportState::paused_at(0, at);
        self.track = (!url.is_empty()).then(|| url.clone());
        Ok(ServerEvent::Track(TrackMsg { url }))
    }

    fn play(&mut self, seek_ms: Option<u64>, now_ms: u64) -> ServerEvent {
        let start = self.scheduler.schedule_start(now_ms, self.latency.room_latency_ms());
        let start = self.issue_reference(start);
        let position_ms = seek_ms.unwrap_or_else(|| self.transport.position_at(start));
        self.transport = TransportState {
            position_ms,
            reference_epoch_ms: start,
            playing: true,
        };
        ServerEvent::Play(PlayMsg {
            start_at_epoch_ms: start,
            seek_ms: position_ms,
        })
    }

    fn pause(&mut self, now_ms: u64) -> ServerEvent {
        let at = self.issue_reference(self.scheduler.schedule_pause(now_ms, self.last_reference_ms));
        self.transport = TransportState::paused_at(self.transport.position_at(at), at);
        ServerEvent::Pause(PauseMsg {})
    }

    fn seek(&mut self, seek_ms: u64, now_ms: u64) -> ServerEvent {
        let at = self.issue_reference(self.scheduler.schedule_seek(now_ms, self.last_reference_ms));
        self.transport = TransportState {
            position_ms: seek_ms,
            reference_epoch_ms: at,
            playing: self.transport.playing,
        };
        ServerEvent::Seek(SeekMsg { seek_ms })
    }

    /// Clamp `at` so reference instants never go backwards, and remember it.
    fn issue_reference(&mut self, at: u64) -> u64 {
        let at = at.max(self.last_reference_ms);
        self.last_reference_ms = at;
        at
    }

    fn drain_device_events(&mut self) -> Vec<ServerEvent> {
        self.registry
            .take_changes()
            .into_iter()
            .map(device_event)
            .collect()
    }

    fn applied_from_changes(&mut self) -> Option<Applied> {
        let events = self.drain_device_events();
        if events.is_empty() {
            return None;
        }
        Some(Applied {
            seq: self.gate.bump()?,
            events,
            placed: None,
        })
    }
}

fn check_seek(seek_ms: u64) -> Result<(), HubError> {
    if seek_ms > MAX_SEEK_MS {
        return Err(HubError::invalid(format!(
            "seekMs {seek_ms} is above {MAX_SEEK_MS}"
        )));
    }
    Ok(())
}

fn device_event(change: DeviceChange) -> ServerEvent {
    ServerEvent::DeviceUpdate(DeviceUpdateMsg {
        removed: change.kind == ChangeKind::Removed,
        device: change.device,
    })
}
