use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceId, GridPos};
use crate::transport::TransportState;

/// Envelope `type` discriminator for every message on the party channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Device -> hub
    SetTrack,
    Play,
    Pause,
    Seek,
    PlaceDevice,
    ResizeGrid,
    Join,
    Leave,
    Rotate,
    Ring,
    Ping,
    Pong,

    // Hub -> device
    DeviceUpdate,
    GridUpdate,
    Track,
    State,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetTrack => "set_track",
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Seek => "seek",
            Self::PlaceDevice => "place_device",
            Self::ResizeGrid => "resize_grid",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Rotate => "rotate",
            Self::Ring => "ring",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::DeviceUpdate => "device_update",
            Self::GridUpdate => "grid_update",
            Self::Track => "track",
            Self::State => "state",
            Self::Error => "error",
        }
    }

    /// Resolve an inbound `type` string as a device intent.
    ///
    /// `track` is accepted as an alias of `set_track`, which is what older
    /// clients send.
    pub fn parse_intent(kind: &str) -> Option<Self> {
        Some(match kind {
            "set_track" | "track" => Self::SetTrack,
            "play" => Self::Play,
            "pause" => Self::Pause,
            "seek" => Self::Seek,
            "place_device" => Self::PlaceDevice,
            "resize_grid" => Self::ResizeGrid,
            "join" => Self::Join,
            "leave" => Self::Leave,
            "rotate" => Self::Rotate,
            "ring" => Self::Ring,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            _ => return None,
        })
    }

    /// Resolve an outbound `type` string as a hub event.
    pub fn parse_event(kind: &str) -> Option<Self> {
        Some(match kind {
            "device_update" => Self::DeviceUpdate,
            "grid_update" => Self::GridUpdate,
            "track" => Self::Track,
            "play" => Self::Play,
            "pause" => Self::Pause,
            "seek" => Self::Seek,
            "ring" => Self::Ring,
            "state" => Self::State,
            "error" => Self::Error,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state-changing request from a device.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    SetTrack { url: String },
    Play { seek_ms: Option<u64> },
    Pause,
    Seek { seek_ms: u64 },
    /// Place `device_id` (or the sender when `None`) at `pos`.
    PlaceDevice { device_id: Option<DeviceId>, pos: GridPos },
    ResizeGrid { size: u32 },
    Join { label: String },
    Leave,
    Rotate { angle_deg: f32 },
    Ring { target: Option<DeviceId> },
}

impl Intent {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::SetTrack { .. } => MessageType::SetTrack,
            Self::Play { .. } => MessageType::Play,
            Self::Pause => MessageType::Pause,
            Self::Seek { .. } => MessageType::Seek,
            Self::PlaceDevice { .. } => MessageType::PlaceDevice,
            Self::ResizeGrid { .. } => MessageType::ResizeGrid,
            Self::Join { .. } => MessageType::Join,
            Self::Leave => MessageType::Leave,
            Self::Rotate { .. } => MessageType::Rotate,
            Self::Ring { .. } => MessageType::Ring,
        }
    }
}

/// Everything a device may send on its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Intent(Intent),
    /// Liveness ping from the device; answered with `pong`.
    Ping { t: Option<u64> },
    /// Answer to a hub `ping`, echoing its timestamp.
    Pong { t: u64 },
}

/// A decoded message together with its optional envelope sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub seq: Option<u64>,
    pub message: T,
}

// ---------------------------------------------------------------------------
// Intent payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetTrackPayload {
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seek_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekPayload {
    pub seek_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceDevicePayload {
    pub x: u32,
    pub y: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeGridPayload {
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotatePayload {
    pub angle_deg: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DeviceId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyPayload {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientPingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<u64>,
}

// ---------------------------------------------------------------------------
// Hub events
// ---------------------------------------------------------------------------

/// Full device record plus whether the device has left the party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdateMsg {
    #[serde(flatten)]
    pub device: Device,
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridUpdateMsg {
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMsg {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayMsg {
    pub start_at_epoch_ms: u64,
    pub seek_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseMsg {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekMsg {
    pub seek_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingMsg {
    pub from: DeviceId,
    pub target: Option<DeviceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMsg {
    pub t: u64,
}

/// Everything a late joiner needs to converge on the party state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub code: String,
    pub name: String,
    pub grid_size: u32,
    pub devices: Vec<Device>,
    pub track: Option<String>,
    pub transport: TransportState,
    /// Position extrapolated to `server_time_ms`.
    pub position_ms: u64,
    pub seq: u64,
    pub server_time_ms: u64,
}

/// Messages the hub sends to devices.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    DeviceUpdate(DeviceUpdateMsg),
    GridUpdate(GridUpdateMsg),
    Track(TrackMsg),
    Play(PlayMsg),
    Pause(PauseMsg),
    Seek(SeekMsg),
    Ring(RingMsg),
    State(Box<RoomSnapshot>),
    Error(ErrorMsg),
    Ping(PingMsg),
    Pong(PingMsg),
}

impl ServerEvent {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::DeviceUpdate(_) => MessageType::DeviceUpdate,
            Self::GridUpdate(_) => MessageType::GridUpdate,
            Self::Track(_) => MessageType::Track,
            Self::Play(_) => MessageType::Play,
            Self::Pause(_) => MessageType::Pause,
            Self::Seek(_) => MessageType::Seek,
            Self::Ring(_) => MessageType::Ring,
            Self::State(_) => MessageType::State,
            Self::Error(_) => MessageType::Error,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
        }
    }

    /// Build an `error` event answering a rejected message.
    pub fn error(err: &crate::error::HubError, intent: Option<MessageType>) -> Self {
        Self::Error(ErrorMsg {
            code: err.code().to_string(),
            message: err.to_string(),
            intent: intent.map(|t| t.as_str().to_string()),
        })
    }
}
