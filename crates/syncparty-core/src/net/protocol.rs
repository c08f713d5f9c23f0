use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::device::GridPos;

use super::messages::{
    ClientMessage, ClientPingPayload, DeviceUpdateMsg, EmptyPayload, Envelope, ErrorMsg,
    GridUpdateMsg, Intent, JoinPayload, MessageType, PauseMsg, PingMsg, PlaceDevicePayload,
    PlayMsg, PlayPayload, ResizeGridPayload, RingMsg, RingPayload, RoomSnapshot, RotatePayload,
    SeekMsg, SeekPayload, ServerEvent, SetTrackPayload, TrackMsg,
};

/// Current protocol version, reported by the health endpoint.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum inbound frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024; // 64 KiB

/// Maximum length of a track URI.
pub const MAX_TRACK_URL_LEN: usize = 2048;

/// Largest seek offset accepted, in milliseconds (24 hours).
pub const MAX_SEEK_MS: u64 = 24 * 60 * 60 * 1000;

/// Frame encoding used on a channel.
///
/// Text frames carry JSON; binary frames carry the same envelope as
/// MessagePack with named fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    #[serde(alias = "messagepack")]
    Msgpack,
}

#[derive(Debug)]
pub enum ProtocolError {
    EmptyMessage,
    UnknownMessageType(String),
    PayloadTooLarge(usize),
    InvalidPayload {
        kind: MessageType,
        reason: String,
    },
    SerializeError(String),
    DeserializeError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::UnknownMessageType(t) => write!(f, "unknown message type: {t:?}"),
            Self::PayloadTooLarge(size) => {
                write!(
                    f,
                    "payload too large: {size} bytes (max {MAX_MESSAGE_SIZE})"
                )
            },
            Self::InvalidPayload { kind, reason } => write!(f, "invalid {kind} payload: {reason}"),
            Self::SerializeError(e) => write!(f, "serialize error: {e}"),
            Self::DeserializeError(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ProtocolError {
    /// The intent type the failure relates to, when it is known.
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Self::InvalidPayload { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    seq: Option<u64>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
    data: &'a T,
}

/// Serialize `{ type, seq?, data }` in the requested format.
pub fn encode_message<T: Serialize>(
    kind: MessageType,
    seq: Option<u64>,
    payload: &T,
    format: WireFormat,
) -> Result<Vec<u8>, ProtocolError> {
    let envelope = EnvelopeRef {
        kind: kind.as_str(),
        seq,
        data: payload,
    };
    let bytes = match format {
        WireFormat::Json => serde_json::to_vec(&envelope)
            .map_err(|e| ProtocolError::SerializeError(e.to_string()))?,
        WireFormat::Msgpack => rmp_serde::to_vec_named(&envelope)
            .map_err(|e| ProtocolError::SerializeError(e.to_string()))?,
    };
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Encode a hub event.
pub fn encode_server_event(
    event: &ServerEvent,
    seq: Option<u64>,
    format: WireFormat,
) -> Result<Vec<u8>, ProtocolError> {
    let kind = event.message_type();
    match event {
        ServerEvent::DeviceUpdate(m) => encode_message(kind, seq, m, format),
        ServerEvent::GridUpdate(m) => encode_message(kind, seq, m, format),
        ServerEvent::Track(m) => encode_message(kind, seq, m, format),
        ServerEvent::Play(m) => encode_message(kind, seq, m, format),
        ServerEvent::Pause(m) => encode_message(kind, seq, m, format),
        ServerEvent::Seek(m) => encode_message(kind, seq, m, format),
        ServerEvent::Ring(m) => encode_message(kind, seq, m, format),
        ServerEvent::State(m) => encode_message(kind, seq, m.as_ref(), format),
        ServerEvent::Error(m) => encode_message(kind, seq, m, format),
        ServerEvent::Ping(m) | ServerEvent::Pong(m) => encode_message(kind, seq, m, format),
    }
}

/// Encode a device message. Used by Rust clients and the test suite.
pub fn encode_client_message(
    msg: &ClientMessage,
    seq: Option<u64>,
    format: WireFormat,
) -> Result<Vec<u8>, ProtocolError> {
    match msg {
        ClientMessage::Ping { t } => {
            encode_message(MessageType::Ping, seq, &ClientPingPayload { t: *t }, format)
        },
        ClientMessage::Pong { t } => encode_message(MessageType::Pong, seq, &PingMsg { t: *t }, format),
        ClientMessage::Intent(intent) => encode_intent(intent, seq, format),
    }
}

fn encode_intent(
    intent: &Intent,
    seq: Option<u64>,
    format: WireFormat,
) -> Result<Vec<u8>, ProtocolError> {
    let kind = intent.message_type();
    match intent {
        Intent::SetTrack { url } => {
            encode_message(kind, seq, &SetTrackPayload { url: url.clone() }, format)
        },
        Intent::Play { seek_ms } => encode_message(kind, seq, &PlayPayload { seek_ms: *seek_ms }, format),
        Intent::Pause | Intent::Leave => encode_message(kind, seq, &EmptyPayload {}, format),
        Intent::Seek { seek_ms } => encode_message(kind, seq, &SeekPayload { seek_ms: *seek_ms }, format),
        Intent::PlaceDevice { device_id, pos } => encode_message(
            kind,
            seq,
            &PlaceDevicePayload {
                x: pos.x,
                y: pos.y,
                device_id: device_id.clone(),
            },
            format,
        ),
        Intent::ResizeGrid { size } => {
            encode_message(kind, seq, &ResizeGridPayload { size: *size }, format)
        },
        Intent::Join { label } => encode_message(
            kind,
            seq,
            &JoinPayload {
                label: label.clone(),
            },
            format,
        ),
        Intent::Rotate { angle_deg } => encode_message(
            kind,
            seq,
            &RotatePayload {
                angle_deg: *angle_deg,
            },
            format,
        ),
        Intent::Ring { target } => encode_message(
            kind,
            seq,
            &RingPayload {
                target: target.clone(),
            },
            format,
        ),
    }
}

fn decode_envelope(data: &[u8], format: WireFormat) -> Result<RawEnvelope, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(data.len()));
    }
    match format {
        WireFormat::Json => serde_json::from_slice(data)
            .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
        WireFormat::Msgpack => {
            rmp_serde::from_slice(data).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
        },
    }
}

/// Decode the `data` object of an envelope. A missing or `null` payload is
/// treated as `{}` so that field-less messages like `pause` need no body.
pub fn decode_payload<T: DeserializeOwned>(
    kind: MessageType,
    data: serde_json::Value,
) -> Result<T, ProtocolError> {
    let data = if data.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

/// Decode one inbound frame from a device.
pub fn decode_client_message(
    data: &[u8],
    format: WireFormat,
) -> Result<Envelope<ClientMessage>, ProtocolError> {
    let raw = decode_envelope(data, format)?;
    let kind = MessageType::parse_intent(&raw.kind)
        .ok_or_else(|| ProtocolError::UnknownMessageType(raw.kind.clone()))?;

    let message = match kind {
        MessageType::Ping => {
            let p: ClientPingPayload = decode_payload(kind, raw.data)?;
            ClientMessage::Ping { t: p.t }
        },
        MessageType::Pong => {
            let p: PingMsg = decode_payload(kind, raw.data)?;
            ClientMessage::Pong { t: p.t }
        },
        _ => ClientMessage::Intent(decode_intent(kind, raw.data)?),
    };
    Ok(Envelope {
        seq: raw.seq,
        message,
    })
}

fn decode_intent(kind: MessageType, data: serde_json::Value) -> Result<Intent, ProtocolError> {
    let invalid = |reason: &str| ProtocolError::InvalidPayload {
        kind,
        reason: reason.to_string(),
    };
    let intent = match kind {
        MessageType::SetTrack => {
            let p: SetTrackPayload = decode_payload(kind, data)?;
            if p.url.len() > MAX_TRACK_URL_LEN {
                return Err(invalid("url is too long"));
            }
            Intent::SetTrack { url: p.url }
        },
        MessageType::Play => {
            let p: PlayPayload = decode_payload(kind, data)?;
            if p.seek_ms.is_some_and(|ms| ms > MAX_SEEK_MS) {
                return Err(invalid("seekMs is out of range"));
            }
            Intent::Play { seek_ms: p.seek_ms }
        },
        MessageType::Pause => Intent::Pause,
        MessageType::Seek => {
            let p: SeekPayload = decode_payload(kind, data)?;
            if p.seek_ms > MAX_SEEK_MS {
                return Err(invalid("seekMs is out of range"));
            }
            Intent::Seek { seek_ms: p.seek_ms }
        },
        MessageType::PlaceDevice => {
            let p: PlaceDevicePayload = decode_payload(kind, data)?;
            Intent::PlaceDevice {
                device_id: p.device_id,
                pos: GridPos::new(p.x, p.y),
            }
        },
        MessageType::ResizeGrid => {
            let p: ResizeGridPayload = decode_payload(kind, data)?;
            Intent::ResizeGrid { size: p.size }
        },
        MessageType::Join => {
            let p: JoinPayload = decode_payload(kind, data)?;
            Intent::Join { label: p.label }
        },
        MessageType::Leave => Intent::Leave,
        MessageType::Rotate => {
            let p: RotatePayload = decode_payload(kind, data)?;
            if !p.angle_deg.is_finite() {
                return Err(invalid("angleDeg must be finite"));
            }
            Intent::Rotate {
                angle_deg: p.angle_deg,
            }
        },
        MessageType::Ring => {
            let p: RingPayload = decode_payload(kind, data)?;
            Intent::Ring { target: p.target }
        },
        other => return Err(ProtocolError::UnknownMessageType(other.as_str().to_string())),
    };
    Ok(intent)
}

/// Decode one frame sent by the hub. Used by Rust clients and tests.
pub fn decode_server_event(
    data: &[u8],
    format: WireFormat,
) -> Result<Envelope<ServerEvent>, ProtocolError> {
    let raw = decode_envelope(data, format)?;
    let kind = MessageType::parse_event(&raw.kind)
        .ok_or_else(|| ProtocolError::UnknownMessageType(raw.kind.clone()))?;
    let event = match kind {
        MessageType::DeviceUpdate => {
            ServerEvent::DeviceUpdate(decode_payload::<DeviceUpdateMsg>(kind, raw.data)?)
        },
        MessageType::GridUpdate => {
            ServerEvent::GridUpdate(decode_payload::<GridUpdateMsg>(kind, raw.data)?)
        },
        MessageType::Track => ServerEvent::Track(decode_payload::<TrackMsg>(kind, raw.data)?),
        MessageType::Play => ServerEvent::Play(decode_payload::<PlayMsg>(kind, raw.data)?),
        MessageType::Pause => ServerEvent::Pause(decode_payload::<PauseMsg>(kind, raw.data)?),
        MessageType::Seek => ServerEvent::Seek(decode_payload::<SeekMsg>(kind, raw.data)?),
        MessageType::Ring => ServerEvent::Ring(decode_payload::<RingMsg>(kind, raw.data)?),
        MessageType::State => {
            ServerEvent::State(Box::new(decode_payload::<RoomSnapshot>(kind, raw.data)?))
        },
        MessageType::Error => ServerEvent::Error(decode_payload::<ErrorMsg>(kind, raw.data)?),
        MessageType::Ping => ServerEvent::Ping(decode_payload::<PingMsg>(kind, raw.data)?),
        MessageType::Pong => ServerEvent::Pong(decode_payload::<PingMsg>(kind, raw.data)?),
        other => return Err(ProtocolError::UnknownMessageType(other.as_str().to_string())),
    };
    Ok(Envelope {
        seq: raw.seq,
        message: event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    fn decode_json(text: &str) -> Result<Envelope<ClientMessage>, ProtocolError> {
        decode_client_message(text.as_bytes(), WireFormat::Json)
    }

    #[test]
    fn decodes_play_with_and_without_seek() {
        let env = decode_json(r#"{"type":"play","data":{"seekMs":1000}}"#).unwrap();
        assert_eq!(
            env.message,
            ClientMessage::Intent(Intent::Play {
                seek_ms: Some(1000)
            })
        );
        let env = decode_json(r#"{"type":"play","seq":7,"data":{}}"#).unwrap();
        assert_eq!(env.seq, Some(7));
        assert_eq!(env.message, ClientMessage::Intent(Intent::Play { seek_ms: None }));
    }

    #[test]
    fn pause_needs_no_data() {
        let env = decode_json(r#"{"type":"pause"}"#).unwrap();
        assert_eq!(env.message, ClientMessage::Intent(Intent::Pause));
        let env = decode_json(r#"{"type":"pause","data":null}"#).unwrap();
        assert_eq!(env.message, ClientMessage::Intent(Intent::Pause));
    }

    #[test]
    fn legacy_track_alias_is_set_track() {
        let env = decode_json(r#"{"type":"track","data":{"url":"https://x/a.mp3"}}"#).unwrap();
        assert_eq!(
            env.message,
            ClientMessage::Intent(Intent::SetTrack {
                url: "https://x/a.mp3".into()
            })
        );
    }

    #[test]
    fn legacy_play_fields_are_ignored() {
        // Older clients send their own start time; the hub schedules instead.
        let env = decode_json(r#"{"type":"play","data":{"startAtEpochMs":123}}"#).unwrap();
        assert_eq!(env.message, ClientMessage::Intent(Intent::Play { seek_ms: None }));
    }

    #[test]
    fn unknown_type_is_reported() {
        let err = decode_json(r#"{"type":"explode","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageType(t) if t == "explode"));
    }

    #[test]
    fn missing_field_is_invalid_payload() {
        let err = decode_json(r#"{"type":"seek","data":{}}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidPayload {
                kind: MessageType::Seek,
                ..
            }
        ));
    }

    #[test]
    fn wrong_type_is_invalid_payload() {
        let err = decode_json(r#"{"type":"place_device","data":{"x":"one","y":0}}"#).unwrap_err();
        assert_eq!(err.message_type(), Some(MessageType::PlaceDevice));
        let err = decode_json(r#"{"type":"seek","data":{"seekMs":-5}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn garbage_is_deserialize_error() {
        assert!(matches!(
            decode_json("not json"),
            Err(ProtocolError::DeserializeError(_))
        ));
        assert!(matches!(
            decode_client_message(&[], WireFormat::Json),
            Err(ProtocolError::EmptyMessage)
        ));
    }

    #[test]
    fn huge_seek_offsets_rejected() {
        for text in [
            r#"{"type":"play","data":{"seekMs":18446744073709551615}}"#,
            r#"{"type":"seek","seq":3,"data":{"seekMs":86400001}}"#,
        ] {
            let err = decode_json(text).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidPayload { .. }), "{text}");
        }
        let env = decode_json(r#"{"type":"seek","data":{"seekMs":86400000}}"#).unwrap();
        assert_eq!(
            env.message,
            ClientMessage::Intent(Intent::Seek {
                seek_ms: MAX_SEEK_MS
            })
        );
    }

    #[test]
    fn oversized_url_rejected() {
        let url = "u".repeat(MAX_TRACK_URL_LEN + 1);
        let text = format!(r#"{{"type":"set_track","data":{{"url":"{url}"}}}}"#);
        assert!(matches!(
            decode_json(&text),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn play_event_wire_shape() {
        let event = ServerEvent::Play(PlayMsg {
            start_at_epoch_ms: 1_700_000_000_090,
            seek_ms: 1000,
        });
        let bytes = encode_server_event(&event, Some(4), WireFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "play");
        assert_eq!(value["seq"], 4);
        assert_eq!(value["data"]["startAtEpochMs"], 1_700_000_000_090u64);
        assert_eq!(value["data"]["seekMs"], 1000);
    }

    #[test]
    fn pause_event_has_empty_object() {
        let bytes =
            encode_server_event(&ServerEvent::Pause(PauseMsg {}), None, WireFormat::Json).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"type":"pause","data":{}}"#
        );
    }

    #[test]
    fn device_update_is_flat_record() {
        let mut device = Device::new("a", "Alpha");
        device.position = Some(GridPos::new(1, 0));
        let event = ServerEvent::DeviceUpdate(DeviceUpdateMsg {
            device,
            removed: false,
        });
        let bytes = encode_server_event(&event, Some(2), WireFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["data"]["id"], "a");
        assert_eq!(value["data"]["position"]["x"], 1);
        assert_eq!(value["data"]["removed"], false);
    }

    #[test]
    fn msgpack_frames_decode_like_json() {
        let msg = ClientMessage::Intent(Intent::PlaceDevice {
            device_id: None,
            pos: GridPos::new(2, 3),
        });
        let bytes = encode_client_message(&msg, Some(9), WireFormat::Msgpack).unwrap();
        let env = decode_client_message(&bytes, WireFormat::Msgpack).unwrap();
        assert_eq!(env.seq, Some(9));
        assert_eq!(env.message, msg);
    }

    #[test]
    fn server_events_decode_for_clients() {
        let event = ServerEvent::Seek(SeekMsg { seek_ms: 42 });
        let bytes = encode_server_event(&event, Some(3), WireFormat::Msgpack).unwrap();
        let env = decode_server_event(&bytes, WireFormat::Msgpack).unwrap();
        assert_eq!(env.seq, Some(3));
        assert_eq!(env.message, event);
    }

    #[test]
    fn wire_format_names() {
        let f: WireFormat = serde_json::from_str("\"msgpack\"").unwrap();
        assert_eq!(f, WireFormat::Msgpack);
        let f: WireFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(f, WireFormat::Json);
    }
}
