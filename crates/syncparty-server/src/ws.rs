use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, FromRequest, Path, Query, Request, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use syncparty_core::device::{DeviceId, is_valid_device_id, sanitize_label};
use syncparty_core::error::HubError;
use syncparty_core::net::messages::{ClientMessage, PingMsg, ServerEvent};
use syncparty_core::net::protocol::{WireFormat, decode_client_message, encode_server_event};
use syncparty_core::time::now_epoch_ms;

use crate::error::AppError;
use crate::room_actor::{Connection, RoomHandle};
use crate::state::{AppState, ConnectionGuard, IpConnectionGuard};

/// Query string of `GET /ws/party/{code}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub device_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub format: WireFormat,
}

/// A validated device identity for one channel.
#[derive(Debug, Clone)]
pub struct Session {
    pub device_id: DeviceId,
    pub label: String,
    pub format: WireFormat,
}

impl SessionQuery {
    pub fn validate(self) -> Result<Session, AppError> {
        let device_id = self.device_id.trim().to_string();
        if !is_valid_device_id(&device_id) {
            return Err(AppError::BadRequest(
                "deviceId must be 1-64 printable characters".into(),
            ));
        }
        let label = match self.label {
            Some(raw) => sanitize_label(&raw).ok_or_else(|| {
                AppError::BadRequest("label must be 1-100 printable characters".into())
            })?,
            None => device_id.clone(),
        };
        Ok(Session {
            device_id,
            label,
            format: self.format,
        })
    }
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    query: Result<Query<SessionQuery>, QueryRejection>,
    request: Request,
) -> Result<Response, AppError> {
    let max_ws = state.config.limits.max_ws_connections;
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= max_ws {
        tracing::warn!(current, max = max_ws, "WS connection limit reached");
        return Err(HubError::Unavailable("connection limit reached".into()).into());
    }

    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    let max_per_ip = state.config.limits.max_ws_per_ip;
    let Some(ip_guard) =
        IpConnectionGuard::try_acquire(ip, Arc::clone(&state.ws_per_ip), max_per_ip)
    else {
        tracing::warn!(%ip, max_per_ip, "Per-IP WS connection limit reached");
        return Err(AppError::TooManyRequests(
            "too many connections from this address".into(),
        ));
    };

    let Query(query) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let session = query.validate()?;

    // Unknown and expired codes are answered over HTTP, before the upgrade.
    let handle = state.hub.resolve(&code).await?;

    let ws = WebSocketUpgrade::from_request(request, &state)
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?;

    // Oversized frames are dropped by the read loop; the protocol limit only
    // bounds what the socket will buffer.
    let frame_limit = state.config.limits.max_message_size.saturating_mul(4);
    let code = handle.code().to_string();
    Ok(ws
        .max_message_size(frame_limit)
        .on_upgrade(move |socket| handle_socket(socket, state, code, session, ip_guard))
        .into_response())
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    code: String,
    session: Session,
    _ip_guard: IpConnectionGuard,
) {
    let _guard = ConnectionGuard::new(Arc::clone(&state.ws_connection_count));
    let (ws_sender, mut ws_receiver) = socket.split();

    let (conn, rx) = Connection::new(session.format, state.config.limits.connection_buffer);
    let writer = spawn_writer(
        ws_sender,
        rx,
        conn.cancel.clone(),
        session.format,
        state.config.ping_interval(),
    );

    let handle = match state
        .hub
        .attach(&code, &session.device_id, &session.label, conn.clone())
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(room = %code, device_id = %session.device_id, error = %e, "Attach failed");
            conn.send_event(&ServerEvent::error(&e, None), None);
            conn.cancel.cancel();
            let _ = writer.await;
            return;
        },
    };

    read_loop(&mut ws_receiver, &state, &handle, &session, &conn).await;

    handle.detach(&session.device_id, conn.id).await;
    conn.cancel.cancel();
    let _ = writer.await;

    tracing::info!(room = %code, device_id = %session.device_id, conn_id = %conn.id, "Connection closed");
}

/// Drain the outbound buffer into the socket and ping the device
/// periodically. Frames already queued are flushed before the close.
fn spawn_writer(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    format: WireFormat,
    ping_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            let data = tokio::select! {
                biased;
                data = rx.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
                _ = cancel.cancelled() => break,
                _ = ping.tick() => {
                    let event = ServerEvent::Ping(PingMsg { t: now_epoch_ms() });
                    match encode_server_event(&event, None, format) {
                        Ok(data) => Bytes::from(data),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode ping");
                            continue;
                        },
                    }
                },
            };
            let Some(msg) = to_frame(data, format) else {
                continue;
            };
            if ws_sender.send(msg).await.is_err() {
                cancel.cancel();
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    })
}

fn to_frame(data: Bytes, format: WireFormat) -> Option<Message> {
    match format {
        WireFormat::Json => match String::from_utf8(data.to_vec()) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                tracing::error!(error = %e, "Dropping non-UTF-8 JSON frame");
                None
            },
        },
        WireFormat::Msgpack => Some(Message::Binary(data)),
    }
}

/// Per-connection rate limiter (token bucket).
struct RateLimiter {
    tokens: f64,
    last_refill: tokio::time::Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: tokio::time::Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Returns true if the message is allowed; false if rate-limited.
    fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    handle: &RoomHandle,
    session: &Session,
    conn: &Connection,
) {
    let limits = &state.config.limits;
    let mut rate_limiter = RateLimiter::new(limits.ws_rate_limit_burst, limits.ws_rate_limit_per_sec);
    let liveness = state.config.liveness_timeout();
    let room = handle.code();
    let device_id = session.device_id.as_str();

    loop {
        let next = tokio::select! {
            _ = conn.cancel.cancelled() => {
                tracing::debug!(room, device_id, "Connection cancelled by hub");
                break;
            },
            next = tokio::time::timeout(liveness, ws_receiver.next()) => next,
        };
        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::debug!(room, device_id, error = %e, "WebSocket error");
                break;
            },
            Ok(None) => break,
            Err(_) => {
                tracing::info!(room, device_id, "Liveness timeout");
                break;
            },
        };

        let (data, format) = match &msg {
            Message::Text(text) => (text.as_str().as_bytes(), WireFormat::Json),
            Message::Binary(data) => (&data[..], WireFormat::Msgpack),
            Message::Close(_) => break,
            // Transport-level pings count toward liveness only.
            _ => continue,
        };

        if !rate_limiter.allow() {
            tracing::warn!(room, device_id, "Rate limited");
            continue;
        }
        if data.len() > limits.max_message_size {
            tracing::warn!(room, device_id, size = data.len(), "Dropping oversized frame");
            continue;
        }

        let envelope = match decode_client_message(data, format) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(room, device_id, error = %e, "Undecodable frame");
                let err = HubError::invalid(e.to_string());
                conn.send_event(&ServerEvent::error(&err, e.message_type()), None);
                continue;
            },
        };

        match envelope.message {
            ClientMessage::Ping { t } => {
                let t = t.unwrap_or_else(now_epoch_ms);
                conn.send_event(&ServerEvent::Pong(PingMsg { t }), None);
            },
            ClientMessage::Pong { t } => {
                let now = now_epoch_ms();
                if t <= now {
                    handle.report_latency(device_id, now - t).await;
                }
            },
            ClientMessage::Intent(intent) => {
                if let Err(e) = handle
                    .submit(device_id, conn.id, envelope.seq, intent)
                    .await
                {
                    tracing::warn!(room, device_id, error = %e, "Room stopped accepting intents");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(device_id: &str, label: Option<&str>) -> SessionQuery {
        SessionQuery {
            device_id: device_id.into(),
            label: label.map(str::to_string),
            format: WireFormat::Json,
        }
    }

    #[test]
    fn session_label_defaults_to_device_id() {
        let session = query("phone-1", None).validate().unwrap();
        assert_eq!(session.device_id, "phone-1");
        assert_eq!(session.label, "phone-1");
    }

    #[test]
    fn session_rejects_bad_identity() {
        assert!(query("", None).validate().is_err());
        assert!(query(&"x".repeat(65), None).validate().is_err());
        assert!(query("ok", Some("bad\u{7}label")).validate().is_err());
        assert!(query("ok", Some(&"l".repeat(101))).validate().is_err());
    }

    #[test]
    fn session_query_parses_camel_case() {
        let q: SessionQuery =
            serde_json::from_str(r#"{"deviceId": "tv", "format": "msgpack"}"#).unwrap();
        assert_eq!(q.device_id, "tv");
        assert_eq!(q.format, WireFormat::Msgpack);
    }

    #[tokio::test]
    async fn rate_limiter_allows_burst_then_blocks() {
        let mut limiter = RateLimiter::new(3.0, 0.0);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test]
    async fn rate_limiter_refills_over_time() {
        let mut limiter = RateLimiter::new(1.0, 100.0);
        assert!(limiter.allow());
        assert!(!limiter.allow());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.allow());
    }

    #[test]
    fn json_frames_are_text_and_msgpack_binary() {
        let text = to_frame(Bytes::from_static(b"{}"), WireFormat::Json).unwrap();
        assert!(matches!(text, Message::Text(_)));
        let bin = to_frame(Bytes::from_static(&[0x80]), WireFormat::Msgpack).unwrap();
        assert!(matches!(bin, Message::Binary(_)));
    }
}
