use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use syncparty_core::net::messages::{Intent, ServerEvent};
use syncparty_core::net::protocol::{WireFormat, decode_server_event};
use syncparty_core::test_helpers::{intent_json, parse_event_json};

use syncparty_server::build_app_with_records;
use syncparty_server::config::{AuthFileConfig, ServerConfig};
use syncparty_server::records::{MemoryPartyRecords, PartyRecord, PartyRecords};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub records: Arc<MemoryPartyRecords>,
    _shutdown: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a test server with no auth and the given parties on record.
    pub async fn with_parties(codes: &[&str]) -> Self {
        Self::from_config(ServerConfig::default(), codes).await
    }

    /// Start a test server whose operator API requires `token`.
    pub async fn with_auth(token: &str, codes: &[&str]) -> Self {
        let config = ServerConfig {
            auth: AuthFileConfig {
                bearer_token: Some(token.to_string()),
            },
            ..ServerConfig::default()
        };
        Self::from_config(config, codes).await
    }

    pub async fn from_config(config: ServerConfig, codes: &[&str]) -> Self {
        let records = Arc::new(MemoryPartyRecords::new());
        for code in codes {
            records.insert(party(code)).await;
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (app, _state) =
            build_app_with_records(config, Arc::clone(&records) as Arc<dyn PartyRecords>);

        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            records,
            _shutdown: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, code: &str, device_id: &str) -> String {
        format!("ws://{}/ws/party/{code}?deviceId={device_id}", self.addr)
    }

    pub fn ws_url_with_format(&self, code: &str, device_id: &str, format: &str) -> String {
        format!("{}&format={format}", self.ws_url(code, device_id))
    }
}

pub fn party(code: &str) -> PartyRecord {
    PartyRecord {
        id: format!("party-{code}"),
        code: code.to_string(),
        name: format!("Party {code}"),
        is_active: true,
        grid_size: None,
    }
}

/// Connect a WebSocket client to the given URL.
pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

/// Connect and consume the initial `state` snapshot plus the join update.
pub async fn ws_join(url: &str) -> WsStream {
    let mut stream = ws_connect(url).await;
    let (_, first) = ws_read_event(&mut stream).await;
    assert!(matches!(first, ServerEvent::State(_)), "expected state, got {first:?}");
    let (_, second) = ws_read_event(&mut stream).await;
    assert!(
        matches!(second, ServerEvent::DeviceUpdate(_)),
        "expected device_update, got {second:?}"
    );
    stream
}

/// Attempt an upgrade that the hub should refuse; returns the HTTP status.
pub async fn ws_connect_expect_status(url: &str) -> u16 {
    match tokio_tungstenite::connect_async(url).await {
        Ok(_) => panic!("expected upgrade to be refused for {url}"),
        Err(tungstenite::Error::Http(resp)) => resp.status().as_u16(),
        Err(e) => panic!("unexpected connect error: {e}"),
    }
}

pub async fn ws_send_intent(stream: &mut WsStream, intent: Intent, seq: Option<u64>) {
    stream
        .send(Message::Text(intent_json(intent, seq).into()))
        .await
        .unwrap();
}

pub async fn ws_send_text(stream: &mut WsStream, text: &str) {
    stream.send(Message::Text(text.into())).await.unwrap();
}

/// Read the next hub event (5s timeout), skipping hub pings.
pub async fn ws_read_event(stream: &mut WsStream) -> (Option<u64>, ServerEvent) {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            let (seq, event) = match stream.next().await {
                Some(Ok(Message::Text(text))) => parse_event_json(text.as_str()),
                Some(Ok(Message::Binary(data))) => {
                    let env = decode_server_event(&data, WireFormat::Msgpack).unwrap();
                    (env.seq, env.message)
                },
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            };
            if matches!(event, ServerEvent::Ping(_)) {
                continue;
            }
            return (seq, event);
        }
    })
    .await
    .expect("Timed out waiting for hub event")
}

/// Read events until one matches `pred`, returning it.
pub async fn ws_read_until(
    stream: &mut WsStream,
    mut pred: impl FnMut(&ServerEvent) -> bool,
) -> (Option<u64>, ServerEvent) {
    for _ in 0..32 {
        let (seq, event) = ws_read_event(stream).await;
        if pred(&event) {
            return (seq, event);
        }
    }
    panic!("no matching event within 32 frames");
}

/// Assert that nothing but pings arrives within `ms`.
pub async fn ws_expect_silence(stream: &mut WsStream, ms: u64) {
    let result = tokio::time::timeout(Duration::from_millis(ms), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let (_, event) = parse_event_json(text.as_str());
                    if !matches!(event, ServerEvent::Ping(_)) {
                        return event;
                    }
                },
                Some(Ok(_)) => continue,
                other => panic!("stream ended while expecting silence: {other:?}"),
            }
        }
    })
    .await;
    if let Ok(event) = result {
        panic!("expected no events, got {event:?}");
    }
}

/// Wait until the hub closes the stream (5s timeout).
pub async fn ws_expect_close(stream: &mut WsStream) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for close");
}
