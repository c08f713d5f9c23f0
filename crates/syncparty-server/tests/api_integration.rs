#[allow(dead_code)]
mod common;

use std::time::Duration;

use syncparty_server::config::ServerConfig;

use common::{TestServer, ws_join};

const CODE: &str = "APIPARTY";

#[tokio::test]
async fn health_reports_connections_and_rooms() {
    let server = TestServer::with_parties(&[CODE]).await;
    let _ws = ws_join(&server.ws_url(CODE, "phone")).await;

    let body: serde_json::Value = reqwest::get(format!("{}/health", server.base_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["protocol"], 1);
    assert_eq!(body["connections"]["websocket"], 1);
    assert_eq!(body["rooms"]["active"], 1);
}

#[tokio::test]
async fn ready_endpoint() {
    let server = TestServer::with_parties(&[]).await;
    let resp = reqwest::get(format!("{}/ready", server.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ready");
}

#[tokio::test]
async fn api_rejected_without_auth() {
    let server = TestServer::with_auth("test-token", &[CODE]).await;
    let resp = reqwest::get(format!("{}/api/v1/status", server.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "Unauthorized");
}

#[tokio::test]
async fn device_path_needs_no_token() {
    let server = TestServer::with_auth("test-token", &[CODE]).await;
    let _ws = ws_join(&server.ws_url(CODE, "phone")).await;
}

#[tokio::test]
async fn open_then_status_and_snapshot() {
    let server = TestServer::with_auth("test-token", &[CODE]).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/v1/parties/{CODE}/open", server.base_url()))
        .bearer_auth("test-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let opened: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(opened["code"], CODE);
    assert_eq!(opened["devices"].as_array().unwrap().len(), 0);

    let status: serde_json::Value = client
        .get(format!("{}/api/v1/status", server.base_url()))
        .bearer_auth("test-token")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["rooms"][0]["code"], CODE);
    assert_eq!(status["rooms"][0]["gridSize"], 5);

    let _ws = ws_join(&server.ws_url(CODE, "phone")).await;
    let snapshot: serde_json::Value = client
        .get(format!("{}/api/v1/parties/{CODE}", server.base_url()))
        .bearer_auth("test-token")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot["devices"][0]["id"], "phone");
    assert_eq!(snapshot["devices"][0]["isMainDevice"], true);
    assert_eq!(snapshot["transport"]["playing"], false);
}

#[tokio::test]
async fn unknown_party_is_not_found_with_json_error() {
    let server = TestServer::with_parties(&[CODE]).await;
    let resp = reqwest::get(format!("{}/api/v1/parties/NOPE0000", server.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "RoomNotFound");
    assert!(body["error"].as_str().unwrap().contains("NOPE0000"));
}

#[tokio::test]
async fn expired_room_snapshot_is_gone() {
    let mut config = ServerConfig::default();
    config.rooms.grace_period_ms = 50;
    let server = TestServer::from_config(config, &[CODE]).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/v1/parties/{CODE}/open", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let resp = reqwest::get(format!("{}/api/v1/parties/{CODE}", server.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 410);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "RoomExpired");
}
