//! Party record collaborator.
//!
//! The hub does not own parties: it looks them up by code when a room is
//! first needed and reports device placements back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;

use syncparty_core::device::GridPos;
use syncparty_core::room::normalize_party_code;

use crate::config::{RecordsBackend, RecordsConfig};

/// A party as known to the record collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub grid_size: Option<u32>,
}

fn default_active() -> bool {
    true
}

fn string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(u64),
    }
    Ok(match Id::deserialize(de)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// A placement reported to the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacementRecord {
    pub party_id: String,
    pub device_id: String,
    pub grid_x: u32,
    pub grid_y: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordsError {
    NotFound,
    Unavailable(String),
}

impl std::fmt::Display for RecordsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "party record not found"),
            Self::Unavailable(reason) => write!(f, "party records unavailable: {reason}"),
        }
    }
}

impl std::error::Error for RecordsError {}

#[async_trait]
pub trait PartyRecords: Send + Sync {
    /// Look a party up by its normalized code.
    async fn get_party(&self, code: &str) -> Result<PartyRecord, RecordsError>;

    async fn record_device_placement(
        &self,
        party_id: &str,
        device_id: &str,
        pos: GridPos,
    ) -> Result<(), RecordsError>;
}

/// Build the collaborator selected by `[records]`.
pub fn from_config(cfg: &RecordsConfig) -> Result<Arc<dyn PartyRecords>, RecordsError> {
    match cfg.backend {
        RecordsBackend::Memory => Ok(Arc::new(MemoryPartyRecords::from_config(cfg))),
        RecordsBackend::Http => {
            let base_url = cfg
                .base_url
                .clone()
                .ok_or_else(|| RecordsError::Unavailable("records.base_url is not set".into()))?;
            Ok(Arc::new(HttpPartyRecords::new(
                &base_url,
                cfg.token.clone(),
                Duration::from_millis(cfg.request_timeout_ms),
            )?))
        },
    }
}

/// In-process records, seeded from config. Used standalone and in tests.
///
/// Only the latest placement of each device in each party is kept.
#[derive(Default)]
pub struct MemoryPartyRecords {
    parties: RwLock<HashMap<String, PartyRecord>>,
    placements: RwLock<HashMap<(String, String), PlacementRecord>>,
}

impl MemoryPartyRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &RecordsConfig) -> Self {
        let mut parties = HashMap::new();
        for seed in &cfg.parties {
            let Some(code) = normalize_party_code(&seed.code) else {
                tracing::warn!(code = %seed.code, "Skipping seeded party with invalid code");
                continue;
            };
            let record = PartyRecord {
                id: seed.id.clone().unwrap_or_else(|| code.clone()),
                code: code.clone(),
                name: seed.name.clone(),
                is_active: true,
                grid_size: seed.grid_size,
            };
            parties.insert(code, record);
        }
        Self {
            parties: RwLock::new(parties),
            placements: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a party. The code is normalized first.
    pub async fn insert(&self, mut record: PartyRecord) {
        if let Some(code) = normalize_party_code(&record.code) {
            record.code = code.clone();
            self.parties.write().await.insert(code, record);
        }
    }

    pub async fn remove(&self, code: &str) -> Option<PartyRecord> {
        let code = normalize_party_code(code)?;
        self.parties.write().await.remove(&code)
    }

    pub async fn set_active(&self, code: &str, active: bool) {
        let Some(code) = normalize_party_code(code) else {
            return;
        };
        let mut parties = self.parties.write().await;
        if let Some(record) = parties.get_mut(&code) {
            record.is_active = active;
        }
    }

    /// Latest placement per device, ordered by party then device.
    pub async fn placements(&self) -> Vec<PlacementRecord> {
        let mut out: Vec<PlacementRecord> =
            self.placements.read().await.values().cloned().collect();
        out.sort_by(|a, b| {
            (a.party_id.as_str(), a.device_id.as_str())
                .cmp(&(b.party_id.as_str(), b.device_id.as_str()))
        });
        out
    }
}

#[async_trait]
impl PartyRecords for MemoryPartyRecords {
    async fn get_party(&self, code: &str) -> Result<PartyRecord, RecordsError> {
        self.parties
            .read()
            .await
            .get(code)
            .cloned()
            .ok_or(RecordsError::NotFound)
    }

    async fn record_device_placement(
        &self,
        party_id: &str,
        device_id: &str,
        pos: GridPos,
    ) -> Result<(), RecordsError> {
        let record = PlacementRecord {
            party_id: party_id.to_string(),
            device_id: device_id.to_string(),
            grid_x: pos.x,
            grid_y: pos.y,
        };
        self.placements
            .write()
            .await
            .insert((record.party_id.clone(), record.device_id.clone()), record);
        Ok(())
    }
}

/// Records served by the party REST API.
pub struct HttpPartyRecords {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPartyRecords {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, RecordsError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecordsError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl PartyRecords for HttpPartyRecords {
    async fn get_party(&self, code: &str) -> Result<PartyRecord, RecordsError> {
        let url = format!("{}/parties/by-code/{code}/", self.base_url);
        let resp = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| RecordsError::Unavailable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RecordsError::NotFound);
        }
        if !resp.status().is_success() {
            return Err(RecordsError::Unavailable(format!(
                "GET {url} returned {}",
                resp.status()
            )));
        }
        resp.json::<PartyRecord>()
            .await
            .map_err(|e| RecordsError::Unavailable(format!("bad party record: {e}")))
    }

    async fn record_device_placement(
        &self,
        party_id: &str,
        device_id: &str,
        pos: GridPos,
    ) -> Result<(), RecordsError> {
        let url = format!("{}/parties/{party_id}/placements/", self.base_url);
        let body = PlacementRecord {
            party_id: party_id.to_string(),
            device_id: device_id.to_string(),
            grid_x: pos.x,
            grid_y: pos.y,
        };
        let resp = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| RecordsError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RecordsError::Unavailable(format!(
                "POST {url} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
