//! Party code to room actor routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use syncparty_core::error::HubError;
use syncparty_core::net::messages::RoomSnapshot;
use syncparty_core::room::{RoomSettings, normalize_party_code};

use crate::config::ServerConfig;
use crate::records::{PartyRecords, RecordsError};
use crate::room_actor::{Connection, RoomHandle, spawn_room};

/// Room lifecycle knobs, resolved from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub room: RoomSettings,
    pub grace_period: Duration,
    pub disconnected_ttl: Duration,
    pub expired_code_ttl: Duration,
    pub reap_interval: Duration,
    pub queue_capacity: usize,
    pub max_rooms: usize,
}

impl HubSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            room: config.room_settings(),
            grace_period: Duration::from_millis(config.rooms.grace_period_ms),
            disconnected_ttl: Duration::from_millis(config.rooms.disconnected_device_ttl_ms),
            expired_code_ttl: Duration::from_millis(config.rooms.expired_code_ttl_ms),
            reap_interval: Duration::from_millis(config.rooms.reap_interval_ms.max(1)),
            queue_capacity: config.limits.room_queue_capacity,
            max_rooms: config.limits.max_rooms,
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Live rooms plus tombstones for recently retired codes.
#[derive(Default)]
pub struct RoomTable {
    rooms: HashMap<String, RoomHandle>,
    expired: HashMap<String, Instant>,
}

impl RoomTable {
    /// The live handle for `code`, skipping actors that already stopped.
    pub fn live(&self, code: &str) -> Option<&RoomHandle> {
        self.rooms.get(code).filter(|h| !h.is_closed())
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn handles(&self) -> Vec<RoomHandle> {
        self.rooms.values().cloned().collect()
    }

    /// Whether `code` was retired less than `ttl` ago.
    pub fn is_expired(&self, code: &str, ttl: Duration) -> bool {
        self.expired
            .get(code)
            .is_some_and(|at| at.elapsed() < ttl)
    }

    pub fn insert(&mut self, handle: RoomHandle) {
        self.expired.remove(handle.code());
        self.rooms.insert(handle.code().to_string(), handle);
    }

    /// Remove the room for `code` if it is still generation `generation`,
    /// leaving a tombstone. Returns false if a newer room owns the code.
    pub fn retire(&mut self, code: &str, generation: u64) -> bool {
        if self
            .rooms
            .get(code)
            .is_some_and(|h| h.generation() != generation)
        {
            return false;
        }
        self.rooms.remove(code);
        self.expired.insert(code.to_string(), Instant::now());
        true
    }

    /// Forget tombstones older than `ttl`. Returns how many were dropped.
    pub fn sweep(&mut self, ttl: Duration) -> usize {
        let before = self.expired.len();
        self.expired.retain(|_, at| at.elapsed() < ttl);
        before - self.expired.len()
    }
}

#[derive(Clone)]
pub struct Hub {
    table: Arc<RwLock<RoomTable>>,
    records: Arc<dyn PartyRecords>,
    settings: Arc<HubSettings>,
    generation: Arc<AtomicU64>,
}

impl Hub {
    pub fn new(records: Arc<dyn PartyRecords>, settings: HubSettings) -> Self {
        Self {
            table: Arc::new(RwLock::new(RoomTable::default())),
            records,
            settings: Arc::new(settings),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn records(&self) -> &Arc<dyn PartyRecords> {
        &self.records
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub async fn room_count(&self) -> usize {
        self.table.read().await.len()
    }

    /// Find the live room for `code`, activating it from the party records
    /// if needed.
    pub async fn resolve(&self, code: &str) -> Result<RoomHandle, HubError> {
        let code = normalize_party_code(code).ok_or_else(|| HubError::RoomNotFound(code.to_string()))?;

        if let Some(handle) = self.table.read().await.live(&code) {
            return Ok(handle.clone());
        }

        let record = match self.records.get_party(&code).await {
            Ok(record) if record.is_active => record,
            Ok(_) => return Err(HubError::RoomExpired(code)),
            Err(RecordsError::NotFound) => {
                let expired = self
                    .table
                    .read()
                    .await
                    .is_expired(&code, self.settings.expired_code_ttl);
                return Err(if expired {
                    HubError::RoomExpired(code)
                } else {
                    HubError::RoomNotFound(code)
                });
            },
            Err(RecordsError::Unavailable(reason)) => {
                tracing::warn!(room = %code, %reason, "Party records unavailable");
                return Err(HubError::Unavailable(reason));
            },
        };

        let mut table = self.table.write().await;
        // Another request may have activated the room while we were looking
        // up the record.
        if let Some(handle) = table.live(&code) {
            return Ok(handle.clone());
        }
        if table.len() >= self.settings.max_rooms {
            return Err(HubError::Unavailable("room limit reached".into()));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = spawn_room(
            &code,
            &record,
            generation,
            Arc::clone(&self.settings),
            Arc::clone(&self.table),
            Arc::clone(&self.records),
        );
        table.insert(handle.clone());
        tracing::info!(
            room = %code,
            party_id = %record.id,
            generation,
            rooms = table.len(),
            "Room activated"
        );
        Ok(handle)
    }

    /// Attach `conn` as `device_id` to the room for `code`.
    ///
    /// A room can retire between resolving and attaching; in that case the
    /// code is resolved once more so a fresh room takes over.
    pub async fn attach(
        &self,
        code: &str,
        device_id: &str,
        label: &str,
        conn: Connection,
    ) -> Result<RoomHandle, HubError> {
        let handle = self.resolve(code).await?;
        match handle.attach(device_id, label, conn.clone()).await {
            Ok(()) => Ok(handle),
            Err(HubError::RoomExpired(_)) => {
                tracing::debug!(room = %handle.code(), device_id, "Room retired during attach, retrying");
                let handle = self.resolve(code).await?;
                handle.attach(device_id, label, conn).await?;
                Ok(handle)
            },
            Err(e) => Err(e),
        }
    }

    /// Snapshot a live room. Codes without a live room are not activated.
    pub async fn snapshot(&self, code: &str) -> Result<RoomSnapshot, HubError> {
        let normalized =
            normalize_party_code(code).ok_or_else(|| HubError::RoomNotFound(code.to_string()))?;
        let handle = {
            let table = self.table.read().await;
            match table.live(&normalized) {
                Some(handle) => handle.clone(),
                None if table.is_expired(&normalized, self.settings.expired_code_ttl) => {
                    return Err(HubError::RoomExpired(normalized));
                },
                None => return Err(HubError::RoomNotFound(normalized)),
            }
        };
        handle.snapshot().await
    }

    /// Activate the room for `code` and return its snapshot.
    pub async fn open(&self, code: &str) -> Result<RoomSnapshot, HubError> {
        self.resolve(code).await?.snapshot().await
    }

    /// Snapshots of every live room.
    pub async fn list(&self) -> Vec<RoomSnapshot> {
        let handles = self.table.read().await.handles();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.code.cmp(&b.code));
        snapshots
    }

    /// Drop stale tombstones.
    pub async fn sweep_expired(&self) -> usize {
        self.table
            .write()
            .await
            .sweep(self.settings.expired_code_ttl)
    }
}
