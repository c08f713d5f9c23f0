//! One task per live party room.
//!
//! The actor owns the [`PartyRoom`] and every attached connection. All
//! commands for a room go through its bounded queue, so mutations and the
//! fan-out that follows them are applied in a single total order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use syncparty_core::device::{DeviceId, GridPos};
use syncparty_core::error::HubError;
use syncparty_core::net::messages::{Intent, RoomSnapshot, ServerEvent};
use syncparty_core::net::protocol::{WireFormat, encode_server_event};
use syncparty_core::room::{Applied, Outcome, PartyRoom};
use syncparty_core::time::now_epoch_ms;

use crate::hub::{HubSettings, RoomTable};
use crate::records::{PartyRecord, PartyRecords};

/// The hub side of one device channel.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub format: WireFormat,
    /// Encoded frames waiting for the socket writer.
    pub sender: mpsc::Sender<Bytes>,
    /// Cancelled when the hub drops the connection.
    pub cancel: CancellationToken,
}

impl Connection {
    pub fn new(format: WireFormat, buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, rx) = mpsc::channel(buffer.max(1));
        let conn = Self {
            id: Uuid::new_v4(),
            format,
            sender,
            cancel: CancellationToken::new(),
        };
        (conn, rx)
    }

    /// Encode and enqueue one event without waiting. Returns false if the
    /// frame could not be queued.
    pub fn send_event(&self, event: &ServerEvent, seq: Option<u64>) -> bool {
        match encode_server_event(event, seq, self.format) {
            Ok(data) => self.sender.try_send(Bytes::from(data)).is_ok(),
            Err(e) => {
                tracing::error!(conn_id = %self.id, error = %e, "Failed to encode event");
                false
            },
        }
    }
}

/// Commands sent from connections and the hub into a room actor.
#[derive(Debug)]
pub enum RoomCommand {
    Attach {
        device_id: DeviceId,
        label: String,
        conn: Connection,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Intent {
        device_id: DeviceId,
        conn_id: Uuid,
        seq: Option<u64>,
        intent: Intent,
    },
    Latency {
        device_id: DeviceId,
        rtt_ms: u64,
    },
    Detach {
        device_id: DeviceId,
        conn_id: Uuid,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

/// Cheap, cloneable address of a room actor.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    code: String,
    generation: u64,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the actor has retired and stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn attach(
        &self,
        device_id: &str,
        label: &str,
        conn: Connection,
    ) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Attach {
                device_id: device_id.to_string(),
                label: label.to_string(),
                conn,
                reply,
            })
            .await
            .map_err(|_| self.expired())?;
        rx.await.map_err(|_| self.expired())?
    }

    pub async fn submit(
        &self,
        device_id: &str,
        conn_id: Uuid,
        seq: Option<u64>,
        intent: Intent,
    ) -> Result<(), HubError> {
        self.tx
            .send(RoomCommand::Intent {
                device_id: device_id.to_string(),
                conn_id,
                seq,
                intent,
            })
            .await
            .map_err(|_| HubError::ChannelClosed)
    }

    pub async fn report_latency(&self, device_id: &str, rtt_ms: u64) {
        let _ = self
            .tx
            .send(RoomCommand::Latency {
                device_id: device_id.to_string(),
                rtt_ms,
            })
            .await;
    }

    pub async fn detach(&self, device_id: &str, conn_id: Uuid) {
        let _ = self
            .tx
            .send(RoomCommand::Detach {
                device_id: device_id.to_string(),
                conn_id,
            })
            .await;
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Snapshot { reply })
            .await
            .map_err(|_| self.expired())?;
        rx.await.map_err(|_| self.expired())
    }

    fn expired(&self) -> HubError {
        HubError::RoomExpired(self.code.clone())
    }
}

/// Start the actor for `code` and return its handle.
pub(crate) fn spawn_room(
    code: &str,
    record: &PartyRecord,
    generation: u64,
    settings: Arc<HubSettings>,
    table: Arc<RwLock<RoomTable>>,
    records: Arc<dyn PartyRecords>,
) -> RoomHandle {
    let mut room_settings = settings.room.clone();
    if let Some(size) = record.grid_size {
        room_settings.grid_size = size;
    }
    let room = PartyRoom::new(code, record.id.as_str(), record.name.as_str(), &room_settings);
    let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));

    let actor = RoomActor {
        room,
        generation,
        connections: HashMap::new(),
        idle_since: Some(Instant::now()),
        settings,
        table,
        records,
    };
    tokio::spawn(actor.run(rx));

    RoomHandle {
        code: code.to_string(),
        generation,
        tx,
    }
}

struct RoomActor {
    room: PartyRoom,
    generation: u64,
    connections: HashMap<DeviceId, Connection>,
    /// Set while no connection is attached; the room retires once the grace
    /// period has elapsed from here.
    idle_since: Option<Instant>,
    settings: Arc<HubSettings>,
    table: Arc<RwLock<RoomTable>>,
    records: Arc<dyn PartyRecords>,
}

impl RoomActor {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        tracing::debug!(room = %self.room.code(), generation = self.generation, "Room actor started");

        let mut reap = tokio::time::interval(self.settings.reap_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.idle_since.map(|t| t + self.settings.grace_period);
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = reap.tick() => self.reap(),
                _ = sleep_until(deadline) => {
                    self.retire(&mut rx).await;
                    return;
                },
            }
        }
        tracing::debug!(room = %self.room.code(), "Room actor stopped");
    }

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Attach {
                device_id,
                label,
                conn,
                reply,
            } => {
                let result = self.attach(device_id, label, conn);
                let _ = reply.send(result);
            },
            RoomCommand::Intent {
                device_id,
                conn_id,
                seq,
                intent,
            } => self.apply(&device_id, conn_id, seq, intent),
            RoomCommand::Latency { device_id, rtt_ms } => {
                self.room.record_latency(&device_id, rtt_ms);
            },
            RoomCommand::Detach { device_id, conn_id } => self.detach(&device_id, conn_id),
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.room.snapshot(now_epoch_ms()));
            },
        }
    }

    fn attach(&mut self, device_id: DeviceId, label: String, conn: Connection) -> Result<(), HubError> {
        let now = now_epoch_ms();
        let applied = match self
            .room
            .apply_intent(&device_id, None, Intent::Join { label }, now)?
        {
            Outcome::Applied(applied) => applied,
            Outcome::Stale(_) => return Err(HubError::invalid("join was not applied")),
        };

        if let Some(old) = self.connections.insert(device_id.clone(), conn.clone()) {
            tracing::info!(
                room = %self.room.code(),
                %device_id,
                old_conn = %old.id,
                "Replacing older connection for device"
            );
            old.cancel.cancel();
        }
        self.idle_since = None;

        let snapshot = ServerEvent::State(Box::new(self.room.snapshot(now)));
        if !conn.send_event(&snapshot, Some(applied.seq)) {
            tracing::warn!(room = %self.room.code(), %device_id, "Failed to queue snapshot");
        }
        tracing::info!(
            room = %self.room.code(),
            %device_id,
            conn_id = %conn.id,
            devices = self.room.registry().len(),
            "Device attached"
        );
        self.broadcast(applied);
        Ok(())
    }

    fn apply(&mut self, device_id: &str, conn_id: Uuid, seq: Option<u64>, intent: Intent) {
        let Some(conn) = self
            .connections
            .get(device_id)
            .filter(|c| c.id == conn_id)
            .cloned()
        else {
            tracing::debug!(room = %self.room.code(), device_id, "Dropping intent from superseded connection");
            return;
        };

        let kind = intent.message_type();
        let leaving = matches!(intent, Intent::Leave);
        match self.room.apply_intent(device_id, seq, intent, now_epoch_ms()) {
            Ok(Outcome::Applied(applied)) => {
                tracing::debug!(
                    room = %self.room.code(),
                    device_id,
                    seq = applied.seq,
                    intent = %kind,
                    "Intent applied"
                );
                if let Some((target, pos)) = applied.placed.clone() {
                    self.record_placement(target, pos);
                }
                self.broadcast(applied);
                if leaving && let Some(conn) = self.connections.remove(device_id) {
                    tracing::info!(room = %self.room.code(), device_id, "Device left");
                    conn.cancel.cancel();
                    self.mark_idle_if_empty();
                }
            },
            Ok(Outcome::Stale(stale)) => {
                tracing::warn!(
                    room = %self.room.code(),
                    device_id,
                    seq = stale.seq,
                    last_applied = stale.last_applied,
                    intent = %kind,
                    "Dropping stale intent"
                );
            },
            Err(e) => {
                tracing::warn!(
                    room = %self.room.code(),
                    device_id,
                    intent = %kind,
                    error = %e,
                    "Intent rejected"
                );
                conn.send_event(&ServerEvent::error(&e, Some(kind)), None);
            },
        }
    }

    fn detach(&mut self, device_id: &str, conn_id: Uuid) {
        if !self
            .connections
            .get(device_id)
            .is_some_and(|c| c.id == conn_id)
        {
            return;
        }
        self.connections.remove(device_id);
        tracing::info!(room = %self.room.code(), device_id, %conn_id, "Device detached");
        if let Some(applied) = self.room.mark_disconnected(device_id, now_epoch_ms()) {
            self.broadcast(applied);
        }
        self.mark_idle_if_empty();
    }

    fn reap(&mut self) {
        let ttl_ms = self.settings.disconnected_ttl.as_millis() as u64;
        if let Some(applied) = self.room.reap_disconnected(now_epoch_ms(), ttl_ms) {
            tracing::info!(
                room = %self.room.code(),
                seq = applied.seq,
                "Reaped disconnected devices"
            );
            self.broadcast(applied);
        }
    }

    /// Fan `applied` out to every connection. Connections whose buffer is
    /// full are dropped and their devices marked disconnected, which is
    /// itself fanned out.
    fn broadcast(&mut self, applied: Applied) {
        let mut pending = VecDeque::from([applied]);
        while let Some(batch) = pending.pop_front() {
            for device_id in self.fan_out(batch.seq, &batch.events) {
                if let Some(conn) = self.connections.remove(&device_id) {
                    conn.cancel.cancel();
                }
                if let Some(applied) = self.room.mark_disconnected(&device_id, now_epoch_ms()) {
                    pending.push_back(applied);
                }
            }
        }
        self.mark_idle_if_empty();
    }

    fn fan_out(&self, seq: u64, events: &[ServerEvent]) -> Vec<DeviceId> {
        let mut dropped: Vec<DeviceId> = Vec::new();
        for event in events {
            let mut frames = EncodedFrames::default();
            for (device_id, conn) in &self.connections {
                if dropped.contains(device_id) {
                    continue;
                }
                let Some(frame) = frames.get(event, seq, conn.format) else {
                    continue;
                };
                match conn.sender.try_send(frame) {
                    Ok(()) => {},
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            room = %self.room.code(),
                            %device_id,
                            conn_id = %conn.id,
                            "Dropping slow connection"
                        );
                        dropped.push(device_id.clone());
                    },
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!(room = %self.room.code(), %device_id, "Connection already closed");
                        dropped.push(device_id.clone());
                    },
                }
            }
        }
        dropped
    }

    fn mark_idle_if_empty(&mut self) {
        if self.connections.is_empty() && self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
        }
    }

    fn record_placement(&self, device_id: DeviceId, pos: GridPos) {
        let records = Arc::clone(&self.records);
        let party_id = self.room.party_id().to_string();
        let room = self.room.code().to_string();
        tokio::spawn(async move {
            if let Err(e) = records
                .record_device_placement(&party_id, &device_id, pos)
                .await
            {
                tracing::warn!(%room, %device_id, error = %e, "Failed to record placement");
            }
        });
    }

    /// Leave the room table and answer anything still queued.
    async fn retire(self, rx: &mut mpsc::Receiver<RoomCommand>) {
        let code = self.room.code().to_string();
        self.table.write().await.retire(&code, self.generation);
        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            if let RoomCommand::Attach { reply, .. } = cmd {
                let _ = reply.send(Err(HubError::RoomExpired(code.clone())));
            }
        }
        tracing::info!(room = %code, generation = self.generation, "Room retired");
    }
}

/// Per-event cache so each wire format is encoded at most once.
#[derive(Default)]
struct EncodedFrames {
    json: Option<Bytes>,
    msgpack: Option<Bytes>,
}

impl EncodedFrames {
    fn get(&mut self, event: &ServerEvent, seq: u64, format: WireFormat) -> Option<Bytes> {
        let slot = match format {
            WireFormat::Json => &mut self.json,
            WireFormat::Msgpack => &mut self.msgpack,
        };
        if slot.is_none() {
            match encode_server_event(event, Some(seq), format) {
                Ok(data) => *slot = Some(Bytes::from(data)),
                Err(e) => {
                    tracing::error!(seq, error = %e, "Failed to encode event");
                    return None;
                },
            }
        }
        slot.clone()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
