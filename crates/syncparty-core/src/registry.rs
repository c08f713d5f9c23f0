//! Per-party device roster and grid placement.
//!
//! The registry is plain data: it never performs I/O and never looks at a
//! clock on its own. Every successful mutation appends a [`DeviceChange`]
//! that the owning room drains with [`DeviceRegistry::take_changes`] to
//! build its `device_update` fan-out.

use std::collections::HashMap;

use crate::device::{Device, DeviceId, GridPos};
use crate::error::HubError;

/// Absolute ceiling for grid sizes, regardless of configuration.
pub const MAX_GRID_SIZE: u32 = 64;

/// Grid size used when a party record does not specify one.
pub const DEFAULT_GRID_SIZE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Joined,
    Rejoined,
    Placed,
    Updated,
    Disconnected,
    Removed,
}

/// A record of one device mutation, carrying the device as it is afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceChange {
    pub kind: ChangeKind,
    pub device: Device,
}

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    /// Join order; the first entry is the main device candidate.
    devices: Vec<Device>,
    grid_size: u32,
    max_grid_size: u32,
    max_devices: usize,
    disconnected_since: HashMap<DeviceId, u64>,
    changes: Vec<DeviceChange>,
}

impl DeviceRegistry {
    pub fn new(grid_size: u32, max_grid_size: u32, max_devices: usize) -> Self {
        let max_grid_size = max_grid_size.clamp(1, MAX_GRID_SIZE);
        Self {
            devices: Vec::new(),
            grid_size: grid_size.clamp(1, max_grid_size),
            max_grid_size,
            max_devices: max_devices.max(1),
            disconnected_since: HashMap::new(),
            changes: Vec::new(),
        }
    }

    pub fn grid_size(&self) -> u32 {
        self.grid_size
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.devices.iter().filter(|d| d.connected).count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.iter().any(|d| d.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// The device currently holding `pos`, if any.
    pub fn occupant(&self, pos: GridPos) -> Option<&Device> {
        self.devices.iter().find(|d| d.position == Some(pos))
    }

    /// Ordered snapshot of all devices, in join order.
    pub fn list(&self) -> Vec<Device> {
        self.devices.clone()
    }

    /// Drain the change records produced since the last call.
    pub fn take_changes(&mut self) -> Vec<DeviceChange> {
        std::mem::take(&mut self.changes)
    }

    /// Add a device, or resume an existing one with the same id.
    ///
    /// New devices start unplaced. A returning device keeps its cell and gets
    /// its label refreshed. Returns the device's coordinates.
    pub fn join(&mut self, id: &str, label: &str) -> Result<Option<GridPos>, HubError> {
        if let Some(idx) = self.index_of(id) {
            self.disconnected_since.remove(id);
            let device = &mut self.devices[idx];
            device.connected = true;
            device.label = label.to_string();
            let position = device.position;
            self.record(ChangeKind::Rejoined, idx);
            return Ok(position);
        }

        if self.devices.len() >= self.max_devices {
            return Err(HubError::RoomFull {
                max_devices: self.max_devices,
            });
        }

        let mut device = Device::new(id, label);
        device.is_main_device = !self.devices.iter().any(|d| d.is_main_device);
        self.devices.push(device);
        self.record(ChangeKind::Joined, self.devices.len() - 1);
        Ok(None)
    }

    /// Claim `pos` for device `id`.
    ///
    /// Reclaiming the device's own cell succeeds without moving anything.
    pub fn place(&mut self, id: &str, pos: GridPos) -> Result<(), HubError> {
        let idx = self
            .index_of(id)
            .ok_or_else(|| HubError::NotAMember(id.to_string()))?;
        if !pos.fits(self.grid_size) {
            return Err(HubError::OutOfBounds {
                pos,
                grid_size: self.grid_size,
            });
        }
        if let Some(holder) = self.occupant(pos)
            && holder.id != id
        {
            return Err(HubError::CellOccupied {
                pos,
                holder: holder.id.clone(),
            });
        }

        self.devices[idx].position = Some(pos);
        self.record(ChangeKind::Placed, idx);
        Ok(())
    }

    /// Remove a device. Removing an absent device is not an error.
    pub fn remove(&mut self, id: &str) {
        let Some(idx) = self.index_of(id) else {
            return;
        };
        let mut removed = self.devices.remove(idx);
        self.disconnected_since.remove(id);
        let was_main = removed.is_main_device;
        removed.connected = false;
        removed.is_main_device = false;
        self.changes.push(DeviceChange {
            kind: ChangeKind::Removed,
            device: removed,
        });

        if was_main && !self.devices.is_empty() {
            self.devices[0].is_main_device = true;
            self.record(ChangeKind::Updated, 0);
        }
    }

    /// Change the grid size. Shrinking below an occupied cell is rejected.
    pub fn resize(&mut self, size: u32) -> Result<(), HubError> {
        if size == 0 || size > self.max_grid_size {
            return Err(HubError::invalid(format!(
                "grid size must be between 1 and {}",
                self.max_grid_size
            )));
        }
        let required = self
            .devices
            .iter()
            .filter_map(|d| d.position)
            .map(|p| p.x.max(p.y) + 1)
            .max()
            .unwrap_or(0);
        if size < required {
            return Err(HubError::GridTooSmall {
                requested: size,
                required,
            });
        }
        self.grid_size = size;
        Ok(())
    }

    /// Flip a device's connectivity flag. `now_ms` starts the reap clock.
    pub fn set_connected(&mut self, id: &str, connected: bool, now_ms: u64) -> Result<(), HubError> {
        let idx = self
            .index_of(id)
            .ok_or_else(|| HubError::NotAMember(id.to_string()))?;
        if self.devices[idx].connected == connected {
            return Ok(());
        }
        self.devices[idx].connected = connected;
        if connected {
            self.disconnected_since.remove(id);
            self.record(ChangeKind::Rejoined, idx);
        } else {
            self.disconnected_since.insert(id.to_string(), now_ms);
            self.record(ChangeKind::Disconnected, idx);
        }
        Ok(())
    }

    pub fn set_angle(&mut self, id: &str, angle_deg: f32) -> Result<(), HubError> {
        if !angle_deg.is_finite() {
            return Err(HubError::invalid("angleDeg must be a finite number"));
        }
        let idx = self
            .index_of(id)
            .ok_or_else(|| HubError::NotAMember(id.to_string()))?;
        self.devices[idx].angle_deg = angle_deg.rem_euclid(360.0);
        self.record(ChangeKind::Updated, idx);
        Ok(())
    }

    /// Remove devices that have been disconnected for at least `ttl_ms`.
    pub fn reap_disconnected(&mut self, now_ms: u64, ttl_ms: u64) -> Vec<DeviceId> {
        let expired: Vec<DeviceId> = self
            .disconnected_since
            .iter()
            .filter(|(_, since)| now_ms.saturating_sub(**since) >= ttl_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.id == id)
    }

    fn record(&mut self, kind: ChangeKind, idx: usize) {
        self.changes.push(DeviceChange {
            kind,
            device: self.devices[idx].clone(),
        });
    }
}
