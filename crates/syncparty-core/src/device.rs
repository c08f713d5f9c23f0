use serde::{Deserialize, Serialize};

/// Stable device identity, supplied by the trusted session context.
pub type DeviceId = String;

/// Maximum length of a device id accepted from a session.
pub const MAX_DEVICE_ID_LEN: usize = 64;

/// Maximum length of a device label.
pub const MAX_LABEL_LEN: usize = 100;

/// A cell on the party grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPos {
    pub x: u32,
    pub y: u32,
}

impl GridPos {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub fn fits(&self, grid_size: u32) -> bool {
        self.x < grid_size && self.y < grid_size
    }
}

/// A device participating in a party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub label: String,
    /// `None` until the device claims a cell.
    pub position: Option<GridPos>,
    pub connected: bool,
    pub is_main_device: bool,
    pub angle_deg: f32,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            position: None,
            connected: true,
            is_main_device: false,
            angle_deg: 0.0,
        }
    }
}

/// Trim and check a label: non-empty, bounded, no control characters.
pub fn sanitize_label(raw: &str) -> Option<String> {
    let label = raw.trim();
    if label.is_empty() || label.chars().count() > MAX_LABEL_LEN {
        return None;
    }
    if label.chars().any(|c| c.is_control()) {
        return None;
    }
    Some(label.to_string())
}

/// Device ids are opaque but must be short printable tokens.
pub fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_DEVICE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'))
}
