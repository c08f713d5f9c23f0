use crate::device::{DeviceId, GridPos};

/// Every failure the hub reports, to a device or to the HTTP layer.
///
/// The variant name doubles as the stable wire code (see [`HubError::code`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    NotAMember(DeviceId),
    InvalidIntent(String),
    CellOccupied { pos: GridPos, holder: DeviceId },
    OutOfBounds { pos: GridPos, grid_size: u32 },
    GridTooSmall { requested: u32, required: u32 },
    RoomNotFound(String),
    RoomExpired(String),
    RoomFull { max_devices: usize },
    ChannelClosed,
    /// The party record collaborator could not be reached.
    Unavailable(String),
}

impl HubError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAMember(_) => "NotAMember",
            Self::InvalidIntent(_) => "InvalidIntent",
            Self::CellOccupied { .. } => "CellOccupied",
            Self::OutOfBounds { .. } => "OutOfBounds",
            Self::GridTooSmall { .. } => "GridTooSmall",
            Self::RoomNotFound(_) => "RoomNotFound",
            Self::RoomExpired(_) => "RoomExpired",
            Self::RoomFull { .. } => "RoomFull",
            Self::ChannelClosed => "ChannelClosed",
            Self::Unavailable(_) => "Unavailable",
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidIntent(reason.into())
    }
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAMember(id) => write!(f, "device {id} is not a member of this party"),
            Self::InvalidIntent(reason) => write!(f, "invalid intent: {reason}"),
            Self::CellOccupied { pos, holder } => {
                write!(f, "cell ({}, {}) is occupied by {holder}", pos.x, pos.y)
            },
            Self::OutOfBounds { pos, grid_size } => write!(
                f,
                "cell ({}, {}) is outside the {grid_size}x{grid_size} grid",
                pos.x, pos.y
            ),
            Self::GridTooSmall {
                requested,
                required,
            } => write!(
                f,
                "grid size {requested} would evict a device (needs at least {required})"
            ),
            Self::RoomNotFound(code) => write!(f, "party {code} not found"),
            Self::RoomExpired(code) => write!(f, "party {code} has expired"),
            Self::RoomFull { max_devices } => {
                write!(f, "party is full ({max_devices} devices)")
            },
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::Unavailable(reason) => write!(f, "party records unavailable: {reason}"),
        }
    }
}

impl std::error::Error for HubError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(HubError::NotAMember("a".into()).code(), "NotAMember");
        assert_eq!(HubError::invalid("x").code(), "InvalidIntent");
        assert_eq!(
            HubError::GridTooSmall {
                requested: 2,
                required: 4
            }
            .code(),
            "GridTooSmall"
        );
        assert_eq!(HubError::ChannelClosed.code(), "ChannelClosed");
    }

    #[test]
    fn display_mentions_cell() {
        let err = HubError::CellOccupied {
            pos: GridPos { x: 1, y: 2 },
            holder: "dev-a".into(),
        };
        let text = err.to_string();
        assert!(text.contains("(1, 2)"));
        assert!(text.contains("dev-a"));
    }
}
