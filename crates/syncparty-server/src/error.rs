use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use syncparty_core::error::HubError;

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    TooManyRequests(String),
    Hub(HubError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Hub(e) => match e {
                HubError::RoomNotFound(_) => StatusCode::NOT_FOUND,
                HubError::RoomExpired(_) => StatusCode::GONE,
                HubError::NotAMember(_) => StatusCode::FORBIDDEN,
                HubError::CellOccupied { .. }
                | HubError::GridTooSmall { .. }
                | HubError::RoomFull { .. } => StatusCode::CONFLICT,
                HubError::ChannelClosed | HubError::Unavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                },
                HubError::InvalidIntent(_) | HubError::OutOfBounds { .. } => {
                    StatusCode::BAD_REQUEST
                },
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::Unauthorized(_) => "Unauthorized",
            Self::TooManyRequests(_) => "TooManyRequests",
            Self::Hub(e) => e.code(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(m) | Self::Unauthorized(m) | Self::TooManyRequests(m) => {
                write!(f, "{m}")
            },
            Self::Hub(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<HubError> for AppError {
    fn from(e: HubError) -> Self {
        Self::Hub(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "error": self.to_string(), "code": self.code() });
        (status, Json(body)).into_response()
    }
}
