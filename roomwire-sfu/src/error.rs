use crate::types::{ProducerId, RoomId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported by the media engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Router error: {0}")]
    Router(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Producer error: {0}")]
    Producer(String),

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("Media engine is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Cannot consume producer {0} with the given capabilities")]
    CapabilityMismatch(ProducerId),

    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Connection has not joined a room")]
    NotJoined,

    #[error("Connection already joined room {0}")]
    AlreadyJoined(RoomId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Room {0} is full")]
    RoomFull(RoomId),

    #[error("Maximum number of rooms reached")]
    RoomLimit,

    #[error("Room {0} is closed")]
    RoomClosed(RoomId),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable error code carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    CapabilityMismatch,
    EngineFailure,
    NotJoined,
    AlreadyJoined,
    InvalidRequest,
    RoomFull,
    RoomLimit,
    RoomClosed,
    Internal,
}

impl SfuError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::CapabilityMismatch(_) => ErrorCode::CapabilityMismatch,
            Self::Engine(_) => ErrorCode::EngineFailure,
            Self::NotJoined => ErrorCode::NotJoined,
            Self::AlreadyJoined(_) => ErrorCode::AlreadyJoined,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::RoomFull(_) => ErrorCode::RoomFull,
            Self::RoomLimit => ErrorCode::RoomLimit,
            Self::RoomClosed(_) => ErrorCode::RoomClosed,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the failure is a lost race with room teardown and the request may be replayed
    #[must_use]
    pub const fn is_room_closed(&self) -> bool {
        matches!(self, Self::RoomClosed(_))
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SfuError::not_found("producer", "p1").code(), ErrorCode::NotFound);
        assert_eq!(
            SfuError::CapabilityMismatch(ProducerId::from("p1")).code(),
            ErrorCode::CapabilityMismatch
        );
        assert_eq!(
            SfuError::from(EngineError::Closed).code(),
            ErrorCode::EngineFailure
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = SfuError::not_found("transport", "t-1");
        assert_eq!(err.to_string(), "transport not found: t-1");
    }

    #[test]
    fn test_error_code_wire_name() {
        let json = serde_json::to_string(&ErrorCode::CapabilityMismatch).unwrap();
        assert_eq!(json, "\"capability_mismatch\"");
    }
}
