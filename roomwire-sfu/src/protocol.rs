//! Signaling protocol - message types exchanged with clients
//!
//! Requests are JSON objects `{"id": 1, "type": "join-room", ...}` whose
//! fields are camelCase. Every request is answered with exactly one
//! [`Response`] carrying the same id. Room broadcasts are [`ServerEvent`]s and
//! carry no acknowledgement contract.

use crate::error::{ErrorCode, SfuError};
use crate::media::{DtlsParameters, RtpCapabilities, RtpParameters, TransportParameters};
use crate::types::{
    ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client request with its correlation id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub id: u64,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Client-to-server intents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        peer_id: PeerId,
        #[serde(default)]
        display_name: String,
    },
    LeaveRoom,
    GetRouterCapabilities,
    #[serde(rename_all = "camelCase")]
    CreateTransport {
        direction: TransportDirection,
        #[serde(default)]
        room_id: Option<RoomId>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    CloseTransport { transport_id: TransportId },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        room_id: Option<RoomId>,
        #[serde(default)]
        app_data: Value,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        #[serde(default)]
        paused: bool,
    },
    #[serde(rename_all = "camelCase")]
    PauseProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    CloseConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    GetProducers {
        room_id: RoomId,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    HostMuteAll {
        room_id: RoomId,
        except_peer_id: PeerId,
    },
    Ping,
}

impl ClientMessage {
    /// Wire name of the intent, used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom => "leave-room",
            Self::GetRouterCapabilities => "get-router-capabilities",
            Self::CreateTransport { .. } => "create-transport",
            Self::ConnectTransport { .. } => "connect-transport",
            Self::CloseTransport { .. } => "close-transport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::PauseProducer { .. } => "pause-producer",
            Self::ResumeProducer { .. } => "resume-producer",
            Self::CloseProducer { .. } => "close-producer",
            Self::PauseConsumer { .. } => "pause-consumer",
            Self::ResumeConsumer { .. } => "resume-consumer",
            Self::CloseConsumer { .. } => "close-consumer",
            Self::GetProducers { .. } => "get-producers",
            Self::HostMuteAll { .. } => "host-mute-all",
            Self::Ping => "ping",
        }
    }
}

/// Everything the server writes to a client
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(Response),
    Event(ServerEvent),
}

/// Answer to one [`ClientRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success<T: Serialize>(id: u64, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                id,
                ok: true,
                data: Some(value),
                error: None,
            },
            Err(e) => Self::failure(id, &SfuError::Internal(format!("encode response: {e}"))),
        }
    }

    #[must_use]
    pub fn failure(id: u64, err: &SfuError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&SfuError> for ErrorBody {
    fn from(err: &SfuError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Server-initiated notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        peer_id: PeerId,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: ProducerId,
        kind: MediaKind,
        peer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    ProducerPaused {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    ProducerResumed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    #[serde(rename_all = "camelCase")]
    MutedByHost { producer_id: ProducerId },
}

/// Participant roster entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub peer_id: PeerId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

/// A producer visible to other peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub peer_id: PeerId,
    pub paused: bool,
    /// Producer app data, `peerId` always set by the server
    #[serde(default)]
    pub app_data: Value,
}

/// Reply to `join-room`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSnapshot {
    pub room_id: RoomId,
    pub rtp_capabilities: RtpCapabilities,
    pub producers: Vec<ProducerInfo>,
    pub participants: Vec<ParticipantInfo>,
}

/// Reply to `create-transport`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub transport_id: TransportId,
    #[serde(flatten)]
    pub parameters: TransportParameters,
}

/// Reply to `produce`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResult {
    pub producer_id: ProducerId,
}

/// Reply to `consume`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    pub producer_paused: bool,
    /// App data of the consumed producer
    #[serde(default)]
    pub app_data: Value,
}

/// Reply to `host-mute-all`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteAllResult {
    pub muted: usize,
    pub failed: usize,
}

/// Reply to `get-router-capabilities`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilities {
    pub rtp_capabilities: RtpCapabilities,
}

/// Reply to `ping`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub server_time: DateTime<Utc>,
}

/// Empty acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ack {}
