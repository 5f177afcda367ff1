//! Roomwire SFU (Selective Forwarding Unit) orchestration
//!
//! This crate implements the room/session layer of an SFU: the in-memory
//! model of rooms, peers, transports, producers and consumers, the signaling
//! protocol that drives their creation and teardown, and the cleanup
//! discipline that keeps the model consistent when participants vanish.
//! Media itself is routed by an external engine behind the [`MediaEngine`]
//! trait family.
//!
//! ## Architecture
//!
//! - **`SignalingGateway`**: process-wide entry point, hands out a `Session`
//!   per connection
//! - **`Session`**: per-connection protocol state machine (unjoined/joined)
//! - **`RoomRegistry`**: room id to room worker, get-or-create and
//!   remove-on-empty
//! - **`Room`**: one meeting, owned by a single worker task that applies
//!   commands in order
//! - **`EntityIndex`**: transport/producer/consumer id to room id
//! - **`MediaEngine`**: collaborator interface; `LocalEngine` is an
//!   in-process loopback implementation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomwire_sfu::{LocalEngine, SfuConfig, SignalingGateway};
//!
//! let gateway = SignalingGateway::new(SfuConfig::default(), Arc::new(LocalEngine::new()));
//! let (mut session, mut events) = gateway.connect();
//! let snapshot = session.join("room".into(), "alice".into(), "Alice".into()).await?;
//! let response = session.handle(request).await;
//! session.disconnect().await;
//! ```

mod config;
pub mod engine;
mod error;
mod gateway;
mod index;
mod media;
mod peer;
pub mod protocol;
mod registry;
mod room;
mod types;
mod worker;

pub use config::SfuConfig;
pub use engine::{EngineEvent, LocalEngine, MediaEngine};
pub use error::{EngineError, ErrorCode, Result, SfuError};
pub use gateway::{Session, SignalingGateway};
pub use index::EntityIndex;
pub use media::{
    default_media_codecs, DtlsParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, TransportParameters,
};
pub use peer::EventSender;
pub use protocol::{ClientMessage, ClientRequest, Response, ServerEvent, ServerMessage};
pub use registry::{RegistryStats, RoomHandle, RoomRegistry};
pub use room::RoomStats;
pub use types::{
    ConnectionId, ConsumerId, MediaKind, PeerId, ProducerId, RoomId, RouterId,
    TransportDirection, TransportId,
};
