//! Media engine interface
//!
//! The SFU never touches RTP, ICE or DTLS itself. Everything media related is
//! delegated to an engine implementing these traits. Every engine call is
//! treated as potentially suspending.
//!
//! The engine reports teardown it performs on its own (a transport closing
//! takes its producers and consumers with it, a producer closing takes its
//! consumers with it) through the [`EngineEvent`] channel handed to
//! [`MediaEngine::create_router`]. Closes requested through `close()` on an
//! object do not produce an event for that same object.

mod local;

pub use local::LocalEngine;

use crate::error::EngineError;
use crate::media::{
    DtlsParameters, RtpCapabilities, RtpCodecCapability, RtpParameters, TransportParameters,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportDirection, TransportId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Lifecycle notifications delivered to the room that owns a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The engine closed a producer (for example because its transport closed)
    ProducerClosed { producer_id: ProducerId },
    /// The engine closed a consumer because its producer or transport went away
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    /// The transport failed underneath (ICE/DTLS failure); reported after
    /// the producers and consumers it carried
    TransportClosed { transport_id: TransportId },
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Create a router supporting `codecs`; lifecycle events go to `events`
    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
        events: EngineEventSender,
    ) -> EngineResult<Arc<dyn MediaRouter>>;

    /// Token cancelled once the engine is gone for good
    fn dead(&self) -> CancellationToken;
}

#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a receiver with `capabilities` can decode `producer_id`
    fn can_consume(&self, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool;

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> EngineResult<Arc<dyn MediaTransport>>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn parameters(&self) -> TransportParameters;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn close(&self);
}
