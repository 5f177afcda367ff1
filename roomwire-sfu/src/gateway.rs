//! Signaling gateway
//!
//! [`SignalingGateway`] is the process-wide entry point. Every signaling
//! connection gets a [`Session`], the per-connection protocol state machine:
//! unjoined until `join-room` succeeds, then bound to exactly one room until
//! it leaves or disconnects.
//!
//! Requests that name only a transport, producer or consumer are routed
//! through the entity index. An id that lives in a room other than the
//! session's own is reported as not found.

use crate::config::SfuConfig;
use crate::engine::MediaEngine;
use crate::error::{Result, SfuError};
use crate::media::{DtlsParameters, RtpCapabilities, RtpParameters};
use crate::peer::EventSender;
use crate::protocol::{
    Ack, ClientMessage, ClientRequest, ConsumerInfo, JoinSnapshot, MuteAllResult, Pong,
    ProduceResult, ProducerInfo, Response, RouterCapabilities, ServerEvent, TransportInfo,
};
use crate::registry::{RegistryStats, RoomHandle, RoomRegistry};
use crate::types::{
    ConnectionId, ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection,
    TransportId,
};
use crate::worker::RoomCommand;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process-wide signaling entry point
pub struct SignalingGateway {
    registry: Arc<RoomRegistry>,
}

impl SignalingGateway {
    pub fn new(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        Arc::new(Self {
            registry: RoomRegistry::new(config, engine),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Cancelled once the media engine is gone for good
    #[must_use]
    pub fn engine_dead(&self) -> CancellationToken {
        self.registry.engine().dead()
    }

    pub async fn stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    /// Open a session for a new connection.
    ///
    /// Server events for the connection are delivered on the returned receiver.
    pub fn connect(self: &Arc<Self>) -> (Session, mpsc::Receiver<ServerEvent>) {
        let (events, receiver) = mpsc::channel(self.registry.config().peer_event_capacity);
        let session = Session {
            connection_id: ConnectionId::generate(),
            gateway: Arc::clone(self),
            events,
            state: SessionState::Unjoined,
        };
        debug!(connection_id = %session.connection_id, "Session opened");
        (session, receiver)
    }
}

enum SessionState {
    Unjoined,
    /// A join was sent and its outcome is unknown
    Joining { room: RoomHandle },
    Joined { room: RoomHandle, peer_id: PeerId },
}

impl SessionState {
    /// The room a leave has to be sent to, if any
    fn into_room(self) -> Option<RoomHandle> {
        match self {
            Self::Joined { room, .. } | Self::Joining { room } => Some(room),
            Self::Unjoined => None,
        }
    }
}

/// Protocol state of one signaling connection
pub struct Session {
    connection_id: ConnectionId,
    gateway: Arc<SignalingGateway>,
    events: EventSender,
    state: SessionState,
}

impl Session {
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    #[must_use]
    pub fn room_id(&self) -> Option<&RoomId> {
        match &self.state {
            SessionState::Joined { room, .. } => Some(&room.room_id),
            SessionState::Joining { .. } | SessionState::Unjoined => None,
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> Option<&PeerId> {
        match &self.state {
            SessionState::Joined { peer_id, .. } => Some(peer_id),
            SessionState::Joining { .. } | SessionState::Unjoined => None,
        }
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        matches!(self.state, SessionState::Joined { .. })
    }

    fn room(&self) -> Result<&RoomHandle> {
        match &self.state {
            SessionState::Joined { room, .. } => Ok(room),
            SessionState::Joining { .. } | SessionState::Unjoined => Err(SfuError::NotJoined),
        }
    }

    /// The joined room, if `room_id` (when given) names it
    fn room_named(&self, room_id: Option<&RoomId>) -> Result<&RoomHandle> {
        let room = self.room()?;
        match room_id {
            Some(room_id) if room_id != &room.room_id => Err(SfuError::not_found("room", room_id)),
            _ => Ok(room),
        }
    }

    /// The joined room, if the index places the entity in it
    fn room_holding(
        &self,
        located: Option<RoomId>,
        kind: &'static str,
        id: &impl ToString,
    ) -> Result<&RoomHandle> {
        let room = self.room()?;
        match located {
            Some(room_id) if room_id == room.room_id => Ok(room),
            _ => Err(SfuError::not_found(kind, id.to_string())),
        }
    }

    /// Dispatch one wire request and build its response
    pub async fn handle(&mut self, request: ClientRequest) -> Response {
        let id = request.id;
        let name = request.message.name();
        let result = self.dispatch(request.message).await;

        match result {
            Ok(data) => Response::success(id, &data),
            Err(e) => {
                debug!(
                    connection_id = %self.connection_id,
                    request = name,
                    error = %e,
                    "Request failed"
                );
                Response::failure(id, &e)
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<Value> {
        fn encode<T: serde::Serialize>(value: T) -> Result<Value> {
            serde_json::to_value(value)
                .map_err(|e| SfuError::Internal(format!("encode response: {e}")))
        }

        match message {
            ClientMessage::JoinRoom {
                room_id,
                peer_id,
                display_name,
            } => encode(self.join(room_id, peer_id, display_name).await?),
            ClientMessage::LeaveRoom => encode(self.leave().await.map(|()| Ack {})?),
            ClientMessage::GetRouterCapabilities => encode(self.router_capabilities().await?),
            ClientMessage::CreateTransport { direction, room_id } => {
                encode(self.create_transport(direction, room_id.as_ref()).await?)
            }
            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.connect_transport(transport_id, dtls_parameters).await?;
                encode(Ack {})
            }
            ClientMessage::CloseTransport { transport_id } => {
                self.close_transport(transport_id).await?;
                encode(Ack {})
            }
            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
                room_id,
                app_data,
            } => encode(
                self.produce(transport_id, kind, rtp_parameters, room_id.as_ref(), app_data)
                    .await?,
            ),
            ClientMessage::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
                paused,
            } => encode(
                self.consume(transport_id, producer_id, rtp_capabilities, paused)
                    .await?,
            ),
            ClientMessage::PauseProducer { producer_id } => {
                self.pause_producer(producer_id).await?;
                encode(Ack {})
            }
            ClientMessage::ResumeProducer { producer_id } => {
                self.resume_producer(producer_id).await?;
                encode(Ack {})
            }
            ClientMessage::CloseProducer { producer_id } => {
                self.close_producer(producer_id).await?;
                encode(Ack {})
            }
            ClientMessage::PauseConsumer { consumer_id } => {
                self.pause_consumer(consumer_id).await?;
                encode(Ack {})
            }
            ClientMessage::ResumeConsumer { consumer_id } => {
                self.resume_consumer(consumer_id).await?;
                encode(Ack {})
            }
            ClientMessage::CloseConsumer { consumer_id } => {
                self.close_consumer(consumer_id).await?;
                encode(Ack {})
            }
            ClientMessage::GetProducers {
                room_id,
                rtp_capabilities,
            } => encode(self.get_producers(&room_id, rtp_capabilities).await?),
            ClientMessage::HostMuteAll {
                room_id,
                except_peer_id,
            } => encode(self.host_mute_all(&room_id, except_peer_id).await?),
            ClientMessage::Ping => encode(Pong {
                server_time: Utc::now(),
            }),
        }
    }

    /// Join a room, creating it (and its router) if needed.
    ///
    /// A join that races with the room's teardown is replayed against a
    /// fresh room.
    pub async fn join(
        &mut self,
        room_id: RoomId,
        peer_id: PeerId,
        display_name: String,
    ) -> Result<JoinSnapshot> {
        if let SessionState::Joined { room, .. } = &self.state {
            return Err(SfuError::AlreadyJoined(room.room_id.clone()));
        }
        if room_id.as_str().is_empty() || peer_id.as_str().is_empty() {
            return Err(SfuError::InvalidRequest(
                "roomId and peerId must not be empty".to_string(),
            ));
        }

        // An earlier join was abandoned midway and may have gone through.
        if matches!(self.state, SessionState::Joining { .. }) {
            self.leave().await?;
        }

        let registry = Arc::clone(&self.gateway.registry);
        let attempts = registry.config().join_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let room = registry.get_or_create(&room_id)?;
            // Until the reply arrives a leave must still reach this room.
            self.state = SessionState::Joining { room: room.clone() };
            let result = room
                .call(|reply| RoomCommand::Join {
                    connection_id: self.connection_id.clone(),
                    peer_id: peer_id.clone(),
                    display_name: display_name.clone(),
                    events: self.events.clone(),
                    reply,
                })
                .await;

            match result {
                Ok(snapshot) => {
                    self.state = SessionState::Joined { room, peer_id };
                    return Ok(snapshot);
                }
                Err(e) if e.is_room_closed() && attempt < attempts => {
                    self.state = SessionState::Unjoined;
                    debug!(room_id = %room_id, attempt, "Join raced with room teardown, retrying");
                }
                Err(e) => {
                    self.state = SessionState::Unjoined;
                    return Err(e);
                }
            }
        }
    }

    /// Leave the joined room. Leaving while unjoined is a no-op.
    pub async fn leave(&mut self) -> Result<()> {
        let Some(room) = std::mem::replace(&mut self.state, SessionState::Unjoined).into_room()
        else {
            return Ok(());
        };

        let result = room
            .call(|reply| RoomCommand::Leave {
                connection_id: self.connection_id.clone(),
                reply,
            })
            .await;

        match result {
            // The room already tore itself down.
            Err(e) if e.is_room_closed() => Ok(()),
            other => {
                debug!(
                    connection_id = %self.connection_id,
                    room_id = %room.room_id,
                    "Session left room"
                );
                other
            }
        }
    }

    /// Implicit leave on transport loss; idempotent and infallible
    pub async fn disconnect(&mut self) {
        if let Err(e) = self.leave().await {
            warn!(connection_id = %self.connection_id, error = %e, "Cleanup on disconnect failed");
        }
    }

    pub async fn router_capabilities(&self) -> Result<RouterCapabilities> {
        self.room()?
            .call(|reply| RoomCommand::RouterCapabilities {
                connection_id: self.connection_id.clone(),
                reply,
            })
            .await
    }

    pub async fn create_transport(
        &self,
        direction: TransportDirection,
        room_id: Option<&RoomId>,
    ) -> Result<TransportInfo> {
        self.room_named(room_id)?
            .call(|reply| RoomCommand::CreateTransport {
                connection_id: self.connection_id.clone(),
                direction,
                reply,
            })
            .await
    }

    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let located = self.gateway.registry.index().transport_room(&transport_id);
        self.room_holding(located, "transport", &transport_id)?
            .call(|reply| RoomCommand::ConnectTransport {
                connection_id: self.connection_id.clone(),
                transport_id,
                dtls_parameters,
                reply,
            })
            .await
    }

    pub async fn close_transport(&self, transport_id: TransportId) -> Result<()> {
        let located = self.gateway.registry.index().transport_room(&transport_id);
        self.room_holding(located, "transport", &transport_id)?
            .call(|reply| RoomCommand::CloseTransport {
                connection_id: self.connection_id.clone(),
                transport_id,
                reply,
            })
            .await
    }

    pub async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        room_id: Option<&RoomId>,
        app_data: Value,
    ) -> Result<ProduceResult> {
        self.room_named(room_id)?;
        let located = self.gateway.registry.index().transport_room(&transport_id);
        self.room_holding(located, "transport", &transport_id)?
            .call(|reply| RoomCommand::Produce {
                connection_id: self.connection_id.clone(),
                transport_id,
                kind,
                rtp_parameters,
                app_data,
                reply,
            })
            .await
    }

    pub async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo> {
        let index = self.gateway.registry.index();
        self.room_holding(index.transport_room(&transport_id), "transport", &transport_id)?;
        self.room_holding(index.producer_room(&producer_id), "producer", &producer_id)?
            .call(|reply| RoomCommand::Consume {
                connection_id: self.connection_id.clone(),
                transport_id,
                producer_id,
                rtp_capabilities,
                paused,
                reply,
            })
            .await
    }

    pub async fn pause_producer(&self, producer_id: ProducerId) -> Result<()> {
        self.set_producer_paused(producer_id, true).await
    }

    pub async fn resume_producer(&self, producer_id: ProducerId) -> Result<()> {
        self.set_producer_paused(producer_id, false).await
    }

    async fn set_producer_paused(&self, producer_id: ProducerId, paused: bool) -> Result<()> {
        let located = self.gateway.registry.index().producer_room(&producer_id);
        self.room_holding(located, "producer", &producer_id)?
            .call(|reply| RoomCommand::SetProducerPaused {
                connection_id: self.connection_id.clone(),
                producer_id,
                paused,
                reply,
            })
            .await
    }

    pub async fn close_producer(&self, producer_id: ProducerId) -> Result<()> {
        let located = self.gateway.registry.index().producer_room(&producer_id);
        self.room_holding(located, "producer", &producer_id)?
            .call(|reply| RoomCommand::CloseProducer {
                connection_id: self.connection_id.clone(),
                producer_id,
                reply,
            })
            .await
    }

    pub async fn pause_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        self.set_consumer_paused(consumer_id, true).await
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        self.set_consumer_paused(consumer_id, false).await
    }

    async fn set_consumer_paused(&self, consumer_id: ConsumerId, paused: bool) -> Result<()> {
        let located = self.gateway.registry.index().consumer_room(&consumer_id);
        self.room_holding(located, "consumer", &consumer_id)?
            .call(|reply| RoomCommand::SetConsumerPaused {
                connection_id: self.connection_id.clone(),
                consumer_id,
                paused,
                reply,
            })
            .await
    }

    pub async fn close_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        let located = self.gateway.registry.index().consumer_room(&consumer_id);
        self.room_holding(located, "consumer", &consumer_id)?
            .call(|reply| RoomCommand::CloseConsumer {
                connection_id: self.connection_id.clone(),
                consumer_id,
                reply,
            })
            .await
    }

    pub async fn get_producers(
        &self,
        room_id: &RoomId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Vec<ProducerInfo>> {
        self.room_named(Some(room_id))?
            .call(|reply| RoomCommand::GetProducers {
                connection_id: self.connection_id.clone(),
                rtp_capabilities,
                reply,
            })
            .await
    }

    /// Mute every other audio producer in the joined room. Open to any member.
    pub async fn host_mute_all(
        &self,
        room_id: &RoomId,
        except_peer_id: PeerId,
    ) -> Result<MuteAllResult> {
        self.room_named(Some(room_id))?
            .call(|reply| RoomCommand::MuteAll {
                connection_id: self.connection_id.clone(),
                except_peer_id,
                reply,
            })
            .await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(room) = std::mem::replace(&mut self.state, SessionState::Unjoined).into_room()
        else {
            return;
        };

        // Dropped without disconnect(): run the cleanup in the background.
        let connection_id = self.connection_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                info!(
                    connection_id = %connection_id,
                    room_id = %room.room_id,
                    "Session dropped while joined, scheduling cleanup"
                );
                runtime.spawn(async move {
                    let _ = room
                        .call(|reply| RoomCommand::Leave {
                            connection_id,
                            reply,
                        })
                        .await;
                });
            }
            Err(_) => warn!(
                connection_id = %connection_id,
                room_id = %room.room_id,
                "Session dropped outside a runtime, cleanup skipped"
            ),
        }
    }
}
