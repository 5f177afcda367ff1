//! Per-room worker task
//!
//! Every room is driven by one task that owns the [`Room`] state and handles
//! commands strictly in submission order. Engine calls are awaited inside the
//! worker, so later commands for the same room queue behind them while other
//! rooms keep running.
//!
//! The router is created on the first join. Once the last peer is gone the
//! worker unregisters the room, closes its queue (queued commands fail with
//! `RoomClosed`) and closes the router.

use crate::config::SfuConfig;
use crate::engine::{EngineEvent, EngineEventSender, MediaEngine};
use crate::error::{Result, SfuError};
use crate::index::EntityIndex;
use crate::media::{DtlsParameters, RtpCapabilities, RtpParameters};
use crate::peer::{EventSender, Peer};
use crate::protocol::{
    ConsumerInfo, JoinSnapshot, MuteAllResult, ProduceResult, ProducerInfo, RouterCapabilities,
    ServerEvent, TransportInfo,
};
use crate::registry::RoomRegistry;
use crate::room::{Room, RoomStats};
use crate::types::{
    ConnectionId, ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection,
    TransportId,
};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum RoomCommand {
    Join {
        connection_id: ConnectionId,
        peer_id: PeerId,
        display_name: String,
        events: EventSender,
        reply: Reply<JoinSnapshot>,
    },
    Leave {
        connection_id: ConnectionId,
        reply: Reply<()>,
    },
    RouterCapabilities {
        connection_id: ConnectionId,
        reply: Reply<RouterCapabilities>,
    },
    CreateTransport {
        connection_id: ConnectionId,
        direction: TransportDirection,
        reply: Reply<TransportInfo>,
    },
    ConnectTransport {
        connection_id: ConnectionId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        reply: Reply<()>,
    },
    CloseTransport {
        connection_id: ConnectionId,
        transport_id: TransportId,
        reply: Reply<()>,
    },
    Produce {
        connection_id: ConnectionId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
        reply: Reply<ProduceResult>,
    },
    Consume {
        connection_id: ConnectionId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
        reply: Reply<ConsumerInfo>,
    },
    SetProducerPaused {
        connection_id: ConnectionId,
        producer_id: ProducerId,
        paused: bool,
        reply: Reply<()>,
    },
    CloseProducer {
        connection_id: ConnectionId,
        producer_id: ProducerId,
        reply: Reply<()>,
    },
    SetConsumerPaused {
        connection_id: ConnectionId,
        consumer_id: ConsumerId,
        paused: bool,
        reply: Reply<()>,
    },
    CloseConsumer {
        connection_id: ConnectionId,
        consumer_id: ConsumerId,
        reply: Reply<()>,
    },
    GetProducers {
        connection_id: ConnectionId,
        rtp_capabilities: RtpCapabilities,
        reply: Reply<Vec<ProducerInfo>>,
    },
    MuteAll {
        connection_id: ConnectionId,
        except_peer_id: PeerId,
        reply: Reply<MuteAllResult>,
    },
    Stats {
        reply: Reply<RoomStats>,
    },
}

pub(crate) struct RoomWorker {
    room_id: RoomId,
    epoch: u64,
    registry: Weak<RoomRegistry>,
    engine: Arc<dyn MediaEngine>,
    config: Arc<SfuConfig>,
    index: Arc<EntityIndex>,
    commands: mpsc::Receiver<RoomCommand>,
    engine_tx: EngineEventSender,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    room: Option<Room>,
    retired: bool,
}

/// Record the server-asserted owner in the producer's app data
fn stamp_owner(app_data: Value, peer_id: &PeerId) -> Result<Value> {
    let mut map = match app_data {
        Value::Null => serde_json::Map::new(),
        Value::Object(map) => map,
        _ => {
            return Err(SfuError::InvalidRequest(
                "appData must be an object".to_string(),
            ))
        }
    };
    map.insert("peerId".to_string(), Value::String(peer_id.to_string()));
    Ok(Value::Object(map))
}

impl RoomWorker {
    pub(crate) fn new(
        room_id: RoomId,
        epoch: u64,
        registry: &Arc<RoomRegistry>,
        commands: mpsc::Receiver<RoomCommand>,
    ) -> Self {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        Self {
            room_id,
            epoch,
            registry: Arc::downgrade(registry),
            engine: Arc::clone(registry.engine()),
            config: Arc::clone(registry.config()),
            index: Arc::clone(registry.index()),
            commands,
            engine_tx,
            engine_rx,
            room: None,
            retired: false,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(room_id = %self.room_id, epoch = self.epoch, "Room worker started");

        // A room whose first join never arrives must not hold its slot forever.
        let vacancy = tokio::time::sleep(self.config.vacant_room_timeout());
        tokio::pin!(vacancy);

        while !self.retired {
            tokio::select! {
                biased;
                Some(event) = self.engine_rx.recv() => self.on_engine_event(event).await,
                command = self.commands.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => self.unregister(),
                },
                () = &mut vacancy, if self.room.is_none() => {
                    debug!(room_id = %self.room_id, "Room never received a join, retiring");
                    self.unregister();
                }
            }
        }

        self.shutdown().await;
    }

    async fn dispatch(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join {
                connection_id,
                peer_id,
                display_name,
                events,
                reply,
            } => {
                let result = self
                    .join(connection_id.clone(), peer_id, display_name, events)
                    .await;
                if result.is_ok() && reply.is_closed() {
                    // Nobody will learn about this membership, so nobody would remove it.
                    warn!(
                        room_id = %self.room_id,
                        connection_id = %connection_id,
                        "Join abandoned by its caller, rolling back"
                    );
                    if let Err(e) = self.leave(&connection_id).await {
                        warn!(room_id = %self.room_id, error = %e, "Join rollback failed");
                    }
                }
                self.reply(reply, result);
            }
            RoomCommand::Leave {
                connection_id,
                reply,
            } => {
                let result = self.leave(&connection_id).await;
                self.reply(reply, result);
            }
            RoomCommand::RouterCapabilities {
                connection_id,
                reply,
            } => {
                let result = self.router_capabilities(&connection_id);
                self.reply(reply, result);
            }
            RoomCommand::CreateTransport {
                connection_id,
                direction,
                reply,
            } => {
                let result = self.create_transport(&connection_id, direction).await;
                self.reply(reply, result);
            }
            RoomCommand::ConnectTransport {
                connection_id,
                transport_id,
                dtls_parameters,
                reply,
            } => {
                let result = self
                    .connect_transport(&connection_id, &transport_id, dtls_parameters)
                    .await;
                self.reply(reply, result);
            }
            RoomCommand::CloseTransport {
                connection_id,
                transport_id,
                reply,
            } => {
                let result = self.close_transport(&connection_id, &transport_id).await;
                self.reply(reply, result);
            }
            RoomCommand::Produce {
                connection_id,
                transport_id,
                kind,
                rtp_parameters,
                app_data,
                reply,
            } => {
                let result = self
                    .produce(&connection_id, transport_id, kind, rtp_parameters, app_data)
                    .await;
                self.reply(reply, result);
            }
            RoomCommand::Consume {
                connection_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                paused,
                reply,
            } => {
                let result = self
                    .consume(&connection_id, transport_id, producer_id, &rtp_capabilities, paused)
                    .await;
                self.reply(reply, result);
            }
            RoomCommand::SetProducerPaused {
                connection_id,
                producer_id,
                paused,
                reply,
            } => {
                let result = self
                    .set_producer_paused(&connection_id, &producer_id, paused)
                    .await;
                self.reply(reply, result);
            }
            RoomCommand::CloseProducer {
                connection_id,
                producer_id,
                reply,
            } => {
                let result = self.close_producer(&connection_id, &producer_id).await;
                self.reply(reply, result);
            }
            RoomCommand::SetConsumerPaused {
                connection_id,
                consumer_id,
                paused,
                reply,
            } => {
                let result = self
                    .set_consumer_paused(&connection_id, &consumer_id, paused)
                    .await;
                self.reply(reply, result);
            }
            RoomCommand::CloseConsumer {
                connection_id,
                consumer_id,
                reply,
            } => {
                let result = self.close_consumer(&connection_id, &consumer_id).await;
                self.reply(reply, result);
            }
            RoomCommand::GetProducers {
                connection_id,
                rtp_capabilities,
                reply,
            } => {
                let result = self.get_producers(&connection_id, &rtp_capabilities);
                self.reply(reply, result);
            }
            RoomCommand::MuteAll {
                connection_id,
                except_peer_id,
                reply,
            } => {
                let result = self.mute_all(&connection_id, &except_peer_id).await;
                self.reply(reply, result);
            }
            RoomCommand::Stats { reply } => {
                let stats = self.room.as_ref().map(Room::stats).unwrap_or_default();
                let _ = reply.send(Ok(stats));
            }
        }
    }

    /// Answer a command. An empty room is unregistered first, so the caller
    /// never observes a peerless room in the registry.
    fn reply<T>(&mut self, reply: Reply<T>, result: Result<T>) {
        if self.room.as_ref().map_or(true, Room::is_empty) {
            self.unregister();
        }
        // The caller may have stopped waiting.
        let _ = reply.send(result);
    }

    fn unregister(&mut self) {
        if self.retired {
            return;
        }
        self.retired = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.room_id, self.epoch);
        }
        self.commands.close();
    }

    async fn shutdown(mut self) {
        let mut rejected = 0usize;
        while let Ok(command) = self.commands.try_recv() {
            // Dropping the reply sender fails the caller with RoomClosed.
            drop(command);
            rejected += 1;
        }
        if rejected > 0 {
            debug!(room_id = %self.room_id, rejected, "Rejected commands queued behind room teardown");
        }

        if let Some(room) = self.room.take() {
            room.close().await;
        }
        info!(room_id = %self.room_id, epoch = self.epoch, "Room worker stopped");
    }

    fn room(&self) -> Result<&Room> {
        self.room.as_ref().ok_or(SfuError::NotJoined)
    }

    fn room_mut(&mut self) -> Result<&mut Room> {
        self.room.as_mut().ok_or(SfuError::NotJoined)
    }

    async fn join(
        &mut self,
        connection_id: ConnectionId,
        peer_id: PeerId,
        display_name: String,
        events: EventSender,
    ) -> Result<JoinSnapshot> {
        if self.room.is_none() {
            let router = self
                .engine
                .create_router(&self.config.media_codecs, self.engine_tx.clone())
                .await
                .map_err(|e| {
                    error!(room_id = %self.room_id, error = %e, "Failed to create router");
                    e
                })?;
            info!(room_id = %self.room_id, router_id = %router.id(), "Router created");
            self.room = Some(Room::new(
                self.room_id.clone(),
                router,
                Arc::clone(&self.index),
            ));
        }

        let max_peers = self.config.max_peers_per_room;
        let room = self.room_mut()?;
        if max_peers > 0 && room.peer_count() >= max_peers {
            warn!(
                room_id = %room.id,
                current_peers = room.peer_count(),
                max_peers,
                "Peer limit reached for room"
            );
            return Err(SfuError::RoomFull(room.id.clone()));
        }

        room.add_peer(Peer::new(
            connection_id.clone(),
            peer_id.clone(),
            display_name.clone(),
            events,
        ))?;

        let snapshot = JoinSnapshot {
            room_id: room.id.clone(),
            rtp_capabilities: room.router().rtp_capabilities(),
            producers: room.producer_infos(),
            participants: room.participants(&connection_id),
        };
        room.broadcast(
            &ServerEvent::ParticipantJoined {
                peer_id: peer_id.clone(),
                display_name,
            },
            Some(&connection_id),
        );

        info!(
            room_id = %room.id,
            peer_id = %peer_id,
            connection_id = %connection_id,
            peer_count = room.peer_count(),
            "Peer joined room"
        );
        Ok(snapshot)
    }

    /// Tear down everything the connection owns. Unknown connections are a no-op.
    async fn leave(&mut self, connection_id: &ConnectionId) -> Result<()> {
        let Some(room) = self.room.as_mut() else {
            return Ok(());
        };
        let Ok(peer) = room.peer(connection_id) else {
            return Ok(());
        };

        let transports: Vec<_> = peer
            .transport_ids
            .iter()
            .filter_map(|id| room.owned_transport(connection_id, id).ok())
            .map(|entry| Arc::clone(&entry.transport))
            .collect();
        for transport in &transports {
            transport.close().await;
        }

        let Some((peer, released)) = room.remove_peer(connection_id) else {
            return Ok(());
        };
        let dependents = released.dependents;
        released.close().await;

        room.broadcast(
            &ServerEvent::ParticipantLeft {
                peer_id: peer.peer_id.clone(),
            },
            None,
        );

        info!(
            room_id = %room.id,
            peer_id = %peer.peer_id,
            connection_id = %connection_id,
            transports = transports.len(),
            dependents,
            remaining_peers = room.peer_count(),
            "Peer left room"
        );
        Ok(())
    }

    fn router_capabilities(&self, connection_id: &ConnectionId) -> Result<RouterCapabilities> {
        let room = self.room()?;
        room.peer(connection_id)?;
        Ok(RouterCapabilities {
            rtp_capabilities: room.router().rtp_capabilities(),
        })
    }

    async fn create_transport(
        &mut self,
        connection_id: &ConnectionId,
        direction: TransportDirection,
    ) -> Result<TransportInfo> {
        let room = self.room_mut()?;
        room.peer(connection_id)?;

        let transport = room.router().create_transport(direction).await?;
        let info = TransportInfo {
            transport_id: transport.id(),
            parameters: transport.parameters(),
        };
        if let Err(e) = room.insert_transport(connection_id, direction, Arc::clone(&transport)) {
            transport.close().await;
            return Err(e);
        }

        debug!(
            room_id = %room.id,
            connection_id = %connection_id,
            transport_id = %info.transport_id,
            "Transport created"
        );
        Ok(info)
    }

    async fn connect_transport(
        &mut self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let room = self.room()?;
        let transport = Arc::clone(&room.owned_transport(connection_id, transport_id)?.transport);
        transport.connect(dtls_parameters).await?;
        debug!(room_id = %room.id, transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    async fn close_transport(
        &mut self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
    ) -> Result<()> {
        let room = self.room_mut()?;
        room.owned_transport(connection_id, transport_id)?;
        let released = room
            .detach_transport(transport_id)
            .ok_or_else(|| SfuError::not_found("transport", transport_id))?;
        released.close().await;
        debug!(room_id = %room.id, transport_id = %transport_id, "Transport closed");
        Ok(())
    }

    async fn produce(
        &mut self,
        connection_id: &ConnectionId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<ProduceResult> {
        let room = self.room_mut()?;
        let transport = Arc::clone(
            &room
                .owned_transport_towards(connection_id, &transport_id, TransportDirection::Send)?
                .transport,
        );
        let peer_id = room.peer(connection_id)?.peer_id.clone();
        let app_data = stamp_owner(app_data, &peer_id)?;

        let producer = transport.produce(kind, rtp_parameters).await?;
        let info = match room.insert_producer(
            connection_id,
            transport_id,
            Arc::clone(&producer),
            app_data,
        ) {
            Ok(info) => info,
            Err(e) => {
                producer.close().await;
                return Err(e);
            }
        };

        room.broadcast(
            &ServerEvent::NewProducer {
                producer_id: info.producer_id.clone(),
                kind: info.kind,
                peer_id: info.peer_id.clone(),
            },
            Some(connection_id),
        );

        info!(
            room_id = %room.id,
            peer_id = %peer_id,
            producer_id = %info.producer_id,
            kind = %info.kind,
            "Producer created"
        );
        Ok(ProduceResult {
            producer_id: info.producer_id,
        })
    }

    async fn consume(
        &mut self,
        connection_id: &ConnectionId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo> {
        let room = self.room_mut()?;
        let transport = Arc::clone(
            &room
                .owned_transport_towards(connection_id, &transport_id, TransportDirection::Recv)?
                .transport,
        );
        let (producer_peer, producer_paused, app_data) = {
            let producer = room.producer(&producer_id)?;
            (producer.peer_id.clone(), producer.paused, producer.app_data.clone())
        };

        if !room.router().can_consume(&producer_id, rtp_capabilities) {
            debug!(
                room_id = %room.id,
                producer_id = %producer_id,
                connection_id = %connection_id,
                "Consume rejected: capabilities cannot decode producer"
            );
            return Err(SfuError::CapabilityMismatch(producer_id));
        }

        let consumer = transport
            .consume(&producer_id, rtp_capabilities, paused)
            .await?;
        let info = ConsumerInfo {
            consumer_id: consumer.id(),
            producer_id,
            peer_id: producer_peer,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            paused,
            producer_paused,
            app_data,
        };
        if let Err(e) = room.insert_consumer(connection_id, transport_id, Arc::clone(&consumer), paused) {
            consumer.close().await;
            return Err(e);
        }

        debug!(
            room_id = %room.id,
            consumer_id = %info.consumer_id,
            producer_id = %info.producer_id,
            "Consumer created"
        );
        Ok(info)
    }

    async fn set_producer_paused(
        &mut self,
        connection_id: &ConnectionId,
        producer_id: &ProducerId,
        paused: bool,
    ) -> Result<()> {
        let room = self.room_mut()?;
        room.peer(connection_id)?;
        let producer = Arc::clone(&room.producer(producer_id)?.producer);

        if paused {
            producer.pause().await?;
        } else {
            producer.resume().await?;
        }

        let entry = room.producer_mut(producer_id)?;
        entry.paused = paused;
        let peer_id = entry.peer_id.clone();
        let event = if paused {
            ServerEvent::ProducerPaused {
                producer_id: producer_id.clone(),
                peer_id,
            }
        } else {
            ServerEvent::ProducerResumed {
                producer_id: producer_id.clone(),
                peer_id,
            }
        };
        room.broadcast(&event, None);

        debug!(room_id = %room.id, producer_id = %producer_id, paused, "Producer pause state changed");
        Ok(())
    }

    async fn close_producer(
        &mut self,
        connection_id: &ConnectionId,
        producer_id: &ProducerId,
    ) -> Result<()> {
        let room = self.room_mut()?;
        room.owned_producer(connection_id, producer_id)?;
        let entry = room
            .detach_producer(producer_id)
            .ok_or_else(|| SfuError::not_found("producer", producer_id))?;
        entry.producer.close().await;

        info!(
            room_id = %room.id,
            peer_id = %entry.peer_id,
            producer_id = %producer_id,
            "Producer closed"
        );
        Ok(())
    }

    async fn set_consumer_paused(
        &mut self,
        connection_id: &ConnectionId,
        consumer_id: &ConsumerId,
        paused: bool,
    ) -> Result<()> {
        let room = self.room_mut()?;
        let consumer = Arc::clone(&room.owned_consumer_mut(connection_id, consumer_id)?.consumer);

        if paused {
            consumer.pause().await?;
        } else {
            consumer.resume().await?;
        }

        room.owned_consumer_mut(connection_id, consumer_id)?.paused = paused;
        Ok(())
    }

    async fn close_consumer(
        &mut self,
        connection_id: &ConnectionId,
        consumer_id: &ConsumerId,
    ) -> Result<()> {
        let room = self.room_mut()?;
        room.owned_consumer_mut(connection_id, consumer_id)?;
        let entry = room
            .detach_consumer(consumer_id)
            .ok_or_else(|| SfuError::not_found("consumer", consumer_id))?;
        entry.consumer.close().await;
        debug!(room_id = %room.id, consumer_id = %consumer_id, "Consumer closed");
        Ok(())
    }

    fn get_producers(
        &self,
        connection_id: &ConnectionId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Vec<ProducerInfo>> {
        let room = self.room()?;
        room.peer(connection_id)?;
        Ok(room.consumable_producers(connection_id, rtp_capabilities))
    }

    /// Pause every audio producer not owned by `except_peer_id`.
    ///
    /// Each owner receives `muted-by-host`; everyone else receives
    /// `producer-paused`. Failures are counted and never abort the batch.
    /// Rooms have no roles, so any joined peer of this room may call it.
    async fn mute_all(
        &mut self,
        connection_id: &ConnectionId,
        except_peer_id: &PeerId,
    ) -> Result<MuteAllResult> {
        let room = self.room_mut()?;
        room.peer(connection_id)?;

        let mut result = MuteAllResult::default();
        for producer_id in room.mutable_audio_producers(except_peer_id) {
            let Ok(entry) = room.producer(&producer_id) else {
                continue;
            };
            let producer = Arc::clone(&entry.producer);

            if let Err(e) = producer.pause().await {
                warn!(
                    room_id = %room.id,
                    producer_id = %producer_id,
                    error = %e,
                    "Failed to mute producer"
                );
                result.failed += 1;
                continue;
            }

            let Ok(entry) = room.producer_mut(&producer_id) else {
                continue;
            };
            entry.paused = true;
            let owner = entry.owner.clone();
            let peer_id = entry.peer_id.clone();

            room.notify(
                &owner,
                ServerEvent::MutedByHost {
                    producer_id: producer_id.clone(),
                },
            );
            room.broadcast(
                &ServerEvent::ProducerPaused {
                    producer_id,
                    peer_id,
                },
                Some(&owner),
            );
            result.muted += 1;
        }

        info!(
            room_id = %room.id,
            except_peer_id = %except_peer_id,
            muted = result.muted,
            failed = result.failed,
            "Host muted audio producers"
        );
        Ok(result)
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        let Some(room) = self.room.as_mut() else {
            return;
        };

        match event {
            EngineEvent::ConsumerClosed {
                consumer_id,
                producer_id,
            } => {
                let owner = match room.take_consumer_notice(&consumer_id) {
                    Some(owner) => Some(owner),
                    None => room.detach_consumer(&consumer_id).map(|entry| entry.owner),
                };
                if let Some(owner) = owner {
                    debug!(
                        room_id = %room.id,
                        consumer_id = %consumer_id,
                        producer_id = %producer_id,
                        "Consumer closed by media engine"
                    );
                    room.notify(
                        &owner,
                        ServerEvent::ConsumerClosed {
                            consumer_id,
                            producer_id,
                        },
                    );
                }
            }
            EngineEvent::ProducerClosed { producer_id } => {
                if let Some(entry) = room.detach_producer(&producer_id) {
                    info!(
                        room_id = %room.id,
                        producer_id = %producer_id,
                        peer_id = %entry.peer_id,
                        "Producer closed by media engine"
                    );
                    room.broadcast(
                        &ServerEvent::ProducerClosed {
                            producer_id,
                            peer_id: entry.peer_id,
                        },
                        None,
                    );
                }
            }
            EngineEvent::TransportClosed { transport_id } => {
                if let Some(released) = room.detach_transport(&transport_id) {
                    warn!(
                        room_id = %room.id,
                        transport_id = %transport_id,
                        "Transport closed by media engine"
                    );
                    released.close().await;
                }
            }
        }
    }
}
