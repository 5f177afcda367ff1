//! SFU Room management
//!
//! [`Room`] is the plain state of one meeting: its router, its peers and the
//! registries of transports, producers and consumers. It is owned by exactly
//! one room worker and mutated without locks; every engine call happens in
//! the worker, never in here.
//!
//! Each registry mutation also updates the owning peer's id sets and the
//! process-wide [`EntityIndex`], so the three views never disagree.

use crate::engine::{MediaConsumer, MediaProducer, MediaRouter, MediaTransport};
use crate::error::{Result, SfuError};
use crate::index::EntityIndex;
use crate::media::RtpCapabilities;
use crate::peer::Peer;
use crate::protocol::{ParticipantInfo, ProducerInfo, ServerEvent};
use crate::types::{
    ConnectionId, ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection,
    TransportId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TransportEntry {
    pub transport: Arc<dyn MediaTransport>,
    pub owner: ConnectionId,
    pub direction: TransportDirection,
}

pub struct ProducerEntry {
    pub producer: Arc<dyn MediaProducer>,
    pub owner: ConnectionId,
    /// Server-asserted owning peer
    pub peer_id: PeerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub paused: bool,
    pub app_data: Value,
}

impl ProducerEntry {
    #[must_use]
    pub fn info(&self) -> ProducerInfo {
        ProducerInfo {
            producer_id: self.producer.id(),
            kind: self.kind,
            peer_id: self.peer_id.clone(),
            paused: self.paused,
            app_data: self.app_data.clone(),
        }
    }
}

pub struct ConsumerEntry {
    pub consumer: Arc<dyn MediaConsumer>,
    pub owner: ConnectionId,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub paused: bool,
}

/// Engine handles detached from the registries that still have to be closed
#[derive(Default)]
pub struct Released {
    pub transports: Vec<Arc<dyn MediaTransport>>,
    pub producers: Vec<Arc<dyn MediaProducer>>,
    pub consumers: Vec<Arc<dyn MediaConsumer>>,
    /// Consumers of other peers detached because their producer went away.
    /// They are closed by the engine, which reports each one back.
    pub dependents: usize,
}

impl Released {
    fn absorb(&mut self, other: Self) {
        self.transports.extend(other.transports);
        self.producers.extend(other.producers);
        self.consumers.extend(other.consumers);
        self.dependents += other.dependents;
    }

    /// Close everything at the engine, transports first
    pub async fn close(self) {
        for transport in self.transports {
            transport.close().await;
        }
        for producer in self.producers {
            producer.close().await;
        }
        for consumer in self.consumers {
            consumer.close().await;
        }
    }
}

/// Room statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStats {
    pub peer_count: usize,
    pub transport_count: usize,
    pub audio_producers: usize,
    pub video_producers: usize,
    pub consumer_count: usize,
}

pub struct Room {
    pub id: RoomId,
    router: Arc<dyn MediaRouter>,
    index: Arc<EntityIndex>,
    peers: HashMap<ConnectionId, Peer>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    /// Detached consumers whose owner is told once the engine confirms the close
    consumer_notices: HashMap<ConsumerId, ConnectionId>,
    created_at: DateTime<Utc>,
}

impl Room {
    #[must_use]
    pub fn new(id: RoomId, router: Arc<dyn MediaRouter>, index: Arc<EntityIndex>) -> Self {
        Self {
            id,
            router,
            index,
            peers: HashMap::new(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            consumer_notices: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<dyn MediaRouter> {
        &self.router
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn add_peer(&mut self, peer: Peer) -> Result<()> {
        if self.peers.contains_key(&peer.connection_id) {
            return Err(SfuError::AlreadyJoined(self.id.clone()));
        }
        self.peers.insert(peer.connection_id.clone(), peer);
        Ok(())
    }

    pub fn peer(&self, connection_id: &ConnectionId) -> Result<&Peer> {
        self.peers.get(connection_id).ok_or(SfuError::NotJoined)
    }

    /// Roster of everyone except `connection_id`
    #[must_use]
    pub fn participants(&self, except: &ConnectionId) -> Vec<ParticipantInfo> {
        let mut participants: Vec<_> = self
            .peers
            .values()
            .filter(|peer| &peer.connection_id != except)
            .map(Peer::info)
            .collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        participants
    }

    #[must_use]
    pub fn producer_infos(&self) -> Vec<ProducerInfo> {
        self.producers.values().map(ProducerEntry::info).collect()
    }

    /// Producers not owned by `connection_id` that a receiver with the
    /// given capabilities can decode
    #[must_use]
    pub fn consumable_producers(
        &self,
        connection_id: &ConnectionId,
        capabilities: &RtpCapabilities,
    ) -> Vec<ProducerInfo> {
        self.producers
            .iter()
            .filter(|(_, entry)| &entry.owner != connection_id)
            .filter(|(id, _)| self.router.can_consume(id, capabilities))
            .map(|(_, entry)| entry.info())
            .collect()
    }

    /// Audio producers affected by a host mute, in a stable order
    #[must_use]
    pub fn mutable_audio_producers(&self, except_peer_id: &PeerId) -> Vec<ProducerId> {
        let mut ids: Vec<_> = self
            .producers
            .iter()
            .filter(|(_, entry)| entry.kind == MediaKind::Audio)
            .filter(|(_, entry)| &entry.peer_id != except_peer_id)
            .filter(|(_, entry)| !entry.paused)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Owned transport that carries media in `direction`
    pub fn owned_transport_towards(
        &self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        direction: TransportDirection,
    ) -> Result<&TransportEntry> {
        let entry = self.owned_transport(connection_id, transport_id)?;
        if entry.direction != direction {
            return Err(SfuError::InvalidRequest(format!(
                "transport {transport_id} is a {:?} transport",
                entry.direction
            )));
        }
        Ok(entry)
    }

    /// Transport owned by `connection_id`; foreign transports are reported as missing
    pub fn owned_transport(
        &self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
    ) -> Result<&TransportEntry> {
        self.transports
            .get(transport_id)
            .filter(|entry| &entry.owner == connection_id)
            .ok_or_else(|| SfuError::not_found("transport", transport_id))
    }

    pub fn producer(&self, producer_id: &ProducerId) -> Result<&ProducerEntry> {
        self.producers
            .get(producer_id)
            .ok_or_else(|| SfuError::not_found("producer", producer_id))
    }

    pub fn producer_mut(&mut self, producer_id: &ProducerId) -> Result<&mut ProducerEntry> {
        self.producers
            .get_mut(producer_id)
            .ok_or_else(|| SfuError::not_found("producer", producer_id))
    }

    pub fn owned_producer(
        &self,
        connection_id: &ConnectionId,
        producer_id: &ProducerId,
    ) -> Result<&ProducerEntry> {
        self.producer(producer_id)
            .ok()
            .filter(|entry| &entry.owner == connection_id)
            .ok_or_else(|| SfuError::not_found("producer", producer_id))
    }

    pub fn owned_consumer_mut(
        &mut self,
        connection_id: &ConnectionId,
        consumer_id: &ConsumerId,
    ) -> Result<&mut ConsumerEntry> {
        self.consumers
            .get_mut(consumer_id)
            .filter(|entry| &entry.owner == connection_id)
            .ok_or_else(|| SfuError::not_found("consumer", consumer_id))
    }

    pub fn insert_transport(
        &mut self,
        owner: &ConnectionId,
        direction: TransportDirection,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<TransportId> {
        let id = transport.id();
        let peer = self.peers.get_mut(owner).ok_or(SfuError::NotJoined)?;
        self.index.insert_transport(id.clone(), &self.id)?;

        peer.transport_ids.insert(id.clone());
        self.transports.insert(
            id.clone(),
            TransportEntry {
                transport,
                owner: owner.clone(),
                direction,
            },
        );
        debug!(room_id = %self.id, transport_id = %id, direction = ?direction, "Transport registered");
        Ok(id)
    }

    pub fn insert_producer(
        &mut self,
        owner: &ConnectionId,
        transport_id: TransportId,
        producer: Arc<dyn MediaProducer>,
        app_data: Value,
    ) -> Result<ProducerInfo> {
        let id = producer.id();
        let peer = self.peers.get_mut(owner).ok_or(SfuError::NotJoined)?;
        self.index.insert_producer(id.clone(), &self.id)?;

        peer.producer_ids.insert(id.clone());
        let entry = ProducerEntry {
            kind: producer.kind(),
            producer,
            owner: owner.clone(),
            peer_id: peer.peer_id.clone(),
            transport_id,
            paused: false,
            app_data,
        };
        let info = entry.info();
        self.producers.insert(id.clone(), entry);
        debug!(room_id = %self.id, producer_id = %id, kind = %info.kind, peer_id = %info.peer_id, "Producer registered");
        Ok(info)
    }

    pub fn insert_consumer(
        &mut self,
        owner: &ConnectionId,
        transport_id: TransportId,
        consumer: Arc<dyn MediaConsumer>,
        paused: bool,
    ) -> Result<ConsumerId> {
        let id = consumer.id();
        let peer = self.peers.get_mut(owner).ok_or(SfuError::NotJoined)?;
        self.index.insert_consumer(id.clone(), &self.id)?;

        peer.consumer_ids.insert(id.clone());
        self.consumers.insert(
            id.clone(),
            ConsumerEntry {
                producer_id: consumer.producer_id(),
                consumer,
                owner: owner.clone(),
                transport_id,
                paused,
            },
        );
        debug!(room_id = %self.id, consumer_id = %id, "Consumer registered");
        Ok(id)
    }

    /// Remove one consumer from every registry
    pub fn detach_consumer(&mut self, consumer_id: &ConsumerId) -> Option<ConsumerEntry> {
        let entry = self.consumers.remove(consumer_id)?;
        self.index.remove_consumer(consumer_id);
        if let Some(peer) = self.peers.get_mut(&entry.owner) {
            peer.consumer_ids.remove(consumer_id);
        }
        debug!(room_id = %self.id, consumer_id = %consumer_id, "Consumer removed");
        Some(entry)
    }

    /// Remove a producer and every consumer bound to it.
    ///
    /// The bound consumers are queued for a `consumer-closed` notice that is
    /// sent once the engine reports their close.
    pub fn detach_producer(&mut self, producer_id: &ProducerId) -> Option<ProducerEntry> {
        let entry = self.producers.remove(producer_id)?;
        self.index.remove_producer(producer_id);
        if let Some(peer) = self.peers.get_mut(&entry.owner) {
            peer.producer_ids.remove(producer_id);
        }

        let dependents: Vec<_> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| &consumer.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in dependents {
            if let Some(consumer) = self.detach_consumer(&consumer_id) {
                self.consumer_notices.insert(consumer_id, consumer.owner);
            }
        }

        debug!(room_id = %self.id, producer_id = %producer_id, "Producer removed");
        Some(entry)
    }

    /// Remove a transport together with everything carried on it
    pub fn detach_transport(&mut self, transport_id: &TransportId) -> Option<Released> {
        let entry = self.transports.remove(transport_id)?;
        self.index.remove_transport(transport_id);
        if let Some(peer) = self.peers.get_mut(&entry.owner) {
            peer.transport_ids.remove(transport_id);
        }

        let mut released = Released::default();
        let producers: Vec<_> = self
            .producers
            .iter()
            .filter(|(_, producer)| &producer.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            let before = self.consumer_notices.len();
            if let Some(producer) = self.detach_producer(&producer_id) {
                released.producers.push(producer.producer);
            }
            released.dependents += self.consumer_notices.len() - before;
        }

        let consumers: Vec<_> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| &consumer.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in consumers {
            if let Some(consumer) = self.detach_consumer(&consumer_id) {
                released.consumers.push(consumer.consumer);
            }
        }

        debug!(room_id = %self.id, transport_id = %transport_id, "Transport removed");
        released.transports.push(entry.transport);
        Some(released)
    }

    /// Remove a peer and every resource it owns.
    ///
    /// Consumers of other peers bound to the leaving peer's producers are
    /// removed as well. Pending notices addressed to the leaving peer are
    /// discarded.
    pub fn remove_peer(&mut self, connection_id: &ConnectionId) -> Option<(Peer, Released)> {
        let transport_ids: Vec<_> = self.peers.get(connection_id)?.transport_ids.iter().cloned().collect();

        let mut released = Released::default();
        for transport_id in transport_ids {
            if let Some(part) = self.detach_transport(&transport_id) {
                released.absorb(part);
            }
        }

        // Anything still owned was not carried on one of the peer's transports.
        let leftovers = self
            .peers
            .get(connection_id)
            .filter(|peer| !peer.is_idle())
            .map(|peer| {
                (
                    peer.producer_ids.iter().cloned().collect::<Vec<_>>(),
                    peer.consumer_ids.iter().cloned().collect::<Vec<_>>(),
                )
            });
        if let Some((producer_ids, consumer_ids)) = leftovers {
            warn!(
                room_id = %self.id,
                connection_id = %connection_id,
                producers = producer_ids.len(),
                consumers = consumer_ids.len(),
                "Peer owned resources outside its transports"
            );
            for producer_id in producer_ids {
                if let Some(producer) = self.detach_producer(&producer_id) {
                    released.producers.push(producer.producer);
                }
            }
            for consumer_id in consumer_ids {
                if let Some(consumer) = self.detach_consumer(&consumer_id) {
                    released.consumers.push(consumer.consumer);
                }
            }
        }

        self.consumer_notices.retain(|_, owner| owner != connection_id);

        let peer = self.peers.remove(connection_id)?;
        debug_assert!(peer.is_idle(), "peer removed while still owning resources");
        Some((peer, released))
    }

    /// Owner awaiting a `consumer-closed` notice for `consumer_id`, if any
    pub fn take_consumer_notice(&mut self, consumer_id: &ConsumerId) -> Option<ConnectionId> {
        self.consumer_notices.remove(consumer_id)
    }

    /// Deliver an event to one connection
    pub fn notify(&self, connection_id: &ConnectionId, event: ServerEvent) -> bool {
        self.peers
            .get(connection_id)
            .is_some_and(|peer| peer.notify(event))
    }

    /// Deliver an event to every peer, optionally skipping one connection
    pub fn broadcast(&self, event: &ServerEvent, except: Option<&ConnectionId>) -> usize {
        self.peers
            .values()
            .filter(|peer| Some(&peer.connection_id) != except)
            .filter(|peer| peer.notify(event.clone()))
            .count()
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let audio_producers = self
            .producers
            .values()
            .filter(|p| p.kind == MediaKind::Audio)
            .count();
        RoomStats {
            peer_count: self.peers.len(),
            transport_count: self.transports.len(),
            audio_producers,
            video_producers: self.producers.len() - audio_producers,
            consumer_count: self.consumers.len(),
        }
    }

    /// Release every remaining resource and close the router
    pub async fn close(mut self) {
        let connections: Vec<_> = self.peers.keys().cloned().collect();
        let mut released = Released::default();
        for connection_id in connections {
            if let Some((_, part)) = self.remove_peer(&connection_id) {
                released.absorb(part);
            }
        }
        released.close().await;
        self.router.close().await;
        debug!(
            room_id = %self.id,
            router_id = %self.router.id(),
            lifetime_secs = (Utc::now() - self.created_at).num_seconds(),
            "Router closed"
        );
    }
}
