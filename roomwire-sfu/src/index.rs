//! Process-wide entity index
//!
//! Maps every live transport, producer and consumer id to the room that owns
//! it, so a request naming only an id is routed to one room without scanning
//! them all. Entries are written and removed by the owning room together with
//! its own registries. Inserting an id that is already indexed fails, which
//! keeps ids globally unique.

use crate::error::{Result, SfuError};
use crate::types::{ConsumerId, ProducerId, RoomId, TransportId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;

#[derive(Default)]
pub struct EntityIndex {
    transports: DashMap<TransportId, RoomId>,
    producers: DashMap<ProducerId, RoomId>,
    consumers: DashMap<ConsumerId, RoomId>,
}

fn claim<K>(map: &DashMap<K, RoomId>, kind: &'static str, id: K, room_id: &RoomId) -> Result<()>
where
    K: Eq + Hash + std::fmt::Display,
{
    match map.entry(id) {
        Entry::Occupied(entry) => Err(SfuError::Internal(format!(
            "duplicate {kind} id {} (owned by room {})",
            entry.key(),
            entry.get()
        ))),
        Entry::Vacant(entry) => {
            entry.insert(room_id.clone());
            Ok(())
        }
    }
}

impl EntityIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_transport(&self, id: TransportId, room_id: &RoomId) -> Result<()> {
        claim(&self.transports, "transport", id, room_id)
    }

    pub fn insert_producer(&self, id: ProducerId, room_id: &RoomId) -> Result<()> {
        claim(&self.producers, "producer", id, room_id)
    }

    pub fn insert_consumer(&self, id: ConsumerId, room_id: &RoomId) -> Result<()> {
        claim(&self.consumers, "consumer", id, room_id)
    }

    pub fn remove_transport(&self, id: &TransportId) {
        self.transports.remove(id);
    }

    pub fn remove_producer(&self, id: &ProducerId) {
        self.producers.remove(id);
    }

    pub fn remove_consumer(&self, id: &ConsumerId) {
        self.consumers.remove(id);
    }

    #[must_use]
    pub fn transport_room(&self, id: &TransportId) -> Option<RoomId> {
        self.transports.get(id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn producer_room(&self, id: &ProducerId) -> Option<RoomId> {
        self.producers.get(id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn consumer_room(&self, id: &ConsumerId) -> Option<RoomId> {
        self.consumers.get(id).map(|entry| entry.value().clone())
    }

    /// Total number of indexed entities
    #[must_use]
    pub fn len(&self) -> usize {
        self.transports.len() + self.producers.len() + self.consumers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
