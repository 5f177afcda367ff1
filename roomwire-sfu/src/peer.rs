//! SFU Peer
//!
//! A peer is one connected participant inside a room. It owns the ids of the
//! transports, producers and consumers it created; the entities themselves
//! live in the room's registries.

use crate::protocol::{ParticipantInfo, ServerEvent};
use crate::types::{ConnectionId, ConsumerId, PeerId, ProducerId, TransportId};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound event channel of one connection
pub type EventSender = mpsc::Sender<ServerEvent>;

pub struct Peer {
    /// Identity of the signaling connection
    pub connection_id: ConnectionId,

    /// Caller-supplied logical identity
    pub peer_id: PeerId,

    pub display_name: String,

    pub joined_at: DateTime<Utc>,

    pub transport_ids: HashSet<TransportId>,
    pub producer_ids: HashSet<ProducerId>,
    pub consumer_ids: HashSet<ConsumerId>,

    events: EventSender,
}

impl Peer {
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        peer_id: PeerId,
        display_name: String,
        events: EventSender,
    ) -> Self {
        Self {
            connection_id,
            peer_id,
            display_name,
            joined_at: Utc::now(),
            transport_ids: HashSet::new(),
            producer_ids: HashSet::new(),
            consumer_ids: HashSet::new(),
            events,
        }
    }

    /// Try to deliver an event to this peer.
    /// Returns false if the channel is full (slow client) or closed.
    pub fn notify(&self, event: ServerEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    peer_id = %self.peer_id,
                    connection_id = %self.connection_id,
                    event = ?event,
                    "Event channel full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    #[must_use]
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            joined_at: self.joined_at,
        }
    }

    /// Whether the peer still owns any media resource
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.transport_ids.is_empty() && self.producer_ids.is_empty() && self.consumer_ids.is_empty()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        debug!(
            peer_id = %self.peer_id,
            connection_id = %self.connection_id,
            "Peer dropped"
        );
    }
}
