//! Room registry - process-wide map of live rooms
//!
//! This module provides:
//! - Get-or-create of rooms, serialized per room id
//! - Room limit enforcement
//! - Removal of a room exactly once, by its own worker, when it empties
//! - Global statistics collection

use crate::config::SfuConfig;
use crate::engine::MediaEngine;
use crate::error::{Result, SfuError};
use crate::index::EntityIndex;
use crate::room::RoomStats;
use crate::types::RoomId;
use crate::worker::{RoomCommand, RoomWorker};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Global registry statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of active rooms
    pub active_rooms: usize,
    /// Total number of peers across all rooms
    pub total_peers: usize,
    pub total_transports: usize,
    /// Total number of audio producers
    pub total_audio_producers: usize,
    /// Total number of video producers
    pub total_video_producers: usize,
    pub total_consumers: usize,
}

/// Cheap, cloneable address of one room worker
#[derive(Clone)]
pub struct RoomHandle {
    pub room_id: RoomId,
    /// Distinguishes successive rooms that reuse the same id
    pub epoch: u64,
    commands: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Send a command and wait for its reply.
    ///
    /// A worker that retired before answering yields [`SfuError::RoomClosed`].
    pub(crate) async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> RoomCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SfuError::RoomClosed(self.room_id.clone()))?;
        response
            .await
            .map_err(|_| SfuError::RoomClosed(self.room_id.clone()))?
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Room registry - owns every live room worker
pub struct RoomRegistry {
    config: Arc<SfuConfig>,
    engine: Arc<dyn MediaEngine>,
    index: Arc<EntityIndex>,

    /// Active rooms (DashMap gives per-shard locking for concurrent access)
    rooms: DashMap<RoomId, RoomHandle>,

    /// Rooms counted against `max_rooms`; claimed under the entry lock
    occupied: AtomicUsize,

    next_epoch: AtomicU64,
}

impl RoomRegistry {
    pub fn new(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        let registry = Arc::new(Self {
            config: Arc::new(config),
            engine,
            index: Arc::new(EntityIndex::new()),
            rooms: DashMap::new(),
            occupied: AtomicUsize::new(0),
            next_epoch: AtomicU64::new(1),
        });

        info!(
            max_rooms = registry.config.max_rooms,
            max_peers_per_room = registry.config.max_peers_per_room,
            codecs = registry.config.media_codecs.len(),
            "Room registry initialized"
        );

        registry
    }

    #[must_use]
    pub fn config(&self) -> &Arc<SfuConfig> {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    #[must_use]
    pub fn index(&self) -> &Arc<EntityIndex> {
        &self.index
    }

    /// Get the live room for `room_id`, starting its worker if there is none.
    ///
    /// Concurrent callers for the same id always receive the same handle.
    /// The router itself is created by the worker on the first join.
    pub fn get_or_create(self: &Arc<Self>, room_id: &RoomId) -> Result<RoomHandle> {
        if let Some(handle) = self.get(room_id) {
            debug!(room_id = %room_id, "Room already exists");
            return Ok(handle);
        }

        let (handle, worker) = match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), None),
            Entry::Vacant(entry) => {
                if !self.claim_slot() {
                    warn!(
                        room_id = %room_id,
                        max_rooms = self.config.max_rooms,
                        "Room limit reached"
                    );
                    return Err(SfuError::RoomLimit);
                }
                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                let (commands, receiver) = mpsc::channel(self.config.room_queue_capacity);
                let handle = RoomHandle {
                    room_id: room_id.clone(),
                    epoch,
                    commands,
                };
                entry.insert(handle.clone());
                let worker = RoomWorker::new(room_id.clone(), epoch, self, receiver);
                (handle, Some(worker))
            }
        };

        if let Some(worker) = worker {
            tokio::spawn(worker.run());
            info!(
                room_id = %room_id,
                epoch = handle.epoch,
                total_rooms = self.rooms.len(),
                "Created new room"
            );
        }

        Ok(handle)
    }

    /// Count one more room unless that would exceed `max_rooms`
    fn claim_slot(&self) -> bool {
        let max_rooms = self.config.max_rooms;
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (max_rooms == 0 || current < max_rooms).then_some(current + 1)
            })
            .is_ok()
    }

    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.rooms.get(room_id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Remove the room registered under `room_id` if it is still the given
    /// epoch. Returns whether an entry was removed.
    pub(crate) fn remove(&self, room_id: &RoomId, epoch: u64) -> bool {
        let removed = self
            .rooms
            .remove_if(room_id, |_, handle| handle.epoch == epoch)
            .is_some();
        if removed {
            self.occupied.fetch_sub(1, Ordering::AcqRel);
            info!(
                room_id = %room_id,
                epoch,
                remaining_rooms = self.rooms.len(),
                "Removed room"
            );
        }
        removed
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Per-room statistics; rooms closing during collection are skipped
    pub async fn room_stats(&self, room_id: &RoomId) -> Option<RoomStats> {
        let handle = self.get(room_id)?;
        handle
            .call(|reply| RoomCommand::Stats { reply })
            .await
            .ok()
    }

    /// Collect statistics from every live room
    pub async fn stats(&self) -> RegistryStats {
        let handles: Vec<_> = self.rooms.iter().map(|entry| entry.value().clone()).collect();

        let mut stats = RegistryStats::default();
        for handle in handles {
            let Ok(room) = handle.call(|reply| RoomCommand::Stats { reply }).await else {
                continue;
            };
            stats.active_rooms += 1;
            stats.total_peers += room.peer_count;
            stats.total_transports += room.transport_count;
            stats.total_audio_producers += room.audio_producers;
            stats.total_video_producers += room.video_producers;
            stats.total_consumers += room.consumer_count;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use std::time::Duration;

    fn registry(config: SfuConfig) -> Arc<RoomRegistry> {
        RoomRegistry::new(config, Arc::new(LocalEngine::new()))
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = registry(SfuConfig::default());
        let room_id = RoomId::from("room1");

        let first = registry.get_or_create(&room_id).unwrap();
        let second = registry.get_or_create(&room_id).unwrap();
        assert_eq!(first.epoch, second.epoch);
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create() {
        let registry = registry(SfuConfig::default());
        let room_id = RoomId::from("room1");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let room_id = room_id.clone();
            tasks.push(tokio::spawn(async move {
                registry.get_or_create(&room_id).unwrap().epoch
            }));
        }

        let mut epochs = Vec::new();
        for task in tasks {
            epochs.push(task.await.unwrap());
        }
        epochs.dedup();
        assert_eq!(epochs.len(), 1);
    }

    #[tokio::test]
    async fn test_room_limit() {
        let registry = registry(SfuConfig {
            max_rooms: 2,
            ..Default::default()
        });

        registry.get_or_create(&RoomId::from("a")).unwrap();
        registry.get_or_create(&RoomId::from("b")).unwrap();
        let err = registry.get_or_create(&RoomId::from("c")).err().unwrap();
        assert!(matches!(err, SfuError::RoomLimit));

        // Existing rooms stay reachable at the limit
        assert!(registry.get_or_create(&RoomId::from("a")).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_room_limit_holds_under_concurrent_creates() {
        let registry = registry(SfuConfig {
            max_rooms: 3,
            ..Default::default()
        });

        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.get_or_create(&RoomId::from(format!("room{i}"))).is_ok()
            }));
        }
        let mut created = 0;
        for task in tasks {
            if task.await.unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 3);
        assert_eq!(registry.room_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_without_join_retires() {
        let config = SfuConfig::default();
        let grace = config.vacant_room_timeout();
        let registry = registry(SfuConfig {
            max_rooms: 1,
            ..config
        });
        let room_id = RoomId::from("room1");
        registry.get_or_create(&room_id).unwrap();

        tokio::time::sleep(grace + Duration::from_secs(1)).await;

        assert!(!registry.contains(&room_id));
        // The slot is free again
        assert!(registry.get_or_create(&RoomId::from("room2")).is_ok());
    }

    #[tokio::test]
    async fn test_remove_checks_epoch() {
        let registry = registry(SfuConfig::default());
        let room_id = RoomId::from("room1");
        let handle = registry.get_or_create(&room_id).unwrap();

        assert!(!registry.remove(&room_id, handle.epoch + 1));
        assert!(registry.contains(&room_id));
        assert!(registry.remove(&room_id, handle.epoch));
        assert!(!registry.contains(&room_id));
    }

    #[tokio::test]
    async fn test_stats_empty() {
        let registry = registry(SfuConfig::default());
        assert_eq!(registry.stats().await, RegistryStats::default());
    }
}
