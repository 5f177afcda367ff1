//! SFU Configuration

use crate::media::{default_media_codecs, RtpCodecCapability};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Capacity of each room's command queue
    pub room_queue_capacity: usize,
    /// Capacity of each connection's outbound event channel
    pub peer_event_capacity: usize,
    /// How many times a join is retried when it races with room teardown
    pub join_attempts: usize,
    /// Seconds a newly started room waits for its first join before retiring
    pub vacant_room_timeout_secs: u64,
    /// Codecs every router is created with
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_peers_per_room: 50,
            room_queue_capacity: 256,
            peer_event_capacity: 256,
            join_attempts: 3,
            vacant_room_timeout_secs: 5,
            media_codecs: default_media_codecs(),
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn vacant_room_timeout(&self) -> Duration {
        Duration::from_secs(self.vacant_room_timeout_secs)
    }

    /// Validate the configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.room_queue_capacity == 0 {
            errors.push("sfu.room_queue_capacity must be greater than 0".to_string());
        }
        if self.peer_event_capacity == 0 {
            errors.push("sfu.peer_event_capacity must be greater than 0".to_string());
        }
        if self.join_attempts == 0 {
            errors.push("sfu.join_attempts must be greater than 0".to_string());
        }
        if self.vacant_room_timeout_secs == 0 {
            errors.push("sfu.vacant_room_timeout_secs must be greater than 0".to_string());
        }
        if self.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must list at least one codec".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SfuConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = SfuConfig {
            room_queue_capacity: 0,
            media_codecs: Vec::new(),
            ..Default::default()
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
