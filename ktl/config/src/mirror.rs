use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_heartbeat() -> Duration {
    Duration::from_secs(15)
}

fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_replay_cache_logs() -> usize {
    300
}

const HEARTBEAT_MIN: Duration = Duration::from_secs(1);
const HEARTBEAT_MAX: Duration = Duration::from_secs(5 * 60);

/// `spec.md` §6 mirror settings; §4.4/§4.5 bound the heartbeat cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    /// ### mirror.heartbeat {#mirror_heartbeat}
    ///
    /// Heartbeat cadence while a subscriber is idle. Clamped to `[1s, 5m]`
    /// at load time (`spec.md` §4.4).
    #[serde(default = "default_heartbeat", with = "crate::lock::humantime_serde")]
    pub heartbeat: Duration,

    /// ### mirror.max_body_bytes {#mirror_max_body_bytes}
    ///
    /// Upper bound on a single HTTP request body (export/publish uploads).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    /// ### mirror.replay_cache_logs {#mirror_replay_cache_logs}
    ///
    /// Ring buffer capacity for the replay cache's `logs` slot.
    #[serde(default = "default_replay_cache_logs")]
    pub replay_cache_logs: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            heartbeat: default_heartbeat(),
            max_body_bytes: default_max_body_bytes(),
            replay_cache_logs: default_replay_cache_logs(),
        }
    }
}

impl MirrorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replay_cache_logs == 0 {
            return Err(ConfigError::Invalid {
                field: "mirror.replayCacheLogs".into(),
                detail: "must be >= 1".into(),
            });
        }
        Ok(())
    }

    /// Clamps the configured heartbeat into `[1s, 5m]`, per `spec.md` §4.4.
    pub fn clamped_heartbeat(&self) -> Duration {
        self.heartbeat.clamp(HEARTBEAT_MIN, HEARTBEAT_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_clamps_to_bounds() {
        let mut cfg = MirrorConfig {
            heartbeat: Duration::from_millis(1),
            ..Default::default()
        };
        assert_eq!(cfg.clamped_heartbeat(), HEARTBEAT_MIN);
        cfg.heartbeat = Duration::from_secs(3600);
        assert_eq!(cfg.clamped_heartbeat(), HEARTBEAT_MAX);
    }
}
