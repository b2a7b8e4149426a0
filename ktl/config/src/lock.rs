use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_ttl() -> Duration {
    Duration::from_secs(60)
}

/// `spec.md` §6 `lock.ttl`, `lock.takeover`.
///
/// Lock renewal is intentionally absent: the core does not heartbeat
/// leases (see the open-question resolution in `SPEC_FULL.md` §9). Callers
/// with long-running stacks should set `ttl` generously or re-acquire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockConfig {
    /// ### lock.ttl {#lock_ttl}
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// ### lock.takeover {#lock_takeover}
    #[serde(default)]
    pub takeover: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            takeover: false,
        }
    }
}

pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_round_trips_through_yaml() {
        let cfg = LockConfig {
            ttl: Duration::from_secs(90),
            takeover: true,
        };
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: LockConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg, back);
    }
}
