use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_concurrency() -> usize {
    4
}

fn default_parallelism_group_limit() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    1
}

/// Scheduler-facing configuration surface (`spec.md` §6).
///
/// `adaptive` consolidates what the original source exposed as two separate
/// flags ("progressive concurrency" and "adaptive concurrency") into one
/// surface, per the open-question resolution in `SPEC_FULL.md` §9.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// ### concurrency {#concurrency}
    ///
    /// Initial worker pool size. Must be at least 1.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// ### fail_mode {#fail_mode}
    ///
    /// `fail-fast` stops admitting new nodes after the first non-cancel
    /// error; `continue` keeps independent subgraphs running.
    #[serde(default)]
    pub fail_mode: FailModeConfig,

    /// ### max_concurrency_per_namespace {#max_concurrency_per_namespace}
    ///
    /// Caps the number of concurrently running nodes per namespace. `0`
    /// disables the cap (the default).
    #[serde(default)]
    pub max_concurrency_per_namespace: usize,

    /// ### max_concurrency_by_kind {#max_concurrency_by_kind}
    ///
    /// Per-workload-kind concurrency caps, e.g. `{"StatefulSet": 1}`. Kinds
    /// absent from the map are uncapped.
    #[serde(default)]
    pub max_concurrency_by_kind: BTreeMap<String, usize>,

    /// ### parallelism_group_limit {#parallelism_group_limit}
    ///
    /// Default permit count for any parallelism group that doesn't specify
    /// its own limit. Must be at least 1.
    #[serde(default = "default_parallelism_group_limit")]
    pub parallelism_group_limit: usize,

    /// ### adaptive {#adaptive}
    ///
    /// Adaptive concurrency controller (`spec.md` §4.7). `None` disables
    /// it; the worker pool then stays fixed at `concurrency`.
    #[serde(default)]
    pub adaptive: Option<AdaptiveConcurrencyConfig>,

    /// ### max_attempts {#max_attempts}
    ///
    /// Maximum attempts per node, including the first. `1` means no retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            fail_mode: FailModeConfig::default(),
            max_concurrency_per_namespace: 0,
            max_concurrency_by_kind: BTreeMap::new(),
            parallelism_group_limit: default_parallelism_group_limit(),
            adaptive: None,
            max_attempts: default_max_attempts(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency < 1 {
            return Err(ConfigError::Invalid {
                field: "concurrency".into(),
                detail: "must be >= 1".into(),
            });
        }
        if self.parallelism_group_limit < 1 {
            return Err(ConfigError::Invalid {
                field: "parallelismGroupLimit".into(),
                detail: "must be >= 1".into(),
            });
        }
        if self.max_attempts < 1 {
            return Err(ConfigError::Invalid {
                field: "maxAttempts".into(),
                detail: "must be >= 1".into(),
            });
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.validate(self.concurrency)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailModeConfig {
    #[default]
    FailFast,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveConcurrencyConfig {
    /// Size of the outcome ring used to estimate the failure rate.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Consecutive high-failure-rate outcomes before halving the target.
    #[serde(default = "default_raise_threshold")]
    pub raise_threshold: usize,
    /// Consecutive low-failure-rate outcomes before incrementing the target.
    #[serde(default = "default_lower_threshold")]
    pub lower_threshold: usize,
    /// Upper clamp for the target worker pool size.
    pub max: usize,
}

fn default_window_size() -> usize {
    32
}

fn default_raise_threshold() -> usize {
    8
}

fn default_lower_threshold() -> usize {
    16
}

impl AdaptiveConcurrencyConfig {
    fn validate(&self, initial_concurrency: usize) -> Result<(), ConfigError> {
        if self.max < initial_concurrency {
            return Err(ConfigError::Invalid {
                field: "adaptive.max".into(),
                detail: format!(
                    "must be >= concurrency ({initial_concurrency}), got {}",
                    self.max
                ),
            });
        }
        if self.window_size == 0 {
            return Err(ConfigError::Invalid {
                field: "adaptive.windowSize".into(),
                detail: "must be >= 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(4, true)]
    fn concurrency_lower_bound(#[case] concurrency: usize, #[case] valid: bool) {
        let mut cfg = SchedulerConfig {
            concurrency,
            ..Default::default()
        };
        cfg.concurrency = concurrency;
        assert_eq!(cfg.validate().is_ok(), valid);
    }

    #[test]
    fn adaptive_max_below_initial_concurrency_is_rejected() {
        let cfg = SchedulerConfig {
            concurrency: 8,
            adaptive: Some(AdaptiveConcurrencyConfig {
                window_size: 32,
                raise_threshold: 8,
                lower_threshold: 16,
                max: 4,
            }),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
