use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, lock::LockConfig, mirror::MirrorConfig, scheduler::SchedulerConfig};

/// Top-level configuration loaded for a stack root.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KtlConfig {
    #[serde(flatten)]
    pub scheduler: SchedulerConfig,
    pub lock: LockConfig,
    pub mirror: MirrorConfig,
}

impl KtlConfig {
    /// Loads defaults, then overlays `<stack_root>/ktl.yaml` or `ktl.toml`
    /// if present, then `KTL_*` environment variables. Validates the
    /// result before returning (`SPEC_FULL.md` §4.9 "config validation at
    /// load time").
    pub fn load(stack_root: &Path, env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(from_file) = Self::from_file(stack_root)? {
            config = from_file;
        }

        config.apply_env(env)?;
        crate::validate::validate(&config)?;
        Ok(config)
    }

    fn from_file(stack_root: &Path) -> Result<Option<Self>, ConfigError> {
        let yaml_path = stack_root.join("ktl.yaml");
        if yaml_path.is_file() {
            let text = std::fs::read_to_string(&yaml_path).map_err(|source| ConfigError::Read {
                path: yaml_path.display().to_string(),
                source,
            })?;
            let parsed = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
                path: yaml_path.display().to_string(),
                source,
            })?;
            return Ok(Some(parsed));
        }

        let toml_path = stack_root.join("ktl.toml");
        if toml_path.is_file() {
            let text = std::fs::read_to_string(&toml_path).map_err(|source| ConfigError::Read {
                path: toml_path.display().to_string(),
                source,
            })?;
            let parsed = toml::from_str(&text).map_err(|source| ConfigError::Toml {
                path: toml_path.display().to_string(),
                source,
            })?;
            return Ok(Some(parsed));
        }

        Ok(None)
    }

    /// Applies `KTL_*` overrides. Only a handful of scalar fields are
    /// exposed through the environment — the rest (budget maps, adaptive
    /// tuning) require the config file, matching the teacher's convention
    /// of env overrides for the common knobs only.
    fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(raw) = env.get("KTL_CONCURRENCY") {
            self.scheduler.concurrency = parse_env("KTL_CONCURRENCY", raw)?;
        }
        if let Some(raw) = env.get("KTL_MAX_ATTEMPTS") {
            self.scheduler.max_attempts = parse_env("KTL_MAX_ATTEMPTS", raw)?;
        }
        if let Some(raw) = env.get("KTL_LOCK_TAKEOVER") {
            self.lock.takeover = parse_env("KTL_LOCK_TAKEOVER", raw)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        detail: format!("could not parse {raw:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn loads_defaults_when_no_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let config = KtlConfig::load(dir.path(), &HashMap::new()).unwrap();
        assert_eq!(config.scheduler.concurrency, 4);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ktl.yaml"), "concurrency: 12\n").unwrap();
        let config = KtlConfig::load(dir.path(), &HashMap::new()).unwrap();
        assert_eq!(config.scheduler.concurrency, 12);
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ktl.yaml"), "concurrency: 12\n").unwrap();
        let mut env = HashMap::new();
        env.insert("KTL_CONCURRENCY".to_string(), "7".to_string());
        let config = KtlConfig::load(dir.path(), &env).unwrap();
        assert_eq!(config.scheduler.concurrency, 7);
    }

    #[test]
    fn invalid_adaptive_max_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ktl.yaml"),
            "concurrency: 8\nadaptive:\n  max: 2\n",
        )
        .unwrap();
        assert!(KtlConfig::load(dir.path(), &HashMap::new()).is_err());
    }
}
