//! Layered configuration for `ktl` (`spec.md` §6, `SPEC_FULL.md` §4.8).
//!
//! Precedence, lowest to highest: built-in defaults, an optional
//! `ktl.yaml`/`ktl.toml` file at the stack root, then `KTL_*` environment
//! variable overrides. This mirrors the teacher's `mirrord-config` crate,
//! which layers a config file over environment variables.

pub mod error;
mod lock;
mod mirror;
mod scheduler;
mod source;
mod validate;

pub use error::ConfigError;
pub use lock::LockConfig;
pub use mirror::MirrorConfig;
pub use scheduler::{AdaptiveConcurrencyConfig, SchedulerConfig};
pub use source::KtlConfig;
