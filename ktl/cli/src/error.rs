//! CLI-facing error type and the documented exit-code mapping
//! (`spec.md` §7 "User-visible behavior").

use miette::Diagnostic;
use thiserror::Error;

/// Exit code reserved for `LockHeld`, so scripts can distinguish "another
/// run owns this stack" from a generic failure (`spec.md` §7).
pub const EXIT_LOCK_HELD: i32 = 2;
pub const EXIT_RUN_FAILED: i32 = 1;
pub const EXIT_USAGE: i32 = 64;

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("failed to read plan file {path}")]
    #[diagnostic(code(ktl::plan::read))]
    PlanRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse plan file {path}")]
    #[diagnostic(code(ktl::plan::parse))]
    PlanParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(ktl::config))]
    Config(#[from] ktl_config::ConfigError),

    #[error(transparent)]
    #[diagnostic(code(ktl::store))]
    Store(#[from] ktl_store::StoreError),

    #[error(transparent)]
    #[diagnostic(code(ktl::scheduler))]
    Scheduler(#[from] ktl_scheduler::SchedulerError),

    #[error(transparent)]
    #[diagnostic(code(ktl::transport))]
    Transport(#[from] ktl_transport::error::TransportError),

    #[error(transparent)]
    #[diagnostic(code(ktl::mirror))]
    Mirror(#[from] ktl_mirror::MirrorError),

    #[error("invalid address {0}")]
    #[diagnostic(code(ktl::usage))]
    InvalidAddress(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Scheduler(ktl_scheduler::SchedulerError::LockHeld { .. }) => EXIT_LOCK_HELD,
            Self::InvalidAddress(_) => EXIT_USAGE,
            _ => EXIT_RUN_FAILED,
        }
    }
}
