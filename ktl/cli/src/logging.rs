//! `tracing-subscriber` initialization, `--log-format {pretty,json}`
//! (teacher convention: env-filter driven, with a json formatter for
//! production log shipping).

use clap::ValueEnum;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            fmt().with_env_filter(filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().with_env_filter(filter).json().with_target(true).init();
        }
    }
}
