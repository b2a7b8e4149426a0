use crate::{error::ConfigError, source::KtlConfig};

/// Eager validation across the whole config, beyond what each section's own
/// `validate()` checks in isolation (`SPEC_FULL.md` §4.9).
pub fn validate(config: &KtlConfig) -> Result<(), ConfigError> {
    config.scheduler.validate()?;
    config.mirror.validate()?;
    Ok(())
}
