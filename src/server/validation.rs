//! Configuration validation

use super::config::AppConfig;
use anyhow::{bail, Result};

/// Reject settings the engine cannot run with.
pub fn validate(config: &AppConfig) -> Result<()> {
    if config.engine.default_max_workers == 0 {
        bail!("engine.default_max_workers must be at least 1");
    }
    if config.engine.retry.backoff_multiplier < 1.0 {
        bail!("engine.retry.backoff_multiplier must be >= 1.0");
    }
    if config.engine.retry.initial_delay_ms > config.engine.retry.max_delay_ms {
        bail!("engine.retry.initial_delay_ms must not exceed engine.retry.max_delay_ms");
    }
    if config.hub.queue_capacity < 4 {
        bail!("hub.queue_capacity must be at least 4");
    }
    if config.hub.ping_interval_secs == 0 {
        bail!("hub.ping_interval_secs must be at least 1");
    }
    if config.hub.heartbeat_timeout_secs <= config.hub.ping_interval_secs {
        bail!("hub.heartbeat_timeout_secs must be greater than hub.ping_interval_secs");
    }
    if config.pipeline.ticks == 0 {
        bail!("pipeline.ticks must be at least 1");
    }
    Ok(())
}
