//! Logging setup for hosts that do not install their own subscriber
//!
//! The crate only emits `tracing` events; calling [`init`] is optional.

use crate::config::GeneralConfig;
use crate::error::{CacheError, CacheResult};
use tracing_subscriber::EnvFilter;

/// Build the event filter for `log_level`
///
/// `RUST_LOG` wins when set, so hosts keep their usual override.
pub fn filter(log_level: &str) -> CacheResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("doccache={log_level}"))
        .map_err(|e| CacheError::Logging(format!("invalid log level {log_level:?}: {e}")))
}

/// Install a global `tracing` subscriber from the `[general]` settings
///
/// Fails if another subscriber is already installed.
pub fn init(general: &GeneralConfig) -> CacheResult<()> {
    let filter = filter(&general.log_level)?;

    let installed = match general.log_format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        "text" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        other => {
            return Err(CacheError::invalid_setting(
                "log_format",
                format!("expected \"text\" or \"json\", got {other:?}"),
            ))
        }
    };

    installed.map_err(|e| CacheError::Logging(e.to_string()))
}
