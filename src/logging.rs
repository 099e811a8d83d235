//! Tracing initialisation.
//!
//! `RUST_LOG` takes precedence over the configured level, so fine-grained filters such as
//! `RUST_LOG=screen_profile::measurement=trace` keep working.

use tracing_subscriber::EnvFilter;

use crate::config::{ApplicationConfig, LogFormat};
use crate::error::{AppResult, ProfileError};

/// Builds the filter: `RUST_LOG` if set, the configured level otherwise.
pub fn env_filter(config: &ApplicationConfig) -> AppResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            ProfileError::Configuration(format!(
                "invalid log filter '{}': {e}",
                config.log_level
            ))
        })
}

/// Installs the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed (for example by a test
/// harness or the embedding application), in which case nothing changes.
pub fn init(config: &ApplicationConfig) -> AppResult<bool> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match config.log_format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    match installed {
        Ok(()) => {
            tracing::info!(
                application = %config.name,
                level = %config.log_level,
                format = ?config.log_format,
                "Tracing initialized"
            );
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}
