use genguard_domain::LoggingConfig;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{InfraError, InfraResult};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `config.level` when set. Output is JSON lines when
/// `config.json` is true, human-readable otherwise.
///
/// Returns `Ok(false)` if a global subscriber was already installed.
///
/// # Errors
/// Returns `InfraError::Logging` if `config.level` is not a valid filter
/// directive.
pub fn init_logging(config: &LoggingConfig) -> InfraResult<bool> {
    let configured = EnvFilter::try_new(&config.level).map_err(|e| {
        InfraError::Logging(format!("invalid log level '{}': {e}", config.level))
    })?;
    let filter = EnvFilter::try_from_default_env().unwrap_or(configured);

    let (json_layer, text_layer) = if config.json {
        (Some(fmt::layer().json().with_target(true).with_current_span(true)), None)
    } else {
        (None, Some(fmt::layer().with_target(true)))
    };

    match tracing_subscriber::registry().with(filter).with(json_layer).with(text_layer).try_init() {
        Ok(()) => Ok(true),
        Err(err) => {
            debug!(error = %err, "Tracing subscriber already installed");
            Ok(false)
        }
    }
}
