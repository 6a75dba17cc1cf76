//! Tracing setup for binaries and integration harnesses embedding the core.

use serde::{Deserialize, Serialize};
use tally_types::constants::{ENGINE_NAME, VERSION};
use tally_types::{Result, TallyError};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
///
/// # Errors
/// `Configuration` if a subscriber is already installed or the filter
/// does not parse.
pub fn init_tracing(format: LogFormat, default_filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| TallyError::Configuration(format!("log filter: {e}")))?,
    };
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_ansi(false))
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init(),
    };
    installed.map_err(|e| TallyError::Configuration(format!("tracing init: {e}")))?;

    tracing::info!(engine = ENGINE_NAME, version = VERSION, ?format, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_an_error() {
        // Another test may have installed one already; either way the
        // second call must fail without panicking.
        let _ = init_tracing(LogFormat::Json, "info");
        assert!(matches!(
            init_tracing(LogFormat::Text, "debug"),
            Err(TallyError::Configuration(_))
        ));
    }

    #[test]
    fn format_parses_from_config() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
    }
}
