//! Tracing subscriber setup for the device process.

use beam_types::{BeamError, Result};
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    /// `BEAM_LOG_FORMAT=json` selects JSON lines.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("BEAM_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Filter from `RUST_LOG`, else `default_filter`.
pub fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber. Call once, from `main`.
pub fn init_tracing(default_filter: &str, format: LogFormat) -> Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(default_filter));
    let installed = match format {
        LogFormat::Pretty => builder.with_target(true).try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| BeamError::Configuration(format!("tracing: {e}")))
}
