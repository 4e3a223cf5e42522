use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::error::OmaError;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    pub env_filter: Option<String>,
    pub with_ansi: bool,
    /// Send log lines to stderr so stdout stays machine-readable.
    pub to_stderr: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            with_ansi: true,
            to_stderr: true,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Only the first call has any effect. `RUST_LOG` wins over `env_filter`
/// when the latter is unset.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), OmaError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = options
        .env_filter
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_ansi(options.with_ansi);
    let installed = if options.to_stderr {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        builder.try_init()
    };
    installed
        .map_err(|err| OmaError::InvalidConfiguration(format!("telemetry init failed: {err}")))?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}
