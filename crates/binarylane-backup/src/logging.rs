use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::reporter::Verbosity;

/// Install the global subscriber. Operator output goes through the reporter;
/// these layers only carry log records.
///
/// `RUST_LOG` overrides `LOG_LEVEL`. Human-readable records reach stderr at
/// `-vv`; JSON records are appended to `LOG_FILE` when it is set.
pub fn init(settings: &Settings, verbosity: Verbosity) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|e| Error::msg(format!("invalid LOG_LEVEL '{}': {e}", settings.log_level)))?;

    let stderr_layer = (verbosity >= Verbosity::Debug).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    });

    let file_layer = match settings.log_file.as_deref() {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                crate::storage::ensure_dir(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::msg(format!("failed to open log file {}: {e}", path.display())))?;
            Some(
                fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .json()
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::msg(format!("failed to install log subscriber: {e}")))
}
