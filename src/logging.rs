use std::{fs::OpenOptions, path::Path, sync::Mutex};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::tunneling::tunnel::TunnelError;

/// Sets up the global subscriber.
///
/// `verbosity` counts `-v` flags (0=info, 1=debug, 2+=trace); `RUST_LOG` wins
/// when set. Logs go to stderr unless `log_file` is given, in which case they
/// are appended to it without colours.
pub(crate) fn init_logging(verbosity: u8, log_file: Option<&Path>) -> Result<(), TunnelError> {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("autotunnel={level}")));

    let result = match log_file {
        None => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(verbosity >= 2),
            )
            .try_init(),
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| TunnelError::Logging(format!("{}: {e}", path.display())))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false)
                        .with_target(verbosity >= 2),
                )
                .try_init()
        }
    };
    result.map_err(|e| TunnelError::Logging(e.to_string()))
}
