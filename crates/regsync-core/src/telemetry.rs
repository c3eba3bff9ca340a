//! Tracing initialisation for the regsync binary.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! since the global subscriber can only be set once per process.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::PreconditionError;

/// Open `path` for appending, creating it if needed.
pub fn open_log_file(path: &Path) -> Result<File, PreconditionError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PreconditionError::InvalidInput {
            path: path.to_path_buf(),
            reason: format!("cannot open log file: {}", e),
        })
}

/// Initialise the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` is used. With `json` every
/// stderr line is a JSON object. Logs go to stderr so they never interleave
/// with command output on stdout. With `log_file`, the same events are also
/// appended to that file as plain text.
pub fn init_tracing(
    json: bool,
    level: Level,
    log_file: Option<&Path>,
) -> Result<(), PreconditionError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let file_layer = match log_file {
        Some(path) => Some(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(open_log_file(path)?)),
        ),
        None => None,
    };

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
    Ok(())
}
