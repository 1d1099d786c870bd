//! Structured logging setup
//!
//! Installs a global `tracing` subscriber according to [`LoggingConfig`], with
//! one fmt layer per enabled sink (console, file or both). `RUST_LOG` takes
//! precedence over the configured level when it is set.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize the global subscriber.
///
/// Fails if the configuration is invalid, the log file cannot be opened, or a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(ProtocolError::ConfigError(errors.join("; ")));
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    tracing_subscriber::registry()
        .with(sinks(config)?)
        .with(filter)
        .try_init()
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

fn sinks(config: &LoggingConfig) -> Result<Vec<BoxedLayer>> {
    let mut layers = Vec::new();
    if config.log_to_console {
        layers.push(fmt_layer(std::io::stdout, true, config.json_format));
    }
    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError("log_file_path must be set".to_string())
        })?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        layers.push(fmt_layer(Mutex::new(file), false, config.json_format));
    }
    Ok(layers)
}

fn fmt_layer<W>(writer: W, ansi: bool, json: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(ansi)
        .with_writer(writer);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn logging(console: bool, file: Option<String>) -> LoggingConfig {
        LoggingConfig {
            log_to_console: console,
            log_to_file: file.is_some(),
            log_file_path: file,
            ..LoggingConfig::default()
        }
    }

    #[test]
    fn test_console_and_file_both_installed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodewire.log");
        let config = logging(true, Some(path.to_string_lossy().into_owned()));

        assert_eq!(sinks(&config).unwrap().len(), 2);
        assert!(path.exists());
    }

    #[test]
    fn test_single_sink() {
        assert_eq!(sinks(&logging(true, None)).unwrap().len(), 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("only.log");
        let file_only = logging(false, Some(path.to_string_lossy().into_owned()));
        assert_eq!(sinks(&file_only).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_log_file_path_rejected() {
        let config = LoggingConfig {
            log_to_file: true,
            log_file_path: None,
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(ProtocolError::ConfigError(_))
        ));
    }
}
