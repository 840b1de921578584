use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Process-wide logging setup, passed once to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or `read_origin_nn=debug`
    pub level: String,
    /// Write logs here instead of stderr
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Installs the global `tracing` subscriber.
///
/// Calling it again after a subscriber is set is a no-op.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match &config.log_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| Error::io(path, e))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Logging already initialised");
    }
    Ok(())
}
