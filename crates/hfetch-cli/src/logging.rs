//! Tracing setup for the binary: log to a file under the XDG state dir so
//! the terminal stays clean for per-URL output, or to stderr when no log
//! file can be opened.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Filter applied when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,hfetch=debug";

fn open_log_file() -> Result<(PathBuf, File)> {
    let dirs = xdg::BaseDirectories::with_prefix("hfetch")?;
    let path = dirs.place_state_file("hfetch.log")?;
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Never fails: if the state dir is
/// unwritable the subscriber goes to stderr instead.
pub fn init() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_ansi(false);
    match open_log_file() {
        Ok((path, file)) => {
            builder.with_writer(Arc::new(file)).init();
            tracing::debug!("logging to {}", path.display());
        }
        Err(e) => {
            builder.with_writer(std::io::stderr).init();
            tracing::warn!("cannot open log file ({e:#}); logging to stderr");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_directive_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
