//! Reactor configuration, plus the on-disk config file it is seeded from.

use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Default cap on concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 12;

/// Default per-step deadline. Generous on purpose: a connection only has to
/// make *some* progress within this window, not finish.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// User-Agent sent with every request unless overridden.
pub const DEFAULT_USER_AGENT: &str = concat!("hfetch/", env!("CARGO_PKG_VERSION"));

/// Tunables for a [`Fetcher`](crate::reactor::Fetcher).
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Maximum concurrent connections (reactor slot count). Jobs submitted
    /// beyond this are deferred, not dropped.
    pub max_connections: usize,
    /// Deadline for each protocol step; expiry fails that connection only.
    pub step_timeout: Duration,
    /// Optional local address to bind sockets to before connecting.
    /// Candidates of a different address family are connected unbound.
    pub bind_addr: Option<IpAddr>,
    /// PEM bundle of trust anchors. When unset, platform roots are used.
    pub ca_bundle: Option<PathBuf>,
    /// User-Agent header value.
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            bind_addr: None,
            ca_bundle: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Persistent defaults loaded from `~/.config/hfetch/config.toml`. Every
/// field is optional; command-line flags win over the file, the file wins
/// over built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    /// Maximum concurrent connections.
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Per-step timeout in seconds.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    /// Local address to bind outgoing sockets to.
    #[serde(default)]
    pub bind_addr: Option<IpAddr>,
    /// Path to a PEM bundle of trust anchors.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
    /// User-Agent header value.
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl FileConfig {
    /// Fold file values over the built-in defaults.
    pub fn into_fetcher_config(self) -> FetcherConfig {
        let defaults = FetcherConfig::default();
        FetcherConfig {
            max_connections: self.max_connections.unwrap_or(defaults.max_connections),
            step_timeout: self
                .step_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.step_timeout),
            bind_addr: self.bind_addr,
            ca_bundle: self.ca_bundle,
            user_agent: self.user_agent.unwrap_or(defaults.user_agent),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("hfetch")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load the config file, writing a default (all-commented-out) one on first
/// run so users have something to edit.
pub fn load_or_init() -> Result<FileConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = FileConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: FileConfig = toml::from_str(&data)?;
    Ok(cfg)
}
