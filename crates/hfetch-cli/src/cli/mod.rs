//! CLI for the hfetch retrieval engine.

mod dest;

use std::collections::HashMap;
use std::fs::File;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hfetch_core::{config, FetchJob, FetchOutcome, Fetcher, FetcherConfig};

/// Fetch files over HTTPS with bounded concurrency.
#[derive(Debug, Parser)]
#[command(name = "hfetch")]
#[command(about = "hfetch: bounded-concurrency HTTPS fetcher", long_about = None)]
pub struct Cli {
    /// https URLs to fetch.
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Directory to write fetched files into.
    #[arg(short, long, default_value = ".", value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Maximum concurrent connections.
    #[arg(short = 'n', long, value_name = "N")]
    pub max_connections: Option<usize>,

    /// Per-step timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Local address to bind outgoing sockets to.
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<IpAddr>,

    /// PEM bundle of trust anchors (default: platform store).
    #[arg(long, value_name = "FILE")]
    pub ca_bundle: Option<PathBuf>,

    /// Fetch only if modified since this HTTP date; applies to every URL.
    #[arg(long, value_name = "HTTP-DATE")]
    pub if_modified_since: Option<String>,
}

pub fn run_from_args() -> Result<()> {
    let cli = Cli::parse();
    let file_cfg = config::load_or_init()?;
    tracing::debug!("loaded config: {:?}", file_cfg);
    let cfg = merge_config(&cli, file_cfg);

    std::fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("cannot create output dir {}", cli.output_dir.display()))?;

    let mut fetcher = Fetcher::spawn(cfg)?;
    let mut pending: HashMap<u64, (String, PathBuf)> = HashMap::new();

    for (id, url) in cli.urls.iter().enumerate() {
        let id = id as u64;
        let path = dest::dest_path(&cli.output_dir, url);
        let file = File::create(&path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        fetcher.submit(FetchJob {
            id,
            url: url.clone(),
            if_modified_since: cli.if_modified_since.clone(),
            sink: Box::new(file),
        })?;
        pending.insert(id, (url.clone(), path));
    }

    let mut failed = 0usize;
    while !pending.is_empty() {
        let Some(result) = fetcher.recv_result() else {
            anyhow::bail!("fetcher stopped with {} fetches unanswered", pending.len());
        };
        let Some((url, path)) = pending.remove(&result.id) else {
            continue;
        };
        match result.outcome {
            FetchOutcome::Ok => {
                println!("{} -> {}", url, path.display());
            }
            FetchOutcome::NotModified => {
                println!("{}: not modified", url);
                let _ = std::fs::remove_file(&path);
            }
            FetchOutcome::Failed => {
                eprintln!("{}: failed", url);
                let _ = std::fs::remove_file(&path);
                failed += 1;
            }
        }
    }
    fetcher.shutdown();

    if failed > 0 {
        anyhow::bail!("{} of {} fetches failed", failed, cli.urls.len());
    }
    Ok(())
}

/// Command-line flags win over the config file, which wins over defaults.
fn merge_config(cli: &Cli, file_cfg: config::FileConfig) -> FetcherConfig {
    let mut cfg = file_cfg.into_fetcher_config();
    if let Some(n) = cli.max_connections {
        cfg.max_connections = n.max(1);
    }
    if let Some(secs) = cli.timeout {
        cfg.step_timeout = std::time::Duration::from_secs(secs);
    }
    if let Some(addr) = cli.bind {
        cfg.bind_addr = Some(addr);
    }
    if let Some(path) = &cli.ca_bundle {
        cfg.ca_bundle = Some(path.clone());
    }
    cfg
}
