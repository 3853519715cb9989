//! Pinherd - durable publishing for content-addressed storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, RwLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pinherd::{
    api::{self, ApiState},
    config::{Config, ConfigError},
    herd::{self, Herd, HerdConfig, ThumbnailCache},
    ipfs::KuboClient,
    publish::{PollConfig, Publisher},
    pup::{ContentId, PinTarget},
};

/// Durable publishing and pin herding for content-addressed storage.
#[derive(Parser)]
#[command(name = "pinherd", about = "Publish and durably pin content")]
struct Cli {
    /// Path to the JSON config file with backend credentials.
    #[arg(long, global = true, default_value = "config.json", env = "PINHERD_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation loop and dashboard API.
    Daemon {
        /// Address to bind the dashboard server.
        #[arg(long, default_value = "127.0.0.1:8081", env = "PINHERD_BIND")]
        bind: String,
    },

    /// Publish files, pin them on a backend, and print a shortened
    /// manifest URL once every pin is confirmed.
    Publish {
        /// Files to publish.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Backend to pin on (pipin, pinata or eternum).
        #[arg(long)]
        backend: String,

        /// Overall limit on waiting for pin confirmations, in seconds.
        #[arg(long, default_value_t = 300)]
        deadline_secs: u64,
    },

    /// List hashes pinned on a backend.
    Ls {
        #[arg(long)]
        backend: String,
    },

    /// Pin a hash on a backend.
    Pin {
        #[arg(long)]
        backend: String,

        hash: String,
    },

    /// Unpin a hash from a backend.
    Unpin {
        #[arg(long)]
        backend: String,

        hash: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pinherd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { bind } => run_daemon(&bind, &cli.config).await?,

        Commands::Publish {
            files,
            backend,
            deadline_secs,
        } => run_publish(&files, &backend, deadline_secs, &cli.config).await?,

        Commands::Ls { backend } => run_ls(&backend, &cli.config).await?,

        Commands::Pin { backend, hash } => run_pin(&backend, &hash, &cli.config).await?,

        Commands::Unpin { backend, hash } => run_unpin(&backend, &hash, &cli.config).await?,
    }

    Ok(())
}

/// Load the config file, printing a sample config when it is missing.
fn load_config(path: &Path) -> Result<Config> {
    match Config::load(path) {
        Ok(config) => Ok(config),
        Err(err @ ConfigError::Read { .. }) => {
            eprintln!("HINT: example config (not all entries are required!):");
            eprintln!("{}", Config::example());
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

fn find_backend(targets: &[PinTarget], name: &str) -> Result<PinTarget> {
    targets.iter().find(|t| t.name == name).cloned().with_context(|| {
        let configured: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        format!("backend {name:?} is not configured (configured: {configured:?})")
    })
}

/// Run the reconciliation loop, its timer, the presentation drain task and
/// the dashboard server.
async fn run_daemon(bind: &str, config_path: &Path) -> Result<()> {
    tracing::info!("starting pinherd daemon...");

    let config = load_config(config_path)?;
    let targets = config.targets()?;
    if targets.is_empty() {
        anyhow::bail!(
            "no pinning backends configured in {}",
            config_path.display()
        );
    }
    tracing::info!(
        backends = ?targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
        "pin targets configured"
    );

    let node = Arc::new(KuboClient::new(config.ipfs_api_url()?));
    let thumbs: ThumbnailCache = Arc::new(RwLock::new(HashMap::new()));
    let (trigger, trigger_rx) = herd::trigger_channel();

    // Bounded change queue: the herd writes, the drain task is the sole
    // consumer mutating presentation state.
    let (changes_tx, changes_rx) = mpsc::channel(100);

    let state = Arc::new(ApiState::new(
        targets.clone(),
        thumbs.clone(),
        trigger.clone(),
    ));
    let _drain = api::spawn_drain(state.clone(), changes_rx);

    let herd_config = HerdConfig {
        evict_unlisted: config.evict_unlisted,
        ..Default::default()
    };
    let _herd = Herd::new(targets, node, changes_tx, thumbs, herd_config).spawn(trigger_rx);
    let _ticker = herd::spawn_ticker(
        trigger.clone(),
        Duration::from_secs(config.poll_interval_secs),
    );

    // First cycle right away rather than waiting out the timer.
    trigger.fire();

    api::serve(state, bind).await
}

/// Batch-publish files through one backend and print the shortened
/// manifest URL.
async fn run_publish(
    files: &[PathBuf],
    backend: &str,
    deadline_secs: u64,
    config_path: &Path,
) -> Result<()> {
    let config = load_config(config_path)?;
    let target = find_backend(&config.targets()?, backend)?;
    let shortener = config
        .shortener()
        .context("publish needs a bitly api_key in the config")?;
    let node = Arc::new(KuboClient::new(config.ipfs_api_url()?));

    let mut contents = Vec::with_capacity(files.len());
    for path in files {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        contents.push((name, Bytes::from(bytes)));
    }

    let poll = PollConfig {
        deadline: Duration::from_secs(deadline_secs),
        ..Default::default()
    };
    let publisher = Publisher::new(node, poll);
    let short = publisher
        .publish_all(contents, target.backend, &shortener)
        .await?;

    println!("{short}");
    Ok(())
}

async fn run_ls(backend: &str, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let target = find_backend(&config.targets()?, backend)?;

    let hashes = target.backend.fetch(&[]).await?;
    println!("Pinned hashes on {}", target.name);
    println!("----------------------------------------------");
    for named in hashes {
        match named.name {
            Some(name) if !name.is_empty() => println!("{}  {}", named.hash, name),
            _ => println!("{}", named.hash),
        }
    }
    Ok(())
}

async fn run_pin(backend: &str, hash: &str, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let target = find_backend(&config.targets()?, backend)?;

    target.backend.pin(&ContentId::from(hash)).await?;
    println!("Pinned hash: {hash:?}");
    Ok(())
}

async fn run_unpin(backend: &str, hash: &str, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let target = find_backend(&config.targets()?, backend)?;

    target.backend.unpin(&ContentId::from(hash)).await?;
    println!("Unpinned hash: {hash:?}");
    Ok(())
}
