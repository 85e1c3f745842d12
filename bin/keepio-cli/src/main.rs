//! KeepIO CLI - operator command line
//!
//! Wires directory-backed volumes, the cluster client and the disk cache
//! together from one TOML file and runs a single operation against them.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use keepio_client::{BlockWriteOptions, ClientContext, DiskCache, KeepClient, KeepGateway};
use keepio_common::{CancellationToken, Config, KeepService, Locator, ServiceRoot};
use keepio_placement::ServiceRoots;
use keepio_storage::{Keepstore, TrashSweepStats, Volume};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "keepio")]
#[command(about = "KeepIO block storage CLI")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "keepio.toml", env = "KEEPIO_CONFIG")]
    config: PathBuf,

    /// Cache directory (overrides the config file)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a file as one block
    Put {
        /// File to store
        file: PathBuf,
        /// Replicas wanted (defaults to client.want_replicas)
        #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
        replicas: Option<usize>,
    },
    /// Fetch a block through the disk cache
    Get {
        locator: String,
        /// Output file (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show the probe sequence for a block
    Probe { locator: String },
    /// Trash a block on one volume
    Trash { volume: String, locator: String },
    /// Restore a trashed block on one volume
    Untrash { volume: String, locator: String },
    /// Delete expired trash on every writable volume
    EmptyTrash {
        /// Keep sweeping every SECS seconds
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },
    /// List the blocks stored on one volume
    Index {
        volume: String,
        /// Only blocks whose hash starts with this prefix
        prefix: Option<String>,
    },
    /// Enforce the cache size budget now
    Tidy,
}

/// Read the config file, falling back to defaults when it does not exist
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!("Config file {} not found, using defaults", path.display());
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// One keepstore per distinct volume root
async fn open_stores(config: &Config) -> Result<Vec<Arc<Keepstore>>> {
    let roots: BTreeSet<&ServiceRoot> = config.volumes.iter().map(|v| &v.root).collect();
    let mut stores = Vec::new();
    for root in roots {
        let store = Keepstore::from_configs(root.clone(), &config.volumes)
            .await
            .with_context(|| format!("opening volumes for {root}"))?;
        stores.push(Arc::new(store));
    }
    Ok(stores)
}

fn find_volume<'a>(stores: &'a [Arc<Keepstore>], name: &str) -> Result<&'a Arc<Volume>> {
    stores
        .iter()
        .find_map(|s| s.volume(name))
        .with_context(|| format!("no volume named {name}"))
}

fn print_sweep(stats: &TrashSweepStats) -> Result<()> {
    println!("{}", serde_json::to_string(stats)?);
    Ok(())
}

async fn empty_trash_once(
    cancel: &CancellationToken,
    stores: &[Arc<Keepstore>],
) -> Result<TrashSweepStats> {
    let mut total = TrashSweepStats::default();
    for store in stores {
        total += store.empty_trash_all(cancel).await?;
    }
    Ok(total)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = load_config(&args.config)?;
    if let Some(dir) = args.cache_dir {
        config.cache.dir = dir;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let stores = open_stores(&config).await?;
    let services: Vec<Arc<dyn KeepService>> = stores
        .iter()
        .map(|s| Arc::clone(s) as Arc<dyn KeepService>)
        .collect();

    match args.command {
        Commands::Put { file, replicas } => {
            let ctx = ClientContext::new(services, &config.client)?;
            let cache = DiskCache::open(KeepClient::new(ctx), &config.cache).await?;
            let reader = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;
            let mut opts = BlockWriteOptions::from_reader(reader);
            if let Some(n) = replicas {
                opts = opts.with_replicas(n);
            }
            let resp = cache.block_write(&cancel, opts).await?;
            println!("{} ({} replicas)", resp.locator, resp.replicas);
        }
        Commands::Get { locator, out } => {
            let locator: Locator = locator.parse()?;
            let ctx = ClientContext::new(services, &config.client)?;
            let cache = DiskCache::open(KeepClient::new(ctx), &config.cache).await?;
            let data = cache.block_read(&cancel, &locator).await?;
            match out {
                Some(path) => tokio::fs::write(&path, &data)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
            }
        }
        Commands::Probe { locator } => {
            let locator: Locator = locator.parse()?;
            let roots = ServiceRoots::new(services.iter().map(|s| s.root().clone()));
            for (i, root) in roots.probe_sequence(&locator).iter().enumerate() {
                println!("{i}\t{root}");
            }
        }
        Commands::Trash { volume, locator } => {
            let locator: Locator = locator.parse()?;
            find_volume(&stores, &volume)?.trash(&cancel, &locator).await?;
        }
        Commands::Untrash { volume, locator } => {
            let locator: Locator = locator.parse()?;
            find_volume(&stores, &volume)?
                .untrash(&cancel, &locator)
                .await?;
        }
        Commands::EmptyTrash { every: None } => {
            print_sweep(&empty_trash_once(&cancel, &stores).await?)?;
        }
        Commands::EmptyTrash { every: Some(secs) } => {
            if secs == 0 {
                bail!("--every must be at least 1 second");
            }
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match empty_trash_once(&cancel, &stores).await {
                    Ok(stats) => print_sweep(&stats)?,
                    Err(e) if cancel.is_cancelled() => {
                        info!("Trash sweep interrupted: {e}");
                        break;
                    }
                    Err(e) => warn!("Trash sweep failed: {e:#}"),
                }
            }
        }
        Commands::Index { volume, prefix } => {
            let mut stdout = tokio::io::stdout();
            find_volume(&stores, &volume)?
                .index_to(&cancel, prefix.as_deref().unwrap_or(""), &mut stdout)
                .await?;
        }
        Commands::Tidy => {
            let ctx = ClientContext::new(services, &config.client)?;
            let cache = DiskCache::open(KeepClient::new(ctx), &config.cache).await?;
            let stats = cache.tidy().await?;
            println!("{}", serde_json::to_string(&stats)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let args = Args::try_parse_from(["keepio", "empty-trash", "--every", "60"]).unwrap();
        assert!(matches!(args.command, Commands::EmptyTrash { every: Some(60) }));

        let args =
            Args::try_parse_from(["keepio", "--config", "/etc/k.toml", "trash", "vol0", "abc"])
                .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/k.toml"));
        assert!(matches!(args.command, Commands::Trash { .. }));

        let args = Args::try_parse_from(["keepio", "put", "f", "--replicas", "2"]).unwrap();
        assert!(matches!(args.command, Commands::Put { replicas: Some(2), .. }));
        assert!(Args::try_parse_from(["keepio", "put", "f", "--replicas", "0"]).is_err());
    }

    #[test]
    fn test_load_config_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keepio.toml");
        std::fs::write(
            &path,
            r#"
[client]
want_replicas = 3

[cache]
dir = "/tmp/keepio-cache"
max_size_bytes = 1048576

[[volumes]]
name = "vol0"
root = "http://keep0:25107"
dir = "/srv/keep0/vol0"
trash_lifetime_secs = 0
unsafe_delete = true
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.client.want_replicas, 3);
        assert_eq!(config.cache.max_size_bytes, 1_048_576);
        assert_eq!(config.volumes.len(), 1);
        assert_eq!(config.volumes[0].root.as_str(), "http://keep0:25107");
        assert!(config.volumes[0].unsafe_delete);
        assert_eq!(config.volumes[0].replication, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keepio.toml");
        std::fs::write(&path, "[client]\nwant_replicas = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[tokio::test]
    async fn test_open_stores_groups_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        for (name, root) in [("a", "http://k0"), ("b", "http://k0"), ("c", "http://k1")] {
            config.volumes.push(keepio_common::VolumeConfig {
                name: name.to_string(),
                root: ServiceRoot::new(root),
                dir: dir.path().join(name),
                ..Default::default()
            });
        }
        let stores = open_stores(&config).await.unwrap();
        assert_eq!(stores.len(), 2);
        assert_eq!(stores[0].volumes().len(), 2);
        assert!(find_volume(&stores, "c").is_ok());
        assert!(find_volume(&stores, "z").is_err());
    }
}
