use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use remotefs::CacheFs;
use remotefs::config::{Config, load_config};
use remotefs::fuse::mount::mount_cache_fs;
use remotefs::remote::{GrpcRemote, LocalDirRemote, RemoteFs};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "remotefs")]
#[command(about = "Mount a remote gRPC filesystem with a local write-back cache", long_about = None)]
struct Cli {
    /// Server address, host or host:port. Port 7890 is used when omitted.
    #[arg(value_name = "SERVER")]
    server: String,

    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,

    /// YAML config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    staging_dir: Option<PathBuf>,

    /// Attempt budget for retried calls (Stat, empty Put)
    #[arg(long, value_name = "N")]
    retry_attempts: Option<u32>,

    /// Serve the namespace from a local directory instead of SERVER
    #[arg(long, value_name = "DIR")]
    local: Option<PathBuf>,

    #[arg(long)]
    allow_other: bool,

    /// Mount through the kernel directly instead of fusermount3
    #[arg(long)]
    privileged: bool,
}

impl Cli {
    fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => load_config(path)?,
            None => Config::default(),
        };
        if let Some(dir) = &self.cache_dir {
            cfg.cache_dir = dir.clone();
        }
        if let Some(dir) = &self.staging_dir {
            cfg.staging_dir = dir.clone();
        }
        if let Some(n) = self.retry_attempts {
            cfg.retry.max_attempts = n;
        }
        if self.allow_other {
            cfg.mount.allow_other = true;
        }
        if self.privileged {
            cfg.mount.unprivileged = false;
        }
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    let cfg = cli.resolve_config()?;

    match &cli.local {
        Some(root) => {
            info!("serving remote namespace from {}", root.display());
            run(LocalDirRemote::new(root), &cli, &cfg).await
        }
        None => {
            let remote = GrpcRemote::connect_lazy(&cli.server, cfg.port)
                .with_context(|| format!("invalid server address {}", cli.server))?;
            run(remote, &cli, &cfg).await
        }
    }
}

async fn run<R: RemoteFs + 'static>(remote: R, cli: &Cli, cfg: &Config) -> anyhow::Result<()> {
    let fs = Arc::new(CacheFs::new(remote, cfg).with_context(|| {
        format!(
            "failed to prepare cache dirs {} and {}",
            cfg.cache_dir.display(),
            cfg.staging_dir.display()
        )
    })?);
    let mut handle = mount_cache_fs(fs.clone(), &cli.mountpoint, &cfg.mount)
        .await
        .with_context(|| format!("failed to mount at {}", cli.mountpoint.display()))?;

    let interrupted = tokio::select! {
        res = &mut handle => {
            fs.shutdown();
            res.context("FUSE session ended with an error")?;
            info!("session ended");
            false
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, unmounting {}", cli.mountpoint.display());
            true
        }
    };

    // unmount after select so the handle is no longer borrowed
    if interrupted {
        fs.shutdown();
        if let Err(e) = handle.unmount().await {
            warn!("unmount failed: {e}");
        }
    }
    Ok(())
}
