use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Port appended to server addresses that do not carry one.
pub const DEFAULT_PORT: u16 = 7890;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    /// Root of the committed cache; mirrors the remote namespace.
    pub cache_dir: PathBuf,
    /// Per-handle staging files. Must be on the same filesystem as
    /// `cache_dir` for commit renames to be atomic.
    pub staging_dir: PathBuf,
    pub retry: RetryPolicy,
    pub mount: MountConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MountConfig {
    pub allow_other: bool,
    pub unprivileged: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            cache_dir: PathBuf::from("cache"),
            staging_dir: PathBuf::from("tmp"),
            retry: RetryPolicy::default(),
            mount: MountConfig::default(),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            allow_other: false,
            unprivileged: true,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("remotefs.yaml");
        fs::write(
            &path,
            "cache_dir: /var/lib/remotefs/cache\nretry:\n  max_attempts: 3\nmount:\n  allow_other: true\n",
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/lib/remotefs/cache"));
        assert_eq!(cfg.staging_dir, PathBuf::from("tmp"));
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.initial_delay_ms, 50);
        assert!(cfg.mount.allow_other);
        assert!(cfg.mount.unprivileged);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_config(Path::new("/no/such/remotefs.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
