//! Configuration module for the build status backend.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{BuilderFilter, CacheConfig, DEFAULT_SKIP_PATTERNS};
use crate::errors::AppError;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-shared key for the mutating endpoints (unset disables auth)
    pub api_psk: Option<String>,
    /// Path to the SQLite build database
    pub db_path: PathBuf,
    /// Local git checkout whose history is followed
    pub repo_path: PathBuf,
    /// Snapshot file for the commit cache
    pub cache_file: PathBuf,
    /// Trailing commits whose builds stay resident
    pub window_size: usize,
    /// Background refresh period
    pub refresh_interval: Duration,
    /// Builder-name patterns left out of the dashboard maps
    pub skip_builders: Vec<String>,
    /// Whether to fetch/pull before reading the log
    pub git_sync: bool,
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(var: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_psk = var("STATUS_API_PSK").filter(|k| !k.is_empty());

        let db_path = var("STATUS_DB_PATH")
            .unwrap_or_else(|| "./data/buildbot.sqlite".to_string())
            .into();

        let repo_path = var("STATUS_REPO_PATH")
            .unwrap_or_else(|| "./data/repo".to_string())
            .into();

        let cache_file = var("STATUS_CACHE_FILE")
            .unwrap_or_else(|| "./data/commit_cache.json".to_string())
            .into();

        let window_size = parse_var(&var, "STATUS_WINDOW_SIZE", 35usize)?;
        if window_size == 0 {
            return Err(AppError::Validation(
                "STATUS_WINDOW_SIZE must be at least 1".to_string(),
            ));
        }

        let refresh_secs = parse_var(&var, "STATUS_REFRESH_INTERVAL_SECS", 60u64)?;
        if refresh_secs == 0 {
            return Err(AppError::Validation(
                "STATUS_REFRESH_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        let skip_builders: Vec<String> = match var("STATUS_SKIP_BUILDERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_SKIP_PATTERNS.iter().map(|p| p.to_string()).collect(),
        };
        // Fail at startup rather than on first use.
        BuilderFilter::new(&skip_builders)?;

        let git_sync = parse_var(&var, "STATUS_GIT_SYNC", true)?;

        let bind_addr = parse_var(
            &var,
            "STATUS_BIND_ADDR",
            SocketAddr::from(([127, 0, 0, 1], 8002)),
        )?;

        let log_level = var("STATUS_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            api_psk,
            db_path,
            repo_path,
            cache_file,
            window_size,
            refresh_interval: Duration::from_secs(refresh_secs),
            skip_builders,
            git_sync,
            bind_addr,
            log_level,
        })
    }

    /// Settings for the commit cache.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(&self.cache_file)
            .with_window_size(self.window_size)
            .with_refresh_interval(self.refresh_interval)
    }

    pub fn builder_filter(&self) -> Result<BuilderFilter, AppError> {
        BuilderFilter::new(&self.skip_builders)
    }
}

fn parse_var<F, T>(var: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Validation(format!("Invalid {} {:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}
