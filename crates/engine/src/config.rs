use std::io;
use std::path::{Path, PathBuf};

use pool::{AUTO_MAX_THREADS, PoolConfig, PoolError, ScalingConfig, WorkerConfig};
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PHP_POOL_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid max_threads {0:?}, expected a number or \"auto\"")]
    InvalidMaxThreads(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Contents of `pool.toml`:
///
/// ```toml
/// log_level = "info"
///
/// [pool]
/// num_threads = 8
/// max_threads = "auto"
/// max_wait_time_ms = 30000
///
/// [scaling]
/// max_idle_time_ms = 5000
///
/// [[worker]]
/// file_name = "public/index.php"
/// num_threads = 4
/// watch = ["src/**/*.php", "config/*.{yaml,php}"]
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct RuntimeConfig {
    pub log_level: Option<String>,
    pub pool: Option<PoolSection>,
    pub scaling: Option<ScalingConfig>,
    #[serde(default, rename = "worker")]
    pub workers: Vec<WorkerConfig>,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PoolSection {
    pub num_threads: Option<usize>,
    pub max_threads: Option<MaxThreads>,
    pub max_wait_time_ms: Option<u64>,
    pub pin_threads: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum MaxThreads {
    Count(i64),
    Named(String),
}

impl MaxThreads {
    fn resolve(&self) -> Result<i64, ConfigError> {
        match self {
            MaxThreads::Count(count) => Ok(*count),
            MaxThreads::Named(name) if name.eq_ignore_ascii_case("auto") => Ok(AUTO_MAX_THREADS),
            MaxThreads::Named(name) => Err(ConfigError::InvalidMaxThreads(name.clone())),
        }
    }
}

impl RuntimeConfig {
    /// Load the first config file found, or defaults when there is none.
    ///
    /// Lookup order: `explicit`, `$PHP_POOL_CONFIG`, `./pool.toml`,
    /// `$XDG_CONFIG_HOME/php-pool/pool.toml` (or `~/.config/...`),
    /// `/etc/php-pool/pool.toml`.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::find_config_path(explicit, |key| std::env::var_os(key)) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.source = Some(path.to_path_buf());
        tracing::debug!("Loaded runtime config from {}", path.display());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// The pool configuration with `PHP_*` environment overrides applied.
    pub fn pool_config(&self) -> Result<PoolConfig, ConfigError> {
        self.pool_config_with(|key| std::env::var(key).ok())
    }

    pub fn pool_config_with<F>(&self, lookup: F) -> Result<PoolConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = PoolConfig::default();
        let section = self.pool.as_ref();

        if let Some(num_threads) = section.and_then(|pool| pool.num_threads) {
            config.num_threads = num_threads;
        }
        let configured_max = section
            .and_then(|pool| pool.max_threads.as_ref())
            .map(MaxThreads::resolve)
            .transpose()?;
        if let Some(wait) = section.and_then(|pool| pool.max_wait_time_ms) {
            config.max_wait_time_ms = wait;
        }
        if let Some(pin) = section.and_then(|pool| pool.pin_threads) {
            config.pin_threads = pin;
        }
        if let Some(scaling) = &self.scaling {
            config.scaling = scaling.clone();
        }
        config.workers = self.workers.clone();

        let env_max = lookup("PHP_MAX_THREADS");
        config.apply_env(&lookup);

        // without an explicit limit there is no autoscaling
        match (configured_max, env_max) {
            (_, Some(_)) => {}
            (Some(max_threads), None) => config.max_threads = max_threads,
            (None, None) => config.max_threads = config.num_threads as i64,
        }

        config.validate()?;
        Ok(config)
    }

    fn find_config_path<F>(explicit: Option<&Path>, var: F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<std::ffi::OsString>,
    {
        if let Some(path) = explicit {
            // a missing explicit file is reported by the read
            return Some(path.to_path_buf());
        }

        if let Some(path) = var(CONFIG_ENV).map(PathBuf::from) {
            if path.exists() {
                return Some(path);
            }
            tracing::warn!("{} set but file not found: {}", CONFIG_ENV, path.display());
        }

        let mut candidates = vec![PathBuf::from("pool.toml")];
        if let Some(dir) = var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| var("HOME").map(|home| PathBuf::from(home).join(".config")))
        {
            candidates.push(dir.join("php-pool").join("pool.toml"));
        }
        candidates.push(PathBuf::from("/etc/php-pool/pool.toml"));

        candidates.into_iter().find(|path| path.exists())
    }
}
