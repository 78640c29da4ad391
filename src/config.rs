use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{KeyPattern, ProfileTable, SqliteStore, Strategy, StrategyProfile};
use crate::executor::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub http: HttpConfig,
}

/// Engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Strategy for keys that no profile binding covers
  pub default_strategy: Strategy,
  pub profiles: Vec<ProfileBinding>,
  pub retry: RetryConfig,
  /// Period of the background eviction sweep
  pub gc_interval_ms: u64,
  pub persistence: PersistenceConfig,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_strategy: Strategy::default(),
      profiles: Vec::new(),
      retry: RetryConfig::default(),
      gc_interval_ms: 60_000,
      persistence: PersistenceConfig::default(),
    }
  }
}

impl CacheConfig {
  pub fn gc_interval(&self) -> Duration {
    Duration::from_millis(self.gc_interval_ms)
  }

  pub fn profile_table(&self) -> ProfileTable {
    self.profiles.iter().fold(
      ProfileTable::new(self.default_strategy.profile()),
      |table, binding| table.bind(binding.prefix.as_str(), binding.profile()),
    )
  }
}

/// Binds a strategy (with optional overrides) to a key prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileBinding {
  pub prefix: String,
  #[serde(default)]
  pub strategy: Strategy,
  pub stale_time_ms: Option<u64>,
  pub gc_time_ms: Option<u64>,
  pub refetch_on_focus: Option<bool>,
  pub refetch_interval_ms: Option<u64>,
}

impl ProfileBinding {
  pub fn profile(&self) -> StrategyProfile {
    let base = self.strategy.profile();
    let mut profile = StrategyProfile::new(
      self
        .stale_time_ms
        .map(Duration::from_millis)
        .unwrap_or(base.stale_time),
      self
        .gc_time_ms
        .map(Duration::from_millis)
        .unwrap_or(base.gc_time),
    )
    .with_focus(self.refetch_on_focus.unwrap_or(base.refetch_on_focus));
    profile.refetch_interval = self
      .refetch_interval_ms
      .map(Duration::from_millis)
      .or(base.refetch_interval);
    profile
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
  Fixed,
  #[default]
  Exponential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub count: u32,
  pub delay_ms: u64,
  pub backoff: BackoffKind,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      count: 3,
      delay_ms: 1000,
      backoff: BackoffKind::Exponential,
      max_delay_ms: 30_000,
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    let delay = Duration::from_millis(self.delay_ms);
    match self.backoff {
      BackoffKind::Fixed => RetryPolicy::fixed(self.count, delay),
      BackoffKind::Exponential => RetryPolicy::exponential(
        self.count,
        delay,
        Duration::from_millis(self.max_delay_ms).max(delay),
      ),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
  pub enabled: bool,
  /// Database file (default: $XDG_DATA_HOME/querykit/cache.db)
  pub path: Option<PathBuf>,
  /// Key patterns mirrored to durable storage
  pub keys: Vec<String>,
}

impl PersistenceConfig {
  pub fn patterns(&self) -> crate::error::Result<Vec<KeyPattern>> {
    self.keys.iter().map(|k| KeyPattern::parse(k)).collect()
  }

  /// Open the SQLite database at `path`, or at the default location.
  pub fn open_store(&self) -> crate::error::Result<SqliteStore> {
    match &self.path {
      Some(path) => SqliteStore::open_at(path),
      None => SqliteStore::open(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub timeout_ms: u64,
  pub user_agent: String,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      timeout_ms: 10_000,
      user_agent: concat!("querykit/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./querykit.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/querykit/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("querykit.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("querykit").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::QueryKey;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.cache.gc_interval(), Duration::from_secs(60));
    assert_eq!(config.cache.retry.policy(), RetryPolicy::default());
    assert!(!config.cache.persistence.enabled);
  }

  #[test]
  fn test_profile_overrides() {
    let config = Config::from_yaml(
      r#"
cache:
  default_strategy: static
  profiles:
    - prefix: "user"
      strategy: dynamic
      stale_time_ms: 1000
    - prefix: "ticker"
      strategy: realtime
      refetch_interval_ms: 2500
  retry:
    count: 1
    delay_ms: 200
    backoff: fixed
  persistence:
    enabled: true
    keys: ["user", "http:*"]
"#,
    )
    .unwrap();

    let table = config.cache.profile_table();
    let user = table.resolve(&QueryKey::parse("user:1"));
    assert_eq!(user.stale_time, Duration::from_millis(1000));
    assert!(user.refetch_on_focus);

    let ticker = table.resolve(&QueryKey::parse("ticker:eur"));
    assert_eq!(ticker.refetch_interval, Some(Duration::from_millis(2500)));

    assert_eq!(
      table.resolve(&QueryKey::parse("country:fr")),
      Strategy::Static.profile()
    );

    assert_eq!(
      config.cache.retry.policy(),
      RetryPolicy::fixed(1, Duration::from_millis(200))
    );
    assert_eq!(config.cache.persistence.patterns().unwrap().len(), 2);
  }
}
