use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::offline::ReplayPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Application origin; only same-origin requests are intercepted
  pub origin: String,
  /// Pass cross-origin requests straight through
  pub same_origin_only: bool,
  pub stores: StoreConfig,
  pub freshness: FreshnessConfig,
  pub routes: RouteConfig,
  /// Critical static paths pre-warmed into the static store on install
  pub precache: Vec<String>,
  /// Static store entry served when a cache-first fetch fails (e.g. "/offline.html")
  pub offline_fallback: Option<String>,
  pub queue: QueueConfig,
  pub network: NetworkConfig,
  /// SQLite file (defaults to $XDG_DATA_HOME/netcache/netcache.db)
  pub database: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      same_origin_only: true,
      stores: StoreConfig::default(),
      freshness: FreshnessConfig::default(),
      routes: RouteConfig::default(),
      precache: vec!["/".to_string(), "/offline.html".to_string()],
      offline_fallback: Some("/offline.html".to_string()),
      queue: QueueConfig::default(),
      network: NetworkConfig::default(),
      database: None,
    }
  }
}

/// A logical store and its generation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreSpec {
  pub name: String,
  pub generation: u32,
}

impl StoreSpec {
  pub fn new(name: &str, generation: u32) -> Self {
    Self {
      name: name.to_string(),
      generation,
    }
  }

  /// Versioned store name, e.g. `static-v3`.
  pub fn versioned_name(&self) -> String {
    format!("{}-v{}", self.name, self.generation)
  }
}

/// The stores owned by the engine, each versioned independently.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub static_assets: StoreSpec,
  pub api: StoreSpec,
  pub pages: StoreSpec,
  pub runtime: StoreSpec,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      static_assets: StoreSpec::new("static", 1),
      api: StoreSpec::new("api", 1),
      pages: StoreSpec::new("pages", 1),
      runtime: StoreSpec::new("runtime", 1),
    }
  }
}

impl StoreConfig {
  /// Every store name belonging to the current generation.
  pub fn expected_names(&self) -> Vec<String> {
    [&self.static_assets, &self.api, &self.pages, &self.runtime]
      .iter()
      .map(|spec| spec.versioned_name())
      .collect()
  }
}

/// How old a stored entry may be and still serve as a network-first fallback.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
  pub api_max_age_ms: i64,
  pub document_max_age_ms: i64,
}

impl Default for FreshnessConfig {
  fn default() -> Self {
    Self {
      api_max_age_ms: 5 * 60 * 1000,
      document_max_age_ms: 24 * 60 * 60 * 1000,
    }
  }
}

impl FreshnessConfig {
  pub fn api_max_age(&self) -> Duration {
    Duration::milliseconds(self.api_max_age_ms)
  }

  pub fn document_max_age(&self) -> Duration {
    Duration::milliseconds(self.document_max_age_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
  pub api_prefix: String,
  pub static_prefixes: Vec<String>,
  /// Compared case-insensitively, without the dot
  pub static_extensions: Vec<String>,
}

impl Default for RouteConfig {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      static_prefixes: vec!["/assets/".to_string(), "/static/".to_string()],
      static_extensions: [
        "js", "mjs", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2",
        "ttf", "otf",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub policy: ReplayPolicy,
  /// Keep the queue in this JSON file instead of the database
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
  pub probe_interval_secs: u64,
  /// Path probed for connectivity
  pub probe_path: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 10,
      probe_interval_secs: 15,
      probe_path: "/".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./netcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/netcache/config.yaml
  ///
  /// Without any file the defaults apply. `NETCACHE_ORIGIN` overrides the origin.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var("NETCACHE_ORIGIN") {
      config.origin = origin;
    }

    config.origin_url()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("netcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("netcache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// The origin as a URL; must be http(s).
  pub fn origin_url(&self) -> Result<Url> {
    let url =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {:?}: {}", self.origin, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be http or https: {}", self.origin));
    }
    Ok(url)
  }

  /// Resolve an origin-relative path to a full URL.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid path {:?}: {}", path, e))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => crate::db::Database::default_path(),
    }
  }
}
