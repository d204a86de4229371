use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache;
use crate::discourse;
use crate::pagination;

const DEFAULT_ENV_PREFIX: &str = "TOPIC_OVERLAY";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub csrf_token: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            csrf_token: String::new(),
        }
    }
}

fn default_base_url() -> String {
    discourse::DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    concat!("topic-overlay/", env!("CARGO_PKG_VERSION")).to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_expiry", with = "humantime_serde")]
    pub expiry: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            expiry: default_expiry(),
        }
    }
}

fn default_max_entries() -> usize {
    cache::DEFAULT_MAX_ENTRIES
}

fn default_expiry() -> Duration {
    cache::DEFAULT_EXPIRY
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchConfig {
    #[serde(default = "default_min_interval", with = "humantime_serde")]
    pub min_interval: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_initial_pages")]
    pub initial_pages: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            min_interval: default_min_interval(),
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            initial_pages: default_initial_pages(),
        }
    }
}

fn default_min_interval() -> Duration {
    discourse::DEFAULT_MIN_INTERVAL
}

fn default_batch_size() -> usize {
    discourse::DEFAULT_BATCH_SIZE
}

fn default_page_size() -> usize {
    pagination::DEFAULT_PAGE_SIZE
}

fn default_initial_pages() -> usize {
    pagination::DEFAULT_INITIAL_PAGES
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = merge_config(cfg, load_env(prefix)?);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.client.base_url.is_empty() {
        base.client.base_url = other.client.base_url;
    }
    if !other.client.user_agent.is_empty() {
        base.client.user_agent = other.client.user_agent;
    }
    if !other.client.csrf_token.is_empty() {
        base.client.csrf_token = other.client.csrf_token;
    }

    if other.cache.max_entries != 0 {
        base.cache.max_entries = other.cache.max_entries;
    }
    base.cache.expiry = other.cache.expiry;

    base.fetch.min_interval = other.fetch.min_interval;
    if other.fetch.batch_size != 0 {
        base.fetch.batch_size = other.fetch.batch_size;
    }
    if other.fetch.page_size != 0 {
        base.fetch.page_size = other.fetch.page_size;
    }
    if other.fetch.initial_pages != 0 {
        base.fetch.initial_pages = other.fetch.initial_pages;
    }

    base
}

fn load_env(prefix: &str) -> Result<Config> {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    if map.is_empty() {
        return Ok(Config::default());
    }

    let mut cfg = Config::default();

    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }

    Ok(cfg)
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "client.base_url" => cfg.client.base_url = value,
        "client.user_agent" => cfg.client.user_agent = value,
        "client.csrf_token" => cfg.client.csrf_token = value,
        "cache.max_entries" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.cache.max_entries = parsed;
            }
        }
        "cache.expiry" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.cache.expiry = duration;
            }
        }
        "fetch.min_interval" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.fetch.min_interval = duration;
            }
        }
        "fetch.batch_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.fetch.batch_size = parsed;
            }
        }
        "fetch.page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.fetch.page_size = parsed;
            }
        }
        "fetch.initial_pages" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.fetch.initial_pages = parsed;
            }
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("topic-overlay").join("config.yaml"))
}
