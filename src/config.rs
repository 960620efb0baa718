use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::BaseDirs;
use serde::Deserialize;
use tracing::warn;

use crate::label::{DisplayLabelOrder, NameProperty};
use crate::phone::DEFAULT_MATCH_DIGITS;

const CONFIG_FILE_NAME: &str = "config.toml";
const DATABASE_FILE_NAME: &str = "contacts.db";
const APP_NAME: &str = "contact-cache";

#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: Option<PathBuf>,
    pub database: PathBuf,
    pub phone_region: Option<String>,
    pub cache: CacheConfig,
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Tuning of the cache engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Quiet period after a change notification before changed contacts are
    /// fetched.
    pub change_quiet: Duration,
    /// Longest a pending change fetch is postponed by further notifications.
    pub change_max_wait: Duration,
    /// Retry delay when a change flush finds a fetch still running.
    pub fetch_retry: Duration,
    /// How long an unused cache stays alive.
    pub expiry_grace: Duration,
    /// Trailing digits compared when matching phone numbers.
    pub phone_match_digits: usize,
    pub display_label_order: DisplayLabelOrder,
    pub sort_property: NameProperty,
    pub group_property: NameProperty,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            change_quiet: Duration::from_millis(500),
            change_max_wait: Duration::from_millis(5000),
            fetch_retry: Duration::from_millis(250),
            expiry_grace: Duration::from_millis(30_000),
            phone_match_digits: DEFAULT_MATCH_DIGITS,
            display_label_order: DisplayLabelOrder::default(),
            sort_property: NameProperty::default(),
            group_property: NameProperty::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CacheConfigFile {
    change_quiet_ms: Option<u64>,
    change_max_wait_ms: Option<u64>,
    fetch_retry_ms: Option<u64>,
    expiry_grace_ms: Option<u64>,
    phone_match_digits: Option<usize>,
    display_label_order: Option<String>,
    sort_property: Option<String>,
    group_property: Option<String>,
}

impl CacheConfigFile {
    fn into_config(self) -> Result<CacheConfig> {
        let defaults = CacheConfig::default();
        let millis = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };

        let phone_match_digits = self
            .phone_match_digits
            .unwrap_or(defaults.phone_match_digits);
        if phone_match_digits == 0 {
            bail!("cache.phone_match_digits must be at least 1");
        }

        let display_label_order = match self.display_label_order.as_deref() {
            Some(value) => DisplayLabelOrder::from_str(value).with_context(|| {
                format!("invalid cache.display_label_order `{value}` (expected first_name_first or last_name_first)")
            })?,
            None => defaults.display_label_order,
        };
        let sort_property = parse_property("sort_property", self.sort_property.as_deref())?
            .unwrap_or(defaults.sort_property);
        let group_property = parse_property("group_property", self.group_property.as_deref())?
            .unwrap_or(defaults.group_property);

        Ok(CacheConfig {
            change_quiet: millis(self.change_quiet_ms, defaults.change_quiet),
            change_max_wait: millis(self.change_max_wait_ms, defaults.change_max_wait),
            fetch_retry: millis(self.fetch_retry_ms, defaults.fetch_retry),
            expiry_grace: millis(self.expiry_grace_ms, defaults.expiry_grace),
            phone_match_digits,
            display_label_order,
            sort_property,
            group_property,
        })
    }
}

fn parse_property(key: &str, value: Option<&str>) -> Result<Option<NameProperty>> {
    value
        .map(|value| {
            NameProperty::from_str(value).with_context(|| {
                format!("invalid cache.{key} `{value}` (expected first_name or last_name)")
            })
        })
        .transpose()
}

// =============================================================================
// File loading
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    database: Option<PathBuf>,
    phone_region: Option<String>,
    cache: CacheConfigFile,
}

/// Expand ~ to home directory in paths
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn config_root() -> Result<PathBuf> {
    let base = BaseDirs::new().context("unable to determine base directories")?;
    Ok(base.config_dir().join(APP_NAME))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_root()?.join(CONFIG_FILE_NAME))
}

pub fn default_database_path() -> Result<PathBuf> {
    let base = BaseDirs::new().context("unable to determine data directories")?;
    Ok(base.data_dir().join(APP_NAME).join(DATABASE_FILE_NAME))
}

/// Load the configuration.
///
/// An explicitly given file must exist; the default location is optional
/// and defaults apply when it is missing.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("configuration file not found at {}", path.display());
            }
            Some(path.to_path_buf())
        }
        None => config_path().ok().filter(|path| path.exists()),
    };

    let Some(path) = path else {
        return Ok(Config {
            config_path: None,
            database: default_database_path()?,
            phone_region: None,
            cache: CacheConfig::default(),
        });
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration file at {}", path.display()))?;
    let mut config = parse(&raw).with_context(|| format!("invalid configuration in {}", path.display()))?;
    config.config_path = Some(path);
    Ok(config)
}

pub fn parse(raw: &str) -> Result<Config> {
    let value: toml::Value = toml::from_str(raw).context("failed to parse configuration as TOML")?;

    warn_unknown_keys(&value);

    let cfg_file: ConfigFile = value
        .try_into()
        .context("failed to deserialize configuration")?;

    let database = match cfg_file.database {
        Some(path) => expand_tilde(&path),
        None => default_database_path()?,
    };

    let phone_region = cfg_file
        .phone_region
        .as_ref()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_ascii_uppercase());

    Ok(Config {
        config_path: None,
        database,
        phone_region,
        cache: cfg_file.cache.into_config()?,
    })
}

// =============================================================================
// Unknown key warnings
// =============================================================================

fn warn_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else {
        return;
    };

    let known = HashSet::from(["database", "phone_region", "cache"]);
    for key in table.keys() {
        if !known.contains(key.as_str()) {
            warn!("unknown configuration key `{}`", key);
        }
    }

    if let Some(cache) = table.get("cache").and_then(|v| v.as_table()) {
        let known = HashSet::from([
            "change_quiet_ms",
            "change_max_wait_ms",
            "fetch_retry_ms",
            "expiry_grace_ms",
            "phone_match_digits",
            "display_label_order",
            "sort_property",
            "group_property",
        ]);
        for key in cache.keys() {
            if !known.contains(key.as_str()) {
                warn!("unknown cache.* configuration key `{}`", key);
            }
        }
    }
}
