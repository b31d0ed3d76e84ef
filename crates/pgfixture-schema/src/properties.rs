use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const ENV_PREFIX: &str = "PGFIXTURE_";

/// Settings that drive a fixture instance.
///
/// Every field has a default, so an empty TOML document is a valid
/// configuration. `load()` layers an optional per-user file and then
/// `PGFIXTURE_*` environment variables on top of the defaults.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FixtureProperties {
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_db_name")]
    pub db_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Comma separated list of scripts to execute once the database is up.
    /// Entries are file paths or `classpath:` resources.
    #[serde(default)]
    pub post_exec_sql_files: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    /// Fixed port. A free port is picked on every start when unset.
    #[serde(default)]
    pub port: Option<u16>,
    /// Fixed data directory. A temporary directory is used when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
    #[serde(default)]
    pub pool: PoolSettings,
}

/// Overrides for the published connection pool. Unset fields keep the
/// baseline pool policy.
#[derive(Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub min_idle: Option<u32>,
    #[serde(default)]
    pub max_active: Option<u32>,
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
    #[serde(default)]
    pub remove_abandoned_timeout_secs: Option<u64>,
    #[serde(default)]
    pub abandon_when_percentage_full: Option<u8>,
}

fn default_username() -> String {
    "postgres".to_owned()
}

fn default_password() -> String {
    "postgres".to_owned()
}

fn default_db_name() -> String {
    "test".to_owned()
}

fn default_version() -> String {
    "16".to_owned()
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_backend() -> String {
    "native".to_owned()
}

impl Default for FixtureProperties {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: default_password(),
            db_name: default_db_name(),
            version: default_version(),
            post_exec_sql_files: None,
            host: default_host(),
            port: None,
            data_dir: None,
            startup_timeout_secs: default_startup_timeout_secs(),
            backend: default_backend(),
            bin_dir: None,
            pool: PoolSettings::default(),
        }
    }
}

impl fmt::Debug for FixtureProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureProperties")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("db_name", &self.db_name)
            .field("version", &self.version)
            .field("post_exec_sql_files", &self.post_exec_sql_files)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("startup_timeout_secs", &self.startup_timeout_secs)
            .field("backend", &self.backend)
            .field("bin_dir", &self.bin_dir)
            .field("pool", &self.pool)
            .finish()
    }
}

impl fmt::Debug for PoolSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSettings")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("min_idle", &self.min_idle)
            .field("max_active", &self.max_active)
            .field("max_wait_ms", &self.max_wait_ms)
            .field(
                "remove_abandoned_timeout_secs",
                &self.remove_abandoned_timeout_secs,
            )
            .field(
                "abandon_when_percentage_full",
                &self.abandon_when_percentage_full,
            )
            .finish()
    }
}

impl FixtureProperties {
    pub fn from_toml_str(input: &str) -> Result<Self, SchemaError> {
        Ok(toml::from_str(input)?)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load defaults, then `~/.pgfixture/devbuild.toml` if it exists, then
    /// `PGFIXTURE_*` environment variables.
    pub fn load() -> Result<Self, SchemaError> {
        let mut props = match default_config_path() {
            Some(path) if path.is_file() => {
                debug!("loading fixture properties from {}", path.display());
                Self::load_from(&path)?
            }
            _ => Self::default(),
        };
        props.apply_env(|key| std::env::var(key).ok())?;
        Ok(props)
    }

    /// Apply `PGFIXTURE_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), SchemaError> {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("USERNAME") {
            self.username = v;
        }
        if let Some(v) = get("PASSWORD") {
            self.password = v;
        }
        if let Some(v) = get("DB_NAME") {
            self.db_name = v;
        }
        if let Some(v) = get("VERSION") {
            self.version = v;
        }
        if let Some(v) = get("POST_EXEC_SQL_FILES") {
            self.post_exec_sql_files = Some(v);
        }
        if let Some(v) = get("HOST") {
            self.host = v;
        }
        if let Some(v) = get("PORT") {
            self.port = Some(parse_env("PORT", &v)?);
        }
        if let Some(v) = get("DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("STARTUP_TIMEOUT_SECS") {
            self.startup_timeout_secs = parse_env("STARTUP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("BACKEND") {
            self.backend = v;
        }
        if let Some(v) = get("BIN_DIR") {
            self.bin_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, SchemaError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| SchemaError::InvalidProperty {
            key: format!("{ENV_PREFIX}{name}"),
            reason: format!("'{value}': {e}"),
        })
}

/// `~/.pgfixture/devbuild.toml`, or `None` when `HOME` is not set.
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".pgfixture").join("devbuild.toml"))
}
