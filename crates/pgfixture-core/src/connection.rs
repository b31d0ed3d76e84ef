//! Connection endpoint derivation: URL, driver config, and pool policy.

use pgfixture_schema::{InstanceConfig, PoolSettings};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Login used by the pool instead of the instance superuser.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialOverrides {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl CredentialOverrides {
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            username: settings.username.clone(),
            password: settings.password.clone(),
        }
    }
}

impl fmt::Debug for CredentialOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialOverrides")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Pool policy for short-lived test workloads: small, fails fast on
/// exhaustion, validates on borrow, and reports abandoned connections.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    pub connection_url: String,
    pub username: String,
    pub password: String,
    pub min_idle: u32,
    pub max_active: u32,
    pub max_idle: u32,
    pub initial_size: u32,
    pub max_wait: Duration,
    pub validation_query: String,
    /// A connection validated less than this long ago is not re-validated.
    pub validation_interval: Duration,
    pub test_on_borrow: bool,
    pub time_between_eviction_runs: Duration,
    pub min_evictable_idle: Duration,
    pub log_abandoned: bool,
    pub remove_abandoned: bool,
    pub remove_abandoned_timeout: Duration,
    /// Abandoned checks only run once this share of `max_active` is in use.
    pub abandon_when_percentage_full: u8,
    pub isolation: IsolationLevel,
}

impl PoolConfig {
    /// Apply the sizing and abandonment overrides from the properties.
    #[must_use]
    pub fn with_settings(mut self, settings: &PoolSettings) -> Self {
        if let Some(min_idle) = settings.min_idle {
            self.min_idle = min_idle;
            self.initial_size = min_idle;
        }
        if let Some(max_active) = settings.max_active {
            self.max_active = max_active.max(1);
            self.max_idle = self.max_active;
        }
        self.min_idle = self.min_idle.min(self.max_active);
        self.initial_size = self.initial_size.min(self.max_active);
        if let Some(ms) = settings.max_wait_ms {
            self.max_wait = Duration::from_millis(ms);
        }
        if let Some(secs) = settings.remove_abandoned_timeout_secs {
            self.remove_abandoned_timeout = Duration::from_secs(secs);
        }
        if let Some(pct) = settings.abandon_when_percentage_full {
            self.abandon_when_percentage_full = pct.min(100);
        }
        self
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("connection_url", &redact_url(&self.connection_url))
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("min_idle", &self.min_idle)
            .field("max_active", &self.max_active)
            .field("max_idle", &self.max_idle)
            .field("initial_size", &self.initial_size)
            .field("max_wait", &self.max_wait)
            .field("validation_query", &self.validation_query)
            .field("test_on_borrow", &self.test_on_borrow)
            .field("remove_abandoned", &self.remove_abandoned)
            .field("remove_abandoned_timeout", &self.remove_abandoned_timeout)
            .field("isolation", &self.isolation)
            .finish_non_exhaustive()
    }
}

/// `postgresql://host:port/db?user=..&password=..`
pub fn build_url(config: &InstanceConfig) -> String {
    format!(
        "postgresql://{}:{}/{}?user={}&password={}",
        config.host,
        config.port,
        encode_component(&config.db_name),
        encode_component(&config.username),
        encode_component(&config.password)
    )
}

pub fn build_pool_config(config: &InstanceConfig, overrides: &CredentialOverrides) -> PoolConfig {
    PoolConfig {
        connection_url: build_url(config),
        username: overrides
            .username
            .clone()
            .unwrap_or_else(|| config.username.clone()),
        password: overrides
            .password
            .clone()
            .unwrap_or_else(|| config.password.clone()),
        min_idle: 2,
        max_active: 4,
        max_idle: 4,
        initial_size: 2,
        max_wait: Duration::from_secs(30),
        validation_query: "select 1".to_owned(),
        validation_interval: Duration::from_secs(30),
        test_on_borrow: true,
        time_between_eviction_runs: Duration::from_secs(30),
        min_evictable_idle: Duration::from_secs(60),
        log_abandoned: true,
        remove_abandoned: true,
        remove_abandoned_timeout: Duration::from_secs(60),
        abandon_when_percentage_full: 75,
        isolation: IsolationLevel::ReadCommitted,
    }
}

/// Driver configuration for a direct connection as the instance superuser.
pub fn connect_config(config: &InstanceConfig) -> postgres::Config {
    let mut pg = postgres::Config::new();
    pg.host(&config.host)
        .port(config.port)
        .dbname(&config.db_name)
        .user(&config.username)
        .password(&config.password)
        .connect_timeout(CONNECT_TIMEOUT);
    pg
}

/// Replace the password query parameter with `***`.
pub fn redact_url(url: &str) -> String {
    match url.split_once("password=") {
        Some((head, tail)) => {
            let rest = tail.find('&').map_or("", |i| &tail[i..]);
            format!("{head}password=***{rest}")
        }
        None => url.to_owned(),
    }
}

// RFC 3986 unreserved characters pass through, everything else is escaped.
fn encode_component(value: &str) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgfixture_schema::{EngineVersion, FixtureProperties};

    fn instance() -> InstanceConfig {
        InstanceConfig::from_properties(&FixtureProperties::default(), EngineVersion::V16, 54321)
    }

    #[test]
    fn url_embeds_endpoint_and_credentials() {
        assert_eq!(
            build_url(&instance()),
            "postgresql://localhost:54321/test?user=postgres&password=postgres"
        );
    }

    #[test]
    fn url_escapes_reserved_characters() {
        let mut config = instance();
        config.password = "p@ss&w/rd".to_owned();
        let url = build_url(&config);
        assert!(url.ends_with("password=p%40ss%26w%2Frd"));
    }

    #[test]
    fn url_parses_back_into_driver_config() {
        let url = build_url(&instance());
        let parsed: postgres::Config = url.parse().unwrap();
        assert_eq!(parsed.get_user(), Some("postgres"));
        assert_eq!(parsed.get_dbname(), Some("test"));
        assert_eq!(parsed.get_ports(), &[54321]);
    }

    #[test]
    fn baseline_pool_policy() {
        let pool = build_pool_config(&instance(), &CredentialOverrides::default());
        assert_eq!(pool.username, "postgres");
        assert_eq!(pool.min_idle, 2);
        assert_eq!(pool.max_active, 4);
        assert_eq!(pool.max_idle, 4);
        assert_eq!(pool.initial_size, 2);
        assert_eq!(pool.max_wait, Duration::from_secs(30));
        assert_eq!(pool.validation_query, "select 1");
        assert!(pool.test_on_borrow);
        assert!(pool.remove_abandoned);
        assert_eq!(pool.remove_abandoned_timeout, Duration::from_secs(60));
        assert_eq!(pool.abandon_when_percentage_full, 75);
        assert_eq!(pool.isolation, IsolationLevel::ReadCommitted);
    }

    #[test]
    fn overrides_replace_credentials_only() {
        let overrides = CredentialOverrides {
            username: Some("app".to_owned()),
            password: Some("app-secret".to_owned()),
        };
        let pool = build_pool_config(&instance(), &overrides);
        assert_eq!(pool.username, "app");
        assert_eq!(pool.password, "app-secret");
        assert!(pool.connection_url.starts_with("postgresql://localhost:54321/test?"));
    }

    #[test]
    fn settings_adjust_sizing() {
        let settings = PoolSettings {
            max_active: Some(1),
            max_wait_ms: Some(500),
            ..PoolSettings::default()
        };
        let pool =
            build_pool_config(&instance(), &CredentialOverrides::default()).with_settings(&settings);
        assert_eq!(pool.max_active, 1);
        assert_eq!(pool.max_idle, 1);
        assert_eq!(pool.min_idle, 1);
        assert_eq!(pool.initial_size, 1);
        assert_eq!(pool.max_wait, Duration::from_millis(500));
    }

    #[test]
    fn redaction_hides_password() {
        let url = build_url(&instance());
        assert_eq!(
            redact_url(&url),
            "postgresql://localhost:54321/test?user=postgres&password=***"
        );
        assert!(!format!("{:?}", build_pool_config(&instance(), &CredentialOverrides::default()))
            .contains("password=postgres"));
    }
}
