use crate::properties::FixtureProperties;
use crate::version::EngineVersion;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Everything needed to run one database instance.
///
/// Built fresh on every start and never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub version: EngineVersion,
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub username: String,
    pub password: String,
    /// `None` allocates a temporary directory that is removed on stop.
    pub data_dir: Option<PathBuf>,
    pub startup_timeout: Duration,
}

impl InstanceConfig {
    pub fn from_properties(props: &FixtureProperties, version: EngineVersion, port: u16) -> Self {
        Self {
            version,
            host: props.host.clone(),
            port,
            db_name: props.db_name.clone(),
            username: props.username.clone(),
            password: props.password.clone(),
            data_dir: props.data_dir.clone(),
            startup_timeout: Duration::from_secs(props.startup_timeout_secs),
        }
    }

    /// `host:port`, the address the engine listens on.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("version", &self.version)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_name", &self.db_name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("data_dir", &self.data_dir)
            .field("startup_timeout", &self.startup_timeout)
            .finish()
    }
}
