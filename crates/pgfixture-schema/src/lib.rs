//! Configuration and version schema for pgfixture.
//!
//! This crate defines the inputs of the fixture: layered `FixtureProperties`
//! (defaults, optional TOML file, `PGFIXTURE_*` environment), the closed set of
//! supported PostgreSQL distributions (`EngineVersion`) with prefix-based token
//! resolution, and the immutable `InstanceConfig` built fresh for every start.

pub mod instance;
pub mod properties;
pub mod version;

pub use instance::InstanceConfig;
pub use properties::{default_config_path, FixtureProperties, PoolSettings};
pub use version::{resolve_version, EngineVersion};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown version '{token}', valid versions: {valid}")]
    UnknownVersion { token: String, valid: String },
    #[error("failed to read properties file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse properties: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid property {key}: {reason}")]
    InvalidProperty { key: String, reason: String },
}
