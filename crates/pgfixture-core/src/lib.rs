//! Lifecycle coordination for throwaway PostgreSQL instances.
//!
//! This crate ties the version schema and the process supervisor together
//! into the `LifecycleCoordinator`: it starts an engine on `refresh`, runs the
//! configured bootstrap scripts on a direct connection, and only then
//! publishes a pooled `DataSource`. It also provides URL and pool policy
//! derivation, the r2d2 connection manager, script parsing, and resource
//! resolution for script locators.

pub mod connection;
pub mod coordinator;
pub mod driver;
pub mod lifecycle;
pub mod logging;
pub mod pool;
pub mod resource;
pub mod script;

pub use connection::{
    build_pool_config, build_url, connect_config, redact_url, CredentialOverrides,
    IsolationLevel, PoolConfig,
};
pub use coordinator::{CoordinatorStatus, DataSource, LifecycleCoordinator};
pub use driver::{Driver, DriverError, PostgresDriver, StatementExecutor};
pub use lifecycle::{validate_transition, LifecycleState};
pub use logging::init_logging;
pub use pool::{
    build_pool, AbandonedConnectionMonitor, PgConnectionManager, PgPool, PgPooledConnection,
};
pub use resource::{FsResourceResolver, ResourceResolver};
pub use script::{parse_locators, parse_statements, ScriptReport, ScriptRunner};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Schema(#[from] pgfixture_schema::SchemaError),
    #[error("runtime error: {0}")]
    Runtime(#[from] pgfixture_runtime::RuntimeError),
    #[error("cannot connect to {address}: {source}")]
    Connectivity {
        address: String,
        source: DriverError,
    },
    #[error("script {script} failed at statement '{statement}': {message}")]
    ScriptExecution {
        script: String,
        statement: String,
        message: String,
    },
    #[error("cannot read script {script}: {source}")]
    ScriptRead {
        script: String,
        source: std::io::Error,
    },
    #[error("cannot open connection pool: {0}")]
    Pool(#[source] DriverError),
    #[error("another lifecycle transition is in progress")]
    TransitionInProgress,
    #[error("lifecycle lock poisoned by a panicked transition")]
    LockPoisoned,
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("problem initializing postgres database: {0}")]
    Initialization(#[source] Box<CoreError>),
}
