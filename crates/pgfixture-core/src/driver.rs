//! The database driver seam.
//!
//! The coordinator only needs two things from a driver: a single direct
//! connection to run bootstrap statements on, and a pool to publish. The
//! production driver is `postgres` + `r2d2`; tests substitute a recording
//! in-memory driver.

use crate::connection::{connect_config, PoolConfig};
use crate::pool::{build_pool, PgPool};
use pgfixture_schema::InstanceConfig;
use postgres::{Client, NoTls};
use std::error::Error as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("postgres error: {}", describe(.0))]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("{0}")]
    Other(String),
}

/// Server-reported errors render as `SEVERITY CODE: message` plus any detail
/// and hint; everything else renders the error and its cause chain.
fn describe(err: &postgres::Error) -> String {
    if let Some(db) = err.as_db_error() {
        let mut text = format!("{} {}: {}", db.severity(), db.code().code(), db.message());
        if let Some(detail) = db.detail() {
            text.push_str(&format!(" (detail: {detail})"));
        }
        if let Some(hint) = db.hint() {
            text.push_str(&format!(" (hint: {hint})"));
        }
        return text;
    }

    let mut text = err.to_string();
    let mut cause = err.source();
    while let Some(e) = cause {
        let part = e.to_string();
        if !text.contains(&part) {
            text.push_str(": ");
            text.push_str(&part);
        }
        cause = e.source();
    }
    text
}

/// Something a SQL statement can be executed on.
pub trait StatementExecutor {
    fn execute(&mut self, statement: &str) -> Result<(), DriverError>;
}

impl StatementExecutor for Client {
    fn execute(&mut self, statement: &str) -> Result<(), DriverError> {
        // Simple query protocol: DDL and multi-word statements need no
        // parameter binding.
        self.batch_execute(statement)?;
        Ok(())
    }
}

pub trait Driver: Send + Sync {
    type Connection: StatementExecutor;
    type Pool: Send + Sync;

    /// Open one direct connection as the instance superuser.
    fn connect(&self, instance: &InstanceConfig) -> Result<Self::Connection, DriverError>;

    /// Build the connection pool that is published to consumers.
    fn open_pool(&self, config: &PoolConfig) -> Result<Self::Pool, DriverError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl Driver for PostgresDriver {
    type Connection = Client;
    type Pool = PgPool;

    fn connect(&self, instance: &InstanceConfig) -> Result<Client, DriverError> {
        Ok(connect_config(instance).connect(NoTls)?)
    }

    fn open_pool(&self, config: &PoolConfig) -> Result<PgPool, DriverError> {
        build_pool(config)
    }
}
