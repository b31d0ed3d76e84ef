//! r2d2 integration: connection manager and abandoned-connection reporting.

use crate::connection::{IsolationLevel, PoolConfig};
use crate::driver::DriverError;
use postgres::{Client, NoTls};
use r2d2::event::{CheckinEvent, CheckoutEvent};
use postgres::error::SqlState;
use r2d2::{HandleError, HandleEvent, ManageConnection};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn, Level};

pub type PgPool = r2d2::Pool<PgConnectionManager>;
pub type PgPooledConnection = r2d2::PooledConnection<PgConnectionManager>;

/// A pooled client plus the time it last passed validation.
pub struct ValidatedClient {
    client: Client,
    last_validated: Instant,
}

impl Deref for ValidatedClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl DerefMut for ValidatedClient {
    fn deref_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

#[derive(Debug)]
pub struct PgConnectionManager {
    config: postgres::Config,
    validation_query: String,
    validation_interval: Duration,
    isolation: IsolationLevel,
}

impl PgConnectionManager {
    pub fn new(pool: &PoolConfig) -> Result<Self, postgres::Error> {
        let mut config: postgres::Config = pool.connection_url.parse()?;
        config
            .user(&pool.username)
            .password(&pool.password)
            .connect_timeout(pool.max_wait);
        Ok(Self {
            config,
            validation_query: pool.validation_query.clone(),
            validation_interval: pool.validation_interval,
            isolation: pool.isolation,
        })
    }
}

impl ManageConnection for PgConnectionManager {
    type Connection = ValidatedClient;
    type Error = postgres::Error;

    fn connect(&self) -> Result<ValidatedClient, postgres::Error> {
        let mut client = self.config.connect(NoTls)?;
        client.batch_execute(&format!(
            "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
            self.isolation.as_sql()
        ))?;
        Ok(ValidatedClient {
            client,
            last_validated: Instant::now(),
        })
    }

    fn is_valid(&self, conn: &mut ValidatedClient) -> Result<(), postgres::Error> {
        if conn.last_validated.elapsed() < self.validation_interval {
            return Ok(());
        }
        conn.client.simple_query(&self.validation_query)?;
        conn.last_validated = Instant::now();
        Ok(())
    }

    fn has_broken(&self, conn: &mut ValidatedClient) -> bool {
        conn.client.is_closed()
    }
}

/// Tracks checked-out connections and logs the ones held past the
/// abandonment timeout once the pool is busy enough.
///
/// r2d2 has no way to reclaim a connection its holder still owns, so an
/// abandoned connection is reported, not closed.
#[derive(Debug)]
pub struct AbandonedConnectionMonitor {
    max_active: u32,
    timeout: Duration,
    percentage_full: u8,
    log_abandoned: bool,
    checked_out: Mutex<HashMap<u64, Instant>>,
}

impl AbandonedConnectionMonitor {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            max_active: config.max_active,
            timeout: config.remove_abandoned_timeout,
            percentage_full: config.abandon_when_percentage_full,
            log_abandoned: config.log_abandoned,
            checked_out: Mutex::new(HashMap::new()),
        }
    }

    /// Records a checkout and returns the connections considered abandoned
    /// at this point (empty while the pool is below the fill threshold).
    pub fn record_checkout(&self, id: u64, now: Instant) -> Vec<(u64, Duration)> {
        let Ok(mut map) = self.checked_out.lock() else {
            return Vec::new();
        };
        map.insert(id, now);

        let in_use = map.len() as u64;
        if in_use * 100 < u64::from(self.max_active) * u64::from(self.percentage_full) {
            return Vec::new();
        }
        let mut abandoned: Vec<(u64, Duration)> = map
            .iter()
            .map(|(id, since)| (*id, now.saturating_duration_since(*since)))
            .filter(|(_, held)| *held > self.timeout)
            .collect();
        abandoned.sort_unstable();
        abandoned
    }

    pub fn record_checkin(&self, id: u64) {
        if let Ok(mut map) = self.checked_out.lock() {
            map.remove(&id);
        }
    }

    pub fn in_use(&self) -> usize {
        self.checked_out.lock().map_or(0, |m| m.len())
    }
}

impl HandleEvent for AbandonedConnectionMonitor {
    fn handle_checkout(&self, event: CheckoutEvent) {
        let abandoned = self.record_checkout(event.connection_id(), Instant::now());
        if self.log_abandoned {
            for (id, held) in abandoned {
                warn!("connection {id} checked out for {held:?} looks abandoned");
            }
        }
    }

    fn handle_checkin(&self, event: CheckinEvent) {
        self.record_checkin(event.connection_id());
        if self.log_abandoned && event.duration() > self.timeout {
            warn!(
                "connection {} returned after {:?}, past the abandonment timeout",
                event.connection_id(),
                event.duration()
            );
        }
    }
}

/// Logs errors raised by r2d2's background work (idle refills, reaping).
///
/// Failures caused by the engine going away, whether transport errors or
/// the server's own shutdown notices, are logged at debug. Other
/// server-reported errors are warnings. A failed checkout is still returned
/// to the caller of `get`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolErrorLog;

impl PoolErrorLog {
    pub fn level(error: &postgres::Error) -> Level {
        match error.as_db_error() {
            Some(db)
                if *db.code() != SqlState::ADMIN_SHUTDOWN
                    && *db.code() != SqlState::CRASH_SHUTDOWN
                    && *db.code() != SqlState::CANNOT_CONNECT_NOW =>
            {
                Level::WARN
            }
            _ => Level::DEBUG,
        }
    }
}

impl HandleError<postgres::Error> for PoolErrorLog {
    fn handle_error(&self, error: postgres::Error) {
        let level = Self::level(&error);
        let error = DriverError::from(error);
        if level == Level::WARN {
            warn!("connection pool: {error}");
        } else {
            debug!("connection pool: {error}");
        }
    }
}

/// Build the r2d2 pool. Blocks until `min_idle` connections are open or
/// `max_wait` elapses.
pub fn build_pool(config: &PoolConfig) -> Result<PgPool, DriverError> {
    let manager = PgConnectionManager::new(config)?;
    let mut builder = r2d2::Pool::builder()
        .max_size(config.max_active)
        .min_idle(Some(config.min_idle))
        .connection_timeout(config.max_wait)
        .idle_timeout(Some(config.min_evictable_idle))
        .test_on_check_out(config.test_on_borrow)
        .error_handler(Box::new(PoolErrorLog));
    if config.remove_abandoned {
        builder = builder.event_handler(Box::new(AbandonedConnectionMonitor::new(config)));
    }
    Ok(builder.build(manager)?)
}
