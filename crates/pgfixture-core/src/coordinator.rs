use crate::connection::{build_pool_config, build_url, redact_url, CredentialOverrides, PoolConfig};
use crate::driver::{Driver, DriverError, PostgresDriver};
use crate::lifecycle::{validate_transition, LifecycleState};
use crate::pool::{PgPool, PgPooledConnection};
use crate::resource::ResourceResolver;
use crate::script::{parse_locators, ScriptRunner};
use crate::CoreError;
use pgfixture_runtime::{free_port, select_backend, EngineBackend, ProcessSupervisor, RuntimeStatus};
use pgfixture_schema::{resolve_version, FixtureProperties, InstanceConfig};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, TryLockError};
use tracing::{debug, error, info, warn};

/// The published endpoint: where the database is and a pool onto it.
pub struct DataSource<P> {
    url: String,
    pool_config: PoolConfig,
    instance: InstanceConfig,
    pool: P,
}

impl<P> DataSource<P> {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool_config
    }

    pub fn instance(&self) -> &InstanceConfig {
        &self.instance
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }
}

impl DataSource<PgPool> {
    /// Check a connection out of the pool.
    pub fn get(&self) -> Result<PgPooledConnection, DriverError> {
        Ok(self.pool.get()?)
    }
}

impl<P> fmt::Debug for DataSource<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("url", &redact_url(&self.url))
            .field("pool_config", &self.pool_config)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

/// Observation snapshot of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    pub state: LifecycleState,
    pub url: Option<String>,
    pub runtime: Option<RuntimeStatus>,
}

struct Published<P> {
    state: LifecycleState,
    endpoint: Option<Arc<DataSource<P>>>,
}

/// Drives one throwaway database through
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`.
///
/// Transitions are serialized by the supervisor mutex; a second caller
/// while one is in flight gets `TransitionInProgress`. State and endpoint are
/// published together, so an observer never sees `Running` without an
/// endpoint or an endpoint whose bootstrap scripts have not finished.
pub struct LifecycleCoordinator<D: Driver = PostgresDriver> {
    props: FixtureProperties,
    driver: D,
    supervisor: Mutex<ProcessSupervisor>,
    published: RwLock<Published<D::Pool>>,
}

impl LifecycleCoordinator<PostgresDriver> {
    /// Coordinator using the backend named in `props` and the postgres driver.
    pub fn new(props: FixtureProperties) -> Result<Self, CoreError> {
        let backend = select_backend(&props.backend, props.bin_dir.as_deref())?;
        Ok(Self::with_parts(props, backend, PostgresDriver))
    }
}

impl<D: Driver> LifecycleCoordinator<D> {
    pub fn with_parts(props: FixtureProperties, backend: Box<dyn EngineBackend>, driver: D) -> Self {
        Self {
            props,
            driver,
            supervisor: Mutex::new(ProcessSupervisor::new(backend)),
            published: RwLock::new(Published {
                state: LifecycleState::Stopped,
                endpoint: None,
            }),
        }
    }

    pub fn properties(&self) -> &FixtureProperties {
        &self.props
    }

    pub fn state(&self) -> LifecycleState {
        self.read_published().state
    }

    /// The published endpoint, present only while `Running`.
    pub fn data_source(&self) -> Option<Arc<DataSource<D::Pool>>> {
        self.read_published().endpoint.clone()
    }

    pub fn instance(&self) -> Option<InstanceConfig> {
        self.read_published()
            .endpoint
            .as_ref()
            .map(|ds| ds.instance.clone())
    }

    /// Never blocks; `runtime` is `None` while a transition holds the
    /// supervisor.
    pub fn status(&self) -> CoordinatorStatus {
        let (state, url) = {
            let published = self.read_published();
            (
                published.state,
                published.endpoint.as_ref().map(|ds| redact_url(&ds.url)),
            )
        };
        let runtime = self.supervisor.try_lock().ok().map(|s| s.status());
        CoordinatorStatus {
            state,
            url,
            runtime,
        }
    }

    /// Start the database, or restart it if it is already running.
    ///
    /// Returns the endpoint once the engine is reachable, every bootstrap
    /// script has run, and the pool is open. Any failure on the way is
    /// reported as `CoreError::Initialization`, after the engine has been
    /// stopped and the state reset to `Stopped`.
    pub fn refresh(
        &self,
        resolver: &dyn ResourceResolver,
    ) -> Result<Arc<DataSource<D::Pool>>, CoreError> {
        let mut supervisor = self.begin_transition()?;

        if self.state() == LifecycleState::Running {
            info!("restarting postgres");
            self.stop_locked(&mut supervisor)?;
        }
        self.publish(LifecycleState::Starting, None)?;

        match self.start_locked(&mut supervisor, resolver) {
            Ok(endpoint) => {
                self.publish(LifecycleState::Running, Some(Arc::clone(&endpoint)))?;
                info!("postgres available at {}", redact_url(endpoint.url()));
                Ok(endpoint)
            }
            Err(e) => {
                error!("problem initializing postgres database: {e}");
                if let Err(stop_err) = supervisor.stop() {
                    warn!("cleanup after failed start: {stop_err}");
                }
                self.publish(LifecycleState::Stopped, None)?;
                Err(CoreError::Initialization(Box::new(e)))
            }
        }
    }

    /// Stop the database. A no-op when already stopped. Engine stop failures
    /// are logged and the state still ends at `Stopped`.
    pub fn stop(&self) -> Result<(), CoreError> {
        let mut supervisor = self.begin_transition()?;
        if self.state() == LifecycleState::Stopped {
            info!("postgres already stopped");
            return Ok(());
        }
        self.stop_locked(&mut supervisor)
    }

    fn start_locked(
        &self,
        supervisor: &mut ProcessSupervisor,
        resolver: &dyn ResourceResolver,
    ) -> Result<Arc<DataSource<D::Pool>>, CoreError> {
        let version = resolve_version(&self.props.version)?;
        let port = match self.props.port {
            Some(port) => port,
            None => free_port(&self.props.host)?,
        };
        let instance = InstanceConfig::from_properties(&self.props, version, port);

        let prepared = supervisor.prepare(instance.clone())?;
        supervisor.start(prepared)?;

        let url = build_url(&instance);
        let mut conn = self
            .driver
            .connect(&instance)
            .map_err(|e| CoreError::Connectivity {
                address: instance.address(),
                source: e,
            })?;

        let sources = parse_locators(self.props.post_exec_sql_files.as_deref().unwrap_or(""));
        let report = ScriptRunner::new(resolver).run(&sources, &mut conn)?;
        drop(conn);
        if !report.executed.is_empty() {
            info!(
                "bootstrap executed {} statements from {} scripts",
                report.total_statements(),
                report.executed.len()
            );
        }

        let pool_config =
            build_pool_config(&instance, &CredentialOverrides::from_settings(&self.props.pool))
                .with_settings(&self.props.pool);
        let pool = self.driver.open_pool(&pool_config).map_err(CoreError::Pool)?;

        Ok(Arc::new(DataSource {
            url,
            pool_config,
            instance,
            pool,
        }))
    }

    fn stop_locked(&self, supervisor: &mut ProcessSupervisor) -> Result<(), CoreError> {
        // The pool goes first so its idle connections close while the
        // engine can still acknowledge them.
        if let Some(endpoint) = self.publish(LifecycleState::Stopping, None)? {
            let held = Arc::strong_count(&endpoint) - 1;
            if held > 0 {
                debug!("{held} endpoint handles still held, their connections will drop with postgres");
            }
            drop(endpoint);
        }
        if let Err(e) = supervisor.stop() {
            warn!("failed to stop postgres cleanly: {e}");
        }
        self.publish(LifecycleState::Stopped, None)?;
        info!("postgres stopped");
        Ok(())
    }

    fn begin_transition(&self) -> Result<MutexGuard<'_, ProcessSupervisor>, CoreError> {
        match self.supervisor.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(CoreError::TransitionInProgress),
            Err(TryLockError::Poisoned(_)) => Err(CoreError::LockPoisoned),
        }
    }

    /// Move to `to` and swap in `endpoint`, handing back the one it replaces.
    fn publish(
        &self,
        to: LifecycleState,
        endpoint: Option<Arc<DataSource<D::Pool>>>,
    ) -> Result<Option<Arc<DataSource<D::Pool>>>, CoreError> {
        let mut published = self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        validate_transition(published.state, to)?;
        published.state = to;
        Ok(std::mem::replace(&mut published.endpoint, endpoint))
    }

    fn read_published(&self) -> RwLockReadGuard<'_, Published<D::Pool>> {
        self.published.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D: Driver> fmt::Debug for LifecycleCoordinator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("props", &self.props)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::StatementExecutor;
    use pgfixture_runtime::{MockBackend, MockBehavior, MockCounters};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullConnection;

    impl StatementExecutor for NullConnection {
        fn execute(&mut self, _statement: &str) -> Result<(), DriverError> {
            Ok(())
        }
    }

    struct NullDriver {
        fail_pool: bool,
    }

    impl Driver for NullDriver {
        type Connection = NullConnection;
        type Pool = ();

        fn connect(&self, _instance: &InstanceConfig) -> Result<NullConnection, DriverError> {
            Ok(NullConnection)
        }

        fn open_pool(&self, _config: &PoolConfig) -> Result<(), DriverError> {
            if self.fail_pool {
                Err(DriverError::Other("pool exhausted".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    /// Pool stand-in that records how many engines were running when the
    /// coordinator let go of it.
    struct ReleaseRecorder {
        counters: Arc<MockCounters>,
        running_at_drop: Arc<AtomicUsize>,
    }

    impl Drop for ReleaseRecorder {
        fn drop(&mut self) {
            self.running_at_drop
                .store(self.counters.running(), Ordering::SeqCst);
        }
    }

    struct ReleaseDriver {
        counters: Arc<MockCounters>,
        running_at_drop: Arc<AtomicUsize>,
    }

    impl Driver for ReleaseDriver {
        type Connection = NullConnection;
        type Pool = ReleaseRecorder;

        fn connect(&self, _instance: &InstanceConfig) -> Result<NullConnection, DriverError> {
            Ok(NullConnection)
        }

        fn open_pool(&self, _config: &PoolConfig) -> Result<ReleaseRecorder, DriverError> {
            Ok(ReleaseRecorder {
                counters: Arc::clone(&self.counters),
                running_at_drop: Arc::clone(&self.running_at_drop),
            })
        }
    }

    fn release_coordinator() -> (LifecycleCoordinator<ReleaseDriver>, Arc<AtomicUsize>) {
        let backend = MockBackend::new();
        let running_at_drop = Arc::new(AtomicUsize::new(usize::MAX));
        let driver = ReleaseDriver {
            counters: backend.counters(),
            running_at_drop: Arc::clone(&running_at_drop),
        };
        let c = LifecycleCoordinator::with_parts(props(), Box::new(backend), driver);
        (c, running_at_drop)
    }

    fn props() -> FixtureProperties {
        let mut props = FixtureProperties::default();
        props.host = "127.0.0.1".to_owned();
        props.backend = "mock".to_owned();
        props.startup_timeout_secs = 1;
        props
    }

    fn no_resources(_: &str) -> Option<PathBuf> {
        None
    }

    fn coordinator(behavior: MockBehavior, fail_pool: bool) -> LifecycleCoordinator<NullDriver> {
        LifecycleCoordinator::with_parts(
            props(),
            Box::new(MockBackend::with_behavior(behavior)),
            NullDriver { fail_pool },
        )
    }

    #[test]
    fn starts_stopped() {
        let c = coordinator(MockBehavior::Healthy, false);
        assert_eq!(c.state(), LifecycleState::Stopped);
        assert!(c.data_source().is_none());
        assert!(c.instance().is_none());
    }

    #[test]
    fn refresh_publishes_endpoint() {
        let c = coordinator(MockBehavior::Healthy, false);
        let ds = c.refresh(&no_resources).unwrap();
        assert_eq!(c.state(), LifecycleState::Running);
        assert!(ds.url().starts_with("postgresql://127.0.0.1:"));
        assert_eq!(c.instance().as_ref(), Some(ds.instance()));

        let status = c.status();
        assert_eq!(status.state, LifecycleState::Running);
        assert!(status.url.unwrap().ends_with("password=***"));
        assert!(status.runtime.unwrap().running);
    }

    #[test]
    fn stop_unpublishes_endpoint() {
        let c = coordinator(MockBehavior::Healthy, false);
        c.refresh(&no_resources).unwrap();
        c.stop().unwrap();
        assert_eq!(c.state(), LifecycleState::Stopped);
        assert!(c.data_source().is_none());
        assert!(!c.status().runtime.unwrap().running);
    }

    #[test]
    fn pool_is_released_before_engine_stops() {
        let (c, running_at_drop) = release_coordinator();
        drop(c.refresh(&no_resources).unwrap());
        assert_eq!(running_at_drop.load(Ordering::SeqCst), usize::MAX);

        c.stop().unwrap();
        assert_eq!(running_at_drop.load(Ordering::SeqCst), 1);
        assert_eq!(c.state(), LifecycleState::Stopped);
    }

    #[test]
    fn restart_releases_old_pool_before_old_engine_stops() {
        let (c, running_at_drop) = release_coordinator();
        drop(c.refresh(&no_resources).unwrap());
        drop(c.refresh(&no_resources).unwrap());
        assert_eq!(running_at_drop.load(Ordering::SeqCst), 1);
        assert_eq!(c.state(), LifecycleState::Running);
    }

    #[test]
    fn pool_held_by_a_consumer_outlives_stop() {
        let (c, running_at_drop) = release_coordinator();
        let ds = c.refresh(&no_resources).unwrap();
        c.stop().unwrap();
        assert_eq!(running_at_drop.load(Ordering::SeqCst), usize::MAX);

        drop(ds);
        assert_eq!(running_at_drop.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pool_failure_is_an_initialization_error() {
        let c = coordinator(MockBehavior::Healthy, true);
        let err = c.refresh(&no_resources).unwrap_err();
        assert!(matches!(&err, CoreError::Initialization(inner) if matches!(**inner, CoreError::Pool(_))));
        assert!(err.to_string().starts_with("problem initializing postgres database"));
        assert_eq!(c.state(), LifecycleState::Stopped);
    }

    #[test]
    fn engine_failure_is_an_initialization_error() {
        let c = coordinator(MockBehavior::ExitOnStart, false);
        let err = c.refresh(&no_resources).unwrap_err();
        assert!(matches!(&err, CoreError::Initialization(inner) if matches!(**inner, CoreError::Runtime(_))));
        assert_eq!(c.state(), LifecycleState::Stopped);
    }

    #[test]
    fn debug_hides_password() {
        let c = coordinator(MockBehavior::Healthy, false);
        let ds = c.refresh(&no_resources).unwrap();
        let out = format!("{ds:?}");
        assert!(out.contains("password=***"));
        assert!(!out.contains("password=postgres"));
    }
}
