use crate::backend::{EngineBackend, EngineProcess};
use crate::layout::InstanceLayout;
use crate::RuntimeError;
use pgfixture_schema::InstanceConfig;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How a mock engine behaves once spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockBehavior {
    #[default]
    Healthy,
    /// Reports itself unavailable, as a native backend does without binaries.
    Unavailable,
    /// `prepare` fails.
    FailPrepare,
    /// The process exits before becoming ready.
    ExitOnStart,
    /// The process never accepts connections.
    NeverReady,
    /// `shutdown` reports an error, though the port is still released.
    FailStop,
}

/// Lifecycle counters shared between a `MockBackend` and its processes.
#[derive(Debug, Default)]
pub struct MockCounters {
    prepared: AtomicUsize,
    spawned: AtomicUsize,
    stopped: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl MockCounters {
    pub fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running mock engines ever observed.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

/// Backend that spawns no engine but holds a real TCP listener on the
/// configured address while "running", so port conflicts behave like they
/// would with a real server.
#[derive(Default)]
pub struct MockBackend {
    counters: Arc<MockCounters>,
    behavior: MockBehavior,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            counters: Arc::default(),
            behavior,
        }
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }
}

impl EngineBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        self.behavior != MockBehavior::Unavailable
    }

    fn prepare(
        &self,
        config: &InstanceConfig,
        layout: &InstanceLayout,
    ) -> Result<(), RuntimeError> {
        if self.behavior == MockBehavior::FailPrepare {
            return Err(RuntimeError::Preparation(
                "mock backend configured to fail prepare".to_owned(),
            ));
        }
        if !layout.is_initialized() {
            std::fs::write(
                layout.data_dir().join("PG_VERSION"),
                format!("{}\n", config.version.major()),
            )?;
        }
        self.counters.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn spawn(
        &self,
        config: &InstanceConfig,
        _layout: &InstanceLayout,
    ) -> Result<Box<dyn EngineProcess>, RuntimeError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).map_err(|e| {
            RuntimeError::Start(format!("cannot bind {}: {e}", config.address()))
        })?;

        let spawned = self.counters.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_running.fetch_max(running, Ordering::SeqCst);

        Ok(Box::new(MockProcess {
            listener: Some(listener),
            counters: Arc::clone(&self.counters),
            behavior: self.behavior,
            pid: 90_000 + spawned as u32,
        }))
    }
}

struct MockProcess {
    listener: Option<TcpListener>,
    counters: Arc<MockCounters>,
    behavior: MockBehavior,
    pid: u32,
}

impl EngineProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        self.listener.as_ref().map(|_| self.pid)
    }

    fn poll_ready(&mut self) -> Result<bool, RuntimeError> {
        match self.behavior {
            MockBehavior::ExitOnStart => Err(RuntimeError::Start(
                "mock engine exited with status 1".to_owned(),
            )),
            MockBehavior::NeverReady => Ok(false),
            _ => Ok(true),
        }
    }

    fn shutdown(&mut self) -> Result<(), RuntimeError> {
        if self.listener.take().is_none() {
            return Ok(());
        }
        self.counters.running.fetch_sub(1, Ordering::SeqCst);
        self.counters.stopped.fetch_add(1, Ordering::SeqCst);
        if self.behavior == MockBehavior::FailStop {
            return Err(RuntimeError::Stop(
                "mock engine did not acknowledge shutdown".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Drop for MockProcess {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgfixture_schema::{EngineVersion, FixtureProperties};

    fn test_config(port: u16) -> InstanceConfig {
        let mut props = FixtureProperties::default();
        props.host = "127.0.0.1".to_owned();
        InstanceConfig::from_properties(&props, EngineVersion::V16, port)
    }

    #[test]
    fn prepare_marks_data_dir_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstanceLayout::new(dir.path());
        layout.initialize().unwrap();

        let backend = MockBackend::new();
        backend.prepare(&test_config(0), &layout).unwrap();
        assert!(layout.is_initialized());
        assert_eq!(backend.counters().prepared(), 1);
    }

    #[test]
    fn spawned_process_holds_port_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstanceLayout::new(dir.path());
        let port = crate::free_port("127.0.0.1").unwrap();
        let config = test_config(port);

        let backend = MockBackend::new();
        let mut process = backend.spawn(&config, &layout).unwrap();
        assert!(process.poll_ready().unwrap());
        assert!(process.pid().is_some());

        // second engine on the same port conflicts
        assert!(matches!(
            backend.spawn(&config, &layout),
            Err(RuntimeError::Start(_))
        ));

        process.shutdown().unwrap();
        process.shutdown().unwrap();
        assert!(process.pid().is_none());

        let counters = backend.counters();
        assert_eq!(counters.spawned(), 1);
        assert_eq!(counters.stopped(), 1);
        assert_eq!(counters.running(), 0);

        let mut again = backend.spawn(&config, &layout).unwrap();
        again.shutdown().unwrap();
        assert_eq!(counters.max_running(), 1);
    }

    #[test]
    fn exit_on_start_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstanceLayout::new(dir.path());
        let port = crate::free_port("127.0.0.1").unwrap();

        let backend = MockBackend::with_behavior(MockBehavior::ExitOnStart);
        let mut process = backend.spawn(&test_config(port), &layout).unwrap();
        assert!(process.poll_ready().is_err());
    }

    #[test]
    fn failed_shutdown_still_releases_port() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstanceLayout::new(dir.path());
        let port = crate::free_port("127.0.0.1").unwrap();

        let backend = MockBackend::with_behavior(MockBehavior::FailStop);
        let mut process = backend.spawn(&test_config(port), &layout).unwrap();
        assert!(matches!(process.shutdown(), Err(RuntimeError::Stop(_))));
        assert!(process.shutdown().is_ok());
        assert_eq!(backend.counters().running(), 0);
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn availability_follows_behavior() {
        assert!(MockBackend::new().available());
        assert!(!MockBackend::with_behavior(MockBehavior::Unavailable).available());
    }
}
