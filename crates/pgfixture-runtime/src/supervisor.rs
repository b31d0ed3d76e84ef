use crate::backend::{EngineBackend, EngineProcess};
use crate::layout::InstanceLayout;
use crate::lock::DataDirLock;
use crate::RuntimeError;
use pgfixture_schema::InstanceConfig;
use serde::Serialize;
use std::fmt;
use std::net::TcpListener;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Ask the OS for a currently unused TCP port on `host`.
pub fn free_port(host: &str) -> Result<u16, RuntimeError> {
    let listener = TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}

/// An instance whose directory is allocated and populated, with nothing
/// bound or spawned yet.
pub struct PreparedInstance {
    config: InstanceConfig,
    layout: InstanceLayout,
    lock: DataDirLock,
    // Declared last: the directory is removed after the lock is released.
    temp_dir: Option<TempDir>,
}

impl PreparedInstance {
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn layout(&self) -> &InstanceLayout {
        &self.layout
    }
}

impl fmt::Debug for PreparedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedInstance")
            .field("config", &self.config)
            .field("layout", &self.layout)
            .field("temporary", &self.temp_dir.is_some())
            .finish_non_exhaustive()
    }
}

/// The running engine. Only the supervisor holds one.
pub struct ProcessHandle {
    config: InstanceConfig,
    process: Box<dyn EngineProcess>,
    layout: InstanceLayout,
    _lock: DataDirLock,
    temp_dir: Option<TempDir>,
}

impl ProcessHandle {
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn layout(&self) -> &InstanceLayout {
        &self.layout
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("config", &self.config)
            .field("pid", &self.pid())
            .field("layout", &self.layout)
            .field("temporary", &self.temp_dir.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeStatus {
    pub backend: String,
    pub running: bool,
    pub address: Option<String>,
    pub pid: Option<u32>,
}

/// Prepares, starts, and stops at most one engine instance.
pub struct ProcessSupervisor {
    backend: Box<dyn EngineBackend>,
    current: Option<ProcessHandle>,
}

impl ProcessSupervisor {
    pub fn new(backend: Box<dyn EngineBackend>) -> Self {
        Self {
            backend,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&ProcessHandle> {
        self.current.as_ref()
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            backend: self.backend.name().to_owned(),
            running: self.current.is_some(),
            address: self.current.as_ref().map(|h| h.config.address()),
            pid: self.current.as_ref().and_then(ProcessHandle::pid),
        }
    }

    /// Validate `config`, allocate and lock the instance directory, and let
    /// the backend populate it. Nothing is bound or spawned.
    pub fn prepare(&self, config: InstanceConfig) -> Result<PreparedInstance, RuntimeError> {
        if !self.backend.available() {
            return Err(RuntimeError::BackendUnavailable(self.backend.name().to_owned()));
        }
        validate(&config)?;

        let (layout, temp_dir) = match &config.data_dir {
            Some(dir) => (InstanceLayout::new(dir), None),
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("pgfixture-")
                    .tempdir()
                    .map_err(|e| {
                        RuntimeError::Preparation(format!("cannot create temp directory: {e}"))
                    })?;
                (InstanceLayout::new(temp.path()), Some(temp))
            }
        };

        layout.initialize().map_err(|e| {
            RuntimeError::Preparation(format!(
                "invalid storage path {}: {e}",
                layout.root().display()
            ))
        })?;
        let lock = DataDirLock::try_acquire(&layout.lock_file())?;

        debug!(
            "preparing {} instance in {}",
            self.backend.name(),
            layout.root().display()
        );
        self.backend.prepare(&config, &layout)?;

        Ok(PreparedInstance {
            config,
            layout,
            lock,
            temp_dir,
        })
    }

    /// Spawn the engine and wait until it accepts connections, bounded by
    /// the configured startup timeout. On any failure the process is stopped
    /// before the error is returned.
    pub fn start(&mut self, prepared: PreparedInstance) -> Result<&ProcessHandle, RuntimeError> {
        if let Some(handle) = &self.current {
            return Err(RuntimeError::AlreadyRunning(handle.config.address()));
        }

        let PreparedInstance {
            config,
            layout,
            lock,
            temp_dir,
        } = prepared;

        info!(
            "starting postgres {} on {}",
            config.version,
            config.address()
        );
        let mut process = self.backend.spawn(&config, &layout)?;

        if let Err(e) = wait_until_ready(process.as_mut(), &config) {
            shutdown_quietly(process.as_mut());
            return Err(e);
        }
        if let Err(e) = self.backend.after_ready(&config, &layout) {
            shutdown_quietly(process.as_mut());
            return Err(e);
        }

        info!("postgres ready on {}", config.address());
        let handle = self.current.insert(ProcessHandle {
            config,
            process,
            layout,
            _lock: lock,
            temp_dir,
        });
        Ok(&*handle)
    }

    /// Stop the running engine, if any. Returns once the process has exited
    /// and its port, lock, and temporary directory are released.
    pub fn stop(&mut self) -> Result<(), RuntimeError> {
        let Some(mut handle) = self.current.take() else {
            debug!("no running instance; stop is a no-op");
            return Ok(());
        };

        info!("stopping postgres on {}", handle.config.address());
        let result = handle.process.shutdown();
        drop(handle);
        result
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("failed to stop postgres on drop: {e}");
        }
    }
}

fn validate(config: &InstanceConfig) -> Result<(), RuntimeError> {
    let problem = if config.db_name.trim().is_empty() {
        Some("database name must not be empty")
    } else if config.username.trim().is_empty() {
        Some("username must not be empty")
    } else if config.host.trim().is_empty() {
        Some("host must not be empty")
    } else if config.port == 0 {
        Some("port must not be 0")
    } else if config.startup_timeout.is_zero() {
        Some("startup timeout must not be zero")
    } else {
        None
    };
    match problem {
        Some(msg) => Err(RuntimeError::Preparation(msg.to_owned())),
        None => Ok(()),
    }
}

fn wait_until_ready(
    process: &mut dyn EngineProcess,
    config: &InstanceConfig,
) -> Result<(), RuntimeError> {
    let deadline = Instant::now() + config.startup_timeout;
    loop {
        if process.poll_ready()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RuntimeError::Start(format!(
                "postgres on {} not ready within {:?}",
                config.address(),
                config.startup_timeout
            )));
        }
        std::thread::sleep(READY_POLL_INTERVAL);
    }
}

fn shutdown_quietly(process: &mut dyn EngineProcess) {
    if let Err(e) = process.shutdown() {
        warn!("cleanup after failed start: {e}");
    }
}
