use crate::layout::InstanceLayout;
use crate::RuntimeError;
use pgfixture_schema::InstanceConfig;
use std::path::Path;

/// A way of running the database engine.
///
/// The supervisor owns all sequencing (validation, locking, readiness
/// deadline, cleanup); backends only do the engine-specific work.
pub trait EngineBackend: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Populate the instance directory (e.g. run `initdb`). Must not bind a
    /// port or leave a process running.
    fn prepare(&self, config: &InstanceConfig, layout: &InstanceLayout)
        -> Result<(), RuntimeError>;

    /// Spawn the engine. The returned process may not accept connections yet.
    fn spawn(
        &self,
        config: &InstanceConfig,
        layout: &InstanceLayout,
    ) -> Result<Box<dyn EngineProcess>, RuntimeError>;

    /// Runs once the engine accepts connections, before the start is
    /// reported as successful.
    fn after_ready(
        &self,
        _config: &InstanceConfig,
        _layout: &InstanceLayout,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// A spawned engine process.
pub trait EngineProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// `Ok(true)` once the engine accepts connections, `Ok(false)` while it
    /// is still starting, `Err` if it exited.
    fn poll_ready(&mut self) -> Result<bool, RuntimeError>;

    /// Stop the engine and wait until it has exited and released its port.
    /// Calling it on an already stopped process is a no-op.
    fn shutdown(&mut self) -> Result<(), RuntimeError>;
}

pub fn select_backend(
    name: &str,
    bin_dir: Option<&Path>,
) -> Result<Box<dyn EngineBackend>, RuntimeError> {
    match name {
        "native" => Ok(Box::new(crate::native::NativeBackend::new(
            bin_dir.map(Path::to_path_buf),
        ))),
        "mock" => Ok(Box::new(crate::mock::MockBackend::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_backends() {
        assert_eq!(select_backend("native", None).unwrap().name(), "native");
        assert_eq!(select_backend("mock", None).unwrap().name(), "mock");
    }

    #[test]
    fn select_invalid_backend_fails() {
        assert!(matches!(
            select_backend("docker", None),
            Err(RuntimeError::BackendUnavailable(name)) if name == "docker"
        ));
    }
}
