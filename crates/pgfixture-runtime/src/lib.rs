//! Engine process supervision for pgfixture.
//!
//! This crate owns everything that touches the filesystem or the process
//! table: the pluggable `EngineBackend` trait with a native backend (host
//! `initdb`/`postgres`/`pg_ctl` binaries) and a mock backend, the per-instance
//! directory layout and advisory lock, prerequisite checks, and the
//! `ProcessSupervisor` that prepares, starts, and stops exactly one instance.

pub mod backend;
pub mod layout;
pub mod lock;
pub mod mock;
pub mod native;
pub mod prereq;
pub mod supervisor;

pub use backend::{select_backend, EngineBackend, EngineProcess};
pub use layout::InstanceLayout;
pub use lock::DataDirLock;
pub use mock::{MockBackend, MockBehavior, MockCounters};
pub use native::{NativeBackend, PgBinaries};
pub use prereq::{check_native_prereqs, format_missing, MissingPrereq};
pub use supervisor::{
    free_port, PreparedInstance, ProcessHandle, ProcessSupervisor, RuntimeStatus,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to prepare instance: {0}")]
    Preparation(String),
    #[error("failed to start instance: {0}")]
    Start(String),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("an instance is already running on {0}")]
    AlreadyRunning(String),
    #[error("failed to stop instance: {0}")]
    Stop(String),
}
