use crate::backend::{EngineBackend, EngineProcess};
use crate::layout::InstanceLayout;
use crate::RuntimeError;
use pgfixture_schema::{EngineVersion, InstanceConfig};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

const REQUIRED_TOOLS: &[&str] = &["initdb", "postgres", "pg_ctl", "pg_isready", "createdb"];

/// Seconds `pg_ctl stop` waits for a fast shutdown before we kill the server.
const STOP_TIMEOUT_SECS: &str = "30";

/// Paths of the PostgreSQL server tools, all taken from one directory so
/// their versions match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgBinaries {
    pub initdb: PathBuf,
    pub postgres: PathBuf,
    pub pg_ctl: PathBuf,
    pub pg_isready: PathBuf,
    pub createdb: PathBuf,
}

impl PgBinaries {
    fn in_dir(dir: &Path) -> Self {
        Self {
            initdb: dir.join("initdb"),
            postgres: dir.join("postgres"),
            pg_ctl: dir.join("pg_ctl"),
            pg_isready: dir.join("pg_isready"),
            createdb: dir.join("createdb"),
        }
    }

    /// Find the first candidate directory that holds every required tool.
    /// On failure, returns the tools that were found in no candidate at all.
    pub fn locate(bin_dir: Option<&Path>, major: u32) -> Result<Self, Vec<&'static str>> {
        let dirs = candidate_dirs(bin_dir, major);

        if let Some(dir) = dirs
            .iter()
            .find(|d| REQUIRED_TOOLS.iter().all(|t| d.join(t).is_file()))
        {
            return Ok(Self::in_dir(dir));
        }

        Err(REQUIRED_TOOLS
            .iter()
            .copied()
            .filter(|t| !dirs.iter().any(|d| d.join(t).is_file()))
            .collect())
    }
}

/// Search order: explicit `bin_dir`, distribution layouts for `major`, `PATH`.
pub fn candidate_dirs(bin_dir: Option<&Path>, major: u32) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = bin_dir {
        dirs.push(dir.to_path_buf());
    }
    dirs.push(PathBuf::from(format!("/usr/lib/postgresql/{major}/bin")));
    dirs.push(PathBuf::from(format!("/usr/pgsql-{major}/bin")));
    dirs.push(PathBuf::from(format!("/opt/homebrew/opt/postgresql@{major}/bin")));
    dirs.push(PathBuf::from(format!("/usr/local/opt/postgresql@{major}/bin")));
    if let Some(path) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&path));
    }
    dirs
}

/// Extract the major version from `postgres --version` output, e.g.
/// `postgres (PostgreSQL) 16.4 (Ubuntu 16.4-1.pgdg22.04+1)`.
pub fn parse_server_major(output: &str) -> Option<u32> {
    output
        .split_whitespace()
        .find(|tok| tok.starts_with(|c: char| c.is_ascii_digit()))
        .and_then(|tok| tok.split(['.', '-']).next())
        .and_then(|major| major.parse().ok())
}

/// Runs host-installed PostgreSQL binaries.
#[derive(Debug, Default)]
pub struct NativeBackend {
    bin_dir: Option<PathBuf>,
}

impl NativeBackend {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    fn binaries(&self, version: EngineVersion) -> Result<PgBinaries, String> {
        PgBinaries::locate(self.bin_dir.as_deref(), version.major()).map_err(|missing| {
            format!(
                "PostgreSQL {} binaries not found (missing: {}); install them or set bin_dir",
                version.major(),
                missing.join(", ")
            )
        })
    }
}

impl EngineBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn available(&self) -> bool {
        EngineVersion::all()
            .iter()
            .any(|v| PgBinaries::locate(self.bin_dir.as_deref(), v.major()).is_ok())
    }

    fn prepare(
        &self,
        config: &InstanceConfig,
        layout: &InstanceLayout,
    ) -> Result<(), RuntimeError> {
        let bins = self
            .binaries(config.version)
            .map_err(RuntimeError::Preparation)?;

        let output = Command::new(&bins.postgres)
            .arg("--version")
            .output()
            .map_err(|e| {
                RuntimeError::Preparation(format!("cannot run {}: {e}", bins.postgres.display()))
            })?;
        let reported = String::from_utf8_lossy(&output.stdout);
        match parse_server_major(&reported) {
            Some(major) if major == config.version.major() => {}
            _ => {
                return Err(RuntimeError::Preparation(format!(
                    "{} reports '{}', expected major version {} for {}",
                    bins.postgres.display(),
                    reported.trim(),
                    config.version.major(),
                    config.version
                )));
            }
        }

        if layout.is_initialized() {
            debug!(
                "reusing initialized data directory {}",
                layout.data_dir().display()
            );
            return Ok(());
        }

        info!("initializing data directory {}", layout.data_dir().display());
        let pwfile = layout.password_file();
        fs::write(&pwfile, format!("{}\n", config.password))?;
        let result = Command::new(&bins.initdb)
            .arg("-D")
            .arg(layout.data_dir())
            .arg("-U")
            .arg(&config.username)
            .arg(format!("--pwfile={}", pwfile.display()))
            .args(["--auth=scram-sha-256", "--encoding=UTF8", "--no-locale", "--no-sync"])
            .stdin(Stdio::null())
            .output();
        let _ = fs::remove_file(&pwfile);

        let output = result.map_err(|e| {
            RuntimeError::Preparation(format!("cannot run {}: {e}", bins.initdb.display()))
        })?;
        if !output.status.success() {
            return Err(RuntimeError::Preparation(format!(
                "initdb exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn spawn(
        &self,
        config: &InstanceConfig,
        layout: &InstanceLayout,
    ) -> Result<Box<dyn EngineProcess>, RuntimeError> {
        let bins = self.binaries(config.version).map_err(RuntimeError::Start)?;

        let log = File::create(layout.log_file())?;
        let log_err = log.try_clone()?;
        let child = Command::new(&bins.postgres)
            .arg("-D")
            .arg(layout.data_dir())
            .arg("-p")
            .arg(config.port.to_string())
            .arg("-k")
            .arg(layout.socket_dir())
            .arg("-c")
            .arg(format!("listen_addresses={}", config.host))
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .map_err(|e| {
                RuntimeError::Start(format!("cannot spawn {}: {e}", bins.postgres.display()))
            })?;
        debug!("spawned postgres pid {}", child.id());

        Ok(Box::new(NativeProcess {
            child,
            exited: false,
            bins,
            config: config.clone(),
            layout: layout.clone(),
        }))
    }

    fn after_ready(
        &self,
        config: &InstanceConfig,
        _layout: &InstanceLayout,
    ) -> Result<(), RuntimeError> {
        if config.db_name == "postgres" {
            return Ok(());
        }
        let bins = self.binaries(config.version).map_err(RuntimeError::Start)?;

        let output = Command::new(&bins.createdb)
            .arg("-h")
            .arg(&config.host)
            .arg("-p")
            .arg(config.port.to_string())
            .arg("-U")
            .arg(&config.username)
            .arg("-w")
            .arg(&config.db_name)
            .env("PGPASSWORD", &config.password)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                RuntimeError::Start(format!("cannot run {}: {e}", bins.createdb.display()))
            })?;

        if output.status.success() {
            debug!("created database {}", config.db_name);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists") {
            debug!("database {} already exists", config.db_name);
            Ok(())
        } else {
            Err(RuntimeError::Start(format!(
                "createdb {} failed: {}",
                config.db_name,
                stderr.trim()
            )))
        }
    }
}

struct NativeProcess {
    child: Child,
    exited: bool,
    bins: PgBinaries,
    config: InstanceConfig,
    layout: InstanceLayout,
}

impl EngineProcess for NativeProcess {
    fn pid(&self) -> Option<u32> {
        (!self.exited).then(|| self.child.id())
    }

    fn poll_ready(&mut self) -> Result<bool, RuntimeError> {
        if let Some(status) = self.child.try_wait()? {
            self.exited = true;
            return Err(RuntimeError::Start(format!(
                "postgres exited with {status} before accepting connections: {}",
                log_tail(&self.layout.log_file(), 5)
            )));
        }

        let status = Command::new(&self.bins.pg_isready)
            .arg("-h")
            .arg(&self.config.host)
            .arg("-p")
            .arg(self.config.port.to_string())
            .args(["-t", "1", "-q"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.success())
    }

    fn shutdown(&mut self) -> Result<(), RuntimeError> {
        if self.exited {
            return Ok(());
        }
        if self.child.try_wait()?.is_some() {
            self.exited = true;
            return Ok(());
        }

        let stopped = Command::new(&self.bins.pg_ctl)
            .arg("stop")
            .arg("-D")
            .arg(self.layout.data_dir())
            .args(["-m", "fast", "-w", "-t", STOP_TIMEOUT_SECS])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match stopped {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!("pg_ctl stop exited with {status}; killing postgres");
                self.child
                    .kill()
                    .map_err(|e| RuntimeError::Stop(format!("kill failed: {e}")))?;
            }
            Err(e) => {
                warn!("cannot run pg_ctl: {e}; killing postgres");
                self.child
                    .kill()
                    .map_err(|e| RuntimeError::Stop(format!("kill failed: {e}")))?;
            }
        }

        self.child.wait()?;
        self.exited = true;
        Ok(())
    }
}

impl Drop for NativeProcess {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("failed to stop postgres pid {}: {e}", self.child.id());
        }
    }
}

fn log_tail(path: &Path, lines: usize) -> String {
    match fs::read_to_string(path) {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            all[all.len().saturating_sub(lines)..].join(" | ")
        }
        Err(_) => format!("no log at {}", path.display()),
    }
}
