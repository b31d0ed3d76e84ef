use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directory layout of one instance.
///
/// ```text
/// <root>/
///   data/          cluster directory (initdb target)
///   run/           unix socket directory
///   postgres.log   engine stdout and stderr
///   .lock          advisory lock held while the instance is prepared or running
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    root: PathBuf,
}

impl InstanceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    #[inline]
    pub fn socket_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    #[inline]
    pub fn log_file(&self) -> PathBuf {
        self.root.join("postgres.log")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Password file handed to `initdb`; removed right after use.
    #[inline]
    pub fn password_file(&self) -> PathBuf {
        self.root.join(".pwfile")
    }

    /// True once `initdb` has populated the data directory.
    pub fn is_initialized(&self) -> bool {
        self.data_dir().join("PG_VERSION").is_file()
    }

    pub fn initialize(&self) -> io::Result<()> {
        if self.root.exists() && !self.root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a directory", self.root.display()),
            ));
        }
        fs::create_dir_all(self.data_dir())?;
        fs::create_dir_all(self.socket_dir())?;
        restrict_permissions(&self.data_dir())?;
        Ok(())
    }
}

// postgres refuses to start on a data directory readable by group or others.
#[cfg(unix)]
fn restrict_permissions(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_permissions(_dir: &Path) -> io::Result<()> {
    Ok(())
}
