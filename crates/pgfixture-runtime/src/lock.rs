use crate::RuntimeError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on an instance directory.
///
/// Held from prepare until the instance is stopped, so two supervisors never
/// run the same data directory.
#[derive(Debug)]
pub struct DataDirLock {
    lock_file: File,
    path: PathBuf,
}

impl DataDirLock {
    pub fn try_acquire(lock_path: &Path) -> Result<Self, RuntimeError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                lock_file: file,
                path: lock_path.to_path_buf(),
            }),
            Err(_) => Err(RuntimeError::Preparation(format!(
                "instance directory is in use by another instance ({})",
                lock_path.display()
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}
