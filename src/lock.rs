//! Single advisory file lock preventing two instances of the daemon
//! running against the same local directory. Grounded in the teacher's
//! `WorkspaceLock`, keeping its `flock()`/Windows-create-new split and
//! drop-time release, but keyed off a hash of the synced directory's
//! absolute path inside the OS temp dir rather than a fixed in-tree path.

use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug)]
pub struct AlreadyRunningError;

impl std::fmt::Display for AlreadyRunningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "another instance is already syncing this directory")
    }
}

impl std::error::Error for AlreadyRunningError {}

#[derive(Debug)]
pub struct ProcessLock {
    #[allow(dead_code)]
    file: fs::File,
    path: PathBuf,
}

/// Deterministic lock file name for `directory`, so re-running against
/// the same path always contends on the same file.
fn lock_path_for(directory: &Path) -> PathBuf {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    directory.hash(&mut hasher);
    std::env::temp_dir().join(format!("icloudds-{:016x}.lock", hasher.finish()))
}

impl ProcessLock {
    pub fn try_acquire(directory: &Path) -> Result<Self> {
        let path = lock_path_for(directory);
        let file = open_lock_file(&path)?;
        lock_file(&file).context("lock")?;
        Ok(Self { file, path })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn lock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;

    let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let raw = err.raw_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock || raw == Some(11) || raw == Some(35) {
        return Err(AlreadyRunningError.into());
    }
    Err(err).context("flock")
}

#[cfg(unix)]
fn unlock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_UN: i32 = 8;
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error()).context("flock unlock")
    }
}

#[cfg(windows)]
fn lock_file(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(windows)]
fn unlock_file(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("open {}", lock_path.display()))
}

#[cfg(windows)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(lock_path);
    match file {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(AlreadyRunningError.into()),
        Err(e) => Err(e).with_context(|| format!("open {}", lock_path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_is_stable_for_the_same_directory() {
        let a = lock_path_for(Path::new("/home/alice/icloud"));
        let b = lock_path_for(Path::new("/home/alice/icloud"));
        let c = lock_path_for(Path::new("/home/alice/other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let tmp = std::env::temp_dir().join(format!("icloudds-lock-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        let lock1 = ProcessLock::try_acquire(&tmp).unwrap();
        let err = ProcessLock::try_acquire(&tmp).unwrap_err();
        let mut found = false;
        for cause in err.chain() {
            if cause.is::<AlreadyRunningError>() {
                found = true;
                break;
            }
        }
        assert!(found, "expected AlreadyRunningError, got: {err:#}");

        drop(lock1);
        let _lock2 = ProcessLock::try_acquire(&tmp).unwrap();
        fs::remove_dir_all(&tmp).ok();
    }
}
