//! Small filesystem utilities.

use serde::Serialize;
use serde::de::DeserializeOwned;

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::{MemtrendError, MemtrendResult};

/// Writes `value` as pretty JSON through a temp file and a rename, so readers
/// never observe a partial record.
pub fn write_json_atomic(path: &Path, value: &impl Serialize) -> MemtrendResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("record.json");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    let bytes = serde_json::to_vec_pretty(value)?;
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// Reads a JSON record; `Ok(None)` when the file does not exist.
pub fn read_json_optional<T: DeserializeOwned>(path: &Path) -> MemtrendResult<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Advisory lock held by creating a file exclusively. Released on drop.
///
/// The lock file carries a per-holder token, so a holder only ever removes
/// its own file. Breaking a stale lock is serialized through a sibling
/// `.break` file and only moves the file whose token was seen as stale.
/// A live holder must finish within `stale_after`.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    token: String,
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    /// A lock file older than this is assumed abandoned and broken.
    pub stale_after: Duration,
    pub poll: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
            poll: Duration::from_millis(5),
        }
    }
}

impl FileLock {
    pub fn acquire(path: &Path, opts: LockOptions) -> MemtrendResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let token = format!("{} {}", std::process::id(), uuid::Uuid::new_v4());
        let deadline = Instant::now() + opts.timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    if let Err(err) = f.write_all(token.as_bytes()).and_then(|()| f.sync_all()) {
                        let _ = std::fs::remove_file(path);
                        return Err(err.into());
                    }
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Read the token before the age so a fresh replacement is never broken.
                    let broke = match read_token(path) {
                        Some(seen) if is_stale(path, opts.stale_after) => {
                            break_stale(path, &seen, opts.stale_after)?
                        }
                        _ => false,
                    };
                    if broke {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(MemtrendError::Lock(format!(
                            "timed out after {:?} waiting for {}",
                            opts.timeout,
                            path.display()
                        )));
                    }
                    std::thread::sleep(opts.poll);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(current) if current == self.token => {
                if let Err(err) = std::fs::remove_file(&self.path) {
                    tracing::warn!("failed to release lock {}: {err}", self.path.display());
                }
            }
            Ok(_) => {
                tracing::warn!("lock {} was taken over; leaving it", self.path.display());
            }
            Err(err) => {
                tracing::warn!("lock {} lost before release: {err}", self.path.display());
            }
        }
    }
}

/// Moves the lock at `path` aside if it still carries the stale token `seen`.
/// Returns whether this caller broke it.
fn break_stale(path: &Path, seen: &str, stale_after: Duration) -> MemtrendResult<bool> {
    let guard = sibling(path, "break");
    match OpenOptions::new().write(true).create_new(true).open(&guard) {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            if is_stale(&guard, stale_after) {
                let _ = std::fs::remove_file(&guard);
            }
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    }

    let broke = read_token(path).as_deref() == Some(seen) && {
        let grave = sibling(path, &format!("{}.stale", uuid::Uuid::new_v4()));
        let moved = std::fs::rename(path, &grave).is_ok();
        if moved {
            let _ = std::fs::remove_file(&grave);
        }
        moved
    };
    let _ = std::fs::remove_file(&guard);
    if broke {
        tracing::warn!("broke stale lock {}", path.display());
    }
    Ok(broke)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn read_token(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    lock_age(path).is_some_and(|age| age > stale_after)
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}
