use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tempfile::NamedTempFile;

use crate::error::ContextWindowError;

fn path_locks() -> &'static Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Exclusive in-process lock for one context file.
pub(crate) fn lock_path(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = lock_unpoisoned(path_locks());
    Arc::clone(locks.entry(path.to_path_buf()).or_default())
}

/// Replaces `path` with `bytes` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ContextWindowError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|source| ContextWindowError::io("creating context directory", parent, source))?;

    let lock = lock_path(path);
    let _guard = lock_unpoisoned(&lock);

    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|source| ContextWindowError::io("creating temp context file", parent, source))?;
    if let Err(source) = temp.write_all(bytes).and_then(|()| temp.flush()) {
        return Err(ContextWindowError::io(
            "writing temp context file",
            temp.path(),
            source,
        ));
    }
    temp.persist(path)
        .map_err(|error| ContextWindowError::io("replacing context file", path, error.error))?;
    Ok(())
}

/// Reads `path` under its lock. A missing file reads as `None`.
pub(crate) fn read_locked(path: &Path) -> Result<Option<Vec<u8>>, ContextWindowError> {
    let lock = lock_path(path);
    let _guard = lock_unpoisoned(&lock);
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ContextWindowError::io("reading context file", path, source)),
    }
}

pub(crate) fn remove_locked(path: &Path) -> Result<(), ContextWindowError> {
    let lock = lock_path(path);
    let _guard = lock_unpoisoned(&lock);
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ContextWindowError::io("removing context file", path, source)),
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
