//! Whole-document JSON persistence.
//!
//! Each state file (job ledger, work items, interaction log) is one JSON
//! document held in memory behind a lock. Mutations run read-modify-write on
//! a working copy and replace the file atomically (temp file in the same
//! directory, then rename) before the in-memory copy is swapped, so neither
//! another task nor a restarted process can observe a half-written document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BotError;

pub struct JsonDocument<T> {
    path: PathBuf,
    inner: Mutex<T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    /// Load the document at `path`, or start from `T::default()` if the file
    /// does not exist yet. A file that exists but does not parse is an error:
    /// it is never silently replaced.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BotError> {
        let path = path.into();
        let value = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                BotError::Persistence(format!("Failed to read {}: {}", path.display(), e))
            })?;
            serde_json::from_str(&content).map_err(|e| {
                BotError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            T::default()
        };

        Ok(Self {
            path,
            inner: Mutex::new(value),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the current document under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.lock();
        f(&guard)
    }

    /// Clone of the current document.
    pub fn get(&self) -> T {
        self.inner.lock().clone()
    }

    /// Read-modify-write transaction.
    ///
    /// `f` works on a copy and returns `(result, dirty)`. When `dirty` is set
    /// the copy is written to disk and then becomes the current document. If
    /// `f` fails or the write fails, the current document is left untouched.
    pub fn mutate<R>(
        &self,
        f: impl FnOnce(&mut T) -> Result<(R, bool), BotError>,
    ) -> Result<R, BotError> {
        let mut guard = self.inner.lock();
        let mut working = guard.clone();
        let (result, dirty) = f(&mut working)?;
        if dirty {
            write_json_atomic(&self.path, &working)?;
            *guard = working;
        }
        Ok(result)
    }
}

/// Serialize `value` next to `path` and rename it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), BotError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|e| {
        BotError::Persistence(format!("Failed to create {}: {}", parent.display(), e))
    })?;

    let payload = serde_json::to_vec_pretty(value)
        .map_err(|e| BotError::Serialization(format!("Failed to serialize {}: {}", path.display(), e)))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        BotError::Persistence(format!("Failed to create temp file in {}: {}", parent.display(), e))
    })?;
    temp.write_all(&payload)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| {
        BotError::Persistence(format!("Failed to replace {}: {}", path.display(), e.error))
    })?;
    Ok(())
}
