//! Durable session persistence for "remember me".
//!
//! TRADE-OFFS
//! ==========
//! Writes go to a sibling temp file and are renamed into place so a crash
//! mid-write never leaves a truncated session behind. The file holds live
//! tokens, so on unix it is created owner-read/write only.

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::net::types::Session;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store decode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where a persisted session lives between restarts.
pub trait SessionStore: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the stored session exists but cannot be read.
    fn load(&self) -> Result<Option<Session>, StoreError>;

    /// # Errors
    ///
    /// Returns an error if the session cannot be written.
    fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Remove any stored session. Clearing an empty store succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing session cannot be removed.
    fn clear(&self) -> Result<(), StoreError>;
}

// =============================================================================
// FILE STORE
// =============================================================================

/// JSON file store used by the binary.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Session>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.temp_path();
        write_private(&tmp, &serde_json::to_vec_pretty(session)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `bytes` to a freshly created file that is owner-only from the start.
///
/// A leftover temp file from a crashed write is removed first; `create_new`
/// then guarantees the mode below is the one the file is born with.
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != ErrorKind::NotFound
    {
        return Err(e);
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// In-process store; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<Session>>,
    saves: Mutex<usize>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session(session: Session) -> Self {
        Self { slot: Mutex::new(Some(session)), saves: Mutex::new(0) }
    }

    /// Currently stored session, if any.
    #[must_use]
    pub fn stored(&self) -> Option<Session> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of successful `save` calls.
    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<Session>, StoreError> {
        Ok(self.stored())
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
