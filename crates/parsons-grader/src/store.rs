//! Key-value storage for a learner's block arrangement.
//!
//! The grading core never reads the stored values; it only hands the store
//! to [`ProblemSession`](crate::session::ProblemSession). Two variants share
//! the [`ArrangementStore`] capability: [`MemoryStore`] for environments
//! without persistent storage and [`FileStore`], a JSON object on disk.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("arrangement store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("arrangement store is not a JSON object of strings: {0}")]
    Format(#[from] serde_json::Error),
}

pub trait ArrangementStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Process-local store; contents vanish with the value.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArrangementStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("MemoryStore mutex poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .expect("MemoryStore mutex poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// All entries live in one JSON object file, rewritten on every `set`.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(HashMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }
}

impl ArrangementStore for FileStore {
    /// Unreadable or malformed files read as empty.
    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().expect("FileStore mutex poisoned");
        self.load().ok()?.remove(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().expect("FileStore mutex poisoned");
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());

        // Write beside the target and rename so readers never see half a file.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
