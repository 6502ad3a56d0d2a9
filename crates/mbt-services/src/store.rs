//! Persistence for server state that must survive a reboot.
//!
//! A store holds exactly one value. `JsonFileStore` writes atomically
//! (temp file, then rename) so a crash mid-write leaves the previous state.

use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("corrupt state in {0}: {1}")]
    Corrupt(PathBuf, serde_json::Error),
    #[error("failed to serialize state: {0}")]
    Serialize(serde_json::Error),
}

pub trait StateStore<T>: Send {
    fn load(&mut self) -> Result<Option<T>, StoreError>;
    fn save(&mut self, value: &T) -> Result<(), StoreError>;
    fn erase(&mut self) -> Result<(), StoreError>;
}

/// Volatile store. Clones share the slot, which lets a test drop a state
/// machine and build a fresh one over the same "flash".
#[derive(Debug)]
pub struct MemoryStore<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self { slot: Arc::clone(&self.slot) }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self { slot: Arc::new(Mutex::new(None)) }
    }
}

impl<T: Clone> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl<T: Clone + Send> StateStore<T> for MemoryStore<T> {
    fn load(&mut self) -> Result<Option<T>, StoreError> {
        Ok(self.get())
    }

    fn save(&mut self, value: &T) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(value.clone());
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = None;
        Ok(())
    }
}

/// One JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), _marker: PhantomData }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl<T: Serialize + DeserializeOwned> StateStore<T> for JsonFileStore<T> {
    fn load(&mut self) -> Result<Option<T>, StoreError> {
        let text = match fs::read(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(self.path.clone(), e)),
        };
        serde_json::from_slice(&text)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(self.path.clone(), e))
    }

    fn save(&mut self, value: &T) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(value).map_err(StoreError::Serialize)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io(parent.to_path_buf(), e))?;
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file =
                fs::File::create(&tmp_path).map_err(|e| StoreError::Io(tmp_path.clone(), e))?;
            file.write_all(&data).map_err(|e| StoreError::Io(tmp_path.clone(), e))?;
            file.sync_all().map_err(|e| StoreError::Io(tmp_path.clone(), e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::Io(self.path.clone(), e))?;

        tracing::trace!(path = %self.path.display(), "state saved");
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(self.path.clone(), e)),
        }
    }
}
