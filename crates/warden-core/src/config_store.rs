//! Persistent configuration blobs.
//!
//! Every blob is kept in one container record (a `Stream` field per
//! [`ConfigId`]); each save or remove rewrites the whole container through a
//! [`BlobBackend`].

use crate::error::{EngineError, EngineResult};
use crate::lbvs::{LbvsReader, LbvsWriter, Value};
use crate::protocol::ConfigId;
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Where the container record lives.
pub trait BlobBackend: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn read(&self) -> EngineResult<Option<Vec<u8>>>;
    fn write(&self, data: &[u8]) -> EngineResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<Option<Vec<u8>>>,
    writes: Mutex<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }
}

impl BlobBackend for MemoryBackend {
    fn read(&self) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.data.lock().clone())
    }

    fn write(&self, data: &[u8]) -> EngineResult<()> {
        *self.data.lock() = Some(data.to_vec());
        *self.writes.lock() += 1;
        Ok(())
    }
}

impl<T: BlobBackend + ?Sized> BlobBackend for std::sync::Arc<T> {
    fn read(&self) -> EngineResult<Option<Vec<u8>>> {
        (**self).read()
    }

    fn write(&self, data: &[u8]) -> EngineResult<()> {
        (**self).write(data)
    }
}

/// Single file, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BlobBackend for FileBackend {
    fn read(&self) -> EngineResult<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, data: &[u8]) -> EngineResult<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| EngineError::Store(format!("persist {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

pub struct ConfigStore {
    backend: Box<dyn BlobBackend>,
    blobs: Mutex<Vec<(ConfigId, Vec<u8>)>>,
}

impl ConfigStore {
    pub fn new(backend: Box<dyn BlobBackend>) -> Self {
        Self {
            backend,
            blobs: Mutex::new(Vec::new()),
        }
    }

    /// Loads the container. Non-stream fields and unknown ids are dropped.
    pub fn initialize(&self) -> EngineResult<()> {
        let mut blobs = self.blobs.lock();
        blobs.clear();
        let Some(container) = self.backend.read()? else {
            return Ok(());
        };
        let reader = LbvsReader::new(&container)?;
        for field in reader.fields() {
            let field = field?;
            let Value::Stream(data) = field.value else {
                continue;
            };
            let Some(id) = ConfigId::from_raw(u32::from(field.id)) else {
                warn!(id = field.id, "unknown config blob id skipped");
                continue;
            };
            upsert(&mut blobs, id, data.to_vec());
        }
        debug!(count = blobs.len(), "config blobs loaded");
        Ok(())
    }

    pub fn save(&self, id: ConfigId, data: Vec<u8>) -> EngineResult<()> {
        let mut blobs = self.blobs.lock();
        upsert(&mut blobs, id, data);
        self.flush(&blobs)
    }

    pub fn load(&self, id: ConfigId) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .iter()
            .find(|(k, _)| *k == id)
            .map(|(_, v)| v.clone())
    }

    pub fn remove(&self, id: ConfigId) -> EngineResult<()> {
        let mut blobs = self.blobs.lock();
        let before = blobs.len();
        blobs.retain(|(k, _)| *k != id);
        if blobs.len() == before {
            return Ok(());
        }
        self.flush(&blobs)
    }

    fn flush(&self, blobs: &[(ConfigId, Vec<u8>)]) -> EngineResult<()> {
        let mut w = LbvsWriter::new();
        for (id, data) in blobs {
            w.write_stream(*id, data)?;
        }
        self.backend.write(&w.finish()?)
    }
}

fn upsert(blobs: &mut Vec<(ConfigId, Vec<u8>)>, id: ConfigId, data: Vec<u8>) {
    match blobs.iter_mut().find(|(k, _)| *k == id) {
        Some(slot) => slot.1 = data,
        None => blobs.push((id, data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Shared(Arc<MemoryBackend>);

    impl BlobBackend for Shared {
        fn read(&self) -> EngineResult<Option<Vec<u8>>> {
            self.0.read()
        }
        fn write(&self, data: &[u8]) -> EngineResult<()> {
            self.0.write(data)
        }
    }

    #[test]
    fn save_replaces_in_place_and_remove_is_lazy() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ConfigStore::new(Box::new(Shared(backend.clone())));
        store.initialize().unwrap();
        assert!(store.load(ConfigId::Main).is_none());

        store.save(ConfigId::Main, vec![1]).unwrap();
        store.save(ConfigId::ProtectedFiles, vec![2, 2]).unwrap();
        store.save(ConfigId::Main, vec![3]).unwrap();
        assert_eq!(backend.write_count(), 3);
        assert_eq!(store.load(ConfigId::Main), Some(vec![3]));

        store.remove(ConfigId::InjectProcess).unwrap();
        assert_eq!(backend.write_count(), 3);
        store.remove(ConfigId::Main).unwrap();
        assert_eq!(backend.write_count(), 4);

        let reopened = ConfigStore::new(Box::new(Shared(backend)));
        reopened.initialize().unwrap();
        assert!(reopened.load(ConfigId::Main).is_none());
        assert_eq!(reopened.load(ConfigId::ProtectedFiles), Some(vec![2, 2]));
    }

    #[test]
    fn file_backend_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.lbvs");
        let store = ConfigStore::new(Box::new(FileBackend::new(&path)));
        store.initialize().unwrap();
        store.save(ConfigId::ProtectedRegKeys, b"keys".to_vec()).unwrap();
        assert!(path.exists());

        let reopened = ConfigStore::new(Box::new(FileBackend::new(&path)));
        reopened.initialize().unwrap();
        assert_eq!(reopened.load(ConfigId::ProtectedRegKeys), Some(b"keys".to_vec()));
    }

    #[test]
    fn corrupt_container_fails_initialize() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.lbvs");
        std::fs::write(&path, b"not a record").unwrap();
        let store = ConfigStore::new(Box::new(FileBackend::new(&path)));
        assert!(store.initialize().is_err());
    }
}
