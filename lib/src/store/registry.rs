use super::{BlobStore, FsStore, MemoryStore};
use crate::{
    error::{Error, Result},
    protocol::RepositorySettings,
};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex as BlockingMutex},
};

pub(crate) const KIND_MEMORY: &str = "memory";
pub(crate) const KIND_FS: &str = "fs";

/// Resolves a repository descriptor (kind + settings) to a blob store handle. Memory stores are
/// cached per location so that deleting and re-registering a repository descriptor reattaches to
/// the same contents, like re-mounting a physical repository does.
pub(crate) struct Registry {
    memory: BlockingMutex<HashMap<String, MemoryStore>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            memory: BlockingMutex::new(HashMap::new()),
        }
    }

    pub fn open(&self, kind: &str, settings: &RepositorySettings) -> Result<Arc<dyn BlobStore>> {
        match kind {
            KIND_MEMORY => {
                let mut stores = self.memory.lock().unwrap();
                let store = stores
                    .entry(settings.location.clone())
                    .or_insert_with(MemoryStore::new)
                    .clone();
                Ok(Arc::new(store))
            }
            KIND_FS => Ok(Arc::new(FsStore::new(settings.location.clone()))),
            _ => Err(Error::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unknown repository kind: {kind}"),
            ))),
        }
    }

    /// The raw memory store behind a location, if one was opened. Test hooks go through this.
    pub fn memory_store(&self, location: &str) -> Option<MemoryStore> {
        self.memory.lock().unwrap().get(location).cloned()
    }
}
