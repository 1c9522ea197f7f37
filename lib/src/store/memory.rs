use super::{paths, BlobStore, Error};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex as BlockingMutex},
};

/// In-memory blob store. The backing map outlives individual repository registrations (see
/// [`super::Registry`]) so re-registering a repository against the same location observes the
/// same contents, the way a re-mounted physical repository would.
#[derive(Clone, Default)]
pub struct MemoryStore {
    blobs: Arc<BlockingMutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: overwrites a blob without going through the async interface, simulating
    /// out-of-band mutation of repository contents.
    pub fn put_raw(&self, path: &str, data: Vec<u8>) {
        self.blobs.lock().unwrap().insert(path.to_owned(), data);
    }

    /// Test hook: renames a blob in place, simulating an external actor moving `index-N`.
    pub fn rename_raw(&self, from: &str, to: &str) -> bool {
        let mut blobs = self.blobs.lock().unwrap();
        match blobs.remove(from) {
            Some(data) => {
                blobs.insert(to.to_owned(), data);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(path)
    }

    fn latest_root(blobs: &BTreeMap<String, Vec<u8>>) -> Option<i64> {
        blobs
            .keys()
            .filter_map(|path| paths::parse_root_index(path))
            .max()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.blobs
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_owned()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), Error> {
        self.blobs
            .lock()
            .unwrap()
            .insert(path.to_owned(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, paths: &[String]) -> Result<(), Error> {
        let mut blobs = self.blobs.lock().unwrap();
        for path in paths {
            blobs.remove(path);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn compare_and_swap_root(
        &self,
        expected: Option<i64>,
        new_generation: i64,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut blobs = self.blobs.lock().unwrap();
        let actual = Self::latest_root(&blobs);

        if actual != expected {
            return Err(Error::CasFailure { expected, actual });
        }

        blobs.insert(paths::root_index(new_generation), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn cas_succeeds_on_expected_generation() {
        let store = MemoryStore::new();

        store.compare_and_swap_root(None, 0, b"zero").await.unwrap();
        store
            .compare_and_swap_root(Some(0), 1, b"one")
            .await
            .unwrap();

        assert_eq!(store.read("index-1").await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn cas_detects_concurrent_writer() {
        let store = MemoryStore::new();
        store.compare_and_swap_root(None, 0, b"zero").await.unwrap();

        assert_matches!(
            store.compare_and_swap_root(None, 0, b"again").await,
            Err(Error::CasFailure {
                expected: None,
                actual: Some(0)
            })
        );
    }

    #[tokio::test]
    async fn cas_detects_out_of_band_rename() {
        let store = MemoryStore::new();
        store.compare_and_swap_root(None, 0, b"zero").await.unwrap();

        // Someone renames the root blob to a higher generation behind our back.
        assert!(store.rename_raw("index-0", "index-1"));

        assert_matches!(
            store.compare_and_swap_root(Some(0), 1, b"one").await,
            Err(Error::CasFailure {
                expected: Some(0),
                actual: Some(1)
            })
        );
    }

    #[tokio::test]
    async fn delete_is_best_effort() {
        let store = MemoryStore::new();
        store.write("a", b"a").await.unwrap();

        store
            .delete(&["a".to_owned(), "does-not-exist".to_owned()])
            .await
            .unwrap();

        assert!(!store.contains("a"));
    }
}
