use super::{paths, BlobStore, Error};
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};

/// Directory-backed blob store. Blob paths map to file paths; writes go through a temp file
/// plus rename and are fsynced before returning.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_path(&self, blob: &str) -> PathBuf {
        self.root.join(blob)
    }

    async fn write_durable(&self, path: &Path, data: &[u8], create_new: bool) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_name: String = rand::thread_rng()
            .sample_iter(Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let tmp = path.with_file_name(format!(".tmp-{tmp_name}"));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if create_new {
            // `hard_link` fails with `AlreadyExists` when the target is present, which is the
            // atomic create-new we need for the root index.
            let result = fs::hard_link(&tmp, path).await;
            fs::remove_file(&tmp).await.ok();
            result?;
        } else {
            fs::rename(&tmp, path).await?;
        }

        Ok(())
    }

    async fn list_dir(&self, dir: PathBuf, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
        let mut stack = vec![dir];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let blob = relative.to_string_lossy().replace('\\', "/");

                if blob.starts_with(prefix) && !blob.rsplit('/').next().unwrap_or("").starts_with(".tmp-") {
                    out.push(blob);
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>, Error> {
        match fs::read(self.file_path(path)).await {
            Ok(data) => Ok(data),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.to_owned()))
            }
            Err(error) => Err(Error::Io(error)),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), Error> {
        self.write_durable(&self.file_path(path), data, false)
            .await
            .map_err(Error::Io)
    }

    async fn delete(&self, paths: &[String]) -> Result<(), Error> {
        for path in paths {
            match fs::remove_file(self.file_path(path)).await {
                Ok(()) => (),
                Err(error) if error.kind() == io::ErrorKind::NotFound => (),
                Err(error) => return Err(Error::Io(error)),
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut out = Vec::new();
        self.list_dir(self.root.clone(), prefix, &mut out)
            .await
            .map_err(Error::Io)?;
        Ok(out)
    }

    async fn compare_and_swap_root(
        &self,
        expected: Option<i64>,
        new_generation: i64,
        data: &[u8],
    ) -> Result<(), Error> {
        let actual = super::latest_root_generation(self).await?;
        if actual != expected {
            return Err(Error::CasFailure { expected, actual });
        }

        let target = self.file_path(&paths::root_index(new_generation));
        match self.write_durable(&target, data, true).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => Err(Error::CasFailure {
                expected,
                actual: Some(new_generation),
            }),
            Err(error) => Err(Error::Io(error)),
        }
    }
}
