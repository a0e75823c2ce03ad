use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::object::{validate_key, Object, ObjectMeta, ObjectStore, Precondition, WriteOutcome};

const TEMP_PREFIX: &str = ".tmp-";

/// Object store rooted at a local directory. One directory is one bucket.
///
/// The version token is derived from the content (`<sha256 prefix>-<len>`),
/// so a token read by one process is checkable by another. Writes land in a
/// temporary file and are renamed into place. Conditional writes are
/// serialized within the process; across processes the check and the rename
/// are not atomic.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsObjectStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::from_io(&root.display().to_string(), e))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_key(path)?;
        if path.split('/').any(|seg| seg.starts_with(TEMP_PREFIX)) {
            return Err(StorageError::InvalidKey {
                key: path.to_string(),
                message: "reserved segment prefix".to_string(),
            });
        }
        Ok(self.root.join(path))
    }

    async fn read(&self, path: &str) -> Result<Option<Bytes>, StorageError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            // A directory sits at this key (it is a prefix of other keys).
            Err(_) if full.is_dir() => Ok(None),
            Err(e) => Err(StorageError::from_io(path, e)),
        }
    }

    async fn write_atomic(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let parent = full.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        let file_name = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(
            "{TEMP_PREFIX}{}-{file_name}",
            std::process::id()
        ));
        tokio::fs::write(&temp, data)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        tokio::fs::rename(&temp, &full)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }
}

/// Content-derived version token.
pub(crate) fn content_version(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{hex}-{}", data.len())
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, path: &str) -> Result<Option<Object>, StorageError> {
        Ok(self.read(path).await?.map(|data| Object {
            version: content_version(&data),
            data,
        }))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: Precondition,
    ) -> Result<WriteOutcome, StorageError> {
        let _guard = self.write_lock.lock().await;
        let current = self.read(path).await?.map(|d| content_version(&d));

        match (&precondition, &current) {
            (Precondition::None, _) => {}
            (Precondition::DoesNotExist, None) => {}
            (Precondition::DoesNotExist, Some(_)) => {
                return Ok(WriteOutcome::PreconditionFailed { current });
            }
            (Precondition::MatchesVersion(expected), Some(actual)) if expected == actual => {}
            (Precondition::MatchesVersion(_), _) => {
                return Ok(WriteOutcome::PreconditionFailed { current });
            }
        }

        self.write_atomic(path, &data).await?;
        Ok(WriteOutcome::Written {
            version: content_version(&data),
        })
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>, StorageError> {
        Ok(self.read(path).await?.map(|data| ObjectMeta {
            path: path.to_string(),
            size: data.len() as u64,
            version: content_version(&data),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        let mut found = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::from_io(&key_prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::from_io(&key_prefix, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let key = format!("{key_prefix}{name}");
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::from_io(&key, e))?;
                if file_type.is_dir() {
                    // Only descend where the prefix can still match.
                    let dir_key = format!("{key}/");
                    if dir_key.starts_with(prefix) || prefix.starts_with(&dir_key) {
                        pending.push((entry.path(), dir_key));
                    }
                } else if key.starts_with(prefix) {
                    found.push(key);
                }
            }
        }
        found.sort();

        let mut metas = Vec::with_capacity(found.len());
        for key in found {
            // Skip keys removed between the directory walk and the read.
            if let Some(meta) = self.head(&key).await? {
                metas.push(meta);
            }
        }
        Ok(metas)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(path, e)),
        }
    }
}
