/// All errors that can be returned by an object store or the result store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Transport-level failure: timeouts, refused connections, 5xx. Worth
    /// retrying.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The key names nothing.
    #[error("object not found: {path}")]
    NotFound { path: String },

    /// A key is not usable by this backend (empty, absolute, or escaping
    /// the bucket root).
    #[error("invalid key '{key}': {message}")]
    InvalidKey { key: String, message: String },

    /// A stored body failed to decode as the requested record type.
    #[error("corrupt record at {path}: {message}")]
    Corrupt { path: String, message: String },

    /// A record failed to encode.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Any other backend-specific failure (permissions, full disk, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    pub(crate) fn from_io(path: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound {
                path: path.to_string(),
            },
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                StorageError::Unavailable(format!("{path}: {err}"))
            }
            _ => StorageError::Backend(format!("{path}: {err}")),
        }
    }
}

impl crate::retry::Transient for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }
}
