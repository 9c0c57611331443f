use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("package not found: {0}")]
    PackageNotFound(String),

    #[error("artifact not found for {0} at fingerprint {1}")]
    ArtifactNotFound(String, String),

    #[error("artifact already exists for {0} at fingerprint {1}")]
    ArtifactAlreadyExists(String, String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    #[error("atomic rename failed: {0}")]
    AtomicRename(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
