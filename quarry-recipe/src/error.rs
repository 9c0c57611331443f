use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("recipe {0}: missing required field {1}")]
    MissingField(String, &'static str),

    #[error("recipe {0}: unrecognized file extension")]
    UnknownFormat(String),

    #[error("recipe {0}: duplicate name in index")]
    DuplicateName(String),

    #[error("unreadable manifest file {0}: {1}")]
    UnreadableManifest(String, std::io::Error),

    #[error("invalid version token in {0:?}")]
    InvalidVersionToken(String),
}

pub type Result<T> = std::result::Result<T, Error>;
