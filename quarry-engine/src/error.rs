use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("recipe error: {0}")]
    Recipe(#[from] quarry_recipe::Error),

    #[error("store error: {0}")]
    Store(#[from] quarry_store::Error),

    #[error("build error: {0}")]
    Build(#[from] quarry_build::Error),

    #[error("unresolved dependency: {0}")]
    UnresolvedDependency(String),

    #[error("dependency cycle detected among: {0:?}")]
    Cycle(Vec<String>),

    #[error("unsatisfied version constraint: {package} requires {constraint} but {found} is available")]
    UnsatisfiedConstraint {
        package: String,
        constraint: String,
        found: String,
    },

    #[error("install failed for {package} at path {path:?}: {cause}")]
    Install {
        package: String,
        path: Option<std::path::PathBuf>,
        cause: String,
    },

    #[error("install rolled back for {package}, but rollback itself failed: {rollback_cause} (original cause: {cause})")]
    InstallRollbackFailed {
        package: String,
        cause: String,
        rollback_cause: String,
    },

    #[error("remove refused for {0}: still required by {1:?}")]
    ReverseDependents(String, Vec<String>),

    #[error("remove failed for {package}: {cause}")]
    Remove { package: String, cause: String },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),

    #[error("digest mismatch for {package}: expected {expected}, computed {computed}")]
    DigestMismatch {
        package: String,
        expected: String,
        computed: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
